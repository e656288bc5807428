// AYUSH Terminology Bridge - CLI
// Import codes and mappings, then query the store the same way the server does

use anyhow::{Context, Result};
use ayush_bridge::index::parse_property_filter;
use ayush_bridge::{
    apply_icd11_refresh, ingest_codes, ingest_mappings, load_icd11_json, load_mapping_csv,
    load_namaste_csv, logging, BridgeConfig, CodeRegistry, CodeSystem, EntryStatus, Icd11Module,
    IngestReport, MappingStore, SearchQuery, StorageContext, TranslationResolver, UpsertMode,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ayush-bridge", version, about = "NAMASTE / ICD-11 / WHO-Ayurveda terminology bridge")]
struct Cli {
    /// TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database (overrides config and AYUSH_BRIDGE_DB)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import NAMASTE codes from CSV
    ImportCodes {
        file: PathBuf,
        /// Replace existing codes whose display or version changed
        #[arg(long)]
        update: bool,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Import concept mappings from CSV
    ImportMappings {
        file: PathBuf,
        #[arg(long)]
        update: bool,
        #[arg(long, default_value = "cli")]
        actor: String,
    },
    /// Apply an ICD-11 refresh batch (JSON array of entries)
    RefreshIcd11 {
        /// Defaults to the configured feed
        file: Option<PathBuf>,
    },
    /// Show one code
    Get { system: CodeSystem, code: String },
    /// Search codes by text, property and category filters
    Search {
        text: Option<String>,
        #[arg(long)]
        system: Option<CodeSystem>,
        #[arg(long)]
        module: Option<Icd11Module>,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        status: Option<EntryStatus>,
        /// Property filter as code=value (repeatable)
        #[arg(long = "property", value_name = "CODE=VALUE")]
        properties: Vec<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        page_size: usize,
    },
    /// Translate a code into another system
    Translate {
        code: String,
        #[arg(long)]
        from: CodeSystem,
        #[arg(long)]
        to: CodeSystem,
    },
    /// Code with parent, children and outgoing mappings
    Lookup { system: CodeSystem, code: String },
    /// Registry and mapping statistics
    Stats,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database = db;
    }
    logging::init_logging(&config.log)?;

    let store = StorageContext::open(&config.database)
        .with_context(|| format!("Failed to open database: {}", config.database.display()))?;

    let result = run(cli.command, &store, &config);
    store.close()?;
    result
}

fn run(command: Command, store: &StorageContext, config: &BridgeConfig) -> Result<()> {
    let registry = CodeRegistry::new(store).with_max_page_size(config.max_page_size);

    match command {
        Command::ImportCodes { file, update, actor } => {
            println!("📂 Loading NAMASTE codes from {}", file.display());
            let entries = load_namaste_csv(&file)?;
            let report = ingest_codes(store, &entries, upsert_mode(update), &actor, &config.deadline())?;
            print_report(&report);
        }
        Command::ImportMappings { file, update, actor } => {
            println!("📂 Loading concept mappings from {}", file.display());
            let mappings = load_mapping_csv(&file)?;
            let report = ingest_mappings(store, &mappings, upsert_mode(update), &actor, &config.deadline())?;
            print_report(&report);
        }
        Command::RefreshIcd11 { file } => {
            let file = file
                .or_else(|| config.icd11_feed.clone())
                .context("No ICD-11 feed given and none configured")?;
            println!("🔄 Applying ICD-11 refresh from {}", file.display());
            let entries = load_icd11_json(&file)?;
            let report = apply_icd11_refresh(store, &entries, &config.deadline())?;
            print_report(&report);
        }
        Command::Get { system, code } => {
            print_json(&registry.get(system, &code, &config.deadline())?)?;
        }
        Command::Search {
            text,
            system,
            module,
            category,
            status,
            properties,
            page,
            page_size,
        } => {
            let mut query = SearchQuery::new().page(page, page_size);
            query.text = text;
            query.system = system;
            query.module = module;
            query.category = category;
            query.status = status;
            for raw in &properties {
                let (code, value) = parse_property_filter(raw)
                    .with_context(|| format!("Property filter must be CODE=VALUE, got '{}'", raw))?;
                query = query.property(code, value);
            }

            let result = registry.search(&query, &config.deadline())?;
            println!(
                "🔎 {} matches (page {}, {} per page)",
                result.total, result.page, result.page_size
            );
            for hit in &result.hits {
                println!(
                    "  {:<14} {:<12} {:>6.3}  {}",
                    hit.entry.system.alias(),
                    hit.entry.code,
                    hit.score,
                    hit.entry.display
                );
            }
        }
        Command::Translate { code, from, to } => {
            let response = TranslationResolver::new(store).translate(&code, from, to, &config.deadline())?;
            print_json(&response)?;
        }
        Command::Lookup { system, code } => {
            print_json(&registry.lookup(system, &code, &config.deadline())?)?;
        }
        Command::Stats => {
            let deadline = config.deadline();
            println!("📊 Registry");
            for system in CodeSystem::ALL {
                println!("  {:<14} {}", system.alias(), registry.count(system, &deadline)?);
            }
            println!("🔗 Mappings");
            print_json(&MappingStore::new(store).stats(&deadline)?)?;
        }
    }

    Ok(())
}

fn upsert_mode(update: bool) -> UpsertMode {
    if update {
        UpsertMode::Update
    } else {
        UpsertMode::Insert
    }
}

fn print_report(report: &IngestReport) {
    println!("✓ Inserted:  {}", report.inserted);
    println!("✓ Updated:   {}", report.updated);
    println!("✓ Unchanged: {}", report.unchanged);
    if !report.rejected.is_empty() {
        println!("⚠️  Rejected:  {}", report.rejected.len());
        for rejected in &report.rejected {
            println!("   {} - {}", rejected.key, rejected.reason);
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
