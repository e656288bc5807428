// AYUSH Terminology Bridge - Core Library
// NAMASTE <-> ICD-11 (TM2 / Biomedicine) <-> WHO-Ayurveda
// Exposes all modules for use in CLI, API server, and tests

pub mod cache;      // Shadow cache (optional, revision-tagged)
pub mod config;     // TOML + environment configuration
pub mod db;         // Storage context, schema, users & audit trail
pub mod deadline;   // Caller deadlines / cancellation
pub mod entities;   // Code systems, entries, mappings, users, audit logs
pub mod error;      // BridgeError taxonomy
pub mod index;      // Index Layer: tokens, property filters, search SQL
pub mod ingest;     // Ingestion boundary: bulk upsert, ICD-11 refresh, CSV loaders
pub mod logging;    // tracing-subscriber setup for the binaries
pub mod mappings;   // Mapping Store
pub mod registry;   // Code Registry
pub mod resolver;   // Translation Resolver

// Re-export commonly used types
pub use cache::{MemoryCache, ShadowCache};
pub use config::BridgeConfig;
pub use db::{
    audit_logs_for_resource, find_user_by_abha, insert_audit_log, setup_database, upsert_user,
    StorageContext, UpsertMode, UpsertOutcome,
};
pub use deadline::Deadline;
pub use entities::{
    AuditLog, CodeEntry, CodeSystem, ConceptMapping, Designation, DesignationUse, EntryStatus,
    Equivalence, Icd11Module, MappingMethod, PropertyValue, Role, User,
};
pub use error::{BridgeError, Result, ValidationError};
pub use index::SearchQuery;
pub use ingest::{
    apply_icd11_refresh, ingest_codes, ingest_mappings, load_icd11_json, load_mapping_csv, load_namaste_csv,
    IngestReport, RejectedRecord,
};
pub use mappings::{compare_versions, MappingStats, MappingStore};
pub use registry::{CodeLookup, CodeRegistry, SearchHit, SearchResult};
pub use resolver::{
    rank_matches, TranslationHop, TranslationMatch, TranslationResolver, TranslationResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
