// 📥 Ingestion Boundary - Bulk upserts, ICD-11 refresh and CSV loaders
//
// Each record is validated and written in its own transaction: a rejected
// record never blocks the rest of the batch, and an accepted one is never
// half-written. Storage failures and cancellation abort the batch.

use crate::db::{insert_audit_log, StorageContext, UpsertMode, UpsertOutcome};
use crate::deadline::Deadline;
use crate::entities::{
    AuditLog, CodeEntry, CodeSystem, ConceptMapping, DesignationUse, Equivalence, MappingMethod,
};
use crate::error::{BridgeError, Result};
use crate::mappings::MappingStore;
use crate::registry::CodeRegistry;
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Actor recorded in the audit trail for scheduled ICD-11 refreshes
pub const ICD11_SYNC_ACTOR: &str = "icd11-sync";

// ============================================================================
// INGEST REPORT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// "system/code" for entries, "source/code -> target@version" for mappings
    pub key: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl IngestReport {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged + self.rejected.len()
    }

    pub fn accepted(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    fn reject(&mut self, key: String, err: &BridgeError) {
        tracing::warn!(%key, error = %err, "record rejected");
        self.rejected.push(RejectedRecord {
            key,
            reason: err.to_string(),
        });
    }
}

fn entry_key(entry: &CodeEntry) -> String {
    format!("{}/{}", entry.system.alias(), entry.code)
}

fn mapping_key(mapping: &ConceptMapping) -> String {
    format!(
        "{}/{} -> {}@{}",
        mapping.source.alias(),
        mapping.source_code,
        mapping.target.alias(),
        mapping.version
    )
}

fn audit_action(kind: &str, outcome: UpsertOutcome) -> Option<String> {
    match outcome {
        UpsertOutcome::Inserted => Some(format!("{}.inserted", kind)),
        UpsertOutcome::Updated => Some(format!("{}.updated", kind)),
        UpsertOutcome::Unchanged => None,
    }
}

// ============================================================================
// BULK UPSERT
// ============================================================================

pub fn ingest_codes(
    store: &StorageContext,
    entries: &[CodeEntry],
    mode: UpsertMode,
    actor: &str,
    deadline: &Deadline,
) -> Result<IngestReport> {
    let registry = CodeRegistry::new(store);
    let mut report = IngestReport::default();

    for entry in entries {
        let key = entry_key(entry);
        match registry.upsert(entry, mode, deadline) {
            Ok(outcome) => {
                report.record(outcome);
                if let Some(action) = audit_action("code", outcome) {
                    let details = serde_json::json!({
                        "system": entry.system,
                        "version": entry.version,
                        "display": entry.display,
                    });
                    insert_audit_log(store, &AuditLog::new(actor, &action, &key, details), deadline)?;
                }
            }
            Err(err @ BridgeError::ValidationFailed(_)) => report.reject(key, &err),
            Err(err) => return Err(err),
        }
    }

    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        rejected = report.rejected.len(),
        "code ingest finished"
    );
    Ok(report)
}

pub fn ingest_mappings(
    store: &StorageContext,
    mappings: &[ConceptMapping],
    mode: UpsertMode,
    actor: &str,
    deadline: &Deadline,
) -> Result<IngestReport> {
    let mapping_store = MappingStore::new(store);
    let mut report = IngestReport::default();

    for mapping in mappings {
        let key = mapping_key(mapping);
        match mapping_store.upsert(mapping, mode, deadline) {
            Ok(outcome) => {
                report.record(outcome);
                if let Some(action) = audit_action("mapping", outcome) {
                    let details = serde_json::json!({
                        "targetCode": mapping.target_code,
                        "equivalence": mapping.equivalence,
                        "confidence": mapping.confidence,
                    });
                    insert_audit_log(store, &AuditLog::new(actor, &action, &key, details), deadline)?;
                }
            }
            Err(err @ BridgeError::ValidationFailed(_)) => report.reject(key, &err),
            Err(err) => return Err(err),
        }
    }

    tracing::info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        rejected = report.rejected.len(),
        "mapping ingest finished"
    );
    Ok(report)
}

/// Apply one batch from the scheduled ICD-11 sync. Entries replace what is
/// stored (update mode), each code atomically.
pub fn apply_icd11_refresh(store: &StorageContext, entries: &[CodeEntry], deadline: &Deadline) -> Result<IngestReport> {
    let (icd11, foreign): (Vec<CodeEntry>, Vec<CodeEntry>) =
        entries.iter().cloned().partition(|e| e.system == CodeSystem::Icd11);

    let mut report = ingest_codes(store, &icd11, UpsertMode::Update, ICD11_SYNC_ACTOR, deadline)?;
    for entry in foreign {
        report.reject(
            entry_key(&entry),
            &BridgeError::validation("Icd11Refresh", "system", "Refresh batches may only contain ICD-11 entries"),
        );
    }
    Ok(report)
}

// ============================================================================
// CSV LOADERS
// ============================================================================

/// Normalize the NAMASTE "systemName" column to a traditional system name
fn traditional_system(name: &str) -> &'static str {
    match name.trim().to_lowercase().as_str() {
        "ayurveda" | "ayurved" => "ayurveda",
        "yoga" => "yoga",
        "unani" => "unani",
        "siddha" => "siddha",
        "homeopathy" | "homoeopathy" => "homeopathy",
        "naturopathy" => "naturopathy",
        "sowa-rigpa" | "sowa rigpa" => "sowa_rigpa",
        "folk medicine" | "folk" => "folk_medicine",
        _ => "other",
    }
}

/// Language tag of the local-name column for each system
fn local_language(system: &str) -> &'static str {
    match system {
        "ayurveda" | "yoga" | "naturopathy" => "sa",
        "siddha" => "ta",
        "unani" => "ur",
        "sowa_rigpa" => "bo",
        _ => "hi",
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NamasteRow {
    code: String,
    #[serde(default)]
    system_name: String,
    english_name: String,
    #[serde(default)]
    local_name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    category: String,
    #[serde(default)]
    indication: String,
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Load NAMASTE codes from CSV with columns
/// code, systemName, englishName, localName, description, category, indication.
/// Rows without a code or English name are skipped with a warning.
pub fn load_namaste_csv(csv_path: &Path) -> anyhow::Result<Vec<CodeEntry>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open NAMASTE CSV: {}", csv_path.display()))?;

    let mut entries = Vec::new();

    for (index, result) in rdr.deserialize::<NamasteRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("Failed to parse NAMASTE CSV line {}", line))?;

        let (Some(code), Some(english_name)) = (non_empty(&row.code), non_empty(&row.english_name)) else {
            tracing::warn!(line, "skipping NAMASTE row without code or englishName");
            continue;
        };

        let system = traditional_system(&row.system_name);
        let mut entry = CodeEntry::new(CodeSystem::Namaste, code, english_name)
            .with_version("1.0")
            .with_property("traditional-system", system);

        if let Some(local_name) = non_empty(&row.local_name) {
            entry = entry.with_designation(local_language(system), local_name, DesignationUse::Synonym);
        }
        if let Some(description) = non_empty(&row.description) {
            entry = entry.with_definition(description);
        }
        if let Some(category) = non_empty(&row.category) {
            entry = entry.with_property("category", category);
        }
        if let Some(indication) = non_empty(&row.indication) {
            entry = entry.with_property("indication", indication);
        }

        entries.push(entry);
    }

    tracing::info!(path = %csv_path.display(), count = entries.len(), "NAMASTE CSV loaded");
    Ok(entries)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MappingRow {
    source_system: String,
    source_code: String,
    target_system: String,
    target_code: String,
    equivalence: String,
    confidence: f64,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    mapping_method: Option<String>,
    #[serde(default)]
    validated_by: Option<String>,
    #[serde(default)]
    validated_at: Option<String>,
}

/// Load concept mappings from CSV with columns
/// sourceSystem, sourceCode, targetSystem, targetCode, equivalence, confidence,
/// comment, version, mappingMethod, validatedBy, validatedAt.
/// Systems accept the URI or a short alias; range checks happen on upsert.
/// `validatedAt` (RFC 3339) is taken from the file only, so loading the same
/// file twice yields identical records.
pub fn load_mapping_csv(csv_path: &Path) -> anyhow::Result<Vec<ConceptMapping>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(csv_path)
        .with_context(|| format!("Failed to open mapping CSV: {}", csv_path.display()))?;

    let mut mappings = Vec::new();

    for (index, result) in rdr.deserialize::<MappingRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("Failed to parse mapping CSV line {}", line))?;

        let source: CodeSystem = row
            .source_system
            .parse()
            .with_context(|| format!("Line {}: bad sourceSystem", line))?;
        let target: CodeSystem = row
            .target_system
            .parse()
            .with_context(|| format!("Line {}: bad targetSystem", line))?;
        let equivalence: Equivalence = row
            .equivalence
            .parse()
            .with_context(|| format!("Line {}: bad equivalence", line))?;

        let mut mapping = ConceptMapping::new(source, row.source_code, target, row.target_code, equivalence, row.confidence);

        if let Some(comment) = row.comment.as_deref().and_then(non_empty) {
            mapping = mapping.with_comment(comment);
        }
        if let Some(version) = row.version.as_deref().and_then(non_empty) {
            mapping = mapping.with_version(version);
        }
        if let Some(method) = row.mapping_method.as_deref().and_then(non_empty) {
            let method: MappingMethod = method
                .parse()
                .with_context(|| format!("Line {}: bad mappingMethod", line))?;
            mapping = mapping.with_method(method);
        }
        if let Some(validator) = row.validated_by.as_deref().and_then(non_empty) {
            mapping.validated_by = Some(validator.to_string());
        }
        if let Some(raw) = row.validated_at.as_deref().and_then(non_empty) {
            let at = DateTime::parse_from_rfc3339(raw)
                .with_context(|| format!("Line {}: bad validatedAt", line))?;
            mapping.validated_at = Some(at.with_timezone(&Utc));
        }

        mappings.push(mapping);
    }

    tracing::info!(path = %csv_path.display(), count = mappings.len(), "mapping CSV loaded");
    Ok(mappings)
}

/// Load an ICD-11 refresh batch: a JSON array of code entries as written by
/// the scheduled sync (camelCase fields, system URI or alias).
pub fn load_icd11_json(json_path: &Path) -> anyhow::Result<Vec<CodeEntry>> {
    let content = std::fs::read_to_string(json_path)
        .with_context(|| format!("Failed to read ICD-11 feed: {}", json_path.display()))?;
    let entries: Vec<CodeEntry> = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse ICD-11 feed: {}", json_path.display()))?;

    tracing::info!(path = %json_path.display(), count = entries.len(), "ICD-11 feed loaded");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::audit_logs_for_resource;
    use crate::entities::{Icd11Module, PropertyValue};
    use std::io::Write;

    fn write_csv(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_ingest_codes_reports_each_outcome() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();

        let first = vec![
            CodeEntry::new(CodeSystem::Namaste, "N1", "Vatavyadhi"),
            CodeEntry::new(CodeSystem::Namaste, "N2", "Pittaja jwara"),
        ];
        let report = ingest_codes(&store, &first, UpsertMode::Insert, "importer", &deadline).unwrap();
        assert_eq!(report.inserted, 2);

        let second = vec![
            first[0].clone(),
            CodeEntry::new(CodeSystem::Namaste, "N2", "Renamed"),
            CodeEntry::new(CodeSystem::Namaste, "", "Blank code"),
            CodeEntry::new(CodeSystem::Namaste, "N3", "Kaphaja kasa"),
        ];
        let report = ingest_codes(&store, &second, UpsertMode::Insert, "importer", &deadline).unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].key, "namaste/N2");
        assert_eq!(report.total(), 4);

        let trail = audit_logs_for_resource(&store, "namaste/N1", &deadline).unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].action, "code.inserted");
        assert_eq!(trail[0].user_id, "importer");
    }

    #[test]
    fn test_ingest_mappings_rejects_out_of_range_confidence() {
        let store = StorageContext::open_in_memory().unwrap();
        let mappings = vec![
            ConceptMapping::new(CodeSystem::Namaste, "N1", CodeSystem::Icd11, "SM30", Equivalence::Equivalent, 0.9),
            ConceptMapping::new(CodeSystem::Namaste, "N2", CodeSystem::Icd11, "SM31", Equivalence::Equivalent, 1.2),
        ];

        let report = ingest_mappings(&store, &mappings, UpsertMode::Insert, "importer", &Deadline::none()).unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].reason.contains("confidence"));
    }

    #[test]
    fn test_cancelled_ingest_aborts() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();
        deadline.cancel();

        let entries = vec![CodeEntry::new(CodeSystem::Namaste, "N1", "Vatavyadhi")];
        let err = ingest_codes(&store, &entries, UpsertMode::Insert, "importer", &deadline).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_icd11_refresh_updates_and_rejects_foreign_entries() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();

        let v1 = CodeEntry::icd11(Icd11Module::Tm2, "SM30", "Vata pattern");
        apply_icd11_refresh(&store, &[v1], &deadline).unwrap();

        let v2 = CodeEntry::icd11(Icd11Module::Tm2, "SM30", "Vata disorder pattern").with_version("2025-01");
        let report = apply_icd11_refresh(
            &store,
            &[v2, CodeEntry::new(CodeSystem::Namaste, "N1", "Vatavyadhi")],
            &deadline,
        )
        .unwrap();

        assert_eq!(report.updated, 1);
        assert_eq!(report.rejected.len(), 1);

        let stored = CodeRegistry::new(&store)
            .get(CodeSystem::Icd11, "SM30", &deadline)
            .unwrap();
        assert_eq!(stored.display, "Vata disorder pattern");

        let trail = audit_logs_for_resource(&store, "icd11/SM30", &deadline).unwrap();
        assert_eq!(trail[0].user_id, ICD11_SYNC_ACTOR);
    }

    #[test]
    fn test_load_namaste_csv() {
        let file = write_csv(
            "code,systemName,englishName,localName,description,category,indication\n\
             AAA-1,Ayurveda,Vata imbalance,Vatavyadhi,Disorder of vata,Disease,Joint pain\n\
             ,Ayurveda,Missing code,,,,\n\
             SID-1,Siddha,Vali disorder,,,,\n",
        );

        let entries = load_namaste_csv(file.path()).unwrap();
        assert_eq!(entries.len(), 2);

        let vata = &entries[0];
        assert_eq!(vata.display, "Vata imbalance");
        assert_eq!(vata.definition.as_deref(), Some("Disorder of vata"));
        assert_eq!(vata.designations[0].language, "sa");
        assert_eq!(vata.properties["category"], PropertyValue::from("Disease"));
        assert_eq!(vata.properties["traditional-system"], PropertyValue::from("ayurveda"));

        assert!(entries[1].designations.is_empty());
        assert!(entries[1].definition.is_none());
    }

    #[test]
    fn test_load_mapping_csv() {
        let file = write_csv(
            "sourceSystem,sourceCode,targetSystem,targetCode,equivalence,confidence,comment,version,mappingMethod,validatedBy\n\
             namaste,AAA-1,icd11,SM30,equivalent,0.9,Panel reviewed,1.0.0,expert-review,dr.rao\n\
             namaste,AAA-2,who-ayurveda,ITA-1,relatedto,0.4,,,,\n",
        );

        let mappings = load_mapping_csv(file.path()).unwrap();
        assert_eq!(mappings.len(), 2);
        assert_eq!(mappings[0].mapping_method, MappingMethod::ExpertReview);
        assert!(mappings[0].is_validated());
        assert_eq!(mappings[1].equivalence, Equivalence::Inexact);
        assert_eq!(mappings[1].version, "1.0.0");
        assert!(mappings[1].comment.is_none());
    }

    #[test]
    fn test_reimporting_mapping_csv_is_unchanged() {
        let file = write_csv(
            "sourceSystem,sourceCode,targetSystem,targetCode,equivalence,confidence,comment,version,mappingMethod,validatedBy,validatedAt\n\
             namaste,AAA-1,icd11,SM30,equivalent,0.9,,1.0.0,expert-review,dr.rao,2024-03-01T10:00:00Z\n\
             namaste,AAA-2,icd11,SM31,wider,0.7,,1.0.0,,dr.iyer,\n",
        );
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();

        let first = load_mapping_csv(file.path()).unwrap();
        assert_eq!(first[0].validated_at.map(|at| at.to_rfc3339()).as_deref(), Some("2024-03-01T10:00:00+00:00"));
        assert!(first[1].is_validated());
        assert!(first[1].validated_at.is_none());
        let report = ingest_mappings(&store, &first, UpsertMode::Insert, "importer", &deadline).unwrap();
        assert_eq!(report.inserted, 2);

        let second = load_mapping_csv(file.path()).unwrap();
        let report = ingest_mappings(&store, &second, UpsertMode::Insert, "importer", &deadline).unwrap();
        assert_eq!(report.unchanged, 2);
        assert!(report.rejected.is_empty(), "{:?}", report.rejected);
    }

    #[test]
    fn test_load_icd11_json_feeds_refresh() {
        let feed = vec![
            CodeEntry::icd11(Icd11Module::Tm2, "SM3", "Vata disorders"),
            CodeEntry::icd11(Icd11Module::Tm2, "SM30", "Vata pattern").with_parent("SM3"),
        ];
        let file = write_csv(&serde_json::to_string(&feed).unwrap());

        let loaded = load_icd11_json(file.path()).unwrap();
        assert_eq!(loaded, feed);

        let store = StorageContext::open_in_memory().unwrap();
        let report = apply_icd11_refresh(&store, &loaded, &Deadline::none()).unwrap();
        assert_eq!(report.inserted, 2);
    }

    #[test]
    fn test_load_mapping_csv_reports_bad_system_with_line() {
        let file = write_csv(
            "sourceSystem,sourceCode,targetSystem,targetCode,equivalence,confidence\n\
             snomed,AAA-1,icd11,SM30,equivalent,0.9\n",
        );

        let err = load_mapping_csv(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("Line 2"));
    }
}
