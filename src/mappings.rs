// 🔗 Mapping Store - Directed, versioned concept mappings
//
// Natural key: (sourceCode, source, target, version). Several versions of
// the same directed pair may coexist; readers that need one record pick the
// latest with `latest_version`.

use crate::db::{enum_column, optional_timestamp_column, timestamp_column, StorageContext, UpsertMode, UpsertOutcome};
use crate::deadline::Deadline;
use crate::entities::{CodeSystem, ConceptMapping, Equivalence};
use crate::error::{BridgeError, Result, ValidationError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

const MAPPING_COLUMNS: &str = "source_system, source_code, target_system, target_code, equivalence, confidence, \
                               comment, validated_by, validated_at, version, last_updated, mapping_method";

// ============================================================================
// VERSION ORDERING
// ============================================================================

fn version_segments(version: &str) -> Vec<&str> {
    version.trim().split(|c: char| c == '.' || c == '-').collect()
}

/// Compare dotted versions segment by segment: numeric segments numerically,
/// anything else lexically. "1.10" > "1.9"; a longer version wins a shared prefix.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = version_segments(a);
    let right = version_segments(b);

    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y),
            _ => l.cmp(r),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left.len().cmp(&right.len())
}

/// Newest version first; `last_updated` breaks version ties, then target code
fn newest_first(a: &ConceptMapping, b: &ConceptMapping) -> Ordering {
    compare_versions(&b.version, &a.version)
        .then_with(|| b.last_updated.cmp(&a.last_updated))
        .then_with(|| a.target_code.cmp(&b.target_code))
}

/// The one record that stands for a directed pair
pub fn latest_version(mappings: &[ConceptMapping]) -> Option<&ConceptMapping> {
    mappings.iter().min_by(|a, b| newest_first(a, b))
}

/// Latest record per target system, ordered by target system
pub fn latest_per_target_system(mappings: &[ConceptMapping]) -> Vec<&ConceptMapping> {
    let mut latest: BTreeMap<CodeSystem, &ConceptMapping> = BTreeMap::new();
    for mapping in mappings {
        latest
            .entry(mapping.target)
            .and_modify(|current| {
                if newest_first(mapping, *current) == Ordering::Less {
                    *current = mapping;
                }
            })
            .or_insert(mapping);
    }
    latest.into_values().collect()
}

// ============================================================================
// STATISTICS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingStats {
    pub total: usize,
    pub by_equivalence: BTreeMap<String, usize>,
    /// Keyed "source -> target" by system alias
    pub by_system_pair: BTreeMap<String, usize>,
    pub validated: usize,
    pub unvalidated: usize,
    pub mean_confidence: Option<f64>,
}

// ============================================================================
// MAPPING STORE
// ============================================================================

pub struct MappingStore<'a> {
    store: &'a StorageContext,
}

impl<'a> MappingStore<'a> {
    pub fn new(store: &'a StorageContext) -> Self {
        MappingStore { store }
    }

    /// Every version of sourceCode -> targetSystem, newest first
    pub fn get_direct(
        &self,
        source: CodeSystem,
        source_code: &str,
        target: CodeSystem,
        deadline: &Deadline,
    ) -> Result<Vec<ConceptMapping>> {
        self.store.read(deadline, |conn| direct_in(conn, source, source_code, target))
    }

    /// All outgoing edges of a code, any target system
    pub fn all_from(&self, source: CodeSystem, source_code: &str, deadline: &Deadline) -> Result<Vec<ConceptMapping>> {
        self.store.read(deadline, |conn| all_from_in(conn, source, source_code))
    }

    /// All mappings pointing at a code
    pub fn reverse(&self, target: CodeSystem, target_code: &str, deadline: &Deadline) -> Result<Vec<ConceptMapping>> {
        self.store.read(deadline, |conn| {
            let sql = format!(
                "SELECT {MAPPING_COLUMNS} FROM concept_mappings
                 WHERE target_code = ?1 AND target_system = ?2
                 ORDER BY source_system ASC, source_code ASC, version ASC"
            );
            query_mappings(conn, &sql, params![target_code, target.uri()])
        })
    }

    pub fn stats(&self, deadline: &Deadline) -> Result<MappingStats> {
        self.store.read(deadline, |conn| {
            let mut stats = MappingStats::default();

            let mut stmt = conn.prepare(
                "SELECT equivalence, COUNT(*) FROM concept_mappings GROUP BY equivalence ORDER BY equivalence",
            )?;
            let rows = stmt.query_map([], |row| Ok((enum_column::<Equivalence>(row, 0)?, row.get::<_, i64>(1)?)))?;
            for row in rows {
                let (equivalence, count) = row?;
                stats.by_equivalence.insert(equivalence.as_str().to_string(), count as usize);
                stats.total += count as usize;
            }

            deadline.check()?;
            let mut stmt = conn.prepare(
                "SELECT source_system, target_system, COUNT(*) FROM concept_mappings
                 GROUP BY source_system, target_system",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    enum_column::<CodeSystem>(row, 0)?,
                    enum_column::<CodeSystem>(row, 1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?;
            for row in rows {
                let (source, target, count) = row?;
                stats
                    .by_system_pair
                    .insert(format!("{} -> {}", source.alias(), target.alias()), count as usize);
            }

            deadline.check()?;
            let (validated, mean): (i64, Option<f64>) = conn.query_row(
                "SELECT COUNT(validated_by), AVG(confidence) FROM concept_mappings",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            stats.validated = validated as usize;
            stats.unvalidated = stats.total - stats.validated;
            stats.mean_confidence = mean;

            Ok(stats)
        })
    }

    pub fn count(&self, deadline: &Deadline) -> Result<usize> {
        self.store.read(deadline, |conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM concept_mappings", [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Validate and write one mapping. Forward references to unregistered
    /// codes are accepted.
    pub fn upsert(&self, mapping: &ConceptMapping, mode: UpsertMode, deadline: &Deadline) -> Result<UpsertOutcome> {
        mapping.validate().map_err(BridgeError::ValidationFailed)?;
        self.store.write(deadline, |conn| upsert_in(conn, mapping, mode))
    }
}

// ============================================================================
// CONNECTION-LEVEL READS
// ============================================================================

fn row_to_mapping(row: &Row<'_>) -> rusqlite::Result<ConceptMapping> {
    Ok(ConceptMapping {
        source: enum_column(row, 0)?,
        source_code: row.get(1)?,
        target: enum_column(row, 2)?,
        target_code: row.get(3)?,
        equivalence: enum_column(row, 4)?,
        confidence: row.get(5)?,
        comment: row.get(6)?,
        validated_by: row.get(7)?,
        validated_at: optional_timestamp_column(row, 8)?,
        version: row.get(9)?,
        last_updated: timestamp_column(row, 10)?,
        mapping_method: enum_column(row, 11)?,
    })
}

fn query_mappings(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<ConceptMapping>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mappings = stmt
        .query_map(params, row_to_mapping)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(mappings)
}

pub(crate) fn direct_in(
    conn: &Connection,
    source: CodeSystem,
    source_code: &str,
    target: CodeSystem,
) -> Result<Vec<ConceptMapping>> {
    let sql = format!(
        "SELECT {MAPPING_COLUMNS} FROM concept_mappings
         WHERE source_code = ?1 AND source_system = ?2 AND target_system = ?3"
    );
    let mut mappings = query_mappings(conn, &sql, params![source_code, source.uri(), target.uri()])?;
    mappings.sort_by(newest_first);
    Ok(mappings)
}

pub(crate) fn all_from_in(conn: &Connection, source: CodeSystem, source_code: &str) -> Result<Vec<ConceptMapping>> {
    let sql = format!(
        "SELECT {MAPPING_COLUMNS} FROM concept_mappings
         WHERE source_code = ?1 AND source_system = ?2
         ORDER BY target_system ASC, target_code ASC, version ASC"
    );
    query_mappings(conn, &sql, params![source_code, source.uri()])
}

fn find_by_key(conn: &Connection, mapping: &ConceptMapping) -> Result<Option<(String, String)>> {
    let row = conn
        .query_row(
            "SELECT target_code, content_hash FROM concept_mappings
             WHERE source_code = ?1 AND source_system = ?2 AND target_system = ?3 AND version = ?4",
            params![mapping.source_code, mapping.source.uri(), mapping.target.uri(), mapping.version],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    Ok(row)
}

// ============================================================================
// WRITE PATH
// ============================================================================

pub(crate) fn upsert_in(conn: &Connection, mapping: &ConceptMapping, mode: UpsertMode) -> Result<UpsertOutcome> {
    let hash = mapping.content_hash();
    let existing = find_by_key(conn, mapping)?;

    if let Some((existing_target, existing_hash)) = &existing {
        if *existing_hash == hash {
            return Ok(UpsertOutcome::Unchanged);
        }
        if mode == UpsertMode::Insert {
            return Err(BridgeError::ValidationFailed(vec![ValidationError::new(
                "MappingStore",
                "version",
                format!(
                    "Mapping {} -> {} version {} already exists (target {}); an explicit update is required",
                    mapping.source_code,
                    mapping.target.alias(),
                    mapping.version,
                    existing_target
                ),
            )]));
        }
    }

    let validated_at = mapping.validated_at.map(|dt| dt.to_rfc3339());
    let outcome = if existing.is_some() {
        conn.execute(
            "UPDATE concept_mappings SET
                target_code = ?5, equivalence = ?6, confidence = ?7, comment = ?8, validated_by = ?9,
                validated_at = ?10, last_updated = ?11, mapping_method = ?12, content_hash = ?13
             WHERE source_code = ?1 AND source_system = ?2 AND target_system = ?3 AND version = ?4",
            params![
                mapping.source_code,
                mapping.source.uri(),
                mapping.target.uri(),
                mapping.version,
                mapping.target_code,
                mapping.equivalence.as_str(),
                mapping.confidence,
                mapping.comment,
                mapping.validated_by,
                validated_at,
                mapping.last_updated.to_rfc3339(),
                mapping.mapping_method.as_str(),
                hash,
            ],
        )?;
        UpsertOutcome::Updated
    } else {
        conn.execute(
            "INSERT INTO concept_mappings (
                source_system, source_code, target_system, target_code, equivalence, confidence,
                comment, validated_by, validated_at, version, last_updated, mapping_method, content_hash
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                mapping.source.uri(),
                mapping.source_code,
                mapping.target.uri(),
                mapping.target_code,
                mapping.equivalence.as_str(),
                mapping.confidence,
                mapping.comment,
                mapping.validated_by,
                validated_at,
                mapping.version,
                mapping.last_updated.to_rfc3339(),
                mapping.mapping_method.as_str(),
                hash,
            ],
        )?;
        UpsertOutcome::Inserted
    };

    tracing::debug!(
        source = mapping.source.alias(),
        source_code = %mapping.source_code,
        target = mapping.target.alias(),
        target_code = %mapping.target_code,
        ?outcome,
        "concept mapping written"
    );
    Ok(outcome)
}
