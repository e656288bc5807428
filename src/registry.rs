// 📚 Code Registry - Canonical code entries for the three vocabularies
//
// Read path: get / find / search / children / ancestors / lookup.
// Write path (ingestion boundary): upsert with validation hooks.
//
// The `*_in` functions take a bare connection so the resolver can run
// several lookups against one consistent view of the store.

use crate::cache::{self, ShadowCache};
use crate::db::{
    enum_column, json_column, optional_enum_column, timestamp_column, to_json, StorageContext, UpsertMode,
    UpsertOutcome,
};
use crate::deadline::Deadline;
use crate::entities::{CodeEntry, CodeSystem, ConceptMapping};
use crate::error::{BridgeError, Result, ValidationError};
use crate::index::{self, SearchQuery};
use crate::mappings;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

/// Longest parent chain followed before giving up
pub const MAX_HIERARCHY_DEPTH: usize = 64;

const ENTRY_COLUMNS: &str = "code, system, display, definition, designations, properties, version, status, \
                             module, parent, category, sanskrit, created, updated";

// ============================================================================
// RESULT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub entry: CodeEntry,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub hits: Vec<SearchHit>,
    /// Matches across all pages
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

impl SearchResult {
    pub fn entries(&self) -> impl Iterator<Item = &CodeEntry> {
        self.hits.iter().map(|hit| &hit.entry)
    }
}

/// `$lookup` view of one code: the entry plus its neighbourhood
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeLookup {
    pub entry: CodeEntry,
    pub parent: Option<CodeEntry>,
    pub children: Vec<CodeEntry>,
    pub mappings: Vec<ConceptMapping>,
}

// ============================================================================
// CODE REGISTRY
// ============================================================================

pub struct CodeRegistry<'a> {
    store: &'a StorageContext,
    max_page_size: usize,
    cache: Option<&'a dyn ShadowCache>,
}

impl<'a> CodeRegistry<'a> {
    pub fn new(store: &'a StorageContext) -> Self {
        CodeRegistry {
            store,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            cache: None,
        }
    }

    pub fn with_max_page_size(mut self, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self
    }

    pub fn with_cache(mut self, cache: &'a dyn ShadowCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Entry by identity. Absence is an error here.
    pub fn get(&self, system: CodeSystem, code: &str, deadline: &Deadline) -> Result<CodeEntry> {
        let key = format!("get|{}|{}", system.alias(), code);
        cache::cached(self.cache, self.store, &key, deadline, || {
            self.find(system, code, deadline)?.ok_or_else(|| BridgeError::NotFound {
                system,
                code: code.to_string(),
            })
        })
    }

    pub fn find(&self, system: CodeSystem, code: &str, deadline: &Deadline) -> Result<Option<CodeEntry>> {
        self.store.read(deadline, |conn| find_in(conn, system, code))
    }

    pub fn search(&self, query: &SearchQuery, deadline: &Deadline) -> Result<SearchResult> {
        let (page, page_size) = query.bounded_page(self.max_page_size);

        self.store.read(deadline, |conn| {
            let (total, scored) = index::search_codes(conn, query, self.max_page_size)?;

            let mut hits = Vec::with_capacity(scored.len());
            for hit in scored {
                deadline.check()?;
                // Rows come from the same snapshot, so a miss means a corrupt index
                let entry = find_in(conn, hit.system, &hit.code)?.ok_or_else(|| BridgeError::NotFound {
                    system: hit.system,
                    code: hit.code.clone(),
                })?;
                hits.push(SearchHit { entry, score: hit.score });
            }

            Ok(SearchResult {
                hits,
                total,
                page,
                page_size,
            })
        })
    }

    /// Direct children, derived from parent back-references, code ascending
    pub fn children(&self, system: CodeSystem, code: &str, deadline: &Deadline) -> Result<Vec<CodeEntry>> {
        self.store.read(deadline, |conn| children_in(conn, system, code))
    }

    /// Parent chain, root first. Stops at the first parent not registered yet.
    pub fn ancestors(&self, system: CodeSystem, code: &str, deadline: &Deadline) -> Result<Vec<CodeEntry>> {
        self.store.read(deadline, |conn| {
            let entry = find_in(conn, system, code)?.ok_or_else(|| BridgeError::NotFound {
                system,
                code: code.to_string(),
            })?;

            let mut chain = Vec::new();
            let mut next = entry.parent;
            while let Some(parent_code) = next {
                deadline.check()?;
                if chain.len() >= MAX_HIERARCHY_DEPTH {
                    tracing::warn!(%system, code, "parent chain exceeds maximum depth");
                    break;
                }
                match find_in(conn, system, &parent_code)? {
                    Some(parent) => {
                        next = parent.parent.clone();
                        chain.push(parent);
                    }
                    None => break,
                }
            }

            chain.reverse();
            Ok(chain)
        })
    }

    pub fn lookup(&self, system: CodeSystem, code: &str, deadline: &Deadline) -> Result<CodeLookup> {
        self.store.read(deadline, |conn| {
            let entry = find_in(conn, system, code)?.ok_or_else(|| BridgeError::NotFound {
                system,
                code: code.to_string(),
            })?;

            let parent = match &entry.parent {
                Some(parent_code) => find_in(conn, system, parent_code)?,
                None => None,
            };
            deadline.check()?;
            let children = children_in(conn, system, code)?;
            deadline.check()?;
            let mappings = mappings::all_from_in(conn, system, code)?;

            Ok(CodeLookup {
                entry,
                parent,
                children,
                mappings,
            })
        })
    }

    pub fn count(&self, system: CodeSystem, deadline: &Deadline) -> Result<usize> {
        self.store.read(deadline, |conn| {
            let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", system.table()), [], |row| row.get(0))?;
            Ok(n as usize)
        })
    }

    /// Validate and write one entry with its index entries, atomically
    pub fn upsert(&self, entry: &CodeEntry, mode: UpsertMode, deadline: &Deadline) -> Result<UpsertOutcome> {
        entry.validate().map_err(BridgeError::ValidationFailed)?;
        self.store.write(deadline, |conn| upsert_in(conn, entry, mode))
    }
}

// ============================================================================
// CONNECTION-LEVEL READS
// ============================================================================

fn row_to_entry(row: &Row<'_>) -> rusqlite::Result<CodeEntry> {
    Ok(CodeEntry {
        code: row.get(0)?,
        system: enum_column(row, 1)?,
        display: row.get(2)?,
        definition: row.get(3)?,
        designations: json_column(row, 4)?,
        properties: json_column(row, 5)?,
        version: row.get(6)?,
        status: enum_column(row, 7)?,
        module: optional_enum_column(row, 8)?,
        parent: row.get(9)?,
        category: row.get(10)?,
        sanskrit: row.get(11)?,
        created: timestamp_column(row, 12)?,
        updated: timestamp_column(row, 13)?,
    })
}

/// ICD-11 codes are unique across both modules, so the code alone identifies a row
pub(crate) fn find_in(conn: &Connection, system: CodeSystem, code: &str) -> Result<Option<CodeEntry>> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM {} WHERE code = ?1", system.table());
    let entry = conn.prepare_cached(&sql)?.query_row([code], row_to_entry).optional()?;
    Ok(entry)
}

pub(crate) fn children_in(conn: &Connection, system: CodeSystem, code: &str) -> Result<Vec<CodeEntry>> {
    if !system.is_hierarchical() {
        return Ok(Vec::new());
    }

    let sql = format!(
        "SELECT {ENTRY_COLUMNS} FROM {} WHERE parent = ?1 ORDER BY code ASC",
        system.table()
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let children = stmt
        .query_map([code], row_to_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(children)
}

fn stored_hash(conn: &Connection, system: CodeSystem, code: &str) -> Result<Option<String>> {
    let sql = format!("SELECT content_hash FROM {} WHERE code = ?1", system.table());
    let hash = conn.query_row(&sql, [code], |row| row.get(0)).optional()?;
    Ok(hash)
}

// ============================================================================
// WRITE PATH
// ============================================================================

/// Store-dependent checks: identity collisions, module partition, hierarchy
fn check_write(conn: &Connection, entry: &CodeEntry, existing: Option<&CodeEntry>, mode: UpsertMode) -> Result<()> {
    let context = "CodeRegistry";
    let mut errors = Vec::new();

    if let Some(existing) = existing {
        if entry.system.is_hierarchical() && existing.module != entry.module {
            errors.push(ValidationError::new(
                context,
                "module",
                format!(
                    "Code {} is already registered in module {}",
                    entry.code,
                    existing.module.map(|m| m.as_str()).unwrap_or("none")
                ),
            ));
        }

        if mode == UpsertMode::Insert && (existing.display != entry.display || existing.version != entry.version) {
            errors.push(ValidationError::new(
                context,
                "code",
                format!(
                    "Code {} already exists with display '{}' version {}; an explicit update is required",
                    entry.code, existing.display, existing.version
                ),
            ));
        }
    }

    if let Some(parent_code) = &entry.parent {
        check_parent(conn, entry, parent_code, &mut errors)?;
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::ValidationFailed(errors))
    }
}

/// The parent must live in the same module and must not lead back to the entry.
/// A parent that is not registered yet is accepted as a forward reference.
fn check_parent(conn: &Connection, entry: &CodeEntry, parent_code: &str, errors: &mut Vec<ValidationError>) -> Result<()> {
    let context = "CodeRegistry";

    let Some(parent) = find_in(conn, entry.system, parent_code)? else {
        return Ok(());
    };

    if parent.module != entry.module {
        errors.push(ValidationError::new(
            context,
            "parent",
            format!("Parent {} belongs to a different module", parent_code),
        ));
    }

    let mut next = parent.parent;
    let mut depth = 1;
    while let Some(code) = next {
        if code == entry.code {
            errors.push(ValidationError::new(
                context,
                "parent",
                format!("Parent {} would create a cycle through {}", parent_code, entry.code),
            ));
            break;
        }
        depth += 1;
        if depth > MAX_HIERARCHY_DEPTH {
            errors.push(ValidationError::new(
                context,
                "parent",
                format!("Hierarchy deeper than {} levels", MAX_HIERARCHY_DEPTH),
            ));
            break;
        }
        next = find_in(conn, entry.system, &code)?.and_then(|ancestor| ancestor.parent);
    }

    Ok(())
}

pub(crate) fn upsert_in(conn: &Connection, entry: &CodeEntry, mode: UpsertMode) -> Result<UpsertOutcome> {
    let hash = entry.content_hash();
    let existing = find_in(conn, entry.system, &entry.code)?;

    if existing.is_some() && stored_hash(conn, entry.system, &entry.code)?.as_deref() == Some(hash.as_str()) {
        return Ok(UpsertOutcome::Unchanged);
    }

    check_write(conn, entry, existing.as_ref(), mode)?;

    let tokens = index::entry_tokens(entry);
    let token_count: i64 = tokens.values().sum();
    let designations_json = to_json(&entry.designations)?;
    let properties_json = to_json(&entry.properties)?;
    let table = entry.system.table();

    let outcome = match &existing {
        None => {
            conn.execute(
                &format!(
                    "INSERT INTO {table} (
                        code, system, display, definition, designations, properties, version, status,
                        module, parent, category, sanskrit, created, updated, content_hash, token_count
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    entry.code,
                    entry.system.uri(),
                    entry.display,
                    entry.definition,
                    designations_json,
                    properties_json,
                    entry.version,
                    entry.status.as_str(),
                    entry.module.map(|m| m.as_str()),
                    entry.parent,
                    entry.category,
                    entry.sanskrit,
                    entry.created.to_rfc3339(),
                    entry.updated.to_rfc3339(),
                    hash,
                    token_count,
                ],
            )?;
            UpsertOutcome::Inserted
        }
        Some(_) => {
            // `created` is kept from the first registration
            conn.execute(
                &format!(
                    "UPDATE {table} SET
                        display = ?2, definition = ?3, designations = ?4, properties = ?5, version = ?6,
                        status = ?7, module = ?8, parent = ?9, category = ?10, sanskrit = ?11,
                        updated = ?12, content_hash = ?13, token_count = ?14
                     WHERE code = ?1"
                ),
                params![
                    entry.code,
                    entry.display,
                    entry.definition,
                    designations_json,
                    properties_json,
                    entry.version,
                    entry.status.as_str(),
                    entry.module.map(|m| m.as_str()),
                    entry.parent,
                    entry.category,
                    entry.sanskrit,
                    entry.updated.to_rfc3339(),
                    hash,
                    token_count,
                ],
            )?;
            UpsertOutcome::Updated
        }
    };

    index::write_entry_index(conn, entry, &tokens)?;

    tracing::debug!(system = %entry.system, code = %entry.code, ?outcome, "code entry written");
    Ok(outcome)
}
