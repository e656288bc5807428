// 🔎 Index Layer - Free-text tokens, property filters and the search query
//
// Maintained synchronously: every registry write calls `write_entry_index`
// inside the same transaction as the row itself. The unique indexes on the
// natural keys live in the schema (see db.rs); this module owns the two
// derived tables `search_tokens` and `code_properties`.

use crate::entities::{CodeEntry, CodeSystem, EntryStatus, Icd11Module, PropertyValue};
use crate::error::Result;
use rusqlite::types::Value;
use rusqlite::{params, Connection};
use std::collections::{BTreeMap, BTreeSet};

/// Score bonus when the query equals the code (case-insensitive)
const EXACT_CODE_SCORE: f64 = 2.0;
/// Score bonus when the code starts with the query
const PREFIX_CODE_SCORE: f64 = 1.0;

// ============================================================================
// TOKENIZER
// ============================================================================

/// Lowercase alphanumeric runs. Every other character separates tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Token -> occurrence count over every searchable field of the entry
pub fn entry_tokens(entry: &CodeEntry) -> BTreeMap<String, i64> {
    let mut counts = BTreeMap::new();
    for field in entry.searchable_text() {
        for token in tokenize(field) {
            *counts.entry(token).or_insert(0) += 1;
        }
    }
    counts
}

// ============================================================================
// INDEX MAINTENANCE
// ============================================================================

/// Replace the token and property index entries of one code.
/// Must run inside the transaction that writes the row.
pub(crate) fn write_entry_index(
    conn: &Connection,
    entry: &CodeEntry,
    tokens: &BTreeMap<String, i64>,
) -> Result<()> {
    let collection = entry.system.table();
    remove_entry_index(conn, entry.system, &entry.code)?;

    let mut insert_token = conn.prepare_cached(
        "INSERT INTO search_tokens (collection, code, token, occurrences) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (token, occurrences) in tokens {
        insert_token.execute(params![collection, entry.code, token, occurrences])?;
    }

    let mut insert_property = conn.prepare_cached(
        "INSERT INTO code_properties (collection, code, property_code, value_key) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (property_code, value) in &entry.properties {
        insert_property.execute(params![collection, entry.code, property_code, value.index_key()])?;
    }

    Ok(())
}

pub(crate) fn remove_entry_index(conn: &Connection, system: CodeSystem, code: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM search_tokens WHERE collection = ?1 AND code = ?2",
        params![system.table(), code],
    )?;
    conn.execute(
        "DELETE FROM code_properties WHERE collection = ?1 AND code = ?2",
        params![system.table(), code],
    )?;
    Ok(())
}

// ============================================================================
// SEARCH QUERY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SearchQuery {
    /// None searches all three systems
    pub system: Option<CodeSystem>,
    pub text: Option<String>,
    /// Exact (property code, value) pairs; all must match
    pub properties: Vec<(String, PropertyValue)>,
    pub module: Option<Icd11Module>,
    pub parent: Option<String>,
    pub category: Option<String>,
    pub status: Option<EntryStatus>,
    /// Starts at 1
    pub page: usize,
    pub page_size: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        SearchQuery {
            system: None,
            text: None,
            properties: Vec::new(),
            module: None,
            parent: None,
            category: None,
            status: None,
            page: 1,
            page_size: 20,
        }
    }
}

impl SearchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(mut self, system: CodeSystem) -> Self {
        self.system = Some(system);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn property(mut self, code: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.push((code.into(), value.into()));
        self
    }

    pub fn module(mut self, module: Icd11Module) -> Self {
        self.module = Some(module);
        self
    }

    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn status(mut self, status: EntryStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn page(mut self, page: usize, page_size: usize) -> Self {
        self.page = page;
        self.page_size = page_size;
        self
    }

    /// Page and size after bounds: page >= 1, 1 <= size <= max_page_size
    pub fn bounded_page(&self, max_page_size: usize) -> (usize, usize) {
        let page = self.page.max(1);
        let size = self.page_size.clamp(1, max_page_size.max(1));
        (page, size)
    }

    fn trimmed_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

/// Parse a `code=value` filter; the value type is inferred
pub fn parse_property_filter(raw: &str) -> Option<(String, PropertyValue)> {
    let (code, value) = raw.split_once('=')?;
    let code = code.trim();
    if code.is_empty() {
        return None;
    }
    Some((code.to_string(), PropertyValue::infer(value)))
}

/// One ranked (system, code) produced by the search SQL
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ScoredCode {
    pub system: CodeSystem,
    pub code: String,
    pub score: f64,
}

// ============================================================================
// SQL BUILDER
// ============================================================================

/// SQL text plus numbered parameters (`?1`, `?2`, ...) so one value can be
/// referenced from several UNION branches.
struct SqlBuilder {
    params: Vec<Value>,
}

impl SqlBuilder {
    fn bind(&mut self, value: impl Into<Value>) -> String {
        self.params.push(value.into());
        format!("?{}", self.params.len())
    }
}

/// Escape LIKE wildcards so a query like "A_1" matches literally
fn like_prefix(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() + 1);
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

struct BoundText {
    exact: String,
    prefix: String,
    tokens: Vec<String>,
}

fn branch_sql(system: CodeSystem, query: &SearchQuery, text: Option<&BoundText>, binds: &mut SqlBuilder) -> String {
    let table = system.table();
    let mut conditions: Vec<String> = Vec::new();

    let score = match text {
        Some(text) => {
            let token_list = text.tokens.join(", ");
            let code_score = format!(
                "(CASE WHEN lower(t.code) = {exact} THEN {EXACT_CODE_SCORE:.1} \
                 WHEN t.code LIKE {prefix} ESCAPE '\\' THEN {PREFIX_CODE_SCORE:.1} ELSE 0.0 END)",
                exact = text.exact,
                prefix = text.prefix,
            );

            if text.tokens.is_empty() {
                conditions.push(format!("t.code LIKE {} ESCAPE '\\'", text.prefix));
                code_score
            } else {
                conditions.push(format!(
                    "((SELECT COUNT(*) FROM search_tokens s
                        WHERE s.collection = '{table}' AND s.code = t.code AND s.token IN ({token_list})) = {n}
                      OR t.code LIKE {prefix} ESCAPE '\\')",
                    n = text.tokens.len(),
                    prefix = text.prefix,
                ));
                format!(
                    "{code_score} + COALESCE((SELECT SUM(s.occurrences) FROM search_tokens s
                        WHERE s.collection = '{table}' AND s.code = t.code AND s.token IN ({token_list})), 0)
                        * 1.0 / MAX(t.token_count, 1)"
                )
            }
        }
        None => "0.0".to_string(),
    };

    if let Some(module) = query.module {
        conditions.push(format!("t.module = {}", binds.bind(module.as_str().to_string())));
    }
    if let Some(parent) = &query.parent {
        conditions.push(format!("t.parent = {}", binds.bind(parent.clone())));
    }
    if let Some(category) = &query.category {
        conditions.push(format!("t.category = {}", binds.bind(category.clone())));
    }
    if let Some(status) = query.status {
        conditions.push(format!("t.status = {}", binds.bind(status.as_str().to_string())));
    }
    for (property_code, value) in &query.properties {
        let code_param = binds.bind(property_code.clone());
        let value_param = binds.bind(value.index_key());
        conditions.push(format!(
            "EXISTS (SELECT 1 FROM code_properties p
                WHERE p.collection = '{table}' AND p.code = t.code
                  AND p.property_code = {code_param} AND p.value_key = {value_param})"
        ));
    }

    let where_clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    };

    format!(
        "SELECT '{uri}' AS system_uri, t.code AS code, {score} AS score FROM {table} t{where_clause}",
        uri = system.uri(),
    )
}

/// Run the ranked search. Returns the total number of matches and the
/// requested page of (system, code, score), ordered by score descending,
/// then code ascending, then system.
pub(crate) fn search_codes(
    conn: &Connection,
    query: &SearchQuery,
    max_page_size: usize,
) -> Result<(usize, Vec<ScoredCode>)> {
    let mut binds = SqlBuilder { params: Vec::new() };

    let text = query.trimmed_text().map(|raw| {
        let lowered = raw.to_lowercase();
        let unique: BTreeSet<String> = tokenize(raw).into_iter().collect();
        BoundText {
            exact: binds.bind(lowered.clone()),
            prefix: binds.bind(like_prefix(&lowered)),
            tokens: unique.into_iter().map(|t| binds.bind(t)).collect(),
        }
    });

    let systems: Vec<CodeSystem> = match query.system {
        Some(system) => vec![system],
        None => CodeSystem::ALL.to_vec(),
    };

    let union = systems
        .iter()
        .map(|system| branch_sql(*system, query, text.as_ref(), &mut binds))
        .collect::<Vec<_>>()
        .join(" UNION ALL ");

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM ({union})"),
        rusqlite::params_from_iter(binds.params.iter()),
        |row| row.get(0),
    )?;

    let (page, page_size) = query.bounded_page(max_page_size);
    let Some(offset) = (page - 1).checked_mul(page_size).and_then(|o| i64::try_from(o).ok()) else {
        tracing::debug!(total, page, page_size, "page lies past every possible match");
        return Ok((total as usize, Vec::new()));
    };
    let limit_param = binds.bind(page_size as i64);
    let offset_param = binds.bind(offset);

    let sql = format!(
        "SELECT system_uri, code, score FROM ({union})
         ORDER BY score DESC, code ASC, system_uri ASC
         LIMIT {limit_param} OFFSET {offset_param}"
    );

    tracing::debug!(total, page, page_size, "search executed");

    let mut stmt = conn.prepare(&sql)?;
    let hits = stmt
        .query_map(rusqlite::params_from_iter(binds.params.iter()), |row| {
            Ok(ScoredCode {
                system: crate::db::enum_column(row, 0)?,
                code: row.get(1)?,
                score: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok((total as usize, hits))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::DesignationUse;

    #[test]
    fn test_tokenize_lowercases_and_splits_on_punctuation() {
        assert_eq!(
            tokenize("Vāta-vyādhi (Wind) disorder"),
            vec!["vāta", "vyādhi", "wind", "disorder"]
        );
        assert!(tokenize("  --  ").is_empty());
    }

    #[test]
    fn test_entry_tokens_count_across_fields() {
        let entry = CodeEntry::new(CodeSystem::Namaste, "AAA-1", "Vata disorder")
            .with_definition("A disorder of vata")
            .with_designation("en", "Wind disorder", DesignationUse::Synonym);

        let tokens = entry_tokens(&entry);
        assert_eq!(tokens["disorder"], 3);
        assert_eq!(tokens["vata"], 2);
        assert_eq!(tokens["wind"], 1);
    }

    #[test]
    fn test_like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix("a_1%"), "a\\_1\\%%");
    }

    #[test]
    fn test_parse_property_filter() {
        assert_eq!(
            parse_property_filter("severity=2"),
            Some(("severity".to_string(), PropertyValue::Integer(2)))
        );
        assert_eq!(
            parse_property_filter("traditional-system = ayurveda"),
            Some(("traditional-system".to_string(), PropertyValue::from("ayurveda")))
        );
        assert!(parse_property_filter("no-equals").is_none());
        assert!(parse_property_filter("=x").is_none());
    }

    #[test]
    fn test_bounded_page() {
        let query = SearchQuery::new().page(0, 10_000);
        assert_eq!(query.bounded_page(100), (1, 100));

        let query = SearchQuery::new().page(3, 0);
        assert_eq!(query.bounded_page(100), (3, 1));
    }

    #[test]
    fn test_branch_sql_binds_each_filter() {
        let query = SearchQuery::new()
            .module(Icd11Module::Tm2)
            .property("severity", 2i64);
        let mut binds = SqlBuilder { params: Vec::new() };

        let sql = branch_sql(CodeSystem::Icd11, &query, None, &mut binds);

        assert!(sql.contains("FROM icd11_codes t"));
        assert!(sql.contains("t.module = ?1"));
        assert!(sql.contains("p.property_code = ?2 AND p.value_key = ?3"));
        assert_eq!(binds.params.len(), 3);
    }
}
