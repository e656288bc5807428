// 🗄️ Storage Context - SQLite backend for the six collections
//
// One explicitly passed context owns the connection: opened once (schema is
// created idempotently), closed once. `open_in_memory` is the test fake.
// Every write runs in one IMMEDIATE transaction covering the record and all of
// its index entries, so readers never observe a half-written document.

use crate::deadline::Deadline;
use crate::entities::{AuditLog, Role, User};
use crate::error::{BridgeError, ParseEnumError, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// SQLite VM instructions between two deadline checks inside a running statement
const PROGRESS_OPS: i32 = 1_000;

// ============================================================================
// UPSERT TYPES (ingestion boundary)
// ============================================================================

/// Whether an ingest may replace an existing record whose identity collides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertMode {
    /// Reject a collision that changes display or version
    #[default]
    Insert,
    /// Explicit update flag: replace the stored record
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// Identical content already stored; nothing written
    Unchanged,
}

// ============================================================================
// STORAGE CONTEXT
// ============================================================================

pub struct StorageContext {
    conn: Mutex<Connection>,
    location: String,
}

impl StorageContext {
    /// Open (or create) a file database and make sure the schema exists
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for crash recovery
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        setup_database(&conn)?;

        tracing::info!(path = %path.display(), "storage context opened");

        Ok(StorageContext {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        setup_database(&conn)?;

        Ok(StorageContext {
            conn: Mutex::new(conn),
            location: ":memory:".to_string(),
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// Close the underlying connection. Consumes the context.
    pub fn close(self) -> Result<()> {
        let location = self.location;
        self.conn
            .into_inner()
            .close()
            .map_err(|(_, err)| BridgeError::from(err))?;
        tracing::info!(%location, "storage context closed");
        Ok(())
    }

    /// Monotonic counter bumped by every committed write
    pub fn revision(&self, deadline: &Deadline) -> Result<i64> {
        self.read(deadline, |conn| current_revision(conn))
    }

    /// Run read-only work against one consistent view of the store
    pub(crate) fn read<T>(&self, deadline: &Deadline, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.lock(deadline)?;
        arm(&conn, deadline);
        let result = f(&conn);
        disarm(&conn);
        result
    }

    /// Run a write atomically and bump the store revision on commit
    pub(crate) fn write<T>(&self, deadline: &Deadline, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.transact(deadline, true, f)
    }

    /// Append-only writes (audit trail, users) that do not affect code lookups
    pub(crate) fn append<T>(&self, deadline: &Deadline, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.transact(deadline, false, f)
    }

    fn transact<T>(
        &self,
        deadline: &Deadline,
        bump_revision: bool,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.lock(deadline)?;
        arm(&conn, deadline);
        let result = run_transaction(&mut conn, bump_revision, f);
        disarm(&conn);
        result
    }

    fn lock(&self, deadline: &Deadline) -> Result<MutexGuard<'_, Connection>> {
        deadline.check()?;
        match deadline.expires_at() {
            Some(at) => self.conn.try_lock_until(at).ok_or(BridgeError::Cancelled),
            None => Ok(self.conn.lock()),
        }
    }
}

fn run_transaction<T>(
    conn: &mut Connection,
    bump_revision: bool,
    f: impl FnOnce(&Connection) -> Result<T>,
) -> Result<T> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    // Dropping `tx` on the error path rolls everything back
    let value = f(&tx)?;
    if bump_revision {
        tx.execute("UPDATE store_meta SET value = value + 1 WHERE key = 'revision'", [])?;
    }
    tx.commit()?;
    Ok(value)
}

fn arm(conn: &Connection, deadline: &Deadline) {
    let deadline = deadline.clone();
    conn.progress_handler(PROGRESS_OPS, Some(move || deadline.is_expired()));
}

fn disarm(conn: &Connection) {
    conn.progress_handler(PROGRESS_OPS, None::<fn() -> bool>);
}

pub(crate) fn current_revision(conn: &Connection) -> Result<i64> {
    let revision = conn.query_row(
        "SELECT value FROM store_meta WHERE key = 'revision'",
        [],
        |row| row.get(0),
    )?;
    Ok(revision)
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // ==========================================================================
    // Code collections (same shape; system-specific columns stay NULL elsewhere)
    // ==========================================================================
    for table in ["namaste_codes", "icd11_codes", "who_ayurveda_codes"] {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {table} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    code TEXT NOT NULL,
                    system TEXT NOT NULL,
                    display TEXT NOT NULL,
                    definition TEXT,
                    designations TEXT NOT NULL DEFAULT '[]',
                    properties TEXT NOT NULL DEFAULT '{{}}',
                    version TEXT NOT NULL,
                    status TEXT NOT NULL,
                    module TEXT,
                    parent TEXT,
                    category TEXT,
                    sanskrit TEXT,
                    created TEXT NOT NULL,
                    updated TEXT NOT NULL,
                    content_hash TEXT NOT NULL,
                    token_count INTEGER NOT NULL DEFAULT 0
                )"
            ),
            [],
        )?;
    }

    // ==========================================================================
    // Concept mappings
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS concept_mappings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_system TEXT NOT NULL,
            source_code TEXT NOT NULL,
            target_system TEXT NOT NULL,
            target_code TEXT NOT NULL,
            equivalence TEXT NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            comment TEXT,
            validated_by TEXT,
            validated_at TEXT,
            version TEXT NOT NULL,
            last_updated TEXT NOT NULL,
            mapping_method TEXT NOT NULL,
            content_hash TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Users & audit trail
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            abha_id TEXT NOT NULL,
            email TEXT NOT NULL,
            name TEXT NOT NULL,
            role TEXT NOT NULL,
            institution TEXT NOT NULL,
            active INTEGER NOT NULL,
            last_login TEXT,
            created TEXT NOT NULL,
            updated TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            log_id TEXT UNIQUE NOT NULL,
            user_id TEXT NOT NULL,
            action TEXT NOT NULL,
            resource TEXT NOT NULL,
            details TEXT NOT NULL,
            ip TEXT,
            user_agent TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    // ==========================================================================
    // Index Layer tables (maintained in the same transaction as each write)
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS search_tokens (
            collection TEXT NOT NULL,
            code TEXT NOT NULL,
            token TEXT NOT NULL,
            occurrences INTEGER NOT NULL,
            PRIMARY KEY (collection, code, token)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_properties (
            collection TEXT NOT NULL,
            code TEXT NOT NULL,
            property_code TEXT NOT NULL,
            value_key TEXT NOT NULL,
            PRIMARY KEY (collection, code, property_code)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS store_meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO store_meta (key, value) VALUES ('revision', 0)",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    const INDEXES: &[&str] = &[
        // NAMASTE
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_namaste_code ON namaste_codes(code)",
        "CREATE INDEX IF NOT EXISTS idx_namaste_system ON namaste_codes(system)",
        "CREATE INDEX IF NOT EXISTS idx_namaste_status ON namaste_codes(status)",
        // ICD-11: code spaces are disjoint per module
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_icd11_code_module ON icd11_codes(code, module)",
        "CREATE INDEX IF NOT EXISTS idx_icd11_module ON icd11_codes(module)",
        "CREATE INDEX IF NOT EXISTS idx_icd11_parent ON icd11_codes(parent)",
        "CREATE INDEX IF NOT EXISTS idx_icd11_hierarchy ON icd11_codes(parent, code)",
        // WHO-Ayurveda
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_who_ayurveda_code ON who_ayurveda_codes(code)",
        "CREATE INDEX IF NOT EXISTS idx_who_ayurveda_category ON who_ayurveda_codes(category)",
        // Concept mappings: one record per (sourceCode, source, target) per version
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_mapping_natural_key
            ON concept_mappings(source_code, source_system, target_system, version)",
        "CREATE INDEX IF NOT EXISTS idx_mapping_source ON concept_mappings(source_system, source_code)",
        "CREATE INDEX IF NOT EXISTS idx_mapping_target ON concept_mappings(target_code, target_system)",
        "CREATE INDEX IF NOT EXISTS idx_mapping_confidence ON concept_mappings(confidence DESC)",
        // Users
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_abha ON users(abha_id)",
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email ON users(email)",
        "CREATE INDEX IF NOT EXISTS idx_users_role ON users(role)",
        // Audit logs
        "CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_logs(user_id)",
        "CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_logs(timestamp DESC)",
        "CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_logs(action)",
        "CREATE INDEX IF NOT EXISTS idx_audit_resource ON audit_logs(resource)",
        // Index Layer lookups
        "CREATE INDEX IF NOT EXISTS idx_search_tokens_token ON search_tokens(collection, token)",
        "CREATE INDEX IF NOT EXISTS idx_code_properties_value
            ON code_properties(collection, property_code, value_key)",
    ];

    for statement in INDEXES {
        conn.execute(statement, [])?;
    }

    Ok(())
}

// ============================================================================
// COLUMN DECODING
// ============================================================================

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn optional_enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr<Err = ParseEnumError>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| s.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

pub(crate) fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn optional_timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

pub(crate) fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| BridgeError::StoreUnavailable(conversion_error(0, e)))
}

// ============================================================================
// USERS
// ============================================================================

/// Insert a user, or refresh the one with the same ABHA ID.
/// An email already owned by another user is rejected by the unique index.
pub fn upsert_user(store: &StorageContext, user: &User, deadline: &Deadline) -> Result<()> {
    user.validate().map_err(BridgeError::ValidationFailed)?;

    store.append(deadline, |conn| {
        conn.execute(
            "INSERT INTO users (
                abha_id, email, name, role, institution, active, last_login, created, updated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(abha_id) DO UPDATE SET
                email = excluded.email,
                name = excluded.name,
                role = excluded.role,
                institution = excluded.institution,
                active = excluded.active,
                last_login = excluded.last_login,
                updated = excluded.updated",
            params![
                user.abha_id,
                user.email,
                user.name,
                user.role.as_str(),
                user.institution,
                user.active,
                user.last_login.map(|dt| dt.to_rfc3339()),
                user.created.to_rfc3339(),
                user.updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
}

pub fn find_user_by_abha(store: &StorageContext, abha_id: &str, deadline: &Deadline) -> Result<Option<User>> {
    store.read(deadline, |conn| {
        let user = conn
            .query_row(
                "SELECT abha_id, email, name, role, institution, active, last_login, created, updated
                 FROM users WHERE abha_id = ?1",
                [abha_id],
                |row| {
                    Ok(User {
                        abha_id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        role: enum_column::<Role>(row, 3)?,
                        institution: row.get(4)?,
                        active: row.get(5)?,
                        last_login: optional_timestamp_column(row, 6)?,
                        created: timestamp_column(row, 7)?,
                        updated: timestamp_column(row, 8)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    })
}

// ============================================================================
// AUDIT TRAIL
// ============================================================================

pub fn insert_audit_log(store: &StorageContext, log: &AuditLog, deadline: &Deadline) -> Result<()> {
    let details_json = to_json(&log.details)?;

    store.append(deadline, |conn| {
        conn.execute(
            "INSERT INTO audit_logs (
                log_id, user_id, action, resource, details, ip, user_agent, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                log.id,
                log.user_id,
                log.action,
                log.resource,
                details_json,
                log.ip,
                log.user_agent,
                log.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
}

/// Audit entries for one resource, newest first
pub fn audit_logs_for_resource(
    store: &StorageContext,
    resource: &str,
    deadline: &Deadline,
) -> Result<Vec<AuditLog>> {
    store.read(deadline, |conn| {
        let mut stmt = conn.prepare(
            "SELECT log_id, user_id, action, resource, details, ip, user_agent, timestamp
             FROM audit_logs
             WHERE resource = ?1
             ORDER BY timestamp DESC, id DESC",
        )?;

        let logs = stmt
            .query_map([resource], |row| {
                Ok(AuditLog {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    action: row.get(2)?,
                    resource: row.get(3)?,
                    details: json_column(row, 4)?,
                    ip: row.get(5)?,
                    user_agent: row.get(6)?,
                    timestamp: timestamp_column(row, 7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(logs)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_setup_is_idempotent() {
        let store = StorageContext::open_in_memory().unwrap();

        store
            .read(&Deadline::none(), |conn| {
                setup_database(conn)?;
                setup_database(conn)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(store.revision(&Deadline::none()).unwrap(), 0);
    }

    #[test]
    fn test_write_bumps_revision_and_rollback_does_not() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();

        store.write(&deadline, |_| Ok(())).unwrap();
        assert_eq!(store.revision(&deadline).unwrap(), 1);

        let failed: Result<()> = store.write(&deadline, |conn| {
            conn.execute(
                "INSERT INTO store_meta (key, value) VALUES ('scratch', 1)",
                [],
            )?;
            Err(BridgeError::validation("test", "field", "forced failure"))
        });
        assert!(failed.is_err());
        assert_eq!(store.revision(&deadline).unwrap(), 1);

        let scratch: Option<i64> = store
            .read(&deadline, |conn| {
                Ok(conn
                    .query_row("SELECT value FROM store_meta WHERE key = 'scratch'", [], |r| r.get(0))
                    .optional()?)
            })
            .unwrap();
        assert!(scratch.is_none(), "failed write must leave no partial state");
    }

    #[test]
    fn test_expired_deadline_is_rejected_before_querying() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::at(Instant::now());

        let result = store.revision(&deadline);
        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_cancel_interrupts_running_statement() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();
        let canceller = deadline.clone();

        let result: Result<i64> = store.read(&deadline, |conn| {
            canceller.cancel();
            // Long enough that the progress handler fires mid-statement
            let n = conn.query_row(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 10000000)
                 SELECT COUNT(*) FROM c",
                [],
                |row| row.get(0),
            )?;
            Ok(n)
        });

        assert!(matches!(result, Err(BridgeError::Cancelled)));
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.db");

        let store = StorageContext::open(&path).unwrap();
        store.write(&Deadline::none(), |_| Ok(())).unwrap();
        store.close().unwrap();

        let reopened = StorageContext::open(&path).unwrap();
        assert_eq!(reopened.revision(&Deadline::none()).unwrap(), 1);
    }

    #[test]
    fn test_user_upsert_and_unique_email() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();

        let mut user = User::new("ABHA-1", "vaidya@example.in", "Dr. Rao", Role::Clinician);
        upsert_user(&store, &user, &deadline).unwrap();

        user.role = Role::Auditor;
        upsert_user(&store, &user, &deadline).unwrap();

        let found = find_user_by_abha(&store, "ABHA-1", &deadline).unwrap().unwrap();
        assert_eq!(found.role, Role::Auditor);

        let other = User::new("ABHA-2", "vaidya@example.in", "Dr. Iyer", Role::Clinician);
        let err = upsert_user(&store, &other, &deadline).unwrap_err();
        assert!(matches!(err, BridgeError::ValidationFailed(_)));
    }

    #[test]
    fn test_audit_log_round_trip() {
        let store = StorageContext::open_in_memory().unwrap();
        let deadline = Deadline::none();

        let log = AuditLog::new(
            "importer",
            "code_inserted",
            "namaste/AAA-1",
            serde_json::json!({"version": "1.0.0"}),
        );
        insert_audit_log(&store, &log, &deadline).unwrap();

        let logs = audit_logs_for_resource(&store, "namaste/AAA-1", &deadline).unwrap();
        assert_eq!(logs, vec![log]);

        // Audit writes do not invalidate cached lookups
        assert_eq!(store.revision(&deadline).unwrap(), 0);
    }
}
