use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use rule_ledger_core::{LedgerError, OrderKey, Rule, RuleId, RulePayload};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS rules (
  rule_id TEXT PRIMARY KEY,
  order_key REAL NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  name TEXT NOT NULL,
  sources_json TEXT NOT NULL,
  destinations_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_meta (
  id INTEGER PRIMARY KEY CHECK (id = 1),
  revision INTEGER NOT NULL
);

INSERT OR IGNORE INTO ledger_meta(id, revision) VALUES (1, 0);

CREATE INDEX IF NOT EXISTS idx_rules_order_key ON rules(order_key);
";

const SELECT_RULE_COLUMNS: &str =
    "rule_id, order_key, created_at, updated_at, name, sources_json, destinations_json";

/// One entry in a transactional write batch. The batch commits entirely or
/// not at all; readers never observe a partially applied batch.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert { rule: Rule },
    UpdateKey { id: RuleId, key: OrderKey },
    UpdatePayload { id: RuleId, payload: RulePayload },
    Delete { id: RuleId },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateKey {
    pub rule_id: String,
    pub other_rule_id: String,
    pub order_key: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub duplicate_keys: Vec<DuplicateKey>,
    pub schema_status: SchemaStatus,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a SQLite-backed rule store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the database cannot be
    /// opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        let conn = Connection::open(path).map_err(|err| {
            store_err(&format!("failed to open sqlite database at {}", path.display()), &err)
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(|err| store_err("failed to configure sqlite pragmas", &err))?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when schema metadata cannot
    /// be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus, LedgerError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(|err| store_err("failed to apply schema_migrations table", &err))?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when migration bootstrapping
    /// or any migration step fails.
    pub fn migrate(&mut self) -> Result<(), LedgerError> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .map_err(|err| store_err("failed to apply schema_migrations table", &err))?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            self.conn
                .execute_batch(MIGRATION_001_SQL)
                .map_err(|err| store_err("failed to apply migration v1", &err))?;
            record_schema_version(&self.conn, 1)?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(LedgerError::StoreUnavailable(format!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            )));
        }

        Ok(())
    }

    /// Ascending key-ordered scan over real rules, starting strictly after
    /// `after_key` when given. `limit = None` returns the full tail.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when rows cannot be read or
    /// decoded.
    pub fn list_range(
        &self,
        after_key: Option<OrderKey>,
        limit: Option<usize>,
    ) -> Result<Vec<Rule>, LedgerError> {
        let query = format!(
            "SELECT {SELECT_RULE_COLUMNS} FROM rules
             WHERE ?1 IS NULL OR order_key > ?1
             ORDER BY order_key ASC, rule_id ASC
             LIMIT ?2"
        );
        let mut stmt = self
            .conn
            .prepare(&query)
            .map_err(|err| store_err("failed to prepare range scan", &err))?;

        let limit = limit.map_or(-1_i64, |value| i64::try_from(value).unwrap_or(i64::MAX));
        let rows = stmt
            .query_map(params![after_key.map(OrderKey::value), limit], read_rule_row)
            .map_err(|err| store_err("failed to run range scan", &err))?;

        let mut rules = Vec::new();
        for row in rows {
            let raw = row.map_err(|err| store_err("failed to read rule row", &err))?;
            rules.push(decode_rule(raw)?);
        }

        Ok(rules)
    }

    /// Count of real rules; the sentinel is virtual and never stored.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the count query fails.
    pub fn count(&self) -> Result<u64, LedgerError> {
        let raw = self
            .conn
            .query_row("SELECT COUNT(*) FROM rules", [], |row| row.get::<_, i64>(0))
            .map_err(|err| store_err("failed to count rules", &err))?;
        u64::try_from(raw).map_err(|err| store_err("row count out of range", &err))
    }

    /// Point lookup by rule id.
    ///
    /// # Errors
    /// Returns [`LedgerError::NotFound`] when the id is absent, or
    /// [`LedgerError::StoreUnavailable`] on query failure.
    pub fn get(&self, id: RuleId) -> Result<Rule, LedgerError> {
        let query =
            format!("SELECT {SELECT_RULE_COLUMNS} FROM rules WHERE rule_id = ?1");
        let raw = self
            .conn
            .query_row(&query, params![id.to_string()], read_rule_row)
            .optional()
            .map_err(|err| store_err("failed to look up rule", &err))?
            .ok_or(LedgerError::NotFound(id))?;
        decode_rule(raw)
    }

    /// Greatest-key rule strictly below `before`, optionally excluding one id
    /// (the record being moved resolves its own gap without seeing itself).
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] on query failure.
    pub fn predecessor(
        &self,
        before: OrderKey,
        exclude: Option<RuleId>,
    ) -> Result<Option<Rule>, LedgerError> {
        let query = format!(
            "SELECT {SELECT_RULE_COLUMNS} FROM rules
             WHERE order_key < ?1 AND (?2 IS NULL OR rule_id <> ?2)
             ORDER BY order_key DESC, rule_id DESC
             LIMIT 1"
        );
        let raw = self
            .conn
            .query_row(
                &query,
                params![before.value(), exclude.map(|id| id.to_string())],
                read_rule_row,
            )
            .optional()
            .map_err(|err| store_err("failed to resolve predecessor", &err))?;
        raw.map(decode_rule).transpose()
    }

    /// Greatest-key rule overall, optionally excluding one id.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] on query failure.
    pub fn last(&self, exclude: Option<RuleId>) -> Result<Option<Rule>, LedgerError> {
        let query = format!(
            "SELECT {SELECT_RULE_COLUMNS} FROM rules
             WHERE ?1 IS NULL OR rule_id <> ?1
             ORDER BY order_key DESC, rule_id DESC
             LIMIT 1"
        );
        let raw = self
            .conn
            .query_row(&query, params![exclude.map(|id| id.to_string())], read_rule_row)
            .optional()
            .map_err(|err| store_err("failed to resolve last rule", &err))?;
        raw.map(decode_rule).transpose()
    }

    /// Current optimistic revision stamp for the collection.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the stamp cannot be read.
    pub fn revision(&self) -> Result<i64, LedgerError> {
        self.conn
            .query_row("SELECT revision FROM ledger_meta WHERE id = 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .map_err(|err| store_err("failed to read collection revision", &err))
    }

    /// Apply a write batch as one transaction guarded by the optimistic
    /// revision stamp. The stamp is re-checked inside the transaction; on
    /// mismatch nothing is applied and [`LedgerError::Conflict`] is returned.
    ///
    /// # Errors
    /// [`LedgerError::Conflict`] on a stale revision, [`LedgerError::NotFound`]
    /// when an update or delete references an absent id (batch rolled back),
    /// [`LedgerError::StoreUnavailable`] on any storage failure.
    pub fn apply(&mut self, ops: &[WriteOp], expected_revision: i64) -> Result<(), LedgerError> {
        let tx = self
            .conn
            .transaction()
            .map_err(|err| store_err("failed to start write transaction", &err))?;

        let current: i64 = tx
            .query_row("SELECT revision FROM ledger_meta WHERE id = 1", [], |row| row.get(0))
            .map_err(|err| store_err("failed to read collection revision", &err))?;
        if current != expected_revision {
            return Err(LedgerError::Conflict);
        }

        let now = now_rfc3339()?;
        for op in ops {
            match op {
                WriteOp::Insert { rule } => {
                    tx.execute(
                        "INSERT INTO rules(
                            rule_id, order_key, created_at, updated_at,
                            name, sources_json, destinations_json
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        params![
                            rule.id.to_string(),
                            rule.key.value(),
                            rfc3339(rule.created_at)?,
                            rfc3339(rule.updated_at)?,
                            rule.payload.name,
                            encode_endpoints(&rule.payload.sources)?,
                            encode_endpoints(&rule.payload.destinations)?,
                        ],
                    )
                    .map_err(|err| store_err("failed to insert rule", &err))?;
                }
                WriteOp::UpdateKey { id, key } => {
                    let affected = tx
                        .execute(
                            "UPDATE rules SET order_key = ?2, updated_at = ?3 WHERE rule_id = ?1",
                            params![id.to_string(), key.value(), now],
                        )
                        .map_err(|err| store_err("failed to update rule key", &err))?;
                    if affected == 0 {
                        return Err(LedgerError::NotFound(*id));
                    }
                }
                WriteOp::UpdatePayload { id, payload } => {
                    let affected = tx
                        .execute(
                            "UPDATE rules
                             SET name = ?2, sources_json = ?3, destinations_json = ?4,
                                 updated_at = ?5
                             WHERE rule_id = ?1",
                            params![
                                id.to_string(),
                                payload.name,
                                encode_endpoints(&payload.sources)?,
                                encode_endpoints(&payload.destinations)?,
                                now,
                            ],
                        )
                        .map_err(|err| store_err("failed to update rule payload", &err))?;
                    if affected == 0 {
                        return Err(LedgerError::NotFound(*id));
                    }
                }
                WriteOp::Delete { id } => {
                    let affected = tx
                        .execute("DELETE FROM rules WHERE rule_id = ?1", params![id.to_string()])
                        .map_err(|err| store_err("failed to delete rule", &err))?;
                    if affected == 0 {
                        return Err(LedgerError::NotFound(*id));
                    }
                }
            }
        }

        tx.execute("UPDATE ledger_meta SET revision = revision + 1 WHERE id = 1", [])
            .map_err(|err| store_err("failed to bump collection revision", &err))?;
        tx.commit().map_err(|err| store_err("failed to commit write transaction", &err))?;
        Ok(())
    }

    /// Run quick-check, duplicate-order-key, and schema status health probes.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when any probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport, LedgerError> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|err| store_err("failed to run PRAGMA quick_check", &err))?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT a.rule_id, b.rule_id, a.order_key
                 FROM rules a
                 JOIN rules b ON a.order_key = b.order_key AND a.rule_id < b.rule_id
                 ORDER BY a.order_key ASC",
            )
            .map_err(|err| store_err("failed to prepare duplicate-key probe", &err))?;
        let rows = stmt
            .query_map([], |row| {
                Ok(DuplicateKey {
                    rule_id: row.get(0)?,
                    other_rule_id: row.get(1)?,
                    order_key: row.get(2)?,
                })
            })
            .map_err(|err| store_err("failed to run duplicate-key probe", &err))?;

        let mut duplicate_keys = Vec::new();
        for row in rows {
            duplicate_keys
                .push(row.map_err(|err| store_err("failed to read duplicate-key row", &err))?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            duplicate_keys,
            schema_status,
        })
    }

    /// Create a SQLite backup file of the current main database.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when backup directories
    /// cannot be created or the backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<(), LedgerError> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                store_err(
                    &format!("failed to create parent directory for {}", out_file.display()),
                    &err,
                )
            })?;
        }

        self.conn.backup(DatabaseName::Main, out_file, None).map_err(|err| {
            store_err(&format!("failed to create sqlite backup at {}", out_file.display()), &err)
        })
    }

    /// Restore this database from a SQLite backup file, then migrate.
    ///
    /// # Errors
    /// Returns [`LedgerError::StoreUnavailable`] when the backup file is
    /// missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<(), LedgerError> {
        if !in_file.exists() {
            return Err(LedgerError::StoreUnavailable(format!(
                "backup file does not exist: {}",
                in_file.display()
            )));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .map_err(|err| {
                store_err(
                    &format!("failed to restore sqlite backup from {}", in_file.display()),
                    &err,
                )
            })?;

        self.migrate()
    }
}

#[derive(Debug)]
struct RuleRow {
    rule_id: String,
    order_key: f64,
    created_at: String,
    updated_at: String,
    name: String,
    sources_json: String,
    destinations_json: String,
}

fn read_rule_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RuleRow> {
    Ok(RuleRow {
        rule_id: row.get(0)?,
        order_key: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        name: row.get(4)?,
        sources_json: row.get(5)?,
        destinations_json: row.get(6)?,
    })
}

fn decode_rule(raw: RuleRow) -> Result<Rule, LedgerError> {
    let id = Ulid::from_str(&raw.rule_id)
        .map_err(|err| store_err(&format!("invalid rule id {}", raw.rule_id), &err))?;
    let key = OrderKey::new(raw.order_key)
        .map_err(|err| store_err(&format!("invalid order key for {}", raw.rule_id), &err))?;

    Ok(Rule {
        id: RuleId(id),
        key,
        created_at: parse_rfc3339(&raw.created_at)?,
        updated_at: parse_rfc3339(&raw.updated_at)?,
        payload: RulePayload {
            name: raw.name,
            sources: decode_endpoints(&raw.sources_json)?,
            destinations: decode_endpoints(&raw.destinations_json)?,
        },
    })
}

fn encode_endpoints(endpoints: &[rule_ledger_core::Endpoint]) -> Result<String, LedgerError> {
    serde_json::to_string(endpoints)
        .map_err(|err| store_err("failed to serialize endpoints", &err))
}

fn decode_endpoints(raw: &str) -> Result<Vec<rule_ledger_core::Endpoint>, LedgerError> {
    serde_json::from_str(raw).map_err(|err| store_err("failed to deserialize endpoints", &err))
}

fn store_err(context: &str, err: &impl Display) -> LedgerError {
    LedgerError::StoreUnavailable(format!("{context}: {err}"))
}

fn current_schema_version(conn: &Connection) -> Result<i64, LedgerError> {
    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .map_err(|err| store_err("failed to read current schema version", &err))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<(), LedgerError> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .map_err(|err| store_err(&format!("failed to record migration version {version}"), &err))?;
    Ok(())
}

fn now_rfc3339() -> Result<String, LedgerError> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| store_err("failed to format RFC3339 timestamp", &err))
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, LedgerError> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| store_err(&format!("invalid RFC3339 timestamp: {value}"), &err))
}
