//! Local SQLite database for cart view preferences and the last snapshot.
//!
//! Uses rusqlite with WAL mode. Holds the persisted modality filter (the
//! "client-local storage" of the cart panel) and the last reconciled cart
//! snapshot so a restarted session can render before its first fetch.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

use crate::error::CartError;
use crate::model::{CartItem, ModalityFilter};

/// Setting category for cart panel preferences.
pub const CART_VIEW_CATEGORY: &str = "cart_view";
/// Setting key for the persisted modality filter.
pub const MODALITY_FILTER_KEY: &str = "modality_filter";

pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

fn storage_err(context: &str) -> impl Fn(rusqlite::Error) -> CartError + '_ {
    move |e| CartError::Storage(format!("{context}: {e}"))
}

/// Initialize the database at `{data_dir}/cart.db`.
///
/// Creates the directory if needed and runs pending migrations. On open
/// failure the file is deleted and the open retried once; the data is a
/// cache of server state, so losing it is harmless.
pub fn init(data_dir: &Path) -> Result<DbState, CartError> {
    fs::create_dir_all(data_dir)
        .map_err(|e| CartError::Storage(format!("Failed to create data dir: {e}")))?;

    let db_path = data_dir.join("cart.db");
    info!("Opening cart database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!("Database open failed ({first_err}), deleting and retrying once");
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path).map_err(|e| {
                CartError::Storage(format!("Database open failed after retry: {e}"))
            })?
        }
    };

    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// In-memory database, used by tests and by sessions without a data dir.
pub fn init_in_memory() -> Result<DbState, CartError> {
    let conn = Connection::open_in_memory().map_err(storage_err("sqlite open"))?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn open_and_configure(path: &Path) -> Result<Connection, CartError> {
    let conn = Connection::open(path).map_err(storage_err("sqlite open"))?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(storage_err("pragma setup"))?;
    Ok(conn)
}

fn run_migrations(conn: &Connection) -> Result<(), CartError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(storage_err("create schema_version"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        return Ok(());
    }
    info!("Migrating cart database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    Ok(())
}

/// Migration v1: category/key/value settings.
fn migrate_v1(conn: &Connection) -> Result<(), CartError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );
        INSERT INTO schema_version (version) VALUES (1);",
    )
    .map_err(storage_err("migration v1"))
}

/// Migration v2: last reconciled cart snapshot (single row).
fn migrate_v2(conn: &Connection) -> Result<(), CartError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS cart_snapshot (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            items TEXT NOT NULL DEFAULT '[]',
            last_updated TEXT NOT NULL
        );
        INSERT INTO schema_version (version) VALUES (2);",
    )
    .map_err(storage_err("migration v2"))
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), CartError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(storage_err("set_setting"))?;
    Ok(())
}

/// Persisted filter; unknown or missing values read as ALL.
pub fn load_filter(conn: &Connection) -> ModalityFilter {
    get_setting(conn, CART_VIEW_CATEGORY, MODALITY_FILTER_KEY)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default()
}

pub fn save_filter(conn: &Connection, filter: ModalityFilter) -> Result<(), CartError> {
    set_setting(conn, CART_VIEW_CATEGORY, MODALITY_FILTER_KEY, filter.as_str())
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

pub fn save_snapshot(conn: &Connection, items: &[CartItem]) -> Result<(), CartError> {
    let json = serde_json::to_string(items)
        .map_err(|e| CartError::Storage(format!("serialize snapshot: {e}")))?;
    conn.execute(
        "INSERT INTO cart_snapshot (id, items, last_updated) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE
         SET items = excluded.items, last_updated = excluded.last_updated",
        params![json, Utc::now().to_rfc3339()],
    )
    .map_err(storage_err("save snapshot"))?;
    Ok(())
}

/// Last saved snapshot with its timestamp. A corrupt row is discarded.
pub fn load_snapshot(
    conn: &Connection,
) -> Result<Option<(Vec<CartItem>, DateTime<Utc>)>, CartError> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT items, last_updated FROM cart_snapshot WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(storage_err("load snapshot"))?;

    let Some((items_json, last_updated)) = row else {
        return Ok(None);
    };
    let items = match serde_json::from_str::<Vec<CartItem>>(&items_json) {
        Ok(items) => items,
        Err(e) => {
            warn!("Discarding unreadable cart snapshot: {e}");
            clear_snapshot(conn)?;
            return Ok(None);
        }
    };
    let last_updated = DateTime::parse_from_rfc3339(&last_updated)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    Ok(Some((items, last_updated)))
}

pub fn clear_snapshot(conn: &Connection) -> Result<(), CartError> {
    conn.execute("DELETE FROM cart_snapshot", [])
        .map_err(storage_err("clear snapshot"))?;
    Ok(())
}
