//! Schema migrations: numbered `NNN_name.sql` files applied in version order.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use rusqlite::{params, Connection};

use crate::error::{KingraphError, Result};

/// Tables the graph engine expects once every migration has run.
pub const EXPECTED_TABLES: &[&str] = &[
    "accounts",
    "connection_requests",
    "layout_snapshots",
    "profiles",
    "relationship_edges",
    "schema_migrations",
];

#[derive(Debug)]
struct Migration {
    version: u32,
    name: String,
    sql: String,
}

fn ensure_migrations_table(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
        );",
    )?;
    Ok(())
}

/// Names of applied migrations, oldest first.
pub fn get_applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY version")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;
    Ok(names)
}

fn applied_versions(conn: &Connection) -> Result<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations")?;
    let versions = stmt
        .query_map([], |row| row.get::<_, u32>(0))?
        .collect::<std::result::Result<HashSet<_>, rusqlite::Error>>()?;
    Ok(versions)
}

/// "003_connection_requests.sql" -> (3, "003_connection_requests")
fn parse_file_name(file_name: &str) -> Result<(u32, String)> {
    let stem = file_name
        .strip_suffix(".sql")
        .ok_or_else(|| KingraphError::Config(format!("not a migration file: {}", file_name)))?;
    let version = stem
        .split_once('_')
        .and_then(|(prefix, _)| prefix.parse::<u32>().ok())
        .ok_or_else(|| {
            KingraphError::Config(format!(
                "migration {} must be named NNN_description.sql",
                file_name
            ))
        })?;
    Ok((version, stem.to_string()))
}

/// Read every `.sql` file in `migrations_dir`, ordered by version.
fn load_migrations(migrations_dir: &Path) -> Result<Vec<Migration>> {
    let mut by_version: BTreeMap<u32, Migration> = BTreeMap::new();

    for entry in fs::read_dir(migrations_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            continue;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| KingraphError::Config(format!("unreadable migration path {}", path.display())))?;
        let (version, name) = parse_file_name(file_name)?;

        if let Some(clash) = by_version.get(&version) {
            return Err(KingraphError::Config(format!(
                "migrations {} and {} share version {}",
                clash.name, name, version
            )));
        }
        let sql = fs::read_to_string(&path)?;
        by_version.insert(version, Migration { version, name, sql });
    }

    Ok(by_version.into_values().collect())
}

/// Apply pending migrations, then check the graph tables are all present.
///
/// Each migration commits together with its `schema_migrations` row. Returns
/// the names applied by this call.
pub fn run_migrations(conn: &mut Connection, migrations_dir: &Path) -> Result<Vec<String>> {
    ensure_migrations_table(conn)?;
    let applied = applied_versions(conn)?;
    let mut newly_applied = Vec::new();

    for migration in load_migrations(migrations_dir)? {
        if applied.contains(&migration.version) {
            log::debug!("Migration {} already applied", migration.name);
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(&migration.sql)
            .map_err(|source| KingraphError::Migration { name: migration.name.clone(), source })?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )?;
        tx.commit()?;

        log::info!("Applied migration {}", migration.name);
        newly_applied.push(migration.name);
    }

    let missing = missing_tables(conn)?;
    if !missing.is_empty() {
        return Err(KingraphError::Config(format!(
            "schema incomplete after migrations in {}: missing {}",
            migrations_dir.display(),
            missing.join(", ")
        )));
    }

    Ok(newly_applied)
}

/// Names of expected tables that are missing from the database.
pub fn missing_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<HashSet<_>, rusqlite::Error>>()?;

    Ok(EXPECTED_TABLES
        .iter()
        .filter(|t| !tables.contains(**t))
        .map(|t| t.to_string())
        .collect())
}
