// 🗄️ SQLite Export - artifacts in a queryable database + run audit trail
//
// Tables:
//   expenses           enriched records, idempotent on content fingerprint
//   aggregated_groups  replaced wholesale on every export
//   registry           replaced wholesale on every export
//   events             append-only log of pipeline runs

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::consolidation::fingerprint;
use crate::records::{AggregatedGroup, EnrichedRecord, RegistryEntry};

/// Audit trail entry
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub data: serde_json::Value,
    pub actor: String,
}

impl Event {
    pub fn new(
        event_type: &str,
        entity_type: &str,
        entity_id: &str,
        data: serde_json::Value,
        actor: &str,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            data,
            actor: actor.to_string(),
        }
    }
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS expenses (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fingerprint TEXT UNIQUE NOT NULL,
            entity_id TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            quarter INTEGER,
            year INTEGER,
            expense_value REAL,
            inconsistency_flags TEXT NOT NULL,
            registry_id TEXT NOT NULL,
            modality TEXT NOT NULL,
            region TEXT NOT NULL,
            match_status TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS aggregated_groups (
            rank INTEGER PRIMARY KEY,
            entity_name TEXT NOT NULL,
            region TEXT NOT NULL,
            total REAL NOT NULL,
            mean REAL NOT NULL,
            mean_per_period REAL NOT NULL,
            std_dev REAL NOT NULL,
            coefficient_of_variation REAL NOT NULL,
            sample_count INTEGER NOT NULL,
            high_variability INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS registry (
            entity_id TEXT PRIMARY KEY,
            registry_id TEXT NOT NULL,
            entity_name TEXT NOT NULL,
            modality TEXT NOT NULL,
            region TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            data TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_entity ON expenses(entity_id)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_expenses_period ON expenses(year, quarter)",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_entity ON events(entity_type, entity_id)",
        [],
    )?;

    Ok(())
}

/// Insert enriched records; rows already present (same fingerprint) are
/// skipped. Returns the number inserted.
pub fn insert_expenses(conn: &Connection, records: &[EnrichedRecord]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    let mut inserted = 0;
    let mut duplicates = 0;

    {
        let mut stmt = tx.prepare(
            "INSERT INTO expenses (
                fingerprint, entity_id, entity_name, quarter, year, expense_value,
                inconsistency_flags, registry_id, modality, region, match_status
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;

        for enriched in records {
            let r = &enriched.record;
            let result = stmt.execute(params![
                fingerprint(r),
                r.entity_id,
                r.entity_name,
                r.quarter,
                r.year,
                r.expense_value,
                r.inconsistency_flags.to_field(),
                enriched.registry_id,
                enriched.modality,
                enriched.region,
                enriched.match_status.as_str(),
            ]);

            match result {
                Ok(_) => inserted += 1,
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    duplicates += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    tx.commit()?;
    info!("expenses: {} inserted, {} already present", inserted, duplicates);
    Ok(inserted)
}

pub fn replace_aggregated(conn: &Connection, groups: &[AggregatedGroup]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM aggregated_groups", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO aggregated_groups (
                rank, entity_name, region, total, mean, mean_per_period, std_dev,
                coefficient_of_variation, sample_count, high_variability
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for g in groups {
            stmt.execute(params![
                g.rank as i64,
                g.entity_name,
                g.region,
                g.total,
                g.mean,
                g.mean_per_period,
                g.std_dev,
                g.coefficient_of_variation,
                g.sample_count as i64,
                g.high_variability,
            ])?;
        }
    }
    tx.commit()?;
    Ok(groups.len())
}

pub fn replace_registry(conn: &Connection, entries: &[RegistryEntry]) -> Result<usize> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM registry", [])?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO registry (entity_id, registry_id, entity_name, modality, region)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for e in entries {
            stmt.execute(params![e.entity_id, e.registry_id, e.entity_name, e.modality, e.region])?;
        }
    }
    tx.commit()?;
    Ok(entries.len())
}

const RUN_EVENT: &str = "pipeline_run_exported";
const RUN_ENTITY_TYPE: &str = "export";

pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    conn.execute(
        "INSERT INTO events (event_id, timestamp, event_type, entity_type, entity_id, data, actor)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.event_type,
            event.entity_type,
            event.entity_id,
            serde_json::to_string(&event.data)?,
            event.actor,
        ],
    )?;
    Ok(())
}

/// Most recent export logged for the database `target`, if any
pub fn last_export(conn: &Connection, target: &str) -> Result<Option<Event>> {
    let row = conn
        .query_row(
            "SELECT event_id, timestamp, data, actor FROM events
             WHERE event_type = ?1 AND entity_type = ?2 AND entity_id = ?3
             ORDER BY id DESC
             LIMIT 1",
            params![RUN_EVENT, RUN_ENTITY_TYPE, target],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            },
        )
        .optional()?;

    let Some((event_id, timestamp, data, actor)) = row else {
        return Ok(None);
    };
    Ok(Some(Event {
        event_id,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .with_context(|| format!("Bad event timestamp {:?}", timestamp))?
            .with_timezone(&Utc),
        event_type: RUN_EVENT.to_string(),
        entity_type: RUN_ENTITY_TYPE.to_string(),
        entity_id: target.to_string(),
        data: serde_json::from_str(&data).context("Bad event payload")?,
        actor,
    }))
}

pub fn count_expenses(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM expenses", [], |row| row.get(0))?;
    Ok(count)
}

// ============================================================================
// ONE-SHOT EXPORT
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub run_id: String,
    pub expenses_inserted: usize,
    pub groups_written: usize,
    pub registry_written: usize,
    /// When the same database was last exported to, if ever
    pub previous_export: Option<DateTime<Utc>>,
}

impl ExportReport {
    pub fn summary(&self) -> String {
        let previous = match self.previous_export {
            Some(at) => format!("previous export {}", at.to_rfc3339()),
            None => "first export".to_string(),
        };
        format!(
            "run {}: {} expenses inserted, {} groups, {} registry entries ({})",
            self.run_id, self.expenses_inserted, self.groups_written, self.registry_written, previous
        )
    }
}

/// Write every artifact into the database at `db_path` and log the run
pub fn export_run(
    db_path: &Path,
    records: &[EnrichedRecord],
    groups: &[AggregatedGroup],
    registry: &[RegistryEntry],
    actor: &str,
) -> Result<ExportReport> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let conn = Connection::open(db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;
    setup_database(&conn)?;

    let target = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let previous_export = last_export(&conn, &target)?.map(|e| e.timestamp);

    let run_id = uuid::Uuid::new_v4().to_string();
    let expenses_inserted = insert_expenses(&conn, records)?;
    let groups_written = replace_aggregated(&conn, groups)?;
    let registry_written = replace_registry(&conn, registry)?;

    let event = Event::new(
        RUN_EVENT,
        RUN_ENTITY_TYPE,
        &target,
        serde_json::json!({
            "run_id": run_id,
            "records": records.len(),
            "expenses_inserted": expenses_inserted,
            "groups": groups_written,
            "registry_entries": registry_written,
        }),
        actor,
    );
    insert_event(&conn, &event)?;

    let report = ExportReport {
        run_id,
        expenses_inserted,
        groups_written,
        registry_written,
        previous_export,
    };
    info!("export: {}", report.summary());
    Ok(report)
}
