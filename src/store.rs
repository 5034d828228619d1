use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};
use tracing::{debug, info};

use crate::history::{build_sheet_header, cycle_record_to_row};
use crate::prompt::to_csv;
use crate::site::SiteConfig;
use crate::types::CycleRecord;

/// Append-only store of cycle records. Each record is kept as its full JSON
/// document alongside the columns needed for ordering and idempotence.
pub struct CycleStore {
    conn: Mutex<Connection>,
}

impl CycleStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS cycle_records (
                decision_id TEXT PRIMARY KEY,
                timestamp_utc TEXT NOT NULL,
                site_config_hash TEXT NOT NULL,
                created_at TEXT NOT NULL,
                record_json TEXT NOT NULL
            )"#,
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cycle_records_ts ON cycle_records (timestamp_utc)",
            [],
        )?;
        Ok(())
    }

    /// Insert a record, ignoring duplicates by decision_id. Returns true if
    /// the record was actually written.
    pub fn insert_record(&self, record: &CycleRecord, site_config_hash: &str) -> Result<bool> {
        let json = serde_json::to_string(record).context("Failed to serialize cycle record")?;
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO cycle_records
             (decision_id, timestamp_utc, site_config_hash, created_at, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.decision_id,
                record.timestamp_utc_iso,
                site_config_hash,
                chrono::Utc::now().to_rfc3339(),
                json,
            ],
        )?;
        if changed == 0 {
            debug!(decision_id = %record.decision_id, "record already stored, skipping");
        }
        Ok(changed > 0)
    }

    /// Last `limit` records in ascending timestamp order.
    pub fn recent_records(&self, limit: usize) -> Result<Vec<CycleRecord>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_json FROM cycle_records
             ORDER BY timestamp_utc DESC, decision_id DESC
             LIMIT ?1",
        )?;
        let mut records = stmt
            .query_map([limit], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .map(|json| {
                serde_json::from_str::<CycleRecord>(&json)
                    .context("Failed to deserialize cycle record")
            })
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    pub fn latest_record(&self) -> Result<Option<CycleRecord>> {
        Ok(self.recent_records(1)?.into_iter().next())
    }

    pub fn count_records(&self) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM cycle_records", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Rewrite the local CSV mirror from the most recent records. The header is
/// derived from the site config alone, so the file stays column-stable
/// across restarts.
pub fn sync_csv_mirror(
    store: &CycleStore,
    site: &SiteConfig,
    path: &str,
    max_rows: usize,
) -> Result<()> {
    let records = store.recent_records(max_rows)?;
    let header = build_sheet_header(site);

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(records.len() + 1);
    rows.push(header.clone());
    for record in &records {
        rows.push(cycle_record_to_row(record, site, &header));
    }

    let csv = to_csv(&rows);
    fs::write(path, csv).with_context(|| format!("Failed to write CSV mirror {path}"))?;
    info!(path, rows = records.len(), "CSV mirror updated");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::llm::fallback_decision;
    use crate::prompt::PROMPT_TEMPLATE_VERSION;
    use crate::site::test_site_config;
    use crate::telemetry::summarize;
    use crate::types::{ActuationResult, SensorsNow, WeatherNow};

    fn record(decision_id: &str, timestamp_utc: &str) -> CycleRecord {
        let site = test_site_config();
        let decision = fallback_decision("test", &site.curator_labels(), &site);
        let sensors = SensorsNow {
            observation_time_utc: timestamp_utc.to_string(),
            readings: vec![],
        };
        let telemetry = summarize(&site, &sensors);
        CycleRecord {
            decision_id: decision_id.to_string(),
            llm_model: "test-model".to_string(),
            prompt_template_version: PROMPT_TEMPLATE_VERSION.to_string(),
            site_config_id: site.site.id.clone(),
            timestamp_local_iso: timestamp_utc.to_string(),
            timestamp_utc_iso: timestamp_utc.to_string(),
            weather: WeatherNow {
                temp_f: 55.0,
                rh_pct: 60.0,
                wind_mph: None,
                wind_dir_deg: None,
                precip_in_hr: None,
                conditions: None,
                observation_time_utc: timestamp_utc.to_string(),
            },
            sensors,
            features: telemetry.features.clone(),
            telemetry,
            actuation: ActuationResult {
                applied: decision.actions.clone(),
                errors: vec![],
                actuation_ok: true,
            },
            decision,
        }
    }

    #[test]
    fn duplicate_decision_id_is_ignored() {
        let store = CycleStore::open_in_memory().unwrap();
        assert!(store.insert_record(&record("d1", "2024-01-01T12:00:00Z"), "hash-a").unwrap());
        assert!(!store.insert_record(&record("d1", "2024-01-01T12:00:00Z"), "hash-a").unwrap());
        assert_eq!(store.count_records().unwrap(), 1);
    }

    #[test]
    fn recent_records_are_ascending_and_limited() {
        let store = CycleStore::open_in_memory().unwrap();
        for i in 0..5 {
            let ts = format!("2024-01-01T12:0{i}:00Z");
            store.insert_record(&record(&format!("d{i}"), &ts), "hash-a").unwrap();
        }

        let recent = store.recent_records(3).unwrap();
        assert_eq!(recent.len(), 3);
        let ids: Vec<_> = recent.iter().map(|r| r.decision_id.as_str()).collect();
        assert_eq!(ids, vec!["d2", "d3", "d4"]);

        let latest = store.latest_record().unwrap().unwrap();
        assert_eq!(latest.decision_id, "d4");
    }

    #[test]
    fn records_round_trip_through_json() {
        let store = CycleStore::open_in_memory().unwrap();
        let original = record("d1", "2024-01-01T12:00:00Z");
        store.insert_record(&original, "hash-a").unwrap();

        let loaded = store.latest_record().unwrap().unwrap();
        assert_eq!(loaded.llm_model, "test-model");
        assert_eq!(loaded.decision.confidence_0_1, 0.0);
        assert_eq!(loaded.actuation.applied.len(), original.actuation.applied.len());
    }

    #[test]
    fn csv_mirror_writes_header_plus_rows() {
        let site = test_site_config();
        let store = CycleStore::open_in_memory().unwrap();
        store.insert_record(&record("d1", "2024-01-01T12:00:00Z"), "hash-a").unwrap();
        store.insert_record(&record("d2", "2024-01-01T12:05:00Z"), "hash-a").unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mirror.csv");
        sync_csv_mirror(&store, &site, path.to_str().unwrap(), 100).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp_local_iso,timestamp_utc_iso,"));
        assert!(lines[1].contains("2024-01-01T12:00:00Z"));
    }

    #[test]
    fn empty_store_has_no_latest() {
        let store = CycleStore::open_in_memory().unwrap();
        assert!(store.latest_record().unwrap().is_none());
        assert_eq!(store.recent_records(10).unwrap().len(), 0);
    }
}
