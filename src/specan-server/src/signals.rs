// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Persistent signal store.
//!
//! Detected signals are upserted by frequency proximity: a detection within
//! `match_bandwidth_hz` of an active row updates that row instead of
//! inserting a duplicate. Backed by a JSON key/value file; all operations
//! are synchronous and fast, safe to call from the event loop.

use std::path::Path;
use std::sync::RwLock;
use std::time::{SystemTime, UNIX_EPOCH};

use pickledb::{PickleDb, PickleDbDumpPolicy, SerializationMethod};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use specan_core::DynResult;

const NEXT_ID_KEY: &str = "next_id";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSignal {
    pub id: u64,
    pub center_freq: f64,
    pub peak_freq: f64,
    pub bandwidth: f64,
    pub peak_power: f64,
    pub avg_power: f64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub hit_count: u64,
    #[serde(default)]
    pub classification: String,
    #[serde(default)]
    pub notes: String,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SignalQuery {
    pub active_only: bool,
    pub limit: usize,
    pub offset: usize,
    pub freq_min: Option<f64>,
    pub freq_max: Option<f64>,
}

pub struct SignalStore {
    db: RwLock<PickleDb>,
    match_bw: f64,
    path: String,
}

impl SignalStore {
    pub fn open(path: &str, match_bandwidth_hz: f64) -> DynResult<Self> {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| format!("cannot create {}: {}", parent.display(), e))?;
            }
        }
        let db = PickleDb::load(path, PickleDbDumpPolicy::AutoDump, SerializationMethod::Json)
            .unwrap_or_else(|_| {
                PickleDb::new(path, PickleDbDumpPolicy::AutoDump, SerializationMethod::Json)
            });
        info!("Signal store initialized: {}", path);
        Ok(Self {
            db: RwLock::new(db),
            match_bw: match_bandwidth_hz,
            path: path.to_string(),
        })
    }

    /// Insert a detection, or update the nearest active row within the
    /// match bandwidth: geometry is overwritten, peak power takes the max,
    /// `last_seen` advances and `hit_count` grows by `hit_count_delta`.
    /// Returns the row id.
    pub fn upsert_signal(
        &self,
        center_freq: f64,
        peak_freq: f64,
        bandwidth: f64,
        peak_power: f64,
        avg_power: f64,
        hit_count_delta: u64,
    ) -> u64 {
        let now = unix_now();
        let mut db = self.db.write().expect("signal store lock poisoned");

        let nearest = signal_keys(&db)
            .filter_map(|key| db.get::<StoredSignal>(&key))
            .filter(|row| row.active && (row.center_freq - center_freq).abs() < self.match_bw)
            .min_by(|a, b| {
                let da = (a.center_freq - center_freq).abs();
                let db_ = (b.center_freq - center_freq).abs();
                da.partial_cmp(&db_).unwrap_or(std::cmp::Ordering::Equal)
            });

        match nearest {
            Some(mut row) => {
                row.center_freq = center_freq;
                row.peak_freq = peak_freq;
                row.bandwidth = bandwidth;
                row.peak_power = row.peak_power.max(peak_power);
                row.avg_power = avg_power;
                row.last_seen = now;
                row.hit_count += hit_count_delta;
                row.active = true;
                let id = row.id;
                let _ = db.set(&signal_key(id), &row);
                id
            }
            None => {
                let id = db.get::<u64>(NEXT_ID_KEY).unwrap_or(1);
                let _ = db.set(NEXT_ID_KEY, &(id + 1));
                let row = StoredSignal {
                    id,
                    center_freq,
                    peak_freq,
                    bandwidth,
                    peak_power,
                    avg_power,
                    first_seen: now,
                    last_seen: now,
                    hit_count: hit_count_delta,
                    classification: String::new(),
                    notes: String::new(),
                    active: true,
                };
                let _ = db.set(&signal_key(id), &row);
                id
            }
        }
    }

    /// Deactivate every active row near the given frequency.
    pub fn mark_lost(&self, center_freq: f64) {
        let mut db = self.db.write().expect("signal store lock poisoned");
        let keys: Vec<String> = signal_keys(&db).collect();
        for key in keys {
            if let Some(mut row) = db.get::<StoredSignal>(&key) {
                if row.active && (row.center_freq - center_freq).abs() < self.match_bw {
                    row.active = false;
                    let _ = db.set(&key, &row);
                }
            }
        }
    }

    pub fn get_signals(&self, query: &SignalQuery) -> Vec<StoredSignal> {
        let db = self.db.read().expect("signal store lock poisoned");
        let mut rows: Vec<StoredSignal> = signal_keys(&db)
            .filter_map(|key| db.get::<StoredSignal>(&key))
            .filter(|row| {
                (!query.active_only || row.active)
                    && query.freq_min.map_or(true, |f| row.center_freq >= f)
                    && query.freq_max.map_or(true, |f| row.center_freq <= f)
            })
            .collect();
        rows.sort_by(|a, b| {
            b.last_seen
                .partial_cmp(&a.last_seen)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let limit = if query.limit == 0 { 100 } else { query.limit };
        rows.into_iter().skip(query.offset).take(limit).collect()
    }

    pub fn get_signal(&self, id: u64) -> Option<StoredSignal> {
        let db = self.db.read().expect("signal store lock poisoned");
        db.get(&signal_key(id))
    }

    pub fn classify_signal(&self, id: u64, classification: &str, notes: &str) -> bool {
        let mut db = self.db.write().expect("signal store lock poisoned");
        let key = signal_key(id);
        match db.get::<StoredSignal>(&key) {
            Some(mut row) => {
                row.classification = classification.to_string();
                row.notes = notes.to_string();
                db.set(&key, &row).is_ok()
            }
            None => false,
        }
    }

    pub fn delete_signal(&self, id: u64) -> bool {
        let mut db = self.db.write().expect("signal store lock poisoned");
        db.rem(&signal_key(id)).unwrap_or(false)
    }

    pub fn get_stats(&self) -> Value {
        let db = self.db.read().expect("signal store lock poisoned");
        let mut total = 0usize;
        let mut active = 0usize;
        for key in signal_keys(&db) {
            if let Some(row) = db.get::<StoredSignal>(&key) {
                total += 1;
                if row.active {
                    active += 1;
                }
            }
        }
        json!({
            "total_signals": total,
            "active_signals": active,
            "db_path": self.path,
        })
    }
}

fn signal_key(id: u64) -> String {
    format!("sig:{}", id)
}

fn signal_keys(db: &PickleDb) -> impl Iterator<Item = String> + '_ {
    db.get_all()
        .into_iter()
        .filter(|key| key.starts_with("sig:"))
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (SignalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.db");
        let store = SignalStore::open(path.to_str().unwrap(), 50e3).unwrap();
        (store, dir)
    }

    #[test]
    fn insert_then_update_by_proximity() {
        let (store, _dir) = store();
        let id = store.upsert_signal(100e6, 100.01e6, 20e3, -30.0, -40.0, 1);

        // Within 50 kHz: same row, peak takes the max, hits accumulate.
        let id2 = store.upsert_signal(100.02e6, 100.02e6, 25e3, -35.0, -42.0, 2);
        assert_eq!(id, id2);
        let row = store.get_signal(id).unwrap();
        assert_eq!(row.hit_count, 3);
        assert_eq!(row.peak_power, -30.0);
        assert_eq!(row.center_freq, 100.02e6);

        // 100 kHz away: a new row.
        let id3 = store.upsert_signal(100.12e6, 100.12e6, 20e3, -50.0, -55.0, 1);
        assert_ne!(id, id3);
    }

    #[test]
    fn mark_lost_deactivates_near_matches() {
        let (store, _dir) = store();
        let id = store.upsert_signal(145.8e6, 145.8e6, 12e3, -40.0, -45.0, 1);
        store.mark_lost(145.81e6);
        assert!(!store.get_signal(id).unwrap().active);

        // Re-detection reactivates via upsert.
        let id2 = store.upsert_signal(145.8e6, 145.8e6, 12e3, -40.0, -45.0, 1);
        // The old row is inactive, so a fresh row is created.
        assert_ne!(id, id2);
        assert!(store.get_signal(id2).unwrap().active);
    }

    #[test]
    fn query_filters_and_paginates() {
        let (store, _dir) = store();
        for i in 0..10 {
            store.upsert_signal(
                100e6 + i as f64 * 1e6,
                100e6 + i as f64 * 1e6,
                10e3,
                -40.0,
                -50.0,
                1,
            );
        }
        store.mark_lost(102e6);

        let all = store.get_signals(&SignalQuery {
            limit: 100,
            ..SignalQuery::default()
        });
        assert_eq!(all.len(), 10);

        let active = store.get_signals(&SignalQuery {
            active_only: true,
            limit: 100,
            ..SignalQuery::default()
        });
        assert_eq!(active.len(), 9);

        let band = store.get_signals(&SignalQuery {
            limit: 100,
            freq_min: Some(104.5e6),
            freq_max: Some(106.5e6),
            ..SignalQuery::default()
        });
        assert_eq!(band.len(), 2);

        let page = store.get_signals(&SignalQuery {
            limit: 3,
            offset: 3,
            ..SignalQuery::default()
        });
        assert_eq!(page.len(), 3);
    }

    #[test]
    fn classify_and_delete() {
        let (store, _dir) = store();
        let id = store.upsert_signal(100e6, 100e6, 10e3, -40.0, -50.0, 1);
        assert!(store.classify_signal(id, "FM broadcast", "strong local"));
        let row = store.get_signal(id).unwrap();
        assert_eq!(row.classification, "FM broadcast");
        assert_eq!(row.notes, "strong local");

        assert!(store.delete_signal(id));
        assert!(store.get_signal(id).is_none());
        assert!(!store.delete_signal(id));
    }

    #[test]
    fn stats_count_rows() {
        let (store, _dir) = store();
        store.upsert_signal(100e6, 100e6, 10e3, -40.0, -50.0, 1);
        store.upsert_signal(200e6, 200e6, 10e3, -40.0, -50.0, 1);
        store.mark_lost(200e6);
        let stats = store.get_stats();
        assert_eq!(stats["total_signals"], 2);
        assert_eq!(stats["active_signals"], 1);
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signals.db");
        let path_str = path.to_str().unwrap();
        let id = {
            let store = SignalStore::open(path_str, 50e3).unwrap();
            store.upsert_signal(100e6, 100e6, 10e3, -40.0, -50.0, 1)
        };
        let store = SignalStore::open(path_str, 50e3).unwrap();
        assert!(store.get_signal(id).is_some());
        // Ids continue monotonically after reopen.
        let id2 = store.upsert_signal(500e6, 500e6, 10e3, -40.0, -50.0, 1);
        assert!(id2 > id);
    }
}
