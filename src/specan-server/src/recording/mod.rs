// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Recording and playback: raw IQ capture, throttled spectrum capture, and
//! file-backed playback through the live DSP path.

mod iq;
mod playback;
mod spectrum;

use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tracing::info;

pub use iq::IqRecorder;
pub use playback::{PlaybackSource, PlaybackState};
pub use spectrum::SpectrumRecorder;

use crate::config::RecordingConfig;

pub struct RecordingManager {
    storage: PathBuf,
    max_storage_bytes: u64,
    pub iq: IqRecorder,
    pub spectrum: SpectrumRecorder,
    pub playback: std::sync::Arc<PlaybackSource>,
}

impl RecordingManager {
    pub fn new(config: &RecordingConfig) -> Self {
        let storage = PathBuf::from(&config.storage_path);
        Self {
            iq: IqRecorder::new(
                storage.clone(),
                config.max_storage_bytes,
                config.iq_queue_size,
                config.iq_buffer_size,
            ),
            spectrum: SpectrumRecorder::new(storage.clone(), config.spectrum_rate),
            playback: std::sync::Arc::new(PlaybackSource::new(storage.clone())),
            max_storage_bytes: config.max_storage_bytes,
            storage,
        }
    }

    /// Every recording on disk, newest first: `.raw` IQ captures and `.csv`
    /// spectrum captures, with their sidecar metadata when readable.
    pub fn list_recordings(&self) -> Vec<Value> {
        let mut entries: Vec<(f64, Value)> = Vec::new();
        let Ok(dir) = std::fs::read_dir(&self.storage) else {
            return Vec::new();
        };
        for entry in dir.flatten() {
            let path = entry.path();
            let kind = match path.extension().and_then(|e| e.to_str()) {
                Some("raw") => "iq",
                Some("csv") => "spectrum",
                _ => continue,
            };
            let Some(base) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            let sidecar = std::fs::read_to_string(path.with_extension("json"))
                .ok()
                .and_then(|text| serde_json::from_str::<Value>(&text).ok())
                .unwrap_or(Value::Null);
            entries.push((
                modified,
                json!({
                    "filename": base,
                    "kind": kind,
                    "size_bytes": size,
                    "modified": modified,
                    "metadata": sidecar,
                }),
            ));
        }
        entries.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        entries.into_iter().map(|(_, v)| v).collect()
    }

    /// Delete a recording and its sidecar by base name. The name is reduced
    /// to its final component so clients cannot escape the storage root.
    pub fn delete_recording(&self, filename: &str) -> bool {
        let Some(safe) = Path::new(filename).file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let base = self.storage.join(safe);
        let mut removed = false;
        for ext in ["raw", "csv", "json"] {
            if std::fs::remove_file(base.with_extension(ext)).is_ok() {
                removed = true;
            }
        }
        if removed {
            info!("Deleted recording {}", safe);
        }
        removed
    }

    pub fn storage_info(&self) -> Value {
        json!({
            "used_bytes": dir_usage(&self.storage),
            "max_bytes": self.max_storage_bytes,
            "storage_path": self.storage.to_string_lossy(),
        })
    }

    /// Aggregate recorder + playback status for the command surface.
    pub fn status(&self) -> Value {
        let mut status = self.iq.status();
        merge(&mut status, self.spectrum.status());
        merge(&mut status, self.playback.status_json());
        status
    }
}

fn merge(into: &mut Value, from: Value) {
    if let (Value::Object(a), Value::Object(b)) = (into, from) {
        a.extend(b);
    }
}

/// Total bytes used by files directly inside `path`.
pub(crate) fn dir_usage(path: &Path) -> u64 {
    let Ok(dir) = std::fs::read_dir(path) else {
        return 0;
    };
    dir.flatten()
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecordingConfig;

    fn manager() -> (RecordingManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cfg = RecordingConfig {
            storage_path: dir.path().to_string_lossy().to_string(),
            ..RecordingConfig::default()
        };
        (RecordingManager::new(&cfg), dir)
    }

    #[test]
    fn list_and_delete() {
        let (rm, dir) = manager();
        std::fs::write(dir.path().join("iq_x_100.000MHz.raw"), vec![0u8; 64]).unwrap();
        std::fs::write(
            dir.path().join("iq_x_100.000MHz.json"),
            r#"{"sample_rate": 2e6}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("spectrum_y_100.000MHz.csv"), "a,b\n").unwrap();

        let list = rm.list_recordings();
        assert_eq!(list.len(), 2);
        let iq = list
            .iter()
            .find(|e| e["kind"] == "iq")
            .expect("iq entry present");
        assert_eq!(iq["filename"], "iq_x_100.000MHz");
        assert_eq!(iq["size_bytes"], 64);
        assert_eq!(iq["metadata"]["sample_rate"], 2e6);

        assert!(rm.delete_recording("iq_x_100.000MHz"));
        assert!(!dir.path().join("iq_x_100.000MHz.raw").exists());
        assert!(!dir.path().join("iq_x_100.000MHz.json").exists());
        assert!(!rm.delete_recording("iq_x_100.000MHz"));
    }

    #[test]
    fn delete_is_path_sanitized() {
        let (rm, dir) = manager();
        let outside = dir.path().parent().unwrap().join("victim.raw");
        std::fs::write(&outside, b"data").unwrap();
        assert!(!rm.delete_recording("../victim"));
        assert!(outside.exists());
        std::fs::remove_file(outside).unwrap();
    }

    #[test]
    fn storage_info_reports_usage() {
        let (rm, dir) = manager();
        std::fs::write(dir.path().join("a.raw"), vec![0u8; 100]).unwrap();
        let info = rm.storage_info();
        assert_eq!(info["used_bytes"], 100);
    }
}
