//! Append-only log of synchronized rounds.
//!
//! The consumer appends one [`RoundSummary`] per completed round; the
//! controller flushes the whole log to a timestamped JSON file on stop.
//! Both go through the same lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::StoreError;
use trackviz_env::{EntityId, Sample};

/// What one entity contributed to a round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStamp {
    pub driver_number: u32,

    /// Upstream timestamp of the contributed sample
    pub timestamp: String,

    /// Lap index of the sample, when a reference path is loaded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<usize>,
}

impl DriverStamp {
    pub fn from_sample(sample: &Sample, index: Option<usize>) -> Self {
        Self {
            driver_number: sample.driver_number,
            timestamp: sample.date.clone(),
            index,
        }
    }
}

/// Persisted summary of one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: u64,
    pub timestamp: DateTime<Utc>,
    pub drivers: BTreeMap<EntityId, DriverStamp>,
}

/// In-memory round log plus the round counter.
#[derive(Debug, Default)]
pub struct RoundLog {
    round: u64,
    entries: Vec<RoundSummary>,
}

impl RoundLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a round and returns its 1-based number.
    pub fn record(
        &mut self,
        timestamp: DateTime<Utc>,
        drivers: BTreeMap<EntityId, DriverStamp>,
    ) -> u64 {
        self.round += 1;
        self.entries.push(RoundSummary {
            round: self.round,
            timestamp,
            drivers,
        });
        self.round
    }

    /// Number of the last recorded round, 0 before the first.
    pub fn current_round(&self) -> u64 {
        self.round
    }

    pub fn entries(&self) -> &[RoundSummary] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry and resets the counter.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.round = 0;
    }

    /// File name for a flush performed at `at`; `attempt` disambiguates
    /// flushes that land on the same millisecond.
    pub fn file_name(prefix: &str, at: DateTime<Utc>, attempt: u32) -> String {
        let stamp = at.format("%Y%m%d_%H%M%S%.3f");
        if attempt == 0 {
            format!("{}_{}.json", prefix, stamp)
        } else {
            format!("{}_{}_{}.json", prefix, stamp, attempt)
        }
    }

    /// Creates a log file that did not exist before.
    fn create_file(dir: &Path, prefix: &str, at: DateTime<Utc>) -> Result<(PathBuf, File), StoreError> {
        let mut attempt = 0;
        loop {
            let path = dir.join(Self::file_name(prefix, at, attempt));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Writes the log to `dir` and clears it.
    ///
    /// Returns the written file, or `None` when there was nothing to write.
    /// On failure the entries are kept so a later flush can retry.
    pub fn flush(
        &mut self,
        dir: &Path,
        prefix: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, StoreError> {
        if self.entries.is_empty() {
            self.round = 0;
            return Ok(None);
        }

        std::fs::create_dir_all(dir)?;
        let (file, handle) = Self::create_file(dir, prefix, at)?;
        let mut writer = BufWriter::new(handle);
        serde_json::to_writer_pretty(&mut writer, &self.entries)?;
        writer.flush()?;

        info!("Flushed {} rounds to {}", self.entries.len(), file.display());
        self.clear();
        Ok(Some(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn drivers(ids: &[u32]) -> BTreeMap<EntityId, DriverStamp> {
        ids.iter()
            .map(|&id| {
                let sample = Sample::new(id.into(), "2023-09-17T12:00:00.250", 1, 2, 3);
                (EntityId(id), DriverStamp::from_sample(&sample, None))
            })
            .collect()
    }

    #[test]
    fn test_rounds_are_one_based_and_monotonic() {
        let mut log = RoundLog::new();
        assert_eq!(log.current_round(), 0);
        let now = Utc::now();
        assert_eq!(log.record(now, drivers(&[44])), 1);
        assert_eq!(log.record(now, drivers(&[44, 1])), 2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].drivers.len(), 2);
    }

    #[test]
    fn test_file_name_uses_flush_time() {
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 14, 5, 9).unwrap();
        assert_eq!(RoundLog::file_name("rounds", at, 0), "rounds_20240302_140509.000.json");
        assert_eq!(RoundLog::file_name("rounds", at, 2), "rounds_20240302_140509.000_2.json");
    }

    fn persisted_rounds(file: &Path) -> usize {
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(file).unwrap()).unwrap();
        json.as_array().unwrap().len()
    }

    #[test]
    fn test_flushes_in_same_second_keep_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let first_at = Utc.with_ymd_and_hms(2024, 3, 2, 14, 5, 9).unwrap();
        let second_at = first_at + chrono::Duration::milliseconds(400);

        let mut log = RoundLog::new();
        log.record(first_at, drivers(&[44]));
        log.record(first_at, drivers(&[44]));
        let first = log.flush(dir.path(), "rounds", first_at).unwrap().unwrap();

        log.record(second_at, drivers(&[44]));
        let second = log.flush(dir.path(), "rounds", second_at).unwrap().unwrap();

        assert_ne!(first, second);
        assert_eq!(persisted_rounds(&first), 2);
        assert_eq!(persisted_rounds(&second), 1);
    }

    #[test]
    fn test_flush_never_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 14, 5, 9).unwrap();

        let mut log = RoundLog::new();
        log.record(at, drivers(&[44, 1]));
        let first = log.flush(dir.path(), "rounds", at).unwrap().unwrap();
        log.record(at, drivers(&[44]));
        let second = log.flush(dir.path(), "rounds", at).unwrap().unwrap();

        assert_eq!(second, dir.path().join("rounds_20240302_140509.000_1.json"));
        assert_eq!(persisted_rounds(&first), 1);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_flush_writes_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 2, 14, 5, 9).unwrap();

        let mut log = RoundLog::new();
        log.record(at, drivers(&[44, 16]));
        log.record(at, drivers(&[44]));

        let file = log.flush(dir.path(), "rounds", at).unwrap().unwrap();
        assert!(log.is_empty());
        assert_eq!(log.current_round(), 0);

        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file).unwrap()).unwrap();
        let rounds = json.as_array().unwrap();
        assert_eq!(rounds.len(), 2);
        assert_eq!(rounds[0]["round"], 1);
        assert_eq!(rounds[0]["drivers"]["44"]["driver_number"], 44);
        assert_eq!(rounds[0]["drivers"]["16"]["timestamp"], "2023-09-17T12:00:00.250");
        assert!(rounds[0]["drivers"]["44"].get("index").is_none());

        let decoded: Vec<RoundSummary> = serde_json::from_value(json).unwrap();
        assert_eq!(decoded[1].drivers.keys().copied().collect::<Vec<_>>(), vec![EntityId(44)]);
    }

    #[test]
    fn test_flush_empty_log_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RoundLog::new();
        assert!(log.flush(dir.path(), "rounds", Utc::now()).unwrap().is_none());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_failed_flush_keeps_entries() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut log = RoundLog::new();
        log.record(Utc::now(), drivers(&[44]));
        assert!(log.flush(&blocker, "rounds", Utc::now()).is_err());
        assert_eq!(log.len(), 1);
        assert_eq!(log.current_round(), 1);
    }
}
