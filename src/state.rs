//! Application state management
//!
//! Central state container holding the latest analytics snapshot. A snapshot
//! is immutable once built; reloading replaces it as a whole, so readers never
//! observe a mix of two fetch cycles.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::aggregate::ProcessedData;
use crate::analytics::{reduce, Statistics};
use crate::assembler::{PeriodAssembler, PeriodPair};
use crate::period::DateRange;
use crate::summary::HttpSummarizer;
use crate::transport::Upstream;

/// Which view the snapshot was assembled for
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum SnapshotMode {
    Overall,
    Range {
        range: DateRange,
        #[serde(rename = "previousRange")]
        previous_range: DateRange,
    },
}

/// One complete fetch cycle and its reductions
#[derive(Debug)]
pub struct Snapshot {
    pub id: Uuid,
    pub mode: SnapshotMode,
    pub current: ProcessedData,
    pub current_stats: Statistics,
    pub previous_stats: Option<Statistics>,
    pub generated_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn overall(data: ProcessedData, generated_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode: SnapshotMode::Overall,
            current_stats: reduce(&data, generated_at),
            current: data,
            previous_stats: None,
            generated_at,
        }
    }

    pub fn range(range: DateRange, pair: PeriodPair, generated_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            mode: SnapshotMode::Range {
                range,
                previous_range: range.previous(),
            },
            current_stats: reduce(&pair.current, generated_at),
            previous_stats: Some(reduce(&pair.previous, generated_at)),
            current: pair.current,
            generated_at,
        }
    }

    /// Label handed to the narrative summary
    pub fn description(&self) -> String {
        match self.mode {
            SnapshotMode::Overall => "Overall".to_string(),
            SnapshotMode::Range { range, .. } => range.describe(),
        }
    }
}

/// Long-lived collaborators shared by every request
pub struct Services {
    pub assembler: PeriodAssembler<Upstream>,
    pub summarizer: Option<HttpSummarizer>,
    pub min_patients_for_insights: usize,
}

/// Central application state
#[derive(Debug)]
pub struct AppState {
    /// Latest completed snapshot
    snapshot: Option<Arc<Snapshot>>,
    /// Application start time
    start_time: DateTime<Utc>,
    /// Snapshots installed since startup
    total_loads: u64,
}

impl AppState {
    /// Create new application state
    pub fn new() -> Self {
        info!("Initializing application state");
        Self {
            snapshot: None,
            start_time: Utc::now(),
            total_loads: 0,
        }
    }

    /// Install a freshly assembled snapshot, dropping the previous one
    pub fn replace_snapshot(&mut self, snapshot: Snapshot) -> Arc<Snapshot> {
        self.total_loads += 1;

        info!(
            snapshot_id = %snapshot.id,
            mode = ?snapshot.mode,
            total_patients = snapshot.current_stats.total_patients,
            total_loads = self.total_loads,
            "Replacing analytics snapshot"
        );

        let snapshot = Arc::new(snapshot);
        self.snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Latest snapshot, shared with the caller
    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.clone()
    }

    /// Get uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        (Utc::now() - self.start_time).num_seconds().max(0) as u64
    }

    #[cfg(test)]
    pub fn total_loads(&self) -> u64 {
        self.total_loads
    }

    /// Get the generation time of the latest snapshot
    pub fn last_snapshot_time(&self) -> Option<DateTime<Utc>> {
        self.snapshot.as_ref().map(|s| s.generated_at)
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::tests::{condition, patient};
    use crate::period::YearMonth;
    use chrono::TimeZone;

    fn sample_data() -> ProcessedData {
        ProcessedData::build(
            vec![patient("1", Some("female"), Some("1990-01-01"))],
            vec![],
            vec![condition("c1", Some("Patient/1"), "Asthma", "active")],
            vec![],
        )
    }

    #[test]
    fn test_app_state_creation() {
        let state = AppState::new();
        assert!(state.snapshot().is_none());
        assert!(state.last_snapshot_time().is_none());
        assert_eq!(state.total_loads(), 0);
    }

    #[test]
    fn test_replace_snapshot() {
        let mut state = AppState::new();
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();

        let first = state.replace_snapshot(Snapshot::overall(ProcessedData::empty(), at));
        let second = state.replace_snapshot(Snapshot::overall(sample_data(), at));

        assert_eq!(state.total_loads(), 2);
        let current = state.snapshot().unwrap();
        assert_eq!(current.id, second.id);
        assert_ne!(current.id, first.id);
        assert_eq!(current.current_stats.total_patients, 1);
        // Earlier readers keep their own copy
        assert_eq!(first.current_stats.total_patients, 0);
        assert_eq!(state.last_snapshot_time(), Some(at));
    }

    #[test]
    fn test_range_snapshot_carries_previous_period() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let range = DateRange::new(
            YearMonth::new(2024, 1).unwrap(),
            YearMonth::new(2024, 3).unwrap(),
        )
        .unwrap();

        let snapshot = Snapshot::range(
            range,
            PeriodPair {
                current: sample_data(),
                previous: ProcessedData::empty(),
            },
            at,
        );

        assert_eq!(snapshot.description(), "Jan 2024 to Mar 2024");
        assert_eq!(snapshot.current_stats.active_cases, 1);
        assert_eq!(snapshot.previous_stats.as_ref().unwrap().total_patients, 0);
        match snapshot.mode {
            SnapshotMode::Range { previous_range, .. } => {
                assert_eq!(previous_range.start(), YearMonth::new(2023, 10).unwrap());
                assert_eq!(previous_range.end(), YearMonth::new(2023, 12).unwrap());
            }
            SnapshotMode::Overall => panic!("expected range mode"),
        }
    }

    #[test]
    fn test_overall_description() {
        let snapshot = Snapshot::overall(ProcessedData::empty(), Utc::now());
        assert_eq!(snapshot.description(), "Overall");
        assert!(snapshot.previous_stats.is_none());
    }
}
