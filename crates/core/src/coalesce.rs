//! Temporal coalescing of detection records into event windows.
//!
//! Pure and deterministic: the same records (in any input order) and the
//! same [`CoalesceConfig`] always produce the same windows.

use std::collections::BTreeSet;
use std::time::Duration;

use crate::detector::DetectionRecord;
use crate::error::CoreError;

/// Windowing thresholds. All values are configuration-supplied.
#[derive(Debug, Clone, PartialEq)]
pub struct CoalesceConfig {
    /// Detections at most this far apart belong to the same window; a
    /// longer idle gap closes it.
    pub merge_gap: Duration,
    /// Windows shorter than this are dropped.
    pub min_duration: Duration,
    /// Windows are split once they reach this length. `None` never splits.
    pub max_duration: Option<Duration>,
    /// Windows with fewer detections are dropped.
    pub min_detections: usize,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            merge_gap: Duration::from_secs(10),
            min_duration: Duration::from_secs(2),
            max_duration: Some(Duration::from_secs(600)),
            min_detections: 3,
        }
    }
}

impl CoalesceConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.merge_gap.is_zero() {
            return Err(CoreError::Validation(
                "merge_gap must be greater than zero".to_string(),
            ));
        }
        if let Some(max) = self.max_duration {
            if max <= self.min_duration {
                return Err(CoreError::Validation(
                    "max_duration must exceed min_duration".to_string(),
                ));
            }
        }
        if self.min_detections == 0 {
            return Err(CoreError::Validation(
                "min_detections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A coalesced window, in offsets relative to the start of the source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventWindow {
    pub start_offset_ms: i64,
    pub end_offset_ms: i64,
    pub detection_count: usize,
    /// Distinct payload codes seen within the window, sorted.
    pub codes: BTreeSet<String>,
}

impl EventWindow {
    fn open(record: &DetectionRecord) -> Self {
        let mut codes = BTreeSet::new();
        if let Some(code) = record.code() {
            codes.insert(code.to_string());
        }
        Self {
            start_offset_ms: record.offset_ms,
            end_offset_ms: record.offset_ms,
            detection_count: 1,
            codes,
        }
    }

    fn extend(&mut self, record: &DetectionRecord) {
        self.end_offset_ms = record.offset_ms;
        self.detection_count += 1;
        if let Some(code) = record.code() {
            self.codes.insert(code.to_string());
        }
    }

    pub fn duration_ms(&self) -> i64 {
        self.end_offset_ms - self.start_offset_ms
    }
}

/// Group one item's complete detection set into event windows.
pub fn coalesce(records: &[DetectionRecord], config: &CoalesceConfig) -> Vec<EventWindow> {
    let mut ordered: Vec<&DetectionRecord> = records.iter().collect();
    // Ties on offset are broken by payload text so input order never matters.
    ordered.sort_by(|a, b| {
        a.offset_ms
            .cmp(&b.offset_ms)
            .then_with(|| a.payload.to_string().cmp(&b.payload.to_string()))
    });

    let merge_gap_ms = duration_ms(config.merge_gap);
    let max_ms = config.max_duration.map(duration_ms);

    let mut windows = Vec::new();
    let mut current: Option<EventWindow> = None;

    for record in ordered {
        current = match current.take() {
            Some(mut window) => {
                let gap = record.offset_ms - window.end_offset_ms;
                let too_long = max_ms.is_some_and(|max| record.offset_ms - window.start_offset_ms > max);
                if gap <= merge_gap_ms && !too_long {
                    window.extend(record);
                    Some(window)
                } else {
                    windows.push(window);
                    Some(EventWindow::open(record))
                }
            }
            None => Some(EventWindow::open(record)),
        };
    }
    windows.extend(current);

    let min_ms = duration_ms(config.min_duration);
    windows
        .into_iter()
        .filter(|w| w.duration_ms() >= min_ms && w.detection_count >= config.min_detections)
        .collect()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(offset_ms: i64) -> DetectionRecord {
        DetectionRecord::new(offset_ms, json!({}))
    }

    fn config() -> CoalesceConfig {
        CoalesceConfig {
            merge_gap: Duration::from_secs(5),
            min_duration: Duration::from_secs(1),
            max_duration: Some(Duration::from_secs(60)),
            min_detections: 2,
        }
    }

    #[test]
    fn empty_input_yields_no_windows() {
        assert!(coalesce(&[], &config()).is_empty());
    }

    #[test]
    fn close_detections_merge() {
        let records: Vec<_> = (0..5).map(|i| rec(i * 1000)).collect();
        let windows = coalesce(&records, &config());
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].start_offset_ms, 0);
        assert_eq!(windows[0].end_offset_ms, 4000);
        assert_eq!(windows[0].detection_count, 5);
    }

    #[test]
    fn idle_gap_splits_windows() {
        let records = vec![rec(0), rec(2000), rec(20_000), rec(23_000)];
        let windows = coalesce(&records, &config());
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].start_offset_ms, 20_000);
    }

    #[test]
    fn gap_equal_to_merge_gap_still_merges() {
        let records = vec![rec(0), rec(5000)];
        assert_eq!(coalesce(&records, &config()).len(), 1);
    }

    #[test]
    fn short_and_sparse_windows_dropped() {
        // Single detection: below min_detections and min_duration.
        let records = vec![rec(0), rec(30_000), rec(30_500)];
        let windows = coalesce(&records, &config());
        assert!(windows.is_empty(), "got {windows:?}");
    }

    #[test]
    fn long_activity_splits_at_max_duration() {
        let cfg = CoalesceConfig {
            max_duration: Some(Duration::from_secs(10)),
            ..config()
        };
        let records: Vec<_> = (0..=25).map(|i| rec(i * 1000)).collect();
        let windows = coalesce(&records, &cfg);
        assert_eq!(windows.len(), 3);
        assert!(windows.iter().all(|w| w.duration_ms() <= 10_000));
    }

    #[test]
    fn codes_collected_sorted_and_distinct() {
        let records = vec![
            DetectionRecord::new(0, json!({"code": "B"})),
            DetectionRecord::new(1000, json!({"code": "A"})),
            DetectionRecord::new(2000, json!({"code": "B"})),
        ];
        let windows = coalesce(&records, &config());
        let codes: Vec<_> = windows[0].codes.iter().cloned().collect();
        assert_eq!(codes, vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn replay_is_deterministic_regardless_of_input_order() {
        let mut records: Vec<_> = (0..40)
            .map(|i| DetectionRecord::new((i * 1700) % 45_000, json!({"code": format!("C{}", i % 3)})))
            .collect();
        let first = coalesce(&records, &config());
        records.reverse();
        let second = coalesce(&records, &config());
        assert_eq!(first, second);
        assert_eq!(first, coalesce(&records, &config()));
    }

    #[test]
    fn invalid_config_rejected() {
        let cfg = CoalesceConfig {
            merge_gap: Duration::ZERO,
            ..config()
        };
        assert!(cfg.validate().is_err());
        let cfg = CoalesceConfig {
            max_duration: Some(Duration::from_millis(500)),
            ..config()
        };
        assert!(cfg.validate().is_err());
        assert!(CoalesceConfig::default().validate().is_ok());
    }
}
