//! Environment-driven pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use chrono::FixedOffset;
use packline_core::coalesce::CoalesceConfig;
use packline_core::detector::Roi;
use packline_core::pool::PoolConfig;
use packline_core::resource::LoadThresholds;
use packline_core::schedule::WorkSchedule;

/// Prefix shared by every variable this module reads.
const PREFIX: &str = "PACKLINE_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("PACKLINE_{var} is invalid ({value:?}): {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("PACKLINE_{0} is required")]
    Missing(&'static str),
}

/// One watched recording directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceConfig {
    pub camera_id: String,
    pub root: PathBuf,
}

impl SourceConfig {
    /// Parse `cam=/path,cam2=/path2`.
    pub fn parse_list(s: &str) -> Result<Vec<Self>, String> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (camera_id, root) = entry
                    .split_once('=')
                    .ok_or_else(|| format!("expected camera=path, got \"{entry}\""))?;
                let camera_id = camera_id.trim();
                let root = root.trim();
                if camera_id.is_empty() || root.is_empty() {
                    return Err(format!("empty camera or path in \"{entry}\""));
                }
                Ok(Self {
                    camera_id: camera_id.to_string(),
                    root: PathBuf::from(root),
                })
            })
            .collect()
    }
}

/// Everything the file discoverer needs.
#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    pub sources: Vec<SourceConfig>,
    /// Cameras allowed through the filter. `None` admits every source.
    pub active_sources: Option<Vec<String>>,
    /// Lower-case file extensions without the dot.
    pub extensions: Vec<String>,
    /// How far before the last scan's start an incremental scan reaches back.
    pub scan_overlap: Duration,
    /// Default backfill depth for first-run scans.
    pub first_run_days: u32,
    pub schedule: WorkSchedule,
    /// Compute content fingerprints as an additional dedup key.
    pub fingerprint: bool,
    /// Rows per enqueue transaction.
    pub insert_batch_size: usize,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            active_sources: None,
            extensions: vec!["mp4".into(), "mov".into(), "mkv".into(), "avi".into()],
            scan_overlap: Duration::from_secs(600),
            first_run_days: 7,
            schedule: WorkSchedule::always(),
            fingerprint: false,
            insert_batch_size: 200,
        }
    }
}

/// Per-worker sampling parameters.
#[derive(Debug, Clone)]
pub struct SamplerSettings {
    pub frame_interval: Duration,
    pub roi: Option<Roi>,
    /// Detection records buffered before one log append.
    pub log_batch_size: usize,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(500),
            roi: None,
            log_batch_size: 50,
        }
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub database_url: String,
    /// Stable name of this host; prefixes worker identities.
    pub node_name: String,
    /// External detector command line, split on whitespace.
    pub detector_command: Vec<String>,
    pub pool: PoolConfig,
    pub discovery: DiscoverySettings,
    pub sampler: SamplerSettings,
    pub coalesce: CoalesceConfig,
    /// Upper bound on every blocking wait (also the claim-check cadence).
    pub wait_timeout: Duration,
    pub monitor_interval: Duration,
    pub resize_interval: Duration,
    /// How long `stop()` waits for workers to finish their current item.
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://packline.db".to_string(),
            node_name: "packline".to_string(),
            detector_command: vec!["packline-detect".to_string()],
            pool: PoolConfig::default(),
            discovery: DiscoverySettings::default(),
            sampler: SamplerSettings::default(),
            coalesce: CoalesceConfig::default(),
            wait_timeout: Duration::from_secs(1),
            monitor_interval: Duration::from_secs(5),
            resize_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from `PACKLINE_*` environment variables.
    ///
    /// | Env Var (`PACKLINE_` prefix) | Default                 |
    /// |------------------------------|-------------------------|
    /// | `DATABASE_URL`               | `sqlite://packline.db`  |
    /// | `NODE_NAME`                  | `packline`              |
    /// | `DETECTOR_CMD`               | `packline-detect`       |
    /// | `SOURCES`                    | required, `cam=/path,…` |
    /// | `ACTIVE_SOURCES`             | all sources             |
    /// | `EXTENSIONS`                 | `mp4,mov,mkv,avi`       |
    /// | `SCAN_INTERVAL_SECS`         | `300`                   |
    /// | `SCAN_OVERLAP_SECS`          | `600`                   |
    /// | `FIRST_RUN_DAYS`             | `7`                     |
    /// | `FINGERPRINT`                | `false`                 |
    /// | `WORK_DAYS`                  | every day               |
    /// | `WORK_HOURS`                 | all day, `HH:MM-HH:MM`  |
    /// | `UTC_OFFSET_MINUTES`         | `0`                     |
    /// | `ITEM_TIMEOUT_SECS`          | `900`                   |
    /// | `RECLAIM_INTERVAL_SECS`      | `60`                    |
    /// | `MIN_WORKERS`                | `1`                     |
    /// | `MAX_WORKERS`                | `4`                     |
    /// | `INITIAL_WORKERS`            | `2`                     |
    /// | `CPU_LOW` / `CPU_HIGH`       | `30` / `80`             |
    /// | `MEM_LOW` / `MEM_HIGH`       | `70` / `85`             |
    /// | `QUEUE_DEPTH_LIMIT`          | `500`                   |
    /// | `MAX_RETRIES`                | `3`                     |
    /// | `FRAME_INTERVAL_MS`          | `500`                   |
    /// | `ROI`                        | full frame, `x,y,w,h`   |
    /// | `LOG_BATCH_SIZE`             | `50`                    |
    /// | `MERGE_GAP_SECS`             | `10`                    |
    /// | `MIN_EVENT_SECS`             | `2`                     |
    /// | `MAX_EVENT_SECS`             | `600`, `0` disables     |
    /// | `MIN_DETECTIONS`             | `3`                     |
    /// | `WAIT_TIMEOUT_MS`            | `1000`                  |
    /// | `MONITOR_INTERVAL_SECS`      | `5`                     |
    /// | `RESIZE_INTERVAL_SECS`       | `30`                    |
    /// | `SHUTDOWN_TIMEOUT_SECS`      | `60`                    |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (full names, prefix included).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let sources = match env.get("SOURCES") {
            Some(raw) => SourceConfig::parse_list(&raw).map_err(|reason| ConfigError::Invalid {
                var: "SOURCES",
                value: raw.clone(),
                reason,
            })?,
            None => return Err(ConfigError::Missing("SOURCES")),
        };

        let schedule = {
            let mut schedule = WorkSchedule::always();
            if let Some(raw) = env.get("WORK_DAYS") {
                schedule.days = WorkSchedule::parse_days(&raw)
                    .map_err(|e| invalid("WORK_DAYS", &raw, e))?;
            }
            if let Some(raw) = env.get("WORK_HOURS") {
                let (start, end) = WorkSchedule::parse_hours(&raw)
                    .map_err(|e| invalid("WORK_HOURS", &raw, e))?;
                schedule.start = start;
                schedule.end = end;
            }
            let offset_minutes: i32 = env.parse("UTC_OFFSET_MINUTES", 0)?;
            schedule.offset = FixedOffset::east_opt(offset_minutes * 60).ok_or_else(|| {
                invalid("UTC_OFFSET_MINUTES", &offset_minutes.to_string(), "out of range")
            })?;
            schedule
        };

        let discovery = DiscoverySettings {
            sources,
            active_sources: env.get("ACTIVE_SOURCES").map(|raw| split_list(&raw)),
            extensions: env
                .get("EXTENSIONS")
                .map(|raw| {
                    split_list(&raw)
                        .into_iter()
                        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                        .collect()
                })
                .unwrap_or(defaults.discovery.extensions),
            scan_overlap: env.secs("SCAN_OVERLAP_SECS", defaults.discovery.scan_overlap)?,
            first_run_days: env.parse("FIRST_RUN_DAYS", defaults.discovery.first_run_days)?,
            schedule,
            fingerprint: env.parse("FINGERPRINT", defaults.discovery.fingerprint)?,
            insert_batch_size: defaults.discovery.insert_batch_size,
        };

        let pool = PoolConfig {
            initial_workers: env.parse("INITIAL_WORKERS", defaults.pool.initial_workers)?,
            min_workers: env.parse("MIN_WORKERS", defaults.pool.min_workers)?,
            max_workers: env.parse("MAX_WORKERS", defaults.pool.max_workers)?,
            thresholds: LoadThresholds {
                cpu_low: env.parse("CPU_LOW", defaults.pool.thresholds.cpu_low)?,
                cpu_high: env.parse("CPU_HIGH", defaults.pool.thresholds.cpu_high)?,
                memory_low: env.parse("MEM_LOW", defaults.pool.thresholds.memory_low)?,
                memory_high: env.parse("MEM_HIGH", defaults.pool.thresholds.memory_high)?,
            },
            scan_interval: env.secs("SCAN_INTERVAL_SECS", defaults.pool.scan_interval)?,
            item_timeout: env.secs("ITEM_TIMEOUT_SECS", defaults.pool.item_timeout)?,
            reclaim_interval: env.secs("RECLAIM_INTERVAL_SECS", defaults.pool.reclaim_interval)?,
            queue_depth_limit: env.parse("QUEUE_DEPTH_LIMIT", defaults.pool.queue_depth_limit)?,
            max_retries: env.parse("MAX_RETRIES", defaults.pool.max_retries)?,
        };

        let roi = match env.get("ROI") {
            Some(raw) => Some(Roi::parse(&raw).ok_or_else(|| invalid("ROI", &raw, "expected x,y,w,h"))?),
            None => None,
        };
        let sampler = SamplerSettings {
            frame_interval: Duration::from_millis(env.parse(
                "FRAME_INTERVAL_MS",
                defaults.sampler.frame_interval.as_millis() as u64,
            )?),
            roi,
            log_batch_size: env.parse("LOG_BATCH_SIZE", defaults.sampler.log_batch_size)?,
        };

        let max_event_secs: u64 = env.parse(
            "MAX_EVENT_SECS",
            defaults.coalesce.max_duration.map_or(0, |d| d.as_secs()),
        )?;
        let coalesce = CoalesceConfig {
            merge_gap: env.secs("MERGE_GAP_SECS", defaults.coalesce.merge_gap)?,
            min_duration: env.secs("MIN_EVENT_SECS", defaults.coalesce.min_duration)?,
            max_duration: (max_event_secs > 0).then(|| Duration::from_secs(max_event_secs)),
            min_detections: env.parse("MIN_DETECTIONS", defaults.coalesce.min_detections)?,
        };

        let detector_command = match env.get("DETECTOR_CMD") {
            Some(raw) => {
                let parts = split_command(&raw);
                if parts.is_empty() {
                    return Err(invalid("DETECTOR_CMD", &raw, "empty command"));
                }
                parts
            }
            None => defaults.detector_command,
        };

        let config = Self {
            database_url: env.get("DATABASE_URL").unwrap_or(defaults.database_url),
            node_name: env.get("NODE_NAME").unwrap_or(defaults.node_name),
            detector_command,
            pool,
            discovery,
            sampler,
            coalesce,
            wait_timeout: Duration::from_millis(
                env.parse("WAIT_TIMEOUT_MS", defaults.wait_timeout.as_millis() as u64)?,
            ),
            monitor_interval: env.secs("MONITOR_INTERVAL_SECS", defaults.monitor_interval)?,
            resize_interval: env.secs("RESIZE_INTERVAL_SECS", defaults.resize_interval)?,
            shutdown_timeout: env.secs("SHUTDOWN_TIMEOUT_SECS", defaults.shutdown_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Cross-field checks that the individual parsers cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool
            .validate()
            .map_err(|e| invalid("MAX_WORKERS", &self.pool.max_workers.to_string(), e))?;
        self.coalesce
            .validate()
            .map_err(|e| invalid("MERGE_GAP_SECS", &format!("{:?}", self.coalesce.merge_gap), e))?;
        if self.sampler.log_batch_size == 0 {
            return Err(invalid("LOG_BATCH_SIZE", "0", "must be at least 1"));
        }
        if self.sampler.frame_interval.is_zero() {
            return Err(invalid("FRAME_INTERVAL_MS", "0", "must be greater than zero"));
        }
        for (var, value) in [
            ("WAIT_TIMEOUT_MS", self.wait_timeout),
            ("MONITOR_INTERVAL_SECS", self.monitor_interval),
            ("RESIZE_INTERVAL_SECS", self.resize_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(var, "0", "must be greater than zero"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(&format!("{PREFIX}{var}"))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(var) {
            Some(raw) => raw.parse().map_err(|e| invalid(var, &raw, e)),
            None => Ok(default),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }
}

fn invalid(var: &'static str, value: &str, reason: impl std::fmt::Display) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("PACKLINE_{k}"), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn sources_are_required() {
        assert!(matches!(load(&[]), Err(ConfigError::Missing("SOURCES"))));
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = load(&[("SOURCES", "dock=/srv/dock")]).unwrap();
        assert_eq!(
            config.discovery.sources,
            vec![SourceConfig {
                camera_id: "dock".into(),
                root: PathBuf::from("/srv/dock"),
            }]
        );
        assert_eq!(config.pool.item_timeout, Duration::from_secs(900));
        assert_eq!(config.pool.thresholds, LoadThresholds::default());
        assert_eq!(config.detector_command, vec!["packline-detect".to_string()]);
        assert!(config.discovery.active_sources.is_none());
        assert!(!config.discovery.fingerprint);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("SOURCES", "a=/a, b=/b"),
            ("ACTIVE_SOURCES", "b"),
            ("EXTENSIONS", ".MP4,mov"),
            ("MAX_WORKERS", "8"),
            ("CPU_HIGH", "90"),
            ("ROI", "10,20,300,200"),
            ("MAX_EVENT_SECS", "0"),
            ("WORK_DAYS", "mon,tue"),
            ("WORK_HOURS", "08:00-18:00"),
            ("UTC_OFFSET_MINUTES", "120"),
            ("DETECTOR_CMD", "python3 detect.py --model qr"),
            ("FINGERPRINT", "true"),
        ])
        .unwrap();
        assert_eq!(config.discovery.sources.len(), 2);
        assert_eq!(config.discovery.active_sources, Some(vec!["b".to_string()]));
        assert_eq!(config.discovery.extensions, vec!["mp4", "mov"]);
        assert_eq!(config.pool.max_workers, 8);
        assert_eq!(config.pool.thresholds.cpu_high, 90.0);
        assert_eq!(config.sampler.roi.unwrap().width, 300);
        assert_eq!(config.coalesce.max_duration, None);
        assert_eq!(config.discovery.schedule.days.len(), 2);
        assert_eq!(config.discovery.schedule.offset.local_minus_utc(), 7200);
        assert_eq!(config.detector_command.len(), 4);
        assert!(config.discovery.fingerprint);
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = load(&[("SOURCES", "a=/a"), ("MAX_WORKERS", "many")]).unwrap_err();
        assert!(err.to_string().contains("PACKLINE_MAX_WORKERS"), "{err}");

        let err = load(&[("SOURCES", "nopath")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { var: "SOURCES", .. }));
    }

    #[test]
    fn inconsistent_bounds_rejected() {
        let err = load(&[("SOURCES", "a=/a"), ("MIN_WORKERS", "5"), ("MAX_WORKERS", "2")]);
        assert!(err.is_err());
    }
}
