use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::capture::CaptureSettings;
use crate::extract::ZernikeSettings;
use crate::gallery::DEFAULT_MATCH_THRESHOLD;
use crate::monitor::MonitorSettings;

const DEFAULT_DB_PATH: &str = "facewatch.db";
const DEFAULT_EXTRACTOR: &str = "zernike";
const DEFAULT_REGION_LUMA_THRESHOLD: u8 = 128;
const DEFAULT_MIN_REGION_SIDE: u32 = 24;
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 2000;
const DEFAULT_COOLDOWN_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 10;
const DEFAULT_RETENTION_DAYS: u64 = 30;

const SECS_PER_DAY: u64 = 60 * 60 * 24;

#[derive(Debug, Deserialize, Default)]
struct FacewatchConfigFile {
    db_path: Option<String>,
    matching: Option<MatchingConfigFile>,
    capture: Option<CaptureConfigFile>,
    pipeline: Option<PipelineConfigFile>,
    retention: Option<RetentionConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MatchingConfigFile {
    threshold: Option<f64>,
    extractor: Option<String>,
    region_luma_threshold: Option<u8>,
    min_region_side: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    max_consecutive_errors: Option<u32>,
    retry_backoff_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct PipelineConfigFile {
    cooldown_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    days: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FacewatchConfig {
    pub db_path: String,
    pub matching: MatchingConfig,
    pub capture: CaptureSettings,
    pub pipeline: PipelineConfig,
    pub retention: Duration,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    pub threshold: f64,
    /// Registry name of the feature extractor.
    pub extractor: String,
    pub region_luma_threshold: u8,
    pub min_region_side: u32,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub cooldown: Duration,
    pub poll_interval: Duration,
}

impl FacewatchConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACEWATCH_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) => Some(read_config_file(Path::new(path))?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FacewatchConfigFile) -> Self {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());
        let matching = file.matching.unwrap_or_default();
        let capture = file.capture.unwrap_or_default();
        let pipeline = file.pipeline.unwrap_or_default();
        let retention_days = file
            .retention
            .and_then(|retention| retention.days)
            .unwrap_or(DEFAULT_RETENTION_DAYS);

        Self {
            db_path,
            matching: MatchingConfig {
                threshold: matching.threshold.unwrap_or(DEFAULT_MATCH_THRESHOLD),
                extractor: matching
                    .extractor
                    .unwrap_or_else(|| DEFAULT_EXTRACTOR.to_string()),
                region_luma_threshold: matching
                    .region_luma_threshold
                    .unwrap_or(DEFAULT_REGION_LUMA_THRESHOLD),
                min_region_side: matching
                    .min_region_side
                    .unwrap_or(DEFAULT_MIN_REGION_SIDE),
            },
            capture: CaptureSettings {
                max_consecutive_errors: capture
                    .max_consecutive_errors
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_ERRORS),
                retry_backoff: Duration::from_millis(
                    capture.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
                stop_timeout: Duration::from_millis(
                    capture.stop_timeout_ms.unwrap_or(DEFAULT_STOP_TIMEOUT_MS),
                ),
            },
            pipeline: PipelineConfig {
                cooldown: Duration::from_secs(
                    pipeline.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
                poll_interval: Duration::from_millis(
                    pipeline.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
            retention: Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY)),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("FACEWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(threshold) = std::env::var("FACEWATCH_MATCH_THRESHOLD") {
            self.matching.threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("FACEWATCH_MATCH_THRESHOLD must be a number"))?;
        }
        if let Ok(extractor) = std::env::var("FACEWATCH_EXTRACTOR") {
            if !extractor.trim().is_empty() {
                self.matching.extractor = extractor.trim().to_string();
            }
        }
        if let Ok(cooldown) = std::env::var("FACEWATCH_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("FACEWATCH_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.pipeline.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(poll) = std::env::var("FACEWATCH_POLL_MS") {
            let millis: u64 = poll.trim().parse().map_err(|_| {
                anyhow!("FACEWATCH_POLL_MS must be an integer number of milliseconds")
            })?;
            self.pipeline.poll_interval = Duration::from_millis(millis);
        }
        if let Ok(retention) = std::env::var("FACEWATCH_RETENTION_DAYS") {
            let days: u64 = retention.trim().parse().map_err(|_| {
                anyhow!("FACEWATCH_RETENTION_DAYS must be an integer number of days")
            })?;
            self.retention = Duration::from_secs(days.saturating_mul(SECS_PER_DAY));
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if !self.matching.threshold.is_finite() || self.matching.threshold <= 0.0 {
            return Err(anyhow!("match threshold must be a positive number"));
        }
        self.matching.extractor = self.matching.extractor.to_lowercase();
        if self.matching.min_region_side == 0 {
            return Err(anyhow!("min_region_side must be greater than zero"));
        }
        if self.capture.max_consecutive_errors == 0 {
            return Err(anyhow!("max_consecutive_errors must be at least 1"));
        }
        if self.pipeline.cooldown.is_zero() {
            return Err(anyhow!("cooldown must be greater than zero"));
        }
        if self.pipeline.poll_interval.is_zero() {
            return Err(anyhow!("poll interval must be greater than zero"));
        }
        if self.retention.is_zero() {
            return Err(anyhow!("retention must be greater than zero"));
        }
        Ok(())
    }

    /// Oldest detection timestamp kept at `now`. Saturates instead of
    /// wrapping for retention windows beyond the `i64` range.
    pub fn retention_cutoff(&self, now: i64) -> i64 {
        let window = i64::try_from(self.retention.as_secs()).unwrap_or(i64::MAX);
        now.saturating_sub(window)
    }

    pub fn zernike_settings(&self) -> ZernikeSettings {
        ZernikeSettings {
            luma_threshold: self.matching.region_luma_threshold,
            min_region_side: self.matching.min_region_side,
            ..ZernikeSettings::default()
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            poll_interval: self.pipeline.poll_interval,
            cooldown: self.pipeline.cooldown,
            stop_timeout: self.capture.stop_timeout,
        }
    }
}

fn read_config_file(path: &Path) -> Result<FacewatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() -> Result<()> {
        let mut cfg = FacewatchConfig::from_file(FacewatchConfigFile::default());
        cfg.validate()?;
        assert_eq!(cfg.db_path, "facewatch.db");
        assert_eq!(cfg.matching.threshold, DEFAULT_MATCH_THRESHOLD);
        assert_eq!(cfg.matching.extractor, "zernike");
        assert_eq!(cfg.capture.max_consecutive_errors, 5);
        assert_eq!(cfg.capture.retry_backoff, Duration::from_millis(100));
        assert_eq!(cfg.pipeline.cooldown, Duration::from_secs(60));
        assert_eq!(cfg.pipeline.poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.retention, Duration::from_secs(30 * SECS_PER_DAY));
        Ok(())
    }

    #[test]
    fn rejects_unusable_values() -> Result<()> {
        let parse = |json: &str| -> Result<FacewatchConfig> {
            let file: FacewatchConfigFile = serde_json::from_str(json)?;
            let mut cfg = FacewatchConfig::from_file(file);
            cfg.validate()?;
            Ok(cfg)
        };
        assert!(parse(r#"{"matching": {"threshold": 0.0}}"#).is_err());
        assert!(parse(r#"{"matching": {"threshold": -1.0}}"#).is_err());
        assert!(parse(r#"{"capture": {"max_consecutive_errors": 0}}"#).is_err());
        assert!(parse(r#"{"pipeline": {"cooldown_secs": 0}}"#).is_err());
        assert!(parse(r#"{"retention": {"days": 0}}"#).is_err());
        assert_eq!(
            parse(r#"{"matching": {"extractor": "Stub"}}"#)?.matching.extractor,
            "stub"
        );
        Ok(())
    }

    #[test]
    fn huge_retention_keeps_all_history() -> Result<()> {
        let file: FacewatchConfigFile =
            serde_json::from_str(r#"{"retention": {"days": 999999999999999}}"#)?;
        let mut cfg = FacewatchConfig::from_file(file);
        cfg.validate()?;
        assert_eq!(cfg.retention, Duration::from_secs(u64::MAX));
        let now = 1_700_000_000;
        assert_eq!(cfg.retention_cutoff(now), now - i64::MAX);
        assert!(cfg.retention_cutoff(now) < 0);
        assert_eq!(cfg.retention_cutoff(i64::MIN), i64::MIN);

        cfg.retention = Duration::from_secs(30 * SECS_PER_DAY);
        assert_eq!(cfg.retention_cutoff(now), now - 30 * 86_400);
        Ok(())
    }

    #[test]
    fn derived_settings_follow_config() {
        let file: FacewatchConfigFile = serde_json::from_str(
            r#"{"matching": {"region_luma_threshold": 90, "min_region_side": 16},
                "capture": {"stop_timeout_ms": 500},
                "pipeline": {"cooldown_secs": 5, "poll_interval_ms": 20}}"#,
        )
        .unwrap();
        let cfg = FacewatchConfig::from_file(file);
        let zernike = cfg.zernike_settings();
        assert_eq!(zernike.luma_threshold, 90);
        assert_eq!(zernike.min_region_side, 16);
        assert_eq!(zernike.degree, ZernikeSettings::default().degree);
        let monitor = cfg.monitor_settings();
        assert_eq!(monitor.cooldown, Duration::from_secs(5));
        assert_eq!(monitor.poll_interval, Duration::from_millis(20));
        assert_eq!(monitor.stop_timeout, Duration::from_millis(500));
    }
}
