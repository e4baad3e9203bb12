//! Configuration file management for trackfuse.
//!
//! Reads/writes `~/.trackfuse/config.yaml`: fusion timing, dedup and storage
//! thresholds, notifier batching, raw-record archive retention, geographic
//! bounds, database path, status listener, and one `source.<name>` section
//! per provider.

use std::path::{Path, PathBuf};

use crate::geo::BoundingBox;
use crate::providers::SourceFormat;
use crate::types::{EntityClass, Result, TrackError};

/// Full configuration structure.
#[derive(Debug, Clone)]
pub struct Config {
    pub fusion: FusionConfig,
    pub dedup: DedupConfig,
    pub storage: StorageConfig,
    pub notifier: NotifierConfig,
    pub cleanup: CleanupConfig,
    pub raw_archive: RawArchiveConfig,
    pub bounds: BoundingBox,
    pub database: DatabaseConfig,
    pub status: StatusConfig,
    pub sources: Vec<SourceConfig>,
}

/// Per-class fusion timing, in seconds.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassTiming {
    pub fusion_interval_secs: f64,
    pub freshness_secs: f64,
    pub staleness_secs: f64,
    pub inactivity_secs: f64,
}

impl ClassTiming {
    pub fn defaults(class: EntityClass) -> Self {
        match class {
            EntityClass::Aircraft => ClassTiming {
                fusion_interval_secs: 5.0,
                freshness_secs: 30.0,
                staleness_secs: 60.0,
                inactivity_secs: 300.0,
            },
            EntityClass::Vessel => ClassTiming {
                fusion_interval_secs: 10.0,
                freshness_secs: 60.0,
                staleness_secs: 120.0,
                inactivity_secs: 600.0,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct FusionConfig {
    pub enabled: bool,
    pub min_quality: f64,
    pub max_batch_size: usize,
    pub aircraft: ClassTiming,
    pub vessel: ClassTiming,
}

impl FusionConfig {
    pub fn timing(&self, class: EntityClass) -> &ClassTiming {
        match class {
            EntityClass::Aircraft => &self.aircraft,
            EntityClass::Vessel => &self.vessel,
        }
    }

    fn timing_mut(&mut self, class: EntityClass) -> &mut ClassTiming {
        match class {
            EntityClass::Aircraft => &mut self.aircraft,
            EntityClass::Vessel => &mut self.vessel,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub window_secs: f64,
    pub distance_km: f64,
    /// Emergency updates are never treated as duplicates.
    pub emergency_bypass: bool,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub distance_m: f64,
    pub altitude_ft: f64,
    pub speed_kts: f64,
    pub course_deg: f64,
    pub force_save_secs: f64,
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub batch_enabled: bool,
    pub batch_interval_secs: f64,
    /// Outbound queue depth per session.
    pub session_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval_secs: f64,
}

/// Every raw provider record is kept for `retention_days`, linked to the
/// fused record it fed.
#[derive(Debug, Clone)]
pub struct RawArchiveConfig {
    pub enabled: bool,
    pub retention_days: f64,
}

impl RawArchiveConfig {
    pub fn retention_secs(&self) -> f64 {
        self.retention_days * 86_400.0
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub host: String,
    pub port: u16,
}

/// One external provider.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceConfig {
    pub name: String,
    pub format: SourceFormat,
    pub class: EntityClass,
    pub url: String,
    pub api_key: Option<String>,
    pub enabled: bool,
    /// Lower is more trusted.
    pub priority: u32,
    pub quality: f64,
    pub interval_secs: f64,
    pub timeout_secs: f64,
    /// Consecutive failed fetches before the source is reported unhealthy.
    pub failure_threshold: u32,
}

impl SourceConfig {
    pub fn new(name: &str, format: SourceFormat, priority: u32) -> Self {
        let class = format.class();
        let (interval_secs, timeout_secs) = match class {
            EntityClass::Aircraft => (30.0, 10.0),
            EntityClass::Vessel => (60.0, 15.0),
        };
        SourceConfig {
            name: name.to_string(),
            format,
            class,
            url: format!("http://localhost:3001/api/mock/{name}"),
            api_key: None,
            enabled: true,
            priority,
            quality: format.default_quality(),
            interval_secs,
            timeout_secs,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }
}

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Rank of any source absent from the priority table.
pub const UNKNOWN_SOURCE_PRIORITY: u32 = 999;

fn default_sources() -> Vec<SourceConfig> {
    let mut v2 = SourceConfig::new("marinetraffic-v2", SourceFormat::MarineTraffic, 3);
    v2.quality = 0.90;
    v2.interval_secs = 45.0;
    let mut chinaports = SourceConfig::new("chinaports", SourceFormat::Chinaports, 4);
    chinaports.interval_secs = 45.0;
    vec![
        SourceConfig::new("flightradar24", SourceFormat::Flightradar24, 1),
        SourceConfig::new("adsbexchange", SourceFormat::AdsbExchange, 2),
        SourceConfig::new("marinetraffic", SourceFormat::MarineTraffic, 1),
        SourceConfig::new("vesselfinder", SourceFormat::VesselFinder, 2),
        v2,
        chinaports,
    ]
}

impl Default for Config {
    fn default() -> Self {
        Config {
            fusion: FusionConfig {
                enabled: true,
                min_quality: 0.5,
                max_batch_size: 1000,
                aircraft: ClassTiming::defaults(EntityClass::Aircraft),
                vessel: ClassTiming::defaults(EntityClass::Vessel),
            },
            dedup: DedupConfig {
                window_secs: 30.0,
                distance_km: 0.001,
                emergency_bypass: true,
            },
            storage: StorageConfig {
                distance_m: 100.0,
                altitude_ft: 500.0,
                speed_kts: 10.0,
                course_deg: 30.0,
                force_save_secs: 60.0,
            },
            notifier: NotifierConfig {
                batch_enabled: false,
                batch_interval_secs: 5.0,
                session_buffer: 256,
            },
            cleanup: CleanupConfig {
                interval_secs: 60.0,
            },
            raw_archive: RawArchiveConfig {
                enabled: true,
                retention_days: 30.0,
            },
            bounds: BoundingBox {
                min_lat: 8.5,
                max_lat: 23.5,
                min_lon: 102.0,
                max_lon: 109.5,
            },
            database: DatabaseConfig {
                path: "data/trackfuse.db".into(),
            },
            status: StatusConfig {
                host: "127.0.0.1".into(),
                port: 8080,
            },
            sources: default_sources(),
        }
    }
}

impl Config {
    /// Enabled sources only.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

/// Get the config directory path (`~/.trackfuse/`).
pub fn config_dir() -> PathBuf {
    dirs_home().join(".trackfuse")
}

/// Get the config file path.
pub fn config_file() -> PathBuf {
    config_dir().join("config.yaml")
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load config from `~/.trackfuse/config.yaml`.
///
/// Returns default config if the file doesn't exist.
pub fn load_config() -> Result<Config> {
    load_config_from(&config_file())
}

/// Load config from an explicit path. A missing file yields the defaults.
pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Save config to `~/.trackfuse/config.yaml`.
pub fn save_config(config: &Config) -> Result<PathBuf> {
    let dir = config_dir();
    std::fs::create_dir_all(&dir).map_err(|e| TrackError::Config(e.to_string()))?;

    let path = config_file();
    let text = serialize_config(config);
    std::fs::write(&path, text).map_err(|e| TrackError::Config(e.to_string()))?;

    Ok(path)
}

/// Parse simple YAML-like config text.
pub fn parse_config(text: &str) -> Result<Config> {
    let mut config = Config::default();
    let mut current_section: Option<String> = None;

    for (lineno, line) in text.lines().enumerate() {
        let stripped = line.trim();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }

        let is_indented = line.starts_with("  ") || line.starts_with('\t');

        let Some((key, val)) = stripped.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let val = val.trim();

        if !is_indented {
            current_section = if val.is_empty() {
                Some(key.to_string())
            } else {
                None
            };
            continue;
        }

        let Some(section) = current_section.as_deref() else {
            continue;
        };
        let bad = |what: &str| TrackError::Config(format!("line {}: invalid {what}: {val}", lineno + 1));

        match section {
            "fusion" => match key {
                "enabled" => config.fusion.enabled = parse_bool(val).ok_or_else(|| bad(key))?,
                "min_quality" => config.fusion.min_quality = parse_num(val).ok_or_else(|| bad(key))?,
                "max_batch_size" => {
                    config.fusion.max_batch_size = val.parse().map_err(|_| bad(key))?
                }
                _ => {
                    if let Some((class, field)) = split_class_key(key) {
                        let v = parse_num(val).ok_or_else(|| bad(key))?;
                        let timing = config.fusion.timing_mut(class);
                        match field {
                            "fusion_interval_secs" => {
                                timing.fusion_interval_secs = Some(v).filter(|v| *v > 0.0).ok_or_else(|| bad(key))?
                            }
                            "freshness_secs" => timing.freshness_secs = v,
                            "staleness_secs" => timing.staleness_secs = v,
                            "inactivity_secs" => timing.inactivity_secs = v,
                            _ => {}
                        }
                    }
                }
            },
            "dedup" => match key {
                "window_secs" => config.dedup.window_secs = parse_num(val).ok_or_else(|| bad(key))?,
                "distance_km" => config.dedup.distance_km = parse_num(val).ok_or_else(|| bad(key))?,
                "emergency_bypass" => {
                    config.dedup.emergency_bypass = parse_bool(val).ok_or_else(|| bad(key))?
                }
                _ => {}
            },
            "storage" => {
                let v = parse_num(val).ok_or_else(|| bad(key))?;
                match key {
                    "distance_m" => config.storage.distance_m = v,
                    "altitude_ft" => config.storage.altitude_ft = v,
                    "speed_kts" => config.storage.speed_kts = v,
                    "course_deg" => config.storage.course_deg = v,
                    "force_save_secs" => config.storage.force_save_secs = v,
                    _ => {}
                }
            }
            "notifier" => match key {
                "batch_enabled" => {
                    config.notifier.batch_enabled = parse_bool(val).ok_or_else(|| bad(key))?
                }
                "batch_interval_secs" => {
                    config.notifier.batch_interval_secs = parse_positive(val).ok_or_else(|| bad(key))?
                }
                "session_buffer" => {
                    config.notifier.session_buffer = val.parse().map_err(|_| bad(key))?
                }
                _ => {}
            },
            "cleanup" => {
                if key == "interval_secs" {
                    config.cleanup.interval_secs = parse_positive(val).ok_or_else(|| bad(key))?;
                }
            }
            "raw_archive" => match key {
                "enabled" => config.raw_archive.enabled = parse_bool(val).ok_or_else(|| bad(key))?,
                "retention_days" => {
                    config.raw_archive.retention_days = parse_positive(val).ok_or_else(|| bad(key))?
                }
                _ => {}
            },
            "bounds" => {
                let v = parse_num(val).ok_or_else(|| bad(key))?;
                match key {
                    "min_lat" => config.bounds.min_lat = v,
                    "max_lat" => config.bounds.max_lat = v,
                    "min_lon" => config.bounds.min_lon = v,
                    "max_lon" => config.bounds.max_lon = v,
                    _ => {}
                }
            }
            "database" => {
                if key == "path" {
                    if let Some(v) = parse_string_value(val) {
                        config.database.path = v;
                    }
                }
            }
            "status" => match key {
                "host" => {
                    if let Some(v) = parse_string_value(val) {
                        config.status.host = v;
                    }
                }
                "port" => config.status.port = val.parse().map_err(|_| bad(key))?,
                _ => {}
            },
            other => {
                if let Some(name) = other.strip_prefix("source.") {
                    let source = source_entry(&mut config.sources, name);
                    apply_source_key(source, key, val).ok_or_else(|| bad(key))?;
                }
            }
        }
    }

    // Re-validate the box edges as a unit
    let b = config.bounds;
    config.bounds = BoundingBox::new(b.min_lat, b.max_lat, b.min_lon, b.max_lon)
        .map_err(|e| TrackError::Config(e.to_string()))?;

    Ok(config)
}

fn split_class_key(key: &str) -> Option<(EntityClass, &str)> {
    let (prefix, rest) = key.split_once('_')?;
    Some((EntityClass::parse(prefix)?, rest))
}

fn source_entry<'a>(sources: &'a mut Vec<SourceConfig>, name: &str) -> &'a mut SourceConfig {
    if let Some(idx) = sources.iter().position(|s| s.name == name) {
        return &mut sources[idx];
    }
    let format = SourceFormat::parse(name).unwrap_or(SourceFormat::AdsbExchange);
    sources.push(SourceConfig::new(name, format, UNKNOWN_SOURCE_PRIORITY));
    let last = sources.len() - 1;
    &mut sources[last]
}

fn apply_source_key(source: &mut SourceConfig, key: &str, val: &str) -> Option<()> {
    match key {
        "format" => {
            source.format = SourceFormat::parse(&parse_string_value(val)?)?;
            source.class = source.format.class();
        }
        "class" => source.class = EntityClass::parse(&parse_string_value(val)?)?,
        "url" => source.url = parse_string_value(val)?,
        "api_key" => source.api_key = parse_string_value(val),
        "enabled" => source.enabled = parse_bool(val)?,
        "priority" => source.priority = val.parse().ok()?,
        "quality" => source.quality = parse_num(val)?.clamp(0.0, 1.0),
        "interval_secs" => source.interval_secs = parse_positive(val)?,
        "timeout_secs" => source.timeout_secs = parse_positive(val)?,
        "failure_threshold" => source.failure_threshold = val.parse().ok().filter(|n| *n > 0)?,
        _ => {}
    }
    Some(())
}

fn parse_string_value(val: &str) -> Option<String> {
    if val == "null" || val == "~" || val.is_empty() {
        return None;
    }
    // Strip quotes
    if val.len() >= 2
        && ((val.starts_with('"') && val.ends_with('"'))
            || (val.starts_with('\'') && val.ends_with('\'')))
    {
        return Some(val[1..val.len() - 1].to_string());
    }
    Some(val.to_string())
}

fn parse_num(val: &str) -> Option<f64> {
    val.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Periods feed timers, which cannot tick at zero.
fn parse_positive(val: &str) -> Option<f64> {
    parse_num(val).filter(|v| *v > 0.0)
}

fn parse_bool(val: &str) -> Option<bool> {
    match val {
        "true" | "yes" | "on" => Some(true),
        "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Serialize config to YAML-like text.
pub fn serialize_config(config: &Config) -> String {
    let mut lines = vec!["# trackfuse configuration".to_string(), String::new()];

    let f = &config.fusion;
    lines.push("fusion:".into());
    lines.push(format!("  enabled: {}", f.enabled));
    lines.push(format!("  min_quality: {}", f.min_quality));
    lines.push(format!("  max_batch_size: {}", f.max_batch_size));
    for class in EntityClass::ALL {
        let t = f.timing(class);
        lines.push(format!("  {class}_fusion_interval_secs: {}", t.fusion_interval_secs));
        lines.push(format!("  {class}_freshness_secs: {}", t.freshness_secs));
        lines.push(format!("  {class}_staleness_secs: {}", t.staleness_secs));
        lines.push(format!("  {class}_inactivity_secs: {}", t.inactivity_secs));
    }
    lines.push(String::new());

    lines.push("dedup:".into());
    lines.push(format!("  window_secs: {}", config.dedup.window_secs));
    lines.push(format!("  distance_km: {}", config.dedup.distance_km));
    lines.push(format!("  emergency_bypass: {}", config.dedup.emergency_bypass));
    lines.push(String::new());

    let s = &config.storage;
    lines.push("storage:".into());
    lines.push(format!("  distance_m: {}", s.distance_m));
    lines.push(format!("  altitude_ft: {}", s.altitude_ft));
    lines.push(format!("  speed_kts: {}", s.speed_kts));
    lines.push(format!("  course_deg: {}", s.course_deg));
    lines.push(format!("  force_save_secs: {}", s.force_save_secs));
    lines.push(String::new());

    lines.push("notifier:".into());
    lines.push(format!("  batch_enabled: {}", config.notifier.batch_enabled));
    lines.push(format!("  batch_interval_secs: {}", config.notifier.batch_interval_secs));
    lines.push(format!("  session_buffer: {}", config.notifier.session_buffer));
    lines.push(String::new());

    lines.push("cleanup:".into());
    lines.push(format!("  interval_secs: {}", config.cleanup.interval_secs));
    lines.push(String::new());

    lines.push("raw_archive:".into());
    lines.push(format!("  enabled: {}", config.raw_archive.enabled));
    lines.push(format!("  retention_days: {}", config.raw_archive.retention_days));
    lines.push(String::new());

    let b = &config.bounds;
    lines.push("bounds:".into());
    lines.push(format!("  min_lat: {}", b.min_lat));
    lines.push(format!("  max_lat: {}", b.max_lat));
    lines.push(format!("  min_lon: {}", b.min_lon));
    lines.push(format!("  max_lon: {}", b.max_lon));
    lines.push(String::new());

    lines.push("database:".into());
    lines.push(format!("  path: \"{}\"", config.database.path));
    lines.push(String::new());

    lines.push("status:".into());
    lines.push(format!("  host: \"{}\"", config.status.host));
    lines.push(format!("  port: {}", config.status.port));

    for src in &config.sources {
        lines.push(String::new());
        lines.push(format!("source.{}:", src.name));
        lines.push(format!("  format: {}", src.format));
        lines.push(format!("  class: {}", src.class));
        lines.push(format!("  url: \"{}\"", src.url));
        match &src.api_key {
            Some(k) => lines.push(format!("  api_key: \"{k}\"")),
            None => lines.push("  api_key: null".into()),
        }
        lines.push(format!("  enabled: {}", src.enabled));
        lines.push(format!("  priority: {}", src.priority));
        lines.push(format!("  quality: {}", src.quality));
        lines.push(format!("  interval_secs: {}", src.interval_secs));
        lines.push(format!("  timeout_secs: {}", src.timeout_secs));
        lines.push(format!("  failure_threshold: {}", src.failure_threshold));
    }

    lines.join("\n") + "\n"
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
