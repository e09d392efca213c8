// SPDX-License-Identifier: MIT OR Apache-2.0
//! Engine configuration loading, validation, and merging (spec §6).
//!
//! A `load_config`/`parse_toml`/`apply_env_overrides`/`validate_config`/
//! `merge_configs` pipeline over the engine's own key set: routing defaults,
//! per-op bounds, monitor cadence, and the three backends' tuning knobs.
#![warn(missing_docs)]

use ctx_backend_memory::EvictionPolicy;
use ctx_core::{Algorithm, Service};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Errors that can occur during configuration loading or validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The requested configuration file was not found.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// Path that was requested.
        path: String,
    },

    /// The file could not be parsed as valid TOML.
    #[error("failed to parse config: {reason}")]
    ParseError {
        /// Human-readable parse error detail.
        reason: String,
    },

    /// Semantic validation failed (one or more problems).
    #[error("config validation failed: {reasons:?}")]
    ValidationError {
        /// Individual validation failure messages.
        reasons: Vec<String>,
    },
}

/// Advisory-level issues that do not prevent operation but deserve attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// A recommended optional field is missing or zeroed.
    MissingOptionalField {
        /// Name of the affected field.
        field: String,
        /// Why it matters.
        hint: String,
    },
    /// A timeout is unusually large.
    LargeTimeout {
        /// Milliseconds configured.
        timeout_ms: u64,
    },
    /// The memory backend's byte budget is suspiciously small.
    SmallMemoryBudget {
        /// Configured byte budget.
        max_size: u64,
    },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::MissingOptionalField { field, hint } => {
                write!(f, "missing optional field '{field}': {hint}")
            }
            ConfigWarning::LargeTimeout { timeout_ms } => {
                write!(f, "timeoutMs is unusually large ({timeout_ms}ms)")
            }
            ConfigWarning::SmallMemoryBudget { max_size } => {
                write!(f, "memory.maxSize is suspiciously small ({max_size} bytes)")
            }
        }
    }
}

/// SQLite `PRAGMA journal_mode` values the indexed backend accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum JournalMode {
    /// Write-ahead log, the durable default for concurrent readers.
    Wal,
    /// Classic rollback journal.
    Delete,
    /// No journal at all (unsafe on crash).
    Off,
}

/// Memory backend (C3) tuning (spec §6 `memory.*`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct MemoryConfig {
    /// Byte budget before eviction kicks in.
    #[serde(default = "default_memory_max_size")]
    pub max_size: u64,
    /// Eviction policy applied once `max_size` is exceeded.
    #[serde(default)]
    pub eviction_policy: EvictionPolicy,
    /// Default TTL (seconds) applied to records with no explicit TTL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ttl: Option<u64>,
    /// Whether stored payloads are compressed in memory.
    #[serde(default)]
    pub compression_enabled: bool,
    /// Whether cache hit/miss counters are recorded.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_memory_max_size() -> u64 {
    64 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_size: default_memory_max_size(),
            eviction_policy: EvictionPolicy::Lru,
            default_ttl: None,
            compression_enabled: false,
            metrics_enabled: true,
        }
    }
}

/// Indexed backend (C4) tuning (spec §6 `sqlite.*`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct SqliteConfig {
    /// Path to the SQLite database file (or `:memory:`).
    #[serde(default = "default_sqlite_path")]
    pub database_path: String,
    /// Journal mode.
    #[serde(default)]
    pub journal_mode: JournalMode,
    /// SQLite page cache size, in pages.
    #[serde(default = "default_sqlite_cache_size")]
    pub cache_size: i64,
    /// Whether secondary indexes are created.
    #[serde(default = "default_true")]
    pub indexing_enabled: bool,
    /// Whether the FTS5 virtual table is created and maintained.
    #[serde(default = "default_true")]
    pub full_text_search_enabled: bool,
}

fn default_sqlite_path() -> String {
    "context-engine.db".to_string()
}

fn default_sqlite_cache_size() -> i64 {
    2_000
}

impl Default for JournalMode {
    fn default() -> Self {
        JournalMode::Wal
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            database_path: default_sqlite_path(),
            journal_mode: JournalMode::Wal,
            cache_size: default_sqlite_cache_size(),
            indexing_enabled: true,
            full_text_search_enabled: true,
        }
    }
}

/// Archive backend (C5) tuning (spec §6 `filesystem.*`).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct FilesystemConfig {
    /// Root directory of the file-per-record layout.
    #[serde(default = "default_filesystem_base_path")]
    pub base_path: String,
    /// Whether records are compressed before being archived.
    #[serde(default = "default_true")]
    pub compression_enabled: bool,
    /// Algorithm used when compressing.
    #[serde(default)]
    pub default_algorithm: Algorithm,
    /// Records above this size (bytes) are eligible for archival.
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Whether the archival sweep runs at all.
    #[serde(default = "default_true")]
    pub archive_enabled: bool,
}

fn default_filesystem_base_path() -> String {
    "context-archive".to_string()
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: default_filesystem_base_path(),
            compression_enabled: true,
            default_algorithm: Algorithm::Zstd,
            max_file_size: default_max_file_size(),
            archive_enabled: true,
        }
    }
}

/// Top-level engine configuration (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct EngineConfig {
    /// Backend the priority-0 default route points to.
    #[serde(default = "default_storage_service")]
    pub default_storage_service: Service,
    /// Whether a failed primary write cascades to other healthy backends.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Whether successful writes fan out to other healthy backends.
    #[serde(default = "default_true")]
    pub replication_enabled: bool,
    /// Max records per batch operation.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max concurrent in-flight operations.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Per-operation deadline, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Health monitor probe cadence, in milliseconds.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_ms: u64,
    /// Whether the health monitor runs at all.
    #[serde(default = "default_true")]
    pub health_check_enabled: bool,
    /// Memory backend tuning.
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Indexed backend tuning.
    #[serde(default)]
    pub sqlite: SqliteConfig,
    /// Archive backend tuning.
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

fn default_storage_service() -> Service {
    Service::Memory
}

fn default_batch_size() -> usize {
    100
}

fn default_max_concurrency() -> usize {
    16
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_health_check_interval() -> u64 {
    60_000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_storage_service: default_storage_service(),
            fallback_enabled: true,
            replication_enabled: true,
            batch_size: default_batch_size(),
            max_concurrency: default_max_concurrency(),
            timeout_ms: default_timeout_ms(),
            health_check_interval_ms: default_health_check_interval(),
            health_check_enabled: true,
            memory: MemoryConfig::default(),
            sqlite: SqliteConfig::default(),
            filesystem: FilesystemConfig::default(),
        }
    }
}

const LARGE_TIMEOUT_THRESHOLD_MS: u64 = 60_000;
const SMALL_MEMORY_BUDGET_THRESHOLD: u64 = 1024;

/// Loads an [`EngineConfig`] from an optional TOML file path.
///
/// `None` returns [`EngineConfig::default()`]. Environment overrides apply
/// on top in both cases.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, ConfigError> {
    let mut config = match path {
        Some(p) => {
            let content = std::fs::read_to_string(p).map_err(|_| ConfigError::FileNotFound {
                path: p.display().to_string(),
            })?;
            parse_toml(&content)?
        }
        None => EngineConfig::default(),
    };
    apply_env_overrides(&mut config);
    Ok(config)
}

/// Parses a TOML string into an [`EngineConfig`].
pub fn parse_toml(content: &str) -> Result<EngineConfig, ConfigError> {
    toml::from_str::<EngineConfig>(content).map_err(|e| ConfigError::ParseError {
        reason: e.to_string(),
    })
}

/// Applies environment variable overrides.
///
/// Recognised variables: `CTX_DEFAULT_STORAGE_SERVICE`, `CTX_TIMEOUT_MS`,
/// `CTX_HEALTH_CHECK_INTERVAL_MS`, `CTX_SQLITE_DATABASE_PATH`,
/// `CTX_FILESYSTEM_BASE_PATH`.
pub fn apply_env_overrides(config: &mut EngineConfig) {
    if let Ok(val) = std::env::var("CTX_DEFAULT_STORAGE_SERVICE") {
        if let Some(service) = parse_service(&val) {
            config.default_storage_service = service;
        }
    }
    if let Ok(val) = std::env::var("CTX_TIMEOUT_MS") {
        if let Ok(ms) = val.parse() {
            config.timeout_ms = ms;
        }
    }
    if let Ok(val) = std::env::var("CTX_HEALTH_CHECK_INTERVAL_MS") {
        if let Ok(ms) = val.parse() {
            config.health_check_interval_ms = ms;
        }
    }
    if let Ok(val) = std::env::var("CTX_SQLITE_DATABASE_PATH") {
        config.sqlite.database_path = val;
    }
    if let Ok(val) = std::env::var("CTX_FILESYSTEM_BASE_PATH") {
        config.filesystem.base_path = val;
    }
}

fn parse_service(s: &str) -> Option<Service> {
    match s.to_ascii_lowercase().as_str() {
        "memory" => Some(Service::Memory),
        "indexed" => Some(Service::Indexed),
        "archive" => Some(Service::Archive),
        _ => None,
    }
}

/// Validates a parsed configuration, returning advisory warnings.
///
/// Hard errors (zero bounds, out-of-range values) come back as
/// [`ConfigError::ValidationError`]; soft issues come back as warnings.
pub fn validate_config(config: &EngineConfig) -> Result<Vec<ConfigWarning>, ConfigError> {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if config.batch_size == 0 {
        errors.push("batchSize must be greater than zero".to_string());
    }
    if config.max_concurrency == 0 {
        errors.push("maxConcurrency must be greater than zero".to_string());
    }
    if config.timeout_ms == 0 {
        errors.push("timeoutMs must be greater than zero".to_string());
    } else if config.timeout_ms > LARGE_TIMEOUT_THRESHOLD_MS {
        warnings.push(ConfigWarning::LargeTimeout {
            timeout_ms: config.timeout_ms,
        });
    }
    if config.health_check_enabled && config.health_check_interval_ms == 0 {
        errors.push("healthCheckInterval must be greater than zero when healthCheckEnabled".to_string());
    }

    if config.memory.max_size == 0 {
        errors.push("memory.maxSize must be greater than zero".to_string());
    } else if config.memory.max_size < SMALL_MEMORY_BUDGET_THRESHOLD {
        warnings.push(ConfigWarning::SmallMemoryBudget {
            max_size: config.memory.max_size,
        });
    }

    if config.sqlite.database_path.trim().is_empty() {
        errors.push("sqlite.databasePath must not be empty".to_string());
    }
    if config.filesystem.base_path.trim().is_empty() {
        errors.push("filesystem.basePath must not be empty".to_string());
    }
    if config.filesystem.max_file_size == 0 {
        errors.push("filesystem.maxFileSize must be greater than zero".to_string());
    }

    if config.memory.default_ttl.is_none() {
        warnings.push(ConfigWarning::MissingOptionalField {
            field: "memory.defaultTtl".to_string(),
            hint: "records with no explicit ttl will never expire from the memory tier".to_string(),
        });
    }

    if errors.is_empty() {
        Ok(warnings)
    } else {
        Err(ConfigError::ValidationError { reasons: errors })
    }
}

/// Merges two configurations. Values in `overlay` take precedence over
/// `base`; nested sections are merged field-by-field rather than replaced
/// wholesale.
#[must_use]
pub fn merge_configs(base: EngineConfig, overlay: EngineConfig) -> EngineConfig {
    let default = EngineConfig::default();
    EngineConfig {
        default_storage_service: pick(
            overlay.default_storage_service,
            base.default_storage_service,
            default.default_storage_service,
        ),
        fallback_enabled: overlay.fallback_enabled,
        replication_enabled: overlay.replication_enabled,
        batch_size: pick(overlay.batch_size, base.batch_size, default.batch_size),
        max_concurrency: pick(
            overlay.max_concurrency,
            base.max_concurrency,
            default.max_concurrency,
        ),
        timeout_ms: pick(overlay.timeout_ms, base.timeout_ms, default.timeout_ms),
        health_check_interval_ms: pick(
            overlay.health_check_interval_ms,
            base.health_check_interval_ms,
            default.health_check_interval_ms,
        ),
        health_check_enabled: overlay.health_check_enabled,
        memory: MemoryConfig {
            max_size: pick(overlay.memory.max_size, base.memory.max_size, default.memory.max_size),
            eviction_policy: overlay.memory.eviction_policy,
            default_ttl: overlay.memory.default_ttl.or(base.memory.default_ttl),
            compression_enabled: overlay.memory.compression_enabled,
            metrics_enabled: overlay.memory.metrics_enabled,
        },
        sqlite: SqliteConfig {
            database_path: if overlay.sqlite.database_path != default.sqlite.database_path {
                overlay.sqlite.database_path
            } else {
                base.sqlite.database_path
            },
            journal_mode: overlay.sqlite.journal_mode,
            cache_size: pick(overlay.sqlite.cache_size, base.sqlite.cache_size, default.sqlite.cache_size),
            indexing_enabled: overlay.sqlite.indexing_enabled,
            full_text_search_enabled: overlay.sqlite.full_text_search_enabled,
        },
        filesystem: FilesystemConfig {
            base_path: if overlay.filesystem.base_path != default.filesystem.base_path {
                overlay.filesystem.base_path
            } else {
                base.filesystem.base_path
            },
            compression_enabled: overlay.filesystem.compression_enabled,
            default_algorithm: overlay.filesystem.default_algorithm,
            max_file_size: pick(
                overlay.filesystem.max_file_size,
                base.filesystem.max_file_size,
                default.filesystem.max_file_size,
            ),
            archive_enabled: overlay.filesystem.archive_enabled,
        },
    }
}

/// Picks `overlay` unless it's still at its library default, in which case
/// `base` is kept (unless `base` is also still at the default).
fn pick<T: PartialEq>(overlay: T, base: T, default: T) -> T {
    if overlay != default {
        overlay
    } else if base != default {
        base
    } else {
        overlay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid_with_advisory_warnings() {
        let cfg = EngineConfig::default();
        let warnings = validate_config(&cfg).expect("default config should validate");
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::MissingOptionalField { .. })));
    }

    #[test]
    fn default_config_has_sensible_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.default_storage_service, Service::Memory);
        assert!(cfg.fallback_enabled);
        assert!(cfg.replication_enabled);
        assert_eq!(cfg.sqlite.journal_mode, JournalMode::Wal);
    }

    #[test]
    fn parse_valid_toml_string() {
        let toml_str = r#"
            default_storage_service = "Indexed"

            [memory]
            max_size = 1000
        "#;
        let cfg = parse_toml(toml_str).unwrap();
        assert_eq!(cfg.default_storage_service, Service::Indexed);
        assert_eq!(cfg.memory.max_size, 1000);
    }

    #[test]
    fn parse_invalid_toml_gives_parse_error() {
        let bad = "this is [not valid toml =";
        let err = parse_toml(bad).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn empty_string_toml_parses_to_defaults() {
        let cfg = parse_toml("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn validation_catches_zero_batch_size() {
        let cfg = EngineConfig {
            batch_size: 0,
            ..EngineConfig::default()
        };
        let err = validate_config(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError { .. }));
    }

    #[test]
    fn validation_catches_zero_timeout() {
        let cfg = EngineConfig {
            timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn large_timeout_produces_warning() {
        let cfg = EngineConfig {
            timeout_ms: 120_000,
            memory: MemoryConfig {
                default_ttl: Some(60),
                ..MemoryConfig::default()
            },
            ..EngineConfig::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargeTimeout { .. })));
    }

    #[test]
    fn small_memory_budget_produces_warning() {
        let cfg = EngineConfig {
            memory: MemoryConfig {
                max_size: 128,
                default_ttl: Some(60),
                ..MemoryConfig::default()
            },
            ..EngineConfig::default()
        };
        let warnings = validate_config(&cfg).unwrap();
        assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::SmallMemoryBudget { .. })));
    }

    #[test]
    fn merge_overlay_overrides_base() {
        let base = EngineConfig {
            timeout_ms: 1000,
            ..EngineConfig::default()
        };
        let overlay = EngineConfig {
            timeout_ms: 2000,
            ..EngineConfig::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.timeout_ms, 2000);
    }

    #[test]
    fn merge_preserves_base_when_overlay_is_default() {
        let base = EngineConfig {
            timeout_ms: 9000,
            ..EngineConfig::default()
        };
        let merged = merge_configs(base, EngineConfig::default());
        assert_eq!(merged.timeout_ms, 9000);
    }

    #[test]
    fn merge_combines_nested_sqlite_section() {
        let base = EngineConfig {
            sqlite: SqliteConfig {
                database_path: "/base.db".to_string(),
                ..SqliteConfig::default()
            },
            ..EngineConfig::default()
        };
        let overlay = EngineConfig {
            sqlite: SqliteConfig {
                cache_size: 9999,
                ..SqliteConfig::default()
            },
            ..EngineConfig::default()
        };
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.sqlite.database_path, "/base.db");
        assert_eq!(merged.sqlite.cache_size, 9999);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = EngineConfig::default();
        let serialized = toml::to_string(&cfg).unwrap();
        let deserialized: EngineConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(cfg, deserialized);
    }

    #[test]
    fn load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "timeout_ms = 7000").unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.timeout_ms, 7000);
    }

    #[test]
    fn load_missing_file_gives_file_not_found() {
        let err = load_config(Some(Path::new("/nonexistent/engine.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn load_none_returns_default() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn config_warning_display() {
        let w = ConfigWarning::LargeTimeout { timeout_ms: 9999 };
        assert!(w.to_string().contains("9999"));
        let w = ConfigWarning::SmallMemoryBudget { max_size: 10 };
        assert!(w.to_string().contains('1'));
    }
}
