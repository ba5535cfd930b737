//! Configuration module for DavDrive.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.
//!
//! A `Config` value is owned by the driver of one mount and handed to its
//! collaborators; there is no process-wide configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::domain::{DomainError, PathTranslator, ServerDialect};

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for one DavDrive mount.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub repository: RepositoryConfig,
    pub cache: CacheConfig,
    pub transfer: TransferConfig,
    pub fuse: FuseConfig,
    pub logging: LoggingConfig,
}

/// Remote repository connection settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    /// Base URL of the document library, e.g. `https://host/remote.php/webdav/`.
    pub url: String,
    /// Login used for basic authentication.
    pub login: String,
    /// Password used for basic authentication.
    #[serde(skip_serializing)]
    pub password: String,
    /// Server flavour, decides how collections are recognised.
    pub dialect: ServerDialect,
}

/// Metadata cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// When false every lookup and listing goes to the remote repository.
    pub enabled: bool,
    /// Seconds a parsed directory listing stays fresh.
    pub ttl_secs: u64,
    /// Seconds a confirmed-missing path suppresses remote lookups.
    pub missing_ttl_secs: u64,
    /// Enumerate child directories in the background after a listing.
    pub preloading: bool,
    /// File names answered as not-found without asking the server.
    pub ignored_names: Vec<String>,
}

/// When buffered writes are transmitted to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushMode {
    /// Stream every write to the server as it arrives.
    AtWrite,
    /// Buffer writes in memory and upload the file when it is closed.
    #[default]
    AtClose,
}

/// Kernel-side caching hints passed to the filesystem framework.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelCacheMode {
    /// Cache attributes and file content in the kernel.
    #[default]
    DataAndMetadata,
    /// Cache attributes for a short time, never file content.
    MetadataOnly,
    /// No kernel caching at all.
    Disabled,
}

impl KernelCacheMode {
    /// How long the kernel may trust returned attributes and entries.
    pub fn attr_ttl(&self) -> Duration {
        match self {
            KernelCacheMode::DataAndMetadata => Duration::from_secs(60),
            KernelCacheMode::MetadataOnly => Duration::from_secs(1),
            KernelCacheMode::Disabled => Duration::ZERO,
        }
    }

    /// Whether the kernel page cache may be kept across opens.
    pub fn keep_data(&self) -> bool {
        matches!(self, KernelCacheMode::DataAndMetadata)
    }
}

/// Upload, flush and buffering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Flush policy for buffered writes.
    pub flush_mode: FlushMode,
    /// Number of chunks an upload stream buffers before writers wait.
    pub upload_channel_capacity: usize,
    /// Extra attempts for a failed flush before falling back to a local copy.
    pub flush_retries: u32,
    /// Milliseconds between flush attempts.
    pub flush_retry_delay_ms: u64,
    /// Directory for recovery copies of unflushable files (system temp dir if unset).
    pub recovery_dir: Option<PathBuf>,
    /// Largest file size the volume accepts, in bytes.
    pub max_file_size: u64,
    /// Allocation granularity in bytes.
    pub allocation_unit: u64,
}

/// FUSE mount settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    /// Directory the repository is mounted on. `~/` is expanded.
    pub mount_point: String,
    /// Volume label reported to callers.
    pub volume_label: String,
    /// Kernel caching hints.
    pub kernel_cache: KernelCacheMode,
    /// Filesystem name shown in the mount table.
    pub fs_name: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// `text` or `json`.
    pub format: String,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/davdrive/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("davdrive")
            .join("config.yaml")
    }
}

impl RepositoryConfig {
    /// URL path of the document library, without trailing slash.
    pub fn document_library_path(&self) -> Result<String, DomainError> {
        Ok(self.path_translator()?.root().to_string())
    }

    /// Path translator rooted at this repository's document library.
    pub fn path_translator(&self) -> Result<PathTranslator, DomainError> {
        PathTranslator::from_url(&self.url)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn missing_ttl(&self) -> Duration {
        Duration::from_secs(self.missing_ttl_secs)
    }

    /// True if `name` is on the ignore list (case-insensitive).
    pub fn is_ignored(&self, name: &str) -> bool {
        self.ignored_names
            .iter()
            .any(|ignored| ignored.eq_ignore_ascii_case(name))
    }
}

impl TransferConfig {
    pub fn flush_retry_delay(&self) -> Duration {
        Duration::from_millis(self.flush_retry_delay_ms)
    }

    /// Directory for recovery copies, defaulting to the system temp dir.
    pub fn recovery_dir(&self) -> PathBuf {
        self.recovery_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Rounds `size` up to the next allocation unit.
    pub fn round_to_allocation(&self, size: u64) -> u64 {
        let unit = self.allocation_unit.max(1);
        size.div_ceil(unit).saturating_mul(unit)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            url: "https://localhost/webdav/".to_string(),
            login: String::new(),
            password: String::new(),
            dialect: ServerDialect::WebDav,
        }
    }
}

impl std::fmt::Debug for RepositoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryConfig")
            .field("url", &self.url)
            .field("login", &self.login)
            .field("password", &"<redacted>")
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 5,
            missing_ttl_secs: 5,
            preloading: true,
            ignored_names: vec!["desktop.ini".to_string(), "autorun.inf".to_string()],
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::AtClose,
            upload_channel_capacity: 16,
            flush_retries: 0,
            flush_retry_delay_ms: 500,
            recovery_dir: None,
            max_file_size: u32::MAX as u64,
            allocation_unit: 4096,
        }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mount_point: "~/WebDAV".to_string(),
            volume_label: "WebDAV".to_string(),
            kernel_cache: KernelCacheMode::DataAndMetadata,
            fs_name: "davdrive".to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"cache.ttl_secs"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Valid values for `logging.format`.
const VALID_LOG_FORMATS: &[&str] = &["text", "json"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- repository ---
        match url::Url::parse(&self.repository.url) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => errors.push(ValidationError {
                field: "repository.url".into(),
                message: format!("unsupported scheme '{}', expected http or https", url.scheme()),
            }),
            Err(e) => errors.push(ValidationError {
                field: "repository.url".into(),
                message: format!("not a valid URL: {}", e),
            }),
        }

        // --- cache ---
        if self.cache.ttl_secs == 0 {
            errors.push(ValidationError {
                field: "cache.ttl_secs".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.cache.missing_ttl_secs == 0 {
            errors.push(ValidationError {
                field: "cache.missing_ttl_secs".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- transfer ---
        if self.transfer.upload_channel_capacity == 0
            || self.transfer.upload_channel_capacity > 1024
        {
            errors.push(ValidationError {
                field: "transfer.upload_channel_capacity".into(),
                message: "must be in range 1..=1024".into(),
            });
        }
        if !self.transfer.allocation_unit.is_power_of_two() {
            errors.push(ValidationError {
                field: "transfer.allocation_unit".into(),
                message: "must be a power of two".into(),
            });
        }
        if self.transfer.max_file_size == 0 {
            errors.push(ValidationError {
                field: "transfer.max_file_size".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- fuse ---
        if self.fuse.mount_point.trim().is_empty() {
            errors.push(ValidationError {
                field: "fuse.mount_point".into(),
                message: "must not be empty".into(),
            });
        }
        if self.fuse.fs_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "fuse.fs_name".into(),
                message: "must not be empty".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}', expected one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }
        if !VALID_LOG_FORMATS.contains(&self.logging.format.as_str()) {
            errors.push(ValidationError {
                field: "logging.format".into(),
                message: format!(
                    "invalid format '{}', expected one of: {}",
                    self.logging.format,
                    VALID_LOG_FORMATS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use davdrive_core::config::{ConfigBuilder, FlushMode};
///
/// let config = ConfigBuilder::new()
///     .repository_url("https://dav.example.com/remote.php/webdav/")
///     .credentials("alice", "secret")
///     .flush_mode(FlushMode::AtWrite)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- repository ---

    pub fn repository_url(mut self, url: impl Into<String>) -> Self {
        self.config.repository.url = url.into();
        self
    }

    pub fn credentials(mut self, login: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.repository.login = login.into();
        self.config.repository.password = password.into();
        self
    }

    pub fn dialect(mut self, dialect: ServerDialect) -> Self {
        self.config.repository.dialect = dialect;
        self
    }

    // --- cache ---

    pub fn cache_enabled(mut self, enabled: bool) -> Self {
        self.config.cache.enabled = enabled;
        self
    }

    pub fn cache_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.cache.ttl_secs = seconds;
        self
    }

    pub fn missing_ttl_secs(mut self, seconds: u64) -> Self {
        self.config.cache.missing_ttl_secs = seconds;
        self
    }

    pub fn preloading(mut self, preloading: bool) -> Self {
        self.config.cache.preloading = preloading;
        self
    }

    pub fn ignored_names(mut self, names: Vec<String>) -> Self {
        self.config.cache.ignored_names = names;
        self
    }

    // --- transfer ---

    pub fn flush_mode(mut self, mode: FlushMode) -> Self {
        self.config.transfer.flush_mode = mode;
        self
    }

    pub fn upload_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.transfer.upload_channel_capacity = capacity;
        self
    }

    pub fn flush_retries(mut self, retries: u32, delay_ms: u64) -> Self {
        self.config.transfer.flush_retries = retries;
        self.config.transfer.flush_retry_delay_ms = delay_ms;
        self
    }

    pub fn recovery_dir(mut self, dir: PathBuf) -> Self {
        self.config.transfer.recovery_dir = Some(dir);
        self
    }

    pub fn max_file_size(mut self, bytes: u64) -> Self {
        self.config.transfer.max_file_size = bytes;
        self
    }

    // --- fuse ---

    pub fn mount_point(mut self, mount_point: impl Into<String>) -> Self {
        self.config.fuse.mount_point = mount_point.into();
        self
    }

    pub fn volume_label(mut self, label: impl Into<String>) -> Self {
        self.config.fuse.volume_label = label.into();
        self
    }

    pub fn kernel_cache(mut self, mode: KernelCacheMode) -> Self {
        self.config.fuse.kernel_cache = mode;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_format(mut self, format: impl Into<String>) -> Self {
        self.config.logging.format = format.into();
        self
    }

    /// Consume the builder and return the [`Config`] without validation.
    pub fn build(self) -> Config {
        self.config
    }

    /// Consume the builder, validate, and return the [`Config`] or errors.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let errors = self.config.validate();
        if errors.is_empty() {
            Ok(self.config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
