//! Configuration loading and types for Stowry.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct, then `STOWRY_*` environment variables are applied on
//! top.  Each subsection governs a different part of the system: the HTTP
//! listener, the service, metadata persistence, object storage,
//! authentication, logging and CORS.

use std::path::Path;
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::Deserialize;

use crate::keys::KeyPair;
use crate::path::is_valid_table_name;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Object service settings.
    #[serde(default)]
    pub service: ServiceSettings,

    /// Metadata repository settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Object storage backend settings.
    #[serde(default)]
    pub storage: StorageConfig,

    /// Presigned URL settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Logging settings.
    #[serde(default)]
    pub log: LogConfig,

    /// Cross-origin resource sharing.
    #[serde(default)]
    pub cors: CorsConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

// -- Enumerations -------------------------------------------------------------

/// How GET requests resolve paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    /// Plain object store; no fallback.
    #[default]
    Store,
    /// Static site: `dir` falls back to `dir/index.html`.
    Static,
    /// Single-page app: any miss falls back to `index.html`.
    Spa,
}

impl FromStr for ServerMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "store" => Ok(ServerMode::Store),
            "static" => Ok(ServerMode::Static),
            "spa" => Ok(ServerMode::Spa),
            other => bail!("invalid server mode: {other:?} (expected store, static or spa)"),
        }
    }
}

impl std::fmt::Display for ServerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ServerMode::Store => "store",
            ServerMode::Static => "static",
            ServerMode::Spa => "spa",
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    #[default]
    Sqlite,
    Postgres,
    Memory,
}

impl FromStr for DatabaseType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "sqlite" => Ok(DatabaseType::Sqlite),
            "postgres" => Ok(DatabaseType::Postgres),
            "memory" => Ok(DatabaseType::Memory),
            other => bail!("invalid database type: {other:?} (expected sqlite, postgres or memory)"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Filesystem,
    Memory,
}

impl FromStr for StorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "filesystem" => Ok(StorageType::Filesystem),
            "memory" => Ok(StorageType::Memory),
            other => bail!("invalid storage type: {other:?} (expected filesystem or memory)"),
        }
    }
}

/// Whether an operation class requires a presigned URL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Access {
    #[default]
    Public,
    Private,
}

impl FromStr for Access {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "public" => Ok(Access::Public),
            "private" => Ok(Access::Private),
            other => bail!("invalid auth setting: {other:?} (expected public or private)"),
        }
    }
}

// -- Sections -----------------------------------------------------------------

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path resolution mode for reads.
    #[serde(default)]
    pub mode: ServerMode,

    /// Maximum request body size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_upload_size: u64,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            mode: ServerMode::default(),
            max_upload_size: 0,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceSettings {
    /// Budget in seconds for the compensating delete after a failed create.
    #[serde(default = "default_cleanup_timeout")]
    pub cleanup_timeout: i64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            cleanup_timeout: default_cleanup_timeout(),
        }
    }
}

/// Metadata repository configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Backend type: `sqlite`, `postgres` or `memory`.
    #[serde(default, rename = "type")]
    pub db_type: DatabaseType,

    /// SQLite file path or Postgres connection string.
    #[serde(default = "default_dsn")]
    pub dsn: String,

    #[serde(default)]
    pub tables: TablesConfig,

    /// Postgres pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            db_type: DatabaseType::default(),
            dsn: default_dsn(),
            tables: TablesConfig::default(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TablesConfig {
    #[serde(default = "default_meta_data_table")]
    pub meta_data: String,
}

impl Default for TablesConfig {
    fn default() -> Self {
        Self {
            meta_data: default_meta_data_table(),
        }
    }
}

/// Object storage backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Backend type: `filesystem` or `memory`.
    #[serde(default, rename = "type")]
    pub storage_type: StorageType,

    /// Root directory for stored objects.
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::default(),
            path: default_storage_path(),
        }
    }
}

/// Authentication settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// GET / HEAD access.
    #[serde(default)]
    pub read: Access,

    /// PUT / DELETE access.
    #[serde(default)]
    pub write: Access,

    #[serde(default)]
    pub aws: AwsAuthConfig,

    #[serde(default)]
    pub keys: KeysConfig,
}

/// Expected credential scope of SigV4 presigned URLs.
#[derive(Debug, Clone, Deserialize)]
pub struct AwsAuthConfig {
    #[serde(default = "default_region")]
    pub region: String,

    #[serde(default = "default_service")]
    pub service: String,
}

impl Default for AwsAuthConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            service: default_service(),
        }
    }
}

/// Where access keys come from.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    /// Keys listed directly in the config file.
    #[serde(default)]
    pub inline: Vec<KeyPair>,

    /// Optional JSON file with more keys; its entries win over inline ones.
    #[serde(default)]
    pub file: Option<String>,
}

impl KeysConfig {
    fn is_empty(&self) -> bool {
        self.inline.is_empty() && self.file.as_deref().map_or(true, str::is_empty)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// CORS settings.  Disabled by default.
#[derive(Debug, Clone, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_wildcard")]
    pub allowed_origins: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,

    #[serde(default = "default_wildcard")]
    pub allowed_headers: Vec<String>,

    #[serde(default = "default_cors_exposed_headers")]
    pub exposed_headers: Vec<String>,

    #[serde(default)]
    pub allow_credentials: bool,

    /// Preflight cache lifetime in seconds.
    #[serde(default = "default_cors_max_age")]
    pub max_age: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: default_wildcard(),
            allowed_methods: default_cors_methods(),
            allowed_headers: default_wildcard(),
            exposed_headers: default_cors_exposed_headers(),
            allow_credentials: false,
            max_age: default_cors_max_age(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/_stowry/metrics`.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5708
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_cleanup_timeout() -> i64 {
    30
}

fn default_dsn() -> String {
    "stowry.db".to_string()
}

fn default_meta_data_table() -> String {
    "stowry_metadata".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_storage_path() -> String {
    "./data".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_service() -> String {
    "s3".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_wildcard() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "HEAD", "PUT", "DELETE", "OPTIONS"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cors_exposed_headers() -> Vec<String> {
    ["ETag", "Content-Length", "Content-Type", "Last-Modified"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cors_max_age() -> u64 {
    300
}

// -- Overrides & validation ---------------------------------------------------

impl Config {
    /// Apply `STOWRY_*` variables from the process environment.
    pub fn apply_env(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps a variable name such as
    /// `STOWRY_SERVER_PORT` to its value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("STOWRY_SERVER_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("STOWRY_SERVER_PORT") {
            self.server.port = v.parse().context("STOWRY_SERVER_PORT")?;
        }
        if let Some(v) = get("STOWRY_SERVER_MODE") {
            self.server.mode = v.parse()?;
        }
        if let Some(v) = get("STOWRY_SERVER_MAX_UPLOAD_SIZE") {
            self.server.max_upload_size = v.parse().context("STOWRY_SERVER_MAX_UPLOAD_SIZE")?;
        }
        if let Some(v) = get("STOWRY_SERVICE_CLEANUP_TIMEOUT") {
            self.service.cleanup_timeout = v.parse().context("STOWRY_SERVICE_CLEANUP_TIMEOUT")?;
        }
        if let Some(v) = get("STOWRY_DATABASE_TYPE") {
            self.database.db_type = v.parse()?;
        }
        if let Some(v) = get("STOWRY_DATABASE_DSN") {
            self.database.dsn = v;
        }
        if let Some(v) = get("STOWRY_DATABASE_TABLES_META_DATA") {
            self.database.tables.meta_data = v;
        }
        if let Some(v) = get("STOWRY_STORAGE_TYPE") {
            self.storage.storage_type = v.parse()?;
        }
        if let Some(v) = get("STOWRY_STORAGE_PATH") {
            self.storage.path = v;
        }
        if let Some(v) = get("STOWRY_AUTH_READ") {
            self.auth.read = v.parse()?;
        }
        if let Some(v) = get("STOWRY_AUTH_WRITE") {
            self.auth.write = v.parse()?;
        }
        if let Some(v) = get("STOWRY_AUTH_KEYS_FILE") {
            self.auth.keys.file = Some(v);
        }
        if let Some(v) = get("STOWRY_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("STOWRY_LOG_FORMAT") {
            self.log.format = v;
        }
        Ok(())
    }

    /// Reject settings that would only fail later, at first use.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !is_valid_table_name(&self.database.tables.meta_data) {
            bail!(
                "invalid table name {:?}: must match ^[a-z_][a-z0-9_]*$ (max 63 chars)",
                self.database.tables.meta_data
            );
        }
        if self.database.db_type != DatabaseType::Memory && self.database.dsn.is_empty() {
            bail!("database.dsn is required");
        }
        if self.storage.storage_type == StorageType::Filesystem && self.storage.path.is_empty() {
            bail!("storage.path is required");
        }
        let private = self.auth.read == Access::Private || self.auth.write == Access::Private;
        if private && self.auth.keys.is_empty() {
            bail!("auth is private but no keys are configured (auth.keys.inline or auth.keys.file)");
        }
        if !matches!(self.log.format.as_str(), "text" | "json") {
            bail!("invalid log format: {:?} (expected text or json)", self.log.format);
        }
        Ok(())
    }
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
///
/// When `must_exist` is false a missing file yields the defaults.
pub fn load_config<P: AsRef<Path>>(path: P, must_exist: bool) -> anyhow::Result<Config> {
    let path = path.as_ref();
    if !must_exist && !path.exists() {
        return Ok(Config::default());
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("read config {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("parse config {}", path.display()))?;
    Ok(config)
}

// ── Tests ───────────────────────────────────────────────────────────
