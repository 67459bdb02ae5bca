use std::path::{Path, PathBuf};
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::OpenFlags;
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::retry::RetryPolicy;

lazy_static! {
    static ref SCHEMA_NAME: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex");
}

/// A secondary database file attached under `schema` on every open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub schema: String,
    pub path: String,
}

impl Attachment {
    /// # Errors
    /// Returns `StorageError::Config` if `schema` is not a plain SQL identifier or is one of
    /// the reserved `main` / `temp` names.
    pub fn new(schema: impl Into<String>, path: impl Into<String>) -> Result<Self, StorageError> {
        let attachment = Self {
            schema: schema.into(),
            path: path.into(),
        };
        attachment.validate()?;
        Ok(attachment)
    }

    pub(crate) fn validate(&self) -> Result<(), StorageError> {
        validate_schema_name(&self.schema)?;
        if matches!(self.schema.to_ascii_lowercase().as_str(), "main" | "temp") {
            return Err(StorageError::Config(format!(
                "cannot attach a database under the reserved schema {:?}",
                self.schema
            )));
        }
        if self.path.is_empty() {
            return Err(StorageError::Config(format!(
                "attachment {:?} has an empty path",
                self.schema
            )));
        }
        Ok(())
    }
}

/// A backup step copies `pages` pages; `-1` means all of them. Zero would never finish.
pub(crate) fn validate_page_budget(pages: i32) -> Result<(), StorageError> {
    if pages == 0 || pages < -1 {
        return Err(StorageError::Config(format!(
            "backup pages per step must be -1 or positive, got {pages}"
        )));
    }
    Ok(())
}

/// Schema names are spliced into SQL text, so they must be plain identifiers.
pub(crate) fn validate_schema_name(schema: &str) -> Result<(), StorageError> {
    if SCHEMA_NAME.is_match(schema) {
        Ok(())
    } else {
        Err(StorageError::Config(format!(
            "{schema:?} is not a valid schema name"
        )))
    }
}

/// Default flags: read-write, create, no engine-level mutex (one owner at a time), URI names.
#[must_use]
pub fn default_open_flags() -> OpenFlags {
    OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX
        | OpenFlags::SQLITE_OPEN_URI
}

/// Options for opening a [`crate::Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub path: String,
    pub foreign_keys: bool,
    pub open_flags: OpenFlags,
    /// Sleep between engine busy-callback invocations within one low-level call.
    pub busy_timeout: Duration,
    pub analyze_on_close: bool,
    pub retry: RetryPolicy,
    pub attachments: Vec<Attachment>,
}

impl ConnectionOptions {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        let retry = RetryPolicy::default();
        Self {
            path: path.into(),
            foreign_keys: true,
            open_flags: default_open_flags(),
            busy_timeout: retry.backoff,
            analyze_on_close: false,
            retry,
            attachments: Vec::new(),
        }
    }

    #[must_use]
    pub fn builder(path: impl Into<String>) -> ConnectionOptionsBuilder {
        ConnectionOptionsBuilder::new(path)
    }

    /// # Errors
    /// Returns `StorageError::Config` for an empty path, an invalid retry bound, or an
    /// invalid attachment.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.path.is_empty() {
            return Err(StorageError::Config("database path is empty".into()));
        }
        self.retry.validate()?;
        for attachment in &self.attachments {
            attachment.validate()?;
        }
        Ok(())
    }

    /// Same options pointed at another file, without attachments. Used for backup targets.
    #[must_use]
    pub fn for_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            attachments: Vec::new(),
            analyze_on_close: false,
            ..self.clone()
        }
    }
}

/// Fluent builder for [`ConnectionOptions`].
#[derive(Debug, Clone)]
pub struct ConnectionOptionsBuilder {
    opts: ConnectionOptions,
    busy_timeout_set: bool,
}

impl ConnectionOptionsBuilder {
    #[must_use]
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            opts: ConnectionOptions::new(path),
            busy_timeout_set: false,
        }
    }

    #[must_use]
    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.opts.foreign_keys = enabled;
        self
    }

    #[must_use]
    pub fn open_flags(mut self, flags: OpenFlags) -> Self {
        self.opts.open_flags = flags;
        self
    }

    /// Set the retry policy. Unless [`busy_timeout`](Self::busy_timeout) is also called,
    /// the engine busy callback sleeps for the same duration as the retry backoff.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.opts.retry = policy;
        self
    }

    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.opts.busy_timeout = timeout;
        self.busy_timeout_set = true;
        self
    }

    #[must_use]
    pub fn analyze_on_close(mut self, enabled: bool) -> Self {
        self.opts.analyze_on_close = enabled;
        self
    }

    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.opts.attachments.push(attachment);
        self
    }

    #[must_use]
    pub fn finish(mut self) -> ConnectionOptions {
        if !self.busy_timeout_set {
            self.opts.busy_timeout = self.opts.retry.backoff;
        }
        self.opts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt; `-1` for unbounded.
    pub times: i32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            times: policy.max_retries,
            backoff_ms: u64::try_from(policy.backoff.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.times, Duration::from_millis(self.backoff_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Pages copied per backup step; `-1` copies everything left in one step.
    pub pages_per_step: i32,
    pub main: Option<String>,
    pub secrets: Option<String>,
    /// Skip a backup while the destination file is younger than this.
    pub max_age_secs: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            pages_per_step: -1,
            main: None,
            secrets: None,
            max_age_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_size: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_size: 4 }
    }
}

/// Storage configuration document, usually read from JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    /// Database attached as the `secrets` schema (certificate cache lives there).
    pub secrets_path: Option<String>,
    #[serde(rename = "retry_connection")]
    pub retry: RetryConfig,
    /// Defaults to `retry.backoff_ms` when absent.
    pub busy_timeout_ms: Option<u64>,
    pub foreign_keys: bool,
    pub analyze_on_close: bool,
    pub backup: BackupConfig,
    pub pool: PoolConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            secrets_path: None,
            retry: RetryConfig::default(),
            busy_timeout_ms: None,
            foreign_keys: true,
            analyze_on_close: false,
            backup: BackupConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl StorageConfig {
    pub const SECRETS_SCHEMA: &'static str = "secrets";

    /// # Errors
    /// Returns `StorageError::Config` if the JSON is malformed or fails validation.
    pub fn from_json_str(raw: &str) -> Result<Self, StorageError> {
        let config: StorageConfig = serde_json::from_str(raw)
            .map_err(|e| StorageError::Config(format!("invalid storage configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns `StorageError::Io` if the file cannot be read, or the errors of
    /// [`from_json_str`](Self::from_json_str).
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// # Errors
    /// Returns `StorageError::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<(), StorageError> {
        if self.path.is_empty() {
            return Err(StorageError::Config("storage path is empty".into()));
        }
        if matches!(self.secrets_path.as_deref(), Some("")) {
            return Err(StorageError::Config("secrets path is empty".into()));
        }
        self.retry.policy().validate()?;
        validate_page_budget(self.backup.pages_per_step)?;
        if self.pool.max_size == 0 {
            return Err(StorageError::Config("pool size must be positive".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms.unwrap_or(self.retry.backoff_ms))
    }

    #[must_use]
    pub fn backup_max_age(&self) -> Duration {
        Duration::from_secs(self.backup.max_age_secs)
    }

    /// # Errors
    /// Returns `StorageError::Config` if the secrets attachment is invalid.
    pub fn into_connection_options(&self) -> Result<ConnectionOptions, StorageError> {
        let mut builder = ConnectionOptions::builder(self.path.clone())
            .foreign_keys(self.foreign_keys)
            .retry(self.retry.policy())
            .busy_timeout(self.busy_timeout())
            .analyze_on_close(self.analyze_on_close);
        if let Some(secrets) = &self.secrets_path {
            builder = builder.attach(Attachment::new(Self::SECRETS_SCHEMA, secrets.clone())?);
        }
        Ok(builder.finish())
    }

    /// Backup destinations keyed by source schema, for the ones that are configured.
    #[must_use]
    pub fn backup_targets(&self) -> Vec<(&'static str, PathBuf)> {
        let mut targets = Vec::new();
        if let Some(main) = &self.backup.main {
            targets.push(("main", PathBuf::from(main)));
        }
        if let (Some(secrets), Some(_)) = (&self.backup.secrets, &self.secrets_path) {
            targets.push((Self::SECRETS_SCHEMA, PathBuf::from(secrets)));
        }
        targets
    }
}
