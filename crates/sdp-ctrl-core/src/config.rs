//! Configuration for the SDP control client.
//!
//! The client's own configuration is a TOML file. Resolution order:
//! 1. Built-in defaults
//! 2. The configuration file
//! 3. Environment variables
//! 4. CLI arguments (applied by the binary, highest priority)
//!
//! The paths the configuration was loaded from are kept alongside it, since an
//! in-place restart re-reads exactly those files.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Upper bound on inbound messages drained per loop tick.
pub const MAX_MESSAGE_QUEUE_LEN: usize = 100;

/// Upper bound on the pause between sending SPA and connecting.
pub const MAX_POST_SPA_DELAY: Duration = Duration::from_secs(10);

/// Files a client configuration is loaded from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigPaths {
    /// The client's own TOML configuration file.
    pub config_file: PathBuf,
    /// The paired SPA helper configuration (`.fwknoprc` dialect). When `None`,
    /// the `spa.fwknoprc_file` entry of the config file is used.
    pub fwknoprc_file: Option<PathBuf>,
    /// Command-line settings that outrank both the file and the environment.
    pub overrides: CliOverrides,
}

impl ConfigPaths {
    pub fn new(config_file: impl Into<PathBuf>, fwknoprc_file: Option<PathBuf>) -> Self {
        Self {
            config_file: config_file.into(),
            fwknoprc_file,
            overrides: CliOverrides::default(),
        }
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: CliOverrides) -> Self {
        self.overrides = overrides;
        self
    }
}

/// Settings given on the command line. They are reapplied on every reload so
/// an in-place restart keeps them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CliOverrides {
    /// `--foreground`; only ever forces foreground mode on.
    pub foreground: bool,
    /// `--log-level`.
    pub log_level: Option<String>,
}

/// Complete client configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub client: DaemonConfig,
    pub tls: TlsConfig,
    pub spa: SpaConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub log: LogConfig,
    /// Resolved source files; filled in by [`ClientConfig::load`].
    #[serde(skip)]
    pub config_file: PathBuf,
    #[serde(skip)]
    pub overrides: CliOverrides,
}

/// Where the controller lives and how to reach it.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub use_spa: bool,
    #[serde(default = "default_stanza")]
    pub spa_stanza: String,
}

/// Process behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Stay connected after the first credential update.
    pub remain_connected: bool,
    /// Run attached to the terminal instead of daemonizing.
    pub foreground: bool,
    pub pid_file: PathBuf,
    /// Max inbound messages handled per loop tick.
    pub message_queue_len: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            remain_connected: false,
            foreground: true,
            pid_file: PathBuf::from("/var/run/sdp_ctrl_client.pid"),
            message_queue_len: 10,
        }
    }
}

/// Client TLS material.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    /// Trust anchors for the controller's certificate.
    pub ca_file: PathBuf,
}

/// SPA keys and the helper that sends SPA packets.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpaConfig {
    #[serde(default)]
    pub fwknoprc_file: PathBuf,
    pub encryption_key: String,
    pub hmac_key: String,
    #[serde(default = "default_helper")]
    pub helper: PathBuf,
    #[serde(default = "default_post_spa_delay_ms")]
    pub post_spa_delay_ms: u64,
}

impl std::fmt::Debug for SpaConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaConfig")
            .field("fwknoprc_file", &self.fwknoprc_file)
            .field("encryption_key", &"<redacted>")
            .field("hmac_key", &"<redacted>")
            .field("helper", &self.helper)
            .field("post_spa_delay_ms", &self.post_spa_delay_ms)
            .finish()
    }
}

/// Intervals and retry limits, all in whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingConfig {
    pub cred_update_interval_secs: u64,
    pub access_update_interval_secs: u64,
    pub keep_alive_interval_secs: u64,
    pub max_conn_attempts: u32,
    pub initial_conn_retry_interval_secs: u64,
    pub max_req_attempts: u32,
    pub initial_req_retry_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            cred_update_interval_secs: 7200,
            access_update_interval_secs: 86400,
            keep_alive_interval_secs: 60,
            max_conn_attempts: 3,
            initial_conn_retry_interval_secs: 5,
            max_req_attempts: 3,
            initial_req_retry_interval_secs: 10,
            read_timeout_secs: 1,
            write_timeout_secs: 1,
        }
    }
}

impl TimingConfig {
    pub const fn cred_update_interval(&self) -> Duration {
        Duration::from_secs(self.cred_update_interval_secs)
    }

    pub const fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub const fn initial_conn_retry_interval(&self) -> Duration {
        Duration::from_secs(self.initial_conn_retry_interval_secs)
    }

    pub const fn initial_req_retry_interval(&self) -> Duration {
        Duration::from_secs(self.initial_req_retry_interval_secs)
    }

    pub const fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub const fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

/// Logging output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}

fn default_stanza() -> String {
    "default".to_string()
}

fn default_helper() -> PathBuf {
    PathBuf::from("fwknop")
}

const fn default_post_spa_delay_ms() -> u64 {
    500
}

impl ClientConfig {
    /// Load, override from the environment, and validate.
    pub fn load(paths: &ConfigPaths) -> Result<Self> {
        let content = std::fs::read_to_string(&paths.config_file).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file {}: {}",
                paths.config_file.display(),
                e
            ))
        })?;
        let mut config = Self::from_toml(&content, paths)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.apply_cli_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse a configuration from TOML text without touching the environment.
    pub fn from_toml(content: &str, paths: &ConfigPaths) -> Result<Self> {
        let mut config: Self = toml::from_str(content).map_err(|e| {
            Error::Config(format!(
                "Failed to parse config file {}: {}",
                paths.config_file.display(),
                e
            ))
        })?;
        config.config_file.clone_from(&paths.config_file);
        config.overrides.clone_from(&paths.overrides);
        if let Some(rc) = &paths.fwknoprc_file {
            config.spa.fwknoprc_file.clone_from(rc);
        }
        Ok(config)
    }

    /// The paths a restart must reload from.
    pub fn paths(&self) -> ConfigPaths {
        ConfigPaths::new(
            self.config_file.clone(),
            Some(self.spa.fwknoprc_file.clone()),
        )
        .with_overrides(self.overrides.clone())
    }

    pub fn apply_cli_overrides(&mut self) {
        if self.overrides.foreground {
            self.client.foreground = true;
        }
        if let Some(level) = &self.overrides.log_level {
            self.log.level.clone_from(level);
        }
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("SDP_CTRL_LOG_LEVEL") {
            self.log.level = val;
        }
        if let Some(val) = lookup("SDP_CTRL_FOREGROUND").as_deref().and_then(parse_flag) {
            self.client.foreground = val;
        }
        if let Some(val) = lookup("SDP_CTRL_REMAIN_CONNECTED")
            .as_deref()
            .and_then(parse_flag)
        {
            self.client.remain_connected = val;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.controller.address.trim().is_empty() {
            return Err(Error::Config("controller.address must not be empty".into()));
        }
        if self.controller.port == 0 {
            return Err(Error::Config("controller.port must not be 0".into()));
        }
        if self.spa.fwknoprc_file.as_os_str().is_empty() {
            return Err(Error::Config(
                "spa.fwknoprc_file is required (or pass --fwknoprc)".into(),
            ));
        }
        if self.spa.encryption_key.is_empty() || self.spa.hmac_key.is_empty() {
            return Err(Error::Config("spa keys must not be empty".into()));
        }
        let q = self.client.message_queue_len;
        if !(1..=MAX_MESSAGE_QUEUE_LEN).contains(&q) {
            return Err(Error::Config(format!(
                "client.message_queue_len must be within 1..={MAX_MESSAGE_QUEUE_LEN}, got {q}"
            )));
        }
        if self.post_spa_delay() > MAX_POST_SPA_DELAY {
            return Err(Error::Config(format!(
                "spa.post_spa_delay_ms must not exceed {} ms",
                MAX_POST_SPA_DELAY.as_millis()
            )));
        }
        let t = &self.timing;
        for (name, value) in [
            ("timing.keep_alive_interval_secs", t.keep_alive_interval_secs),
            (
                "timing.initial_req_retry_interval_secs",
                t.initial_req_retry_interval_secs,
            ),
            (
                "timing.initial_conn_retry_interval_secs",
                t.initial_conn_retry_interval_secs,
            ),
            ("timing.read_timeout_secs", t.read_timeout_secs),
            ("timing.write_timeout_secs", t.write_timeout_secs),
        ] {
            if value == 0 {
                return Err(Error::Config(format!("{name} must be greater than 0")));
            }
        }
        if t.max_req_attempts == 0 || t.max_conn_attempts == 0 {
            return Err(Error::Config(
                "timing.max_req_attempts and timing.max_conn_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub const fn post_spa_delay(&self) -> Duration {
        Duration::from_millis(self.spa.post_spa_delay_ms)
    }

    pub fn fwknoprc_file(&self) -> &Path {
        &self.spa.fwknoprc_file
    }

    /// Human-readable dump of the static settings, keys excluded.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let yes_no = |b: bool| if b { "Yes" } else { "No" };
        let _ = writeln!(out, "{:>40}: {}", "Configuration File", self.config_file.display());
        let _ = writeln!(out, "{:>40}: {}", "Controller port", self.controller.port);
        let _ = writeln!(out, "{:>40}: {}", "Controller address", self.controller.address);
        let _ = writeln!(out, "{:>40}: {}", "Use SPA", yes_no(self.controller.use_spa));
        let _ = writeln!(out, "{:>40}: {}", "SPA stanza", self.controller.spa_stanza);
        let _ = writeln!(
            out,
            "{:>40}: {}",
            "Remain connected after update",
            yes_no(self.client.remain_connected)
        );
        let _ = writeln!(out, "{:>40}: {}", "Run in foreground", yes_no(self.client.foreground));
        let _ = writeln!(
            out,
            "{:>40}: {} seconds",
            "Credential update interval", self.timing.cred_update_interval_secs
        );
        let _ = writeln!(
            out,
            "{:>40}: {} seconds",
            "Access update interval", self.timing.access_update_interval_secs
        );
        let _ = writeln!(
            out,
            "{:>40}: {} seconds",
            "Keep alive interval", self.timing.keep_alive_interval_secs
        );
        let _ = writeln!(
            out,
            "{:>40}: {}",
            "Max connection attempts", self.timing.max_conn_attempts
        );
        let _ = writeln!(
            out,
            "{:>40}: {} seconds",
            "Initial connection retry interval", self.timing.initial_conn_retry_interval_secs
        );
        let _ = writeln!(out, "{:>40}: {}", "Max request attempts", self.timing.max_req_attempts);
        let _ = writeln!(
            out,
            "{:>40}: {} seconds",
            "Initial request retry interval", self.timing.initial_req_retry_interval_secs
        );
        let _ = writeln!(out, "{:>40}: {}", "PID file", self.client.pid_file.display());
        let _ = writeln!(out, "{:>40}: {}", "fwknoprc file", self.spa.fwknoprc_file.display());
        let _ = writeln!(out, "{:>40}: {}", "TLS key file", self.tls.key_file.display());
        let _ = writeln!(out, "{:>40}: {}", "TLS cert file", self.tls.cert_file.display());
        let _ = writeln!(out, "{:>40}: {}", "TLS CA file", self.tls.ca_file.display());
        out
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" => Some(true),
        "0" | "false" | "no" | "n" => Some(false),
        _ => None,
    }
}
