//! Runtime configuration: command-line flags, an optional TOML file and
//! Go-style duration parsing

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How the idle window is measured
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum IdlePolicy {
    /// The deadline is fixed once when the controller starts; activity does
    /// not push it back
    #[default]
    Fixed,
    /// Every activity event re-arms the deadline
    Sliding,
}

/// Command-line interface
#[derive(Debug, Parser, Default)]
#[command(
    name = "unitgate",
    version,
    about = "Socket-activated proxy that starts a unit on demand and stops it when idle"
)]
pub struct Cli {
    /// TOML file with defaults; flags given on the command line win
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Backend network type (tcp, tcp4, tcp6 or unix)
    #[arg(short = 'm', long)]
    pub mode: Option<String>,

    /// Unit to start on first connection and stop when idle
    #[arg(short = 'u', long)]
    pub unit: Option<String>,

    /// Backend address to relay connections to
    #[arg(short = 'a', long)]
    pub address: Option<String>,

    /// Inactivity window before the unit is stopped again (0 disables)
    #[arg(short = 't', long, value_parser = parse_duration)]
    pub idle_timeout: Option<Duration>,

    /// Whether activity re-arms the idle deadline
    #[arg(long, value_enum)]
    pub idle_policy: Option<IdlePolicy>,

    /// Number of backend connection attempts before giving up
    #[arg(short = 'r', long)]
    pub retries: Option<u32>,

    /// Delay between backend connection attempts
    #[arg(long, value_parser = parse_duration)]
    pub retry_delay: Option<Duration>,

    /// Talk to the per-user service manager instead of the system one
    #[arg(long, alias = "user-scope")]
    pub user: bool,
}

/// Keys accepted in the optional configuration file
#[derive(Debug, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    mode: Option<String>,
    unit: Option<String>,
    address: Option<String>,
    #[serde(deserialize_with = "deserialize_opt_duration")]
    idle_timeout: Option<Duration>,
    idle_policy: Option<IdlePolicy>,
    retries: Option<u32>,
    #[serde(deserialize_with = "deserialize_opt_duration")]
    retry_delay: Option<Duration>,
    user: Option<bool>,
}

/// Immutable runtime configuration, built once at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Backend dial network type
    pub mode: String,
    /// Supervised unit name
    pub unit: String,
    /// Backend dial address
    pub address: String,
    /// Zero disables idle shutdown
    pub idle_timeout: Duration,
    pub idle_policy: IdlePolicy,
    /// Maximum dial attempts per inbound connection
    pub retries: u32,
    /// Fixed pause between failed dial attempts
    pub retry_delay: Duration,
    /// Use the session bus rather than the system bus
    pub user: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            unit: default_unit(),
            address: default_address(),
            idle_timeout: Duration::ZERO,
            idle_policy: IdlePolicy::default(),
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            user: false,
        }
    }
}

// Default value functions
fn default_mode() -> String {
    "tcp".to_string()
}

fn default_unit() -> String {
    "null.service".to_string()
}

fn default_address() -> String {
    "127.0.0.1:80".to_string()
}

fn default_retries() -> u32 {
    10
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(100)
}

/// Backend network types understood by the dialer
pub const SUPPORTED_MODES: &[&str] = &["tcp", "tcp4", "tcp6", "unix"];

/// Longest unit name systemd accepts
const MAX_UNIT_NAME_LEN: usize = 256;

impl Config {
    /// Build the configuration from parsed flags, reading the file named by
    /// `--config` first when present.
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let file = match cli.config.as_deref() {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        let config = Self::merge(file, cli);
        config.validate()?;
        Ok(config)
    }

    fn merge(file: FileConfig, cli: Cli) -> Self {
        let defaults = Config::default();
        Self {
            mode: cli.mode.or(file.mode).unwrap_or(defaults.mode),
            unit: cli.unit.or(file.unit).unwrap_or(defaults.unit),
            address: cli.address.or(file.address).unwrap_or(defaults.address),
            idle_timeout: cli
                .idle_timeout
                .or(file.idle_timeout)
                .unwrap_or(defaults.idle_timeout),
            idle_policy: cli
                .idle_policy
                .or(file.idle_policy)
                .unwrap_or(defaults.idle_policy),
            retries: cli.retries.or(file.retries).unwrap_or(defaults.retries),
            retry_delay: cli
                .retry_delay
                .or(file.retry_delay)
                .unwrap_or(defaults.retry_delay),
            user: cli.user || file.user.unwrap_or(defaults.user),
        }
    }

    /// The idle window, or `None` when idle shutdown is disabled
    pub fn idle_window(&self) -> Option<Duration> {
        if self.idle_timeout.is_zero() {
            None
        } else {
            Some(self.idle_timeout)
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if !SUPPORTED_MODES.contains(&self.mode.as_str()) {
            errors.push(format!(
                "mode '{}' is not one of {}",
                self.mode,
                SUPPORTED_MODES.join(", ")
            ));
        }

        if let Err(e) = validate_unit_name(&self.unit) {
            errors.push(e);
        }

        if self.address.trim().is_empty() {
            errors.push("address must not be empty".to_string());
        }

        if self.retries == 0 {
            errors.push("retries must be at least 1".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

impl FileConfig {
    fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        let file: FileConfig = toml::from_str(&content)?;
        Ok(file)
    }
}

fn validate_unit_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("unit name must not be empty".to_string());
    }
    if name.len() > MAX_UNIT_NAME_LEN {
        return Err(format!(
            "unit name too long (max {} chars)",
            MAX_UNIT_NAME_LEN
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "@._:-\\".contains(c))
    {
        return Err(format!("unit name '{}' contains invalid characters", name));
    }
    Ok(())
}

/// Parse a duration such as `250ms`, `30s`, `5m` or `1h30m`.
///
/// A bare integer is taken as seconds; `0` disables.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{}'", input))?;
        if digits == 0 {
            return Err(format!("invalid duration '{}'", input));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", input))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            other => {
                return Err(format!("unknown unit '{}' in duration '{}'", other, input));
            }
        };
        rest = &rest[unit_len..];
        total = Duration::try_from_secs_f64(value * scale)
            .ok()
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| format!("duration out of range '{}'", input))?;
    }

    Ok(total)
}

fn deserialize_opt_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Secs(secs)) => Ok(Some(Duration::from_secs(secs))),
        Some(Raw::Text(text)) => parse_duration(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}
