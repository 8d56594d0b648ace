//! Configuration management for the netprobe-rs CLI.
//!
//! This module provides configuration parsing from TOML files, command-line
//! arguments, and environment variables. Configuration is applied in order:
//! defaults → config file → command-line arguments, with later sources
//! overriding earlier ones.
//!
//! # Configuration Flow
//!
//! ```text
//!     ┌─────────────────┐
//!     │ Config::default │ ◄── Start with sensible defaults
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Config file     │ ◄───│ netprobe.conf   │  (TOML format)
//!     │ exists?         │     │ or --config     │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐     ┌─────────────────┐
//!     │ Apply CLI args  │ ◄───│ --proxy,        │
//!     │ (override)      │     │ --state-dir, …  │
//!     └────────┬────────┘     └─────────────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Validate        │
//!     └────────┬────────┘
//!              │
//!              ▼
//!     ┌─────────────────┐
//!     │ Final Config    │ ◄── Ready to use
//!     └─────────────────┘
//! ```
//!
//! # Configuration Sources
//!
//! | Source | Priority | Description |
//! |--------|----------|-------------|
//! | Defaults | Lowest | Built-in sensible defaults |
//! | Config File | Medium | TOML file (`--config` or `NETPROBE_CONFIG`) |
//! | Environment | High | `NETPROBE_STATE_DIR`, `NETPROBE_CONFIG` |
//! | CLI Arguments | Highest | Command-line flags override all |
//!
//! # Example Configuration File
//!
//! ```toml
//! # Directories
//! state_dir = "netprobe/state"
//! tunnel_dir = "netprobe/tunnel"
//! # temp_dir defaults to the system temp directory
//!
//! # Egress: absent for direct, or one of
//! # proxy = "socks5://127.0.0.1:9050/"
//! # proxy = "tor://"
//! # proxy = "tor+snowflake://"
//! # proxy = "psiphon://"
//! # snowflake_rendezvous = "domain_fronting"  # or "amp"
//! # tor_binary = "/usr/bin/tor"
//! # tor_args = ["--MaxCircuitDirtiness", "60"]
//!
//! # Backend
//! # backend_url = "https://api.example.org/"  # skip candidate discovery
//!
//! # Measurement
//! test_name = "web_connectivity"
//! # inputs = ["https://example.com/"]  # empty: take from check-in
//! category_codes = []
//! charging = true
//! on_wifi = true
//! no_submit = false
//!
//! # Logging
//! loglevel = "info"  # debug, info, warn, error
//! # logfile = "netprobe.log"
//! ```
//!
//! # What This Module Does NOT Do
//!
//! - **Runtime reconfiguration**: Config is loaded once at startup
//! - **Config file watching**: Changes require restart
//!
//! # See Also
//!
//! - [`CliArgs`] for command-line argument parsing
//! - [`load_config`] for the loading entry point
//! - [`crate::bootstrap::BootstrapRequest`] - What the session is
//!   ultimately asked to do with these settings

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};
use crate::logger::LogLevel;

/// Configuration for the netprobe-rs CLI.
///
/// # Fields
///
/// | Field | Default | Description |
/// |-------|---------|-------------|
/// | `state_dir` | `netprobe/state` | Persistent session state |
/// | `temp_dir` | system temp dir | Root for per-session temp dirs |
/// | `tunnel_dir` | `netprobe/tunnel` | Persistent tunnel state |
/// | `proxy` | none | Egress selector URL |
/// | `backend_url` | none | Forced backend (skips discovery) |
/// | `tor_binary` | none | Tor binary path (`tor` from PATH) |
/// | `tor_args` | `[]` | Extra tor arguments |
/// | `snowflake_rendezvous` | none | `domain_fronting` or `amp` |
/// | `test_name` | `web_connectivity` | Experiment to run |
/// | `inputs` | `[]` | Explicit inputs (empty: from check-in) |
/// | `category_codes` | `[]` | Check-in URL categories |
/// | `charging` | `true` | Declared to check-in |
/// | `on_wifi` | `true` | Declared to check-in |
/// | `no_submit` | `false` | Measure without submitting |
/// | `loglevel` | `info` | Log verbosity |
/// | `logfile` | none | Log destination (stdout otherwise) |
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Directory for persistent session state.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Root under which sessions create their temp working dirs.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Directory where tunnels keep persistent state.
    #[serde(default = "default_tunnel_dir")]
    pub tunnel_dir: PathBuf,
    /// Egress selector URL. Absent means direct egress.
    #[serde(default)]
    pub proxy: Option<String>,
    /// Forces a specific backend instead of the default candidates.
    #[serde(default)]
    pub backend_url: Option<String>,
    /// Path of the tor binary, when not simply `tor` on PATH.
    #[serde(default)]
    pub tor_binary: Option<PathBuf>,
    /// Extra arguments for the tor binary.
    #[serde(default)]
    pub tor_args: Vec<String>,
    /// Snowflake rendezvous method.
    #[serde(default)]
    pub snowflake_rendezvous: Option<String>,
    /// Name of the experiment to run.
    #[serde(default = "default_test_name")]
    pub test_name: String,
    /// Explicit inputs to measure. Empty means take the check-in
    /// assignment.
    #[serde(default)]
    pub inputs: Vec<String>,
    /// Category codes declared to the check-in API.
    #[serde(default)]
    pub category_codes: Vec<String>,
    /// Whether the device is charging, declared to check-in.
    #[serde(default = "default_true")]
    pub charging: bool,
    /// Whether the device is on wifi, declared to check-in.
    #[serde(default = "default_true")]
    pub on_wifi: bool,
    /// Run measurements without submitting them.
    #[serde(default)]
    pub no_submit: bool,
    /// Log level for output.
    #[serde(default)]
    pub loglevel: LogLevel,
    /// Log file path. None for stdout.
    #[serde(default)]
    pub logfile: Option<PathBuf>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("netprobe").join("state")
}
fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}
fn default_tunnel_dir() -> PathBuf {
    PathBuf::from("netprobe").join("tunnel")
}
fn default_test_name() -> String {
    "web_connectivity".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            temp_dir: default_temp_dir(),
            tunnel_dir: default_tunnel_dir(),
            proxy: None,
            backend_url: None,
            tor_binary: None,
            tor_args: Vec::new(),
            snowflake_rendezvous: None,
            test_name: default_test_name(),
            inputs: Vec::new(),
            category_codes: Vec::new(),
            charging: default_true(),
            on_wifi: default_true(),
            no_submit: false,
            loglevel: LogLevel::default(),
            logfile: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be read.
    /// Returns [`Error::Config`] if the TOML is invalid.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| Error::Config(e.to_string()))
    }

    /// Serialize configuration to TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if serialization fails.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if validation fails.
    pub fn validate(&self) -> Result<()> {
        if self.test_name.is_empty() {
            return Err(Error::Config("test_name must not be empty".to_string()));
        }
        if let Some(proxy) = &self.proxy {
            Url::parse(proxy)
                .map_err(|e| Error::Config(format!("invalid proxy URL {}: {}", proxy, e)))?;
        }
        if let Some(backend_url) = &self.backend_url {
            Url::parse(backend_url).map_err(|e| {
                Error::Config(format!("invalid backend URL {}: {}", backend_url, e))
            })?;
        }
        if let Some(method) = &self.snowflake_rendezvous {
            if method != "domain_fronting" && method != "amp" {
                return Err(Error::Config(format!(
                    "invalid snowflake rendezvous method: {}",
                    method
                )));
            }
        }
        Ok(())
    }
}

/// Command-line arguments for netprobe-rs.
///
/// Arguments override configuration file values, allowing runtime
/// customization without modifying config files.
#[derive(Debug, Parser)]
#[command(name = "netprobe-rs")]
#[command(about = "Network-censorship measurement probe")]
#[command(version)]
#[command(
    long_about = "netprobe-rs runs network-censorship measurements: it acquires an egress \
    path (direct, SOCKS5, Tor, or Psiphon), geolocates the probe, discovers a usable backend, \
    fetches a work assignment, runs measurements, and submits the results."
)]
pub struct CliArgs {
    /// Path to configuration file.
    ///
    /// TOML configuration file containing all settings. Command-line
    /// arguments override values from this file.
    #[arg(long = "config", env = "NETPROBE_CONFIG", default_value = "netprobe.conf")]
    pub config_file: PathBuf,

    /// Write default config to file and exit.
    #[arg(long = "generate_config")]
    pub generate_config: Option<PathBuf>,

    /// Directory for persistent session state.
    #[arg(long = "state-dir", env = "NETPROBE_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Directory where tunnels keep persistent state.
    #[arg(long = "tunnel-dir")]
    pub tunnel_dir: Option<PathBuf>,

    /// Egress selector URL.
    ///
    /// One of socks5://..., tor://, tor+snowflake://, psiphon://.
    /// Omit for direct egress.
    #[arg(long)]
    pub proxy: Option<String>,

    /// Force a specific backend URL, skipping candidate discovery.
    #[arg(long = "backend-url")]
    pub backend_url: Option<String>,

    /// Path of the tor binary.
    #[arg(long = "tor-binary")]
    pub tor_binary: Option<PathBuf>,

    /// Extra argument for the tor binary; repeatable.
    #[arg(long = "tor-arg")]
    pub tor_args: Vec<String>,

    /// Snowflake rendezvous method (domain_fronting or amp).
    #[arg(long = "snowflake-rendezvous")]
    pub snowflake_rendezvous: Option<String>,

    /// Name of the experiment to run.
    #[arg(long = "test")]
    pub test_name: Option<String>,

    /// Input to measure; repeatable. Without inputs the check-in
    /// assignment is measured.
    #[arg(long = "input", short = 'i')]
    pub inputs: Vec<String>,

    /// Category code for check-in URL selection; repeatable.
    #[arg(long = "category-code")]
    pub category_codes: Vec<String>,

    /// Run measurements without submitting them.
    #[arg(long = "no-submit", short = 'n')]
    pub no_submit: bool,

    /// Log verbosity (DEBUG, INFO, WARN, ERROR).
    #[arg(long)]
    pub loglevel: Option<String>,

    /// Log to file instead of stdout.
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Shorthand for --loglevel DEBUG; also makes the session verbose.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}

impl CliArgs {
    /// Apply CLI arguments to a configuration, overriding values.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(ref state_dir) = self.state_dir {
            config.state_dir = state_dir.clone();
        }
        if let Some(ref tunnel_dir) = self.tunnel_dir {
            config.tunnel_dir = tunnel_dir.clone();
        }
        if let Some(ref proxy) = self.proxy {
            config.proxy = Some(proxy.clone());
        }
        if let Some(ref backend_url) = self.backend_url {
            config.backend_url = Some(backend_url.clone());
        }
        if let Some(ref tor_binary) = self.tor_binary {
            config.tor_binary = Some(tor_binary.clone());
        }
        if !self.tor_args.is_empty() {
            config.tor_args = self.tor_args.clone();
        }
        if let Some(ref method) = self.snowflake_rendezvous {
            config.snowflake_rendezvous = Some(method.clone());
        }
        if let Some(ref test_name) = self.test_name {
            config.test_name = test_name.clone();
        }
        if !self.inputs.is_empty() {
            config.inputs = self.inputs.clone();
        }
        if !self.category_codes.is_empty() {
            config.category_codes = self.category_codes.clone();
        }
        if self.no_submit {
            config.no_submit = true;
        }
        if let Some(ref loglevel) = self.loglevel {
            if let Ok(level) = loglevel.parse() {
                config.loglevel = level;
            }
        }
        if let Some(ref logfile) = self.logfile {
            config.logfile = Some(logfile.clone());
        }
        if self.verbose {
            config.loglevel = LogLevel::Debug;
        }
    }
}

/// Load configuration from file and CLI arguments.
///
/// This function implements the configuration loading order:
/// 1. Start with defaults
/// 2. Apply config file if it exists
/// 3. Apply CLI arguments (override)
///
/// # Errors
///
/// Returns [`Error::Config`] if configuration is invalid.
pub fn load_config(args: &CliArgs) -> Result<Config> {
    let mut config = Config::default();

    if args.config_file.exists() {
        config = Config::from_file(&args.config_file)?;
    }

    args.apply_to(&mut config);
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noargs() -> CliArgs {
        CliArgs::parse_from(["netprobe-rs"])
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.test_name, "web_connectivity");
        assert!(config.proxy.is_none());
        assert!(config.charging);
        assert!(config.on_wifi);
        assert!(!config.no_submit);
        assert_eq!(config.loglevel, LogLevel::Info);
        config.validate().unwrap();
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.proxy = Some("tor://".to_string());
        config.inputs = vec!["https://example.com/".to_string()];
        let toml = config.to_toml().unwrap();
        let back: Config = toml::from_str(&toml).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str("proxy = \"psiphon://\"\n").unwrap();
        assert_eq!(config.proxy.as_deref(), Some("psiphon://"));
        assert_eq!(config.test_name, "web_connectivity");
        assert_eq!(config.state_dir, default_state_dir());
    }

    #[test]
    fn test_validate_rejects_bad_proxy() {
        let mut config = Config::default();
        config.proxy = Some("not a url".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_rendezvous() {
        let mut config = Config::default();
        config.snowflake_rendezvous = Some("bogus".to_string());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_test_name() {
        let mut config = Config::default();
        config.test_name = String::new();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_cli_args_override_config() {
        let args = CliArgs::parse_from([
            "netprobe-rs",
            "--proxy",
            "tor://",
            "--test",
            "example",
            "--input",
            "https://one.example.org/",
            "--input",
            "https://two.example.org/",
            "--no-submit",
            "--loglevel",
            "ERROR",
        ]);
        let mut config = Config::default();
        args.apply_to(&mut config);
        assert_eq!(config.proxy.as_deref(), Some("tor://"));
        assert_eq!(config.test_name, "example");
        assert_eq!(config.inputs.len(), 2);
        assert!(config.no_submit);
        assert_eq!(config.loglevel, LogLevel::Error);
    }

    #[test]
    fn test_verbose_wins_over_loglevel() {
        let args = CliArgs::parse_from(["netprobe-rs", "--loglevel", "ERROR", "-v"]);
        let mut config = Config::default();
        args.apply_to(&mut config);
        assert_eq!(config.loglevel, LogLevel::Debug);
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut args = noargs();
        args.config_file = dir.path().join("missing.conf");
        let config = load_config(&args).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_config_file_then_cli_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netprobe.conf");
        std::fs::write(&path, "test_name = \"from_file\"\nno_submit = true\n").unwrap();
        let mut args = noargs();
        args.config_file = path;
        args.test_name = Some("from_cli".to_string());
        let config = load_config(&args).unwrap();
        assert_eq!(config.test_name, "from_cli");
        assert!(config.no_submit);
    }

    #[test]
    fn test_load_config_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netprobe.conf");
        std::fs::write(&path, "this is not toml at all [").unwrap();
        let mut args = noargs();
        args.config_file = path;
        assert!(matches!(load_config(&args), Err(Error::Config(_))));
    }
}
