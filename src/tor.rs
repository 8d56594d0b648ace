//! Tor subprocess lifecycle.
//!
//! Starts a tor process owned by the session, waits for it to bootstrap,
//! and extracts the SOCKS5 listener to route traffic through. The control
//! connection uses stem-rs.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌──────────────────┐
//!   │ Build args       │ ◄── DataDirectory, ControlPort auto,
//!   │                  │     SocksPort auto, DisableNetwork 1
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐
//!   │ Spawn tor        │ ◄── stderr forwarded to debug logs
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐
//!   │ Poll control-    │ ◄── tor writes PORT=127.0.0.1:<port>
//!   │ port file        │
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐
//!   │ Connect + auth   │ ◄── stem-rs Controller
//!   └────────┬─────────┘
//!            ▼
//!   ┌──────────────────┐ ─┐
//!   │ DisableNetwork=0 │  │
//!   └────────┬─────────┘  │
//!            ▼            │ bootstrap time measured
//!   ┌──────────────────┐  │ across these two steps
//!   │ Poll bootstrap-  │  │
//!   │ phase TAG=done   │  │
//!   └────────┬─────────┘ ─┘
//!            ▼
//!   ┌──────────────────┐
//!   │ GETINFO          │ ◄── unix listeners rejected
//!   │ net/listeners/   │     (UnsupportedProxy)
//!   │ socks            │
//!   └──────────────────┘
//! ```
//!
//! Snowflake mode adds bridge and pluggable-transport arguments; the
//! rendezvous method selects the broker (`domain_fronting` via the
//! fastly front, or `amp` via the AMP cache).
//!
//! # See Also
//!
//! - [`crate::tunnel`] - The dispatcher that selects this module
//! - [Tor Control Protocol](https://spec.torproject.org/control-spec)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use stem_rs::controller::Controller;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::logger::SessionLogger;
use crate::tunnel::{StartedTunnel, SubprocessHandle, TunnelConfig};

/// How often we poll for the control-port file and bootstrap progress.
const POLL_PERIOD: Duration = Duration::from_millis(250);

/// Snowflake rendezvous parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnowflakeRendezvous {
    /// Broker URL for the rendezvous.
    pub broker_url: String,
    /// AMP cache URL; empty unless the method uses the AMP cache.
    pub amp_cache_url: String,
    /// Front domain concealing the broker.
    pub front_domain: String,
}

/// Resolves a rendezvous method name into its parameters.
///
/// The empty string selects the default method, `domain_fronting`.
///
/// # Errors
///
/// Returns [`Error::TunnelStart`] for unknown method names.
pub fn snowflake_rendezvous(method: &str) -> Result<SnowflakeRendezvous> {
    match method {
        "" | "domain_fronting" => Ok(SnowflakeRendezvous {
            broker_url: "https://snowflake-broker.torproject.net.global.prod.fastly.net/"
                .to_string(),
            amp_cache_url: String::new(),
            front_domain: "cdn.sstatic.net".to_string(),
        }),
        "amp" => Ok(SnowflakeRendezvous {
            broker_url: "https://snowflake-broker.torproject.net/".to_string(),
            amp_cache_url: "https://cdn.ampproject.org/".to_string(),
            front_domain: "www.google.com".to_string(),
        }),
        other => Err(Error::TunnelStart(format!(
            "unsupported snowflake rendezvous method: {}",
            other
        ))),
    }
}

/// Configuration handed to a [`TorStarter`].
pub struct TorStartConfig {
    /// The tor binary to execute.
    pub binary: PathBuf,
    /// Data directory for this tor instance.
    pub datadir: PathBuf,
    /// Extra caller-supplied arguments.
    pub extra_args: Vec<String>,
    /// Snowflake parameters when bootstrapping over snowflake.
    pub snowflake: Option<SnowflakeRendezvous>,
    /// Session logger.
    pub logger: SessionLogger,
}

/// Starts a tor instance. Swappable so tests can assert that a cancelled
/// start performs zero work.
#[async_trait]
pub trait TorStarter: Send + Sync {
    /// Starts tor and waits until it can carry traffic.
    async fn start(
        &self,
        token: &CancellationToken,
        config: &TorStartConfig,
    ) -> Result<StartedTunnel>;
}

/// Entry point used by the tunnel dispatcher.
pub(crate) async fn tor_start(
    token: &CancellationToken,
    config: &TunnelConfig,
    snowflake: bool,
) -> Result<StartedTunnel> {
    if config.tunnel_dir.as_os_str().is_empty() {
        return Err(Error::TunnelStart("empty tunnel dir".to_string()));
    }
    let rendezvous = if snowflake {
        Some(snowflake_rendezvous(
            config.snowflake_rendezvous.as_deref().unwrap_or(""),
        )?)
    } else {
        None
    };
    let start_config = TorStartConfig {
        binary: config
            .tor_binary
            .clone()
            .unwrap_or_else(|| PathBuf::from("tor")),
        datadir: config.tunnel_dir.join("tor"),
        extra_args: config.tor_args.clone(),
        snowflake: rendezvous,
        logger: config.logger.clone(),
    };
    config.tor_starter.start(token, &start_config).await
}

/// Builds the tor command line.
pub(crate) fn tor_command_args(config: &TorStartConfig, control_port_file: &Path) -> Vec<String> {
    let mut args = vec![
        "--DataDirectory".to_string(),
        config.datadir.to_string_lossy().into_owned(),
        "--ControlPort".to_string(),
        "auto".to_string(),
        "--ControlPortWriteToFile".to_string(),
        control_port_file.to_string_lossy().into_owned(),
        "--CookieAuthentication".to_string(),
        "0".to_string(),
        "--SocksPort".to_string(),
        "auto".to_string(),
        "--DisableNetwork".to_string(),
        "1".to_string(),
        "--Log".to_string(),
        "notice stderr".to_string(),
    ];
    if let Some(rendezvous) = &config.snowflake {
        args.push("--UseBridges".to_string());
        args.push("1".to_string());
        args.push("--ClientTransportPlugin".to_string());
        args.push("snowflake exec snowflake-client".to_string());
        args.push("--Bridge".to_string());
        let mut bridge = format!(
            "snowflake 192.0.2.3:80 2B280B23E1107BB62ABFC40DDCC8824814F80A72 url={} front={}",
            rendezvous.broker_url, rendezvous.front_domain,
        );
        if !rendezvous.amp_cache_url.is_empty() {
            bridge.push_str(&format!(" ampcache={}", rendezvous.amp_cache_url));
        }
        bridge.push_str(" ice=stun:stun.l.google.com:19302,stun:stun.voipgate.com:3478");
        args.push(bridge);
    }
    args.extend(config.extra_args.iter().cloned());
    args
}

/// Parses the control-port file tor writes when `ControlPortWriteToFile`
/// is set; the interesting line reads `PORT=127.0.0.1:<port>`.
pub(crate) fn parse_control_port_file(content: &str) -> Result<SocketAddr> {
    for line in content.lines() {
        if let Some(addr) = line.trim().strip_prefix("PORT=") {
            return addr
                .parse()
                .map_err(|e| Error::TunnelStart(format!("invalid control port: {}", e)));
        }
    }
    Err(Error::TunnelStart(
        "control port file has no PORT line".to_string(),
    ))
}

/// Parses a `GETINFO net/listeners/socks` response into the first TCP
/// listener address.
///
/// # Errors
///
/// Returns [`Error::UnsupportedProxy`] when tor only exposes non-TCP
/// listeners (e.g. a unix-domain socket) and [`Error::TunnelStart`] when
/// there is no listener at all.
pub(crate) fn parse_socks_listener(response: &str) -> Result<SocketAddr> {
    let value = response
        .trim()
        .strip_prefix("net/listeners/socks=")
        .unwrap_or(response.trim());
    let mut unsupported = None;
    for entry in value.split_whitespace() {
        let entry = entry.trim_matches('"');
        if entry.is_empty() {
            continue;
        }
        if entry.starts_with("unix:") {
            unsupported = Some(entry.to_string());
            continue;
        }
        if let Ok(addr) = entry.parse::<SocketAddr>() {
            return Ok(addr);
        }
        unsupported = Some(entry.to_string());
    }
    match unsupported {
        Some(listener) => Err(Error::UnsupportedProxy(listener)),
        None => Err(Error::TunnelStart("no socks listener reported".to_string())),
    }
}

/// The production [`TorStarter`]: spawns the tor binary and drives its
/// control port until the network is usable.
#[derive(Default)]
pub struct TorProcessStarter;

#[async_trait]
impl TorStarter for TorProcessStarter {
    async fn start(
        &self,
        token: &CancellationToken,
        config: &TorStartConfig,
    ) -> Result<StartedTunnel> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        tokio::fs::create_dir_all(&config.datadir).await?;
        let control_port_file = config.datadir.join("control-port");
        // a stale file from a previous run would short-circuit the poll
        let _ = tokio::fs::remove_file(&control_port_file).await;

        let args = tor_command_args(config, &control_port_file);
        config.logger.info(&format!(
            "tunnel: starting {} with data directory {}",
            config.binary.display(),
            config.datadir.display()
        ));
        let mut child = tokio::process::Command::new(&config.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(stderr) = child.stderr.take() {
            let logger = config.logger.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    logger.debug(&format!("tor: {}", line));
                }
            });
        }

        match drive_bootstrap(token, config, &control_port_file).await {
            Ok((proxy_url, bootstrap_time)) => Ok(StartedTunnel {
                proxy_url,
                bootstrap_time,
                handle: Box::new(SubprocessHandle::new(child)),
            }),
            Err(e) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(e)
            }
        }
    }
}

/// Waits for the control port, authenticates, enables the network, and
/// extracts the socks listener.
async fn drive_bootstrap(
    token: &CancellationToken,
    config: &TorStartConfig,
    control_port_file: &Path,
) -> Result<(Url, Duration)> {
    let control_addr = wait_for_control_port_file(token, control_port_file).await?;
    config.logger.debug(&format!(
        "tunnel: tor control port at {}",
        control_addr
    ));

    let mut controller = Controller::from_port(control_addr).await?;
    controller.authenticate(None).await?;

    // Bootstrap time spans from enabling the network to confirmation
    // that tor finished bootstrapping.
    let begin = Instant::now();
    controller.set_conf("DisableNetwork", "0").await?;
    wait_for_bootstrap_done(token, &mut controller, &config.logger).await?;
    let bootstrap_time = begin.elapsed();

    let listeners = controller.get_info("net/listeners/socks").await?;
    let socks_addr = parse_socks_listener(&listeners)?;
    let proxy_url = Url::parse(&format!("socks5://{}/", socks_addr))?;
    config.logger.info(&format!(
        "tunnel: tor ready in {:.2}s, socks at {}",
        bootstrap_time.as_secs_f64(),
        socks_addr
    ));
    Ok((proxy_url, bootstrap_time))
}

async fn wait_for_control_port_file(
    token: &CancellationToken,
    path: &Path,
) -> Result<SocketAddr> {
    loop {
        if let Ok(content) = tokio::fs::read_to_string(path).await {
            if content.contains("PORT=") {
                return parse_control_port_file(&content);
            }
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_PERIOD) => {}
            _ = token.cancelled() => return Err(Error::Cancelled),
        }
    }
}

async fn wait_for_bootstrap_done(
    token: &CancellationToken,
    controller: &mut Controller,
    logger: &SessionLogger,
) -> Result<()> {
    let mut last_phase = String::new();
    loop {
        let phase = controller.get_info("status/bootstrap-phase").await?;
        if phase != last_phase {
            logger.debug(&format!("tunnel: {}", phase.trim()));
            last_phase = phase.clone();
        }
        if phase.contains("TAG=done") {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_PERIOD) => {}
            _ = token.cancelled() => return Err(Error::Cancelled),
        }
    }
}
