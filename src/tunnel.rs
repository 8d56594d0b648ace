//! Tunnel abstraction over egress mechanisms.
//!
//! A session reaches the network through exactly one egress mechanism:
//! directly, through a caller-supplied SOCKS5 proxy, through a tor
//! subprocess (optionally with snowflake), or through a psiphon tunnel.
//! This module unifies all four behind the [`Tunnel`] sum type so that
//! the rest of the engine never branches on how packets leave the host.
//!
//! # State Machine
//!
//! ```text
//!  ┌────────────┐   Tunnel::start(scheme, ...)    ┌────────────┐
//!  │ NotStarted │────────────────────────────────▶│  Starting  │
//!  └────────────┘                                 └─────┬──────┘
//!                                                       │
//!                             ┌─────────────────────────┼──────────┐
//!                             │ ok                      │ error    │
//!                             ▼                         ▼          │
//!                      ┌────────────┐            (no tunnel value) │
//!                      │  Running   │                              │
//!                      └─────┬──────┘                              │
//!                            │ stop()                              │
//!                            ▼                                     │
//!                      ┌────────────┐                              │
//!                      │  Stopped   │◀── stop() again is a no-op ──┘
//!                      └────────────┘
//! ```
//!
//! # Scheme Dispatch
//!
//! | Proxy URL scheme | Variant | Startup |
//! |------------------|---------|---------|
//! | (no proxy URL) | [`Tunnel::None`] | immediate, zero bootstrap time |
//! | `socks5` | [`Tunnel::Socks5`] | immediate, URL passed through verbatim |
//! | `tor`, `tor+snowflake` | [`Tunnel::Tor`] | subprocess + control port, seconds to minutes |
//! | `psiphon` | [`Tunnel::Psiphon`] | config fetch + tunnel library, seconds to minutes |
//! | anything else | — | fails with `UnsupportedTunnelScheme` |
//!
//! # Cancellation
//!
//! [`Tunnel::start`] checks the caller's token at entry: a token that is
//! already cancelled short-circuits before any subprocess is spawned or
//! any network operation begins. Mid-flight cancellation unwinds without
//! leaking the subprocess.
//!
//! # The None Tunnel
//!
//! The absent tunnel is a real value, not a null pointer: zero bootstrap
//! time, no proxy URL, no-op stop. Callers never need to null-check.
//!
//! # See Also
//!
//! - [`crate::tor`] - Tor subprocess lifecycle
//! - [`crate::psiphon`] - Psiphon tunnel lifecycle
//! - [`crate::bootstrap`] - Where sessions start their tunnel

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{Error, Result};
use crate::logger::SessionLogger;
use crate::psiphon::{self, PsiphonConfigSource, PsiphonRunner};
use crate::tor::{self, TorStarter};

/// A handle to a running tunnel mechanism that can be shut down.
///
/// Implemented by subprocess wrappers; test doubles count invocations.
#[async_trait]
pub trait TunnelHandle: Send {
    /// Shuts the mechanism down, waiting for it to exit.
    async fn stop(&mut self);
}

/// A subprocess-backed [`TunnelHandle`].
pub struct SubprocessHandle {
    child: tokio::process::Child,
}

impl SubprocessHandle {
    /// Wraps a spawned child process.
    pub fn new(child: tokio::process::Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl TunnelHandle for SubprocessHandle {
    async fn stop(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// What a tunnel starter hands back: the proxy to route through, how long
/// the bootstrap took, and the handle to stop it.
pub struct StartedTunnel {
    /// The local SOCKS5 proxy exposed by the mechanism.
    pub proxy_url: Url,
    /// Wall-clock bootstrap duration.
    pub bootstrap_time: Duration,
    /// Handle for shutdown.
    pub handle: Box<dyn TunnelHandle>,
}

/// Configuration for [`Tunnel::start`].
pub struct TunnelConfig {
    /// Directory where tunnels keep persistent state.
    pub tunnel_dir: PathBuf,
    /// Path of the tor binary; `tor` from PATH when absent.
    pub tor_binary: Option<PathBuf>,
    /// Extra arguments for the tor binary.
    pub tor_args: Vec<String>,
    /// Snowflake rendezvous method: `domain_fronting` (default) or `amp`.
    pub snowflake_rendezvous: Option<String>,
    /// Session logger.
    pub logger: SessionLogger,
    /// Starts tor; swappable for tests.
    pub tor_starter: std::sync::Arc<dyn TorStarter>,
    /// Starts psiphon; swappable for tests.
    pub psiphon_runner: std::sync::Arc<dyn PsiphonRunner>,
    /// Fetches the psiphon configuration.
    pub psiphon_config_source: std::sync::Arc<dyn PsiphonConfigSource>,
}

/// A managed tunnel with a stoppable mechanism behind it.
pub struct ManagedTunnel {
    proxy_url: Url,
    bootstrap_time: Duration,
    handle: Mutex<Option<Box<dyn TunnelHandle>>>,
}

impl ManagedTunnel {
    fn new(started: StartedTunnel) -> Self {
        Self {
            proxy_url: started.proxy_url,
            bootstrap_time: started.bootstrap_time,
            handle: Mutex::new(Some(started.handle)),
        }
    }

    async fn stop(&self) {
        // take() makes repeated stops no-ops
        let handle = self.handle.lock().unwrap().take();
        if let Some(mut handle) = handle {
            handle.stop().await;
        }
    }
}

/// A running egress mechanism.
pub enum Tunnel {
    /// No tunnel: direct egress. Zero bootstrap time, no proxy.
    None,
    /// Passthrough to a caller-managed SOCKS5 proxy.
    Socks5 {
        /// The proxy URL, verbatim from the caller.
        proxy_url: Url,
    },
    /// A tor subprocess we own.
    Tor(ManagedTunnel),
    /// A psiphon tunnel we own.
    Psiphon(ManagedTunnel),
}

impl Tunnel {
    /// Starts the tunnel selected by `proxy_url`.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] when `token` is already cancelled; checked
    ///   at entry, before any I/O.
    /// - [`Error::UnsupportedTunnelScheme`] for unknown schemes.
    /// - [`Error::UnsupportedProxy`] when tor reports a non-TCP SOCKS
    ///   listener.
    /// - [`Error::TunnelStart`] and passthrough errors for startup
    ///   failures.
    pub async fn start(
        token: &CancellationToken,
        proxy_url: Option<&Url>,
        config: &TunnelConfig,
    ) -> Result<Tunnel> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let proxy_url = match proxy_url {
            None => {
                config.logger.info("tunnel: no proxy configured: using direct egress");
                return Ok(Tunnel::None);
            }
            Some(url) => url,
        };
        match proxy_url.scheme() {
            "socks5" => {
                config
                    .logger
                    .info(&format!("tunnel: using caller-managed proxy {}", proxy_url));
                Ok(Tunnel::Socks5 {
                    proxy_url: proxy_url.clone(),
                })
            }
            scheme @ ("tor" | "tor+snowflake") => {
                let snowflake = scheme == "tor+snowflake";
                let started = tor::tor_start(token, config, snowflake).await?;
                Ok(Tunnel::Tor(ManagedTunnel::new(started)))
            }
            "psiphon" => {
                let started = psiphon::psiphon_start(token, config).await?;
                Ok(Tunnel::Psiphon(ManagedTunnel::new(started)))
            }
            other => Err(Error::UnsupportedTunnelScheme(other.to_string())),
        }
    }

    /// Returns how long the bootstrap took.
    ///
    /// Zero for [`Tunnel::None`] and [`Tunnel::Socks5`], which have no
    /// startup phase.
    pub fn bootstrap_time(&self) -> Duration {
        match self {
            Tunnel::None | Tunnel::Socks5 { .. } => Duration::ZERO,
            Tunnel::Tor(t) | Tunnel::Psiphon(t) => t.bootstrap_time,
        }
    }

    /// Returns the SOCKS5 proxy to route through, when there is one.
    pub fn socks5_proxy_url(&self) -> Option<Url> {
        match self {
            Tunnel::None => None,
            Tunnel::Socks5 { proxy_url } => Some(proxy_url.clone()),
            Tunnel::Tor(t) | Tunnel::Psiphon(t) => Some(t.proxy_url.clone()),
        }
    }

    /// Stops the tunnel. Idempotent; a no-op for variants with nothing
    /// to stop.
    pub async fn stop(&self) {
        match self {
            Tunnel::None | Tunnel::Socks5 { .. } => {}
            Tunnel::Tor(t) | Tunnel::Psiphon(t) => t.stop().await,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared test doubles for tunnel starters.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::tor::TorStartConfig;

    /// A [`TunnelHandle`] counting how many times it was stopped.
    pub(crate) struct CountingHandle {
        pub(crate) stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TunnelHandle for CountingHandle {
        async fn stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// A [`TorStarter`] that records invocations and returns a canned
    /// tunnel.
    pub(crate) struct StubTorStarter {
        pub(crate) calls: Arc<AtomicUsize>,
        pub(crate) stops: Arc<AtomicUsize>,
    }

    impl StubTorStarter {
        pub(crate) fn new() -> Self {
            Self {
                calls: Arc::new(AtomicUsize::new(0)),
                stops: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl TorStarter for StubTorStarter {
        async fn start(
            &self,
            _token: &CancellationToken,
            _config: &TorStartConfig,
        ) -> Result<StartedTunnel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StartedTunnel {
                proxy_url: Url::parse("socks5://127.0.0.1:9050/").unwrap(),
                bootstrap_time: Duration::from_millis(128),
                handle: Box::new(CountingHandle {
                    stops: self.stops.clone(),
                }),
            })
        }
    }

    /// A [`PsiphonRunner`] that records invocations.
    pub(crate) struct StubPsiphonRunner {
        pub(crate) calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PsiphonRunner for StubPsiphonRunner {
        async fn start(
            &self,
            _token: &CancellationToken,
            _config: &[u8],
            _workdir: &std::path::Path,
            _logger: &SessionLogger,
        ) -> Result<StartedTunnel> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(StartedTunnel {
                proxy_url: Url::parse("socks5://127.0.0.1:1080/").unwrap(),
                bootstrap_time: Duration::from_millis(256),
                handle: Box::new(CountingHandle {
                    stops: Arc::new(AtomicUsize::new(0)),
                }),
            })
        }
    }

    /// A [`PsiphonConfigSource`] that records invocations.
    pub(crate) struct StubConfigSource {
        pub(crate) calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PsiphonConfigSource for StubConfigSource {
        async fn fetch_psiphon_config(&self, _token: &CancellationToken) -> Result<Vec<u8>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(b"{}".to_vec())
        }
    }

    /// Builds a [`TunnelConfig`] wired with stubs, returning the stub
    /// call counters alongside.
    pub(crate) fn stub_config(
        tunnel_dir: std::path::PathBuf,
    ) -> (TunnelConfig, Arc<AtomicUsize>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let tor = StubTorStarter::new();
        let tor_calls = tor.calls.clone();
        let tor_stops = tor.stops.clone();
        let psiphon = StubPsiphonRunner {
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let psiphon_calls = psiphon.calls.clone();
        let source = StubConfigSource {
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let config = TunnelConfig {
            tunnel_dir,
            tor_binary: None,
            tor_args: Vec::new(),
            snowflake_rendezvous: None,
            logger: SessionLogger::new(tx, false),
            tor_starter: Arc::new(tor),
            psiphon_runner: Arc::new(psiphon),
            psiphon_config_source: Arc::new(source),
        };
        (config, tor_calls, tor_stops, psiphon_calls)
    }
}
