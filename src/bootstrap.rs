//! Session bootstrap.
//!
//! Bootstrap turns a [`BootstrapRequest`] into the immutable
//! [`SessionState`] every other request needs. The steps run in order
//! and the first failure aborts the whole attempt; no partial state
//! survives.
//!
//! # Bootstrap Steps
//!
//! ```text
//!   1. validate software name/version     (before any resource)
//!   2. open the key-value store           (state dir)
//!   3. ensure the tunnel-state dir
//!   4. create a fresh temp working dir    (under the temp root)
//!   5. start the tunnel                   (may take tens of seconds,
//!                                          cancellable)
//!   6. build resolver + HTTP client       (proxied when the tunnel
//!                                          exposes a SOCKS5 URL)
//!   7. build the backend client           (user-agent from software
//!                                          name/version + engine)
//! ```
//!
//! The psiphon tunnel needs its configuration from the backend before
//! the tunneled HTTP client exists, so step 5 carries a direct-egress
//! backend client used only for that fetch.
//!
//! # See Also
//!
//! - [`crate::session`] - Where bootstrap is requested and the state
//!   lives

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use url::Url;

use crate::backend::{self, BackendClient, BackendClientConfig};
use crate::bytecounter::ByteCounter;
use crate::error::{Error, Result};
use crate::httpclient::{HttpClientConfig, SessionHttpClient};
use crate::kvstore::{FileSystemStore, KeyValueStore};
use crate::logger::SessionLogger;
use crate::model::{CheckInResult, Location, ServiceEndpoint, ENGINE_NAME, ENGINE_VERSION};
use crate::psiphon::ConsoleClientRunner;
use crate::resolver::SessionResolver;
use crate::tor::TorProcessStarter;
use crate::tunnel::{Tunnel, TunnelConfig};

/// Asks the session to create its state.
///
/// Software name and version are mandatory; bootstrap fails with
/// [`Error::InvalidRequest`] before creating any resource when either
/// is empty.
#[derive(Clone, Debug, Default)]
pub struct BootstrapRequest {
    /// Name of the embedding application.
    pub software_name: String,
    /// Version of the embedding application.
    pub software_version: String,
    /// Directory for persistent session state.
    pub state_dir: PathBuf,
    /// Root under which the session creates its temp working dir.
    pub temp_dir: PathBuf,
    /// Directory where tunnels keep persistent state.
    pub tunnel_dir: PathBuf,
    /// Egress selector. Absent means direct; `socks5://...` is a
    /// passthrough proxy; `tor://`, `tor+snowflake://` and
    /// `psiphon://` start the corresponding tunnel.
    pub proxy_url: Option<String>,
    /// Forces a specific backend instead of the default candidates.
    pub backend_url: Option<String>,
    /// Path of the tor binary, when not simply `tor` on PATH.
    pub tor_binary: Option<PathBuf>,
    /// Extra arguments for the tor binary.
    pub tor_args: Vec<String>,
    /// Snowflake rendezvous method: `domain_fronting` or `amp`.
    pub snowflake_rendezvous: Option<String>,
    /// Emit debug log events.
    pub verbose: bool,
}

impl BootstrapRequest {
    fn validate(&self) -> Result<()> {
        if self.software_name.is_empty() {
            return Err(Error::InvalidRequest("empty software name".to_string()));
        }
        if self.software_version.is_empty() {
            return Err(Error::InvalidRequest("empty software version".to_string()));
        }
        Ok(())
    }
}

/// The bootstrapped session state. Owned exclusively by the session
/// actor; callers only ever see it through request results.
pub(crate) struct SessionState {
    pub(crate) kvstore: Arc<dyn KeyValueStore>,
    pub(crate) temp_dir: PathBuf,
    pub(crate) tunnel: Tunnel,
    pub(crate) resolver: Arc<SessionResolver>,
    pub(crate) http: Arc<SessionHttpClient>,
    pub(crate) backend: Arc<BackendClient>,
    pub(crate) counter: Arc<ByteCounter>,
    pub(crate) location: Option<Location>,
    pub(crate) check_in: Option<CheckInResult>,
    pub(crate) software_name: String,
    pub(crate) software_version: String,
    pub(crate) user_agent: String,
    cleaned_up: bool,
}

impl SessionState {
    /// Runs the bootstrap steps; see the module docs for the order.
    pub(crate) async fn bootstrap(
        token: &CancellationToken,
        req: &BootstrapRequest,
        logger: &SessionLogger,
    ) -> Result<SessionState> {
        req.validate()?;

        let proxy_url = match &req.proxy_url {
            Some(raw) => Some(Url::parse(raw)?),
            None => None,
        };

        logger.info(&format!(
            "bootstrap: creating key-value store at {}",
            req.state_dir.display()
        ));
        let kvstore: Arc<dyn KeyValueStore> = Arc::new(FileSystemStore::new(&req.state_dir)?);

        logger.info(&format!(
            "bootstrap: creating tunnel state dir at {}",
            req.tunnel_dir.display()
        ));
        tokio::fs::create_dir_all(&req.tunnel_dir).await?;

        logger.info(&format!(
            "bootstrap: creating temporary directory inside {}",
            req.temp_dir.display()
        ));
        tokio::fs::create_dir_all(&req.temp_dir).await?;
        let temp_dir = tempfile::Builder::new()
            .prefix("session")
            .tempdir_in(&req.temp_dir)?
            .keep();

        let counter = Arc::new(ByteCounter::new());
        let user_agent = format!(
            "{}/{} {}/{}",
            req.software_name, req.software_version, ENGINE_NAME, ENGINE_VERSION
        );

        // Direct-egress backend access for fetching the psiphon config:
        // the tunneled HTTP client cannot exist before the tunnel does.
        let early_backend = Arc::new(new_backend_client(
            req,
            Arc::new(SessionHttpClient::new(HttpClientConfig {
                counter: counter.clone(),
                proxy_url: None,
                user_agent: user_agent.clone(),
            })?),
            kvstore.clone(),
            logger.clone(),
        )?);

        logger.info("bootstrap: starting the tunnel");
        let tunnel_config = TunnelConfig {
            tunnel_dir: req.tunnel_dir.clone(),
            tor_binary: req.tor_binary.clone(),
            tor_args: req.tor_args.clone(),
            snowflake_rendezvous: req.snowflake_rendezvous.clone(),
            logger: logger.clone(),
            tor_starter: Arc::new(TorProcessStarter),
            psiphon_runner: Arc::new(ConsoleClientRunner::default()),
            psiphon_config_source: early_backend,
        };
        let tunnel = match Tunnel::start(token, proxy_url.as_ref(), &tunnel_config).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                logger.warn(&format!("bootstrap: cannot create tunnel: {}", e));
                let _ = tokio::fs::remove_dir_all(&temp_dir).await;
                return Err(e);
            }
        };

        logger.info("bootstrap: creating a resolver for the session");
        let resolver = Arc::new(SessionResolver::new(tunnel.socks5_proxy_url()));

        logger.info("bootstrap: creating an HTTP client for the session");
        let http = Arc::new(SessionHttpClient::new(HttpClientConfig {
            counter: counter.clone(),
            proxy_url: tunnel.socks5_proxy_url(),
            user_agent: user_agent.clone(),
        })?);

        logger.info("bootstrap: creating the backend client");
        let backend = Arc::new(new_backend_client(
            req,
            http.clone(),
            kvstore.clone(),
            logger.clone(),
        )?);

        logger.info("bootstrap: complete");
        Ok(SessionState {
            kvstore,
            temp_dir,
            tunnel,
            resolver,
            http,
            backend,
            counter,
            location: None,
            check_in: None,
            software_name: req.software_name.clone(),
            software_version: req.software_version.clone(),
            user_agent,
            cleaned_up: false,
        })
    }

    /// Releases the session resources. One-shot: repeated calls are
    /// no-ops.
    pub(crate) async fn cleanup(&mut self, logger: &SessionLogger) {
        if self.cleaned_up {
            return;
        }
        self.cleaned_up = true;
        logger.info("session: releasing resources");
        self.tunnel.stop().await;
        // resolver and HTTP client close their connections on drop,
        // together with the state
        if let Err(e) = tokio::fs::remove_dir_all(&self.temp_dir).await {
            logger.warn(&format!(
                "session: cannot remove temp dir {}: {}",
                self.temp_dir.display(),
                e
            ));
        }
    }
}

fn new_backend_client(
    req: &BootstrapRequest,
    http: Arc<SessionHttpClient>,
    kvstore: Arc<dyn KeyValueStore>,
    logger: SessionLogger,
) -> Result<BackendClient> {
    let candidates = match &req.backend_url {
        Some(address) => vec![ServiceEndpoint {
            address: address.clone(),
            kind: "https".to_string(),
            front: None,
        }],
        None => backend::default_backend_endpoints(),
    };
    Ok(BackendClient::new(BackendClientConfig {
        candidates,
        http,
        kvstore,
        logger,
        software_name: req.software_name.clone(),
        software_version: req.software_version.clone(),
    }))
}
