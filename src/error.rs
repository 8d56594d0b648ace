//! Error types for netprobe-rs.
//!
//! This module defines the [`enum@Error`] enum representing all possible error
//! conditions in the netprobe-rs library. Each variant provides specific
//! information about the failure and guidance on recovery.
//!
//! # Error Categories
//!
//! ```text
//!   Error
//!   ├── Io                      ◄── File/network I/O failures
//!   ├── Config                  ◄── Invalid CLI/TOML configuration
//!   ├── InvalidRequest          ◄── Malformed bootstrap request
//!   ├── AlreadyBootstrapped     ◄── Second bootstrap on the same session
//!   ├── NotBootstrapped         ◄── Request issued before bootstrap
//!   ├── SessionTerminated       ◄── Session no longer accepting requests
//!   ├── Cancelled               ◄── Caller's cancellation token fired
//!   ├── UnsupportedTunnelScheme ◄── Unknown proxy URL scheme
//!   ├── UnsupportedProxy        ◄── Tunnel reported an unusable listener
//!   ├── TunnelStart             ◄── Tunnel subprocess/bootstrap failure
//!   ├── Control                 ◄── Tor control protocol errors (stem-rs)
//!   ├── Http                    ◄── HTTP round-trip failures (reqwest)
//!   ├── UrlParse                ◄── Invalid URL
//!   ├── Json                    ◄── JSON (de)serialization failures
//!   ├── KvStore                 ◄── Key-value store failures
//!   ├── Backend                 ◄── Backend API rejected the call
//!   ├── Geolocate               ◄── All location lookup services failed
//!   ├── NoLocation              ◄── Handler needed a cached location
//!   └── NoCheckIn               ◄── Handler needed a cached check-in
//! ```
//!
//! # Recovery Guide
//!
//! | Error | Recoverable | Retry | Recommended Action |
//! |-------|-------------|-------|-------------------|
//! | [`Io`](Error::Io) | Sometimes | Yes (backoff) | Check permissions, disk space |
//! | [`InvalidRequest`](Error::InvalidRequest) | No | No | Fix the bootstrap request |
//! | [`AlreadyBootstrapped`](Error::AlreadyBootstrapped) | N/A | No | Reuse the existing session |
//! | [`NotBootstrapped`](Error::NotBootstrapped) | Yes | Yes | Send a bootstrap request first |
//! | [`SessionTerminated`](Error::SessionTerminated) | No | No | Create a new session |
//! | [`Cancelled`](Error::Cancelled) | N/A | Caller decides | Propagated from the caller's token |
//! | [`TunnelStart`](Error::TunnelStart) | Sometimes | Yes | Check tunnel binary and network |
//! | [`Http`](Error::Http) | Sometimes | Yes | Check connectivity, try a tunnel |
//! | [`Backend`](Error::Backend) | Sometimes | Yes | Backend may be unreachable or censored |
//! | [`NoLocation`](Error::NoLocation) | Yes | Yes | Run a geolocate request first |
//! | [`NoCheckIn`](Error::NoCheckIn) | Yes | Yes | Run a check-in request first |
//!
//! # Example
//!
//! ```rust
//! use netprobe_rs::Error;
//!
//! fn is_retryable(err: &Error) -> bool {
//!     matches!(err,
//!         Error::Io(_) |
//!         Error::Http(_) |
//!         Error::TunnelStart(_) |
//!         Error::Backend(_)
//!     )
//! }
//! ```
//!
//! # See Also
//!
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//! - [`crate::session`] - How terminal events carry these errors to callers

use thiserror::Error;

/// Errors that can occur during netprobe-rs operations.
///
/// This enum represents all possible error conditions in the library. A
/// failed request never poisons the session: the error travels to the caller
/// inside the corresponding terminal event and the session keeps accepting
/// further requests, except for [`SessionTerminated`](Error::SessionTerminated).
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error during file or network operations.
    ///
    /// # Recovery
    ///
    /// - Check file permissions and paths
    /// - Retry with backoff for transient issues
    /// - Verify disk space for write operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The application configuration is invalid.
    ///
    /// # Recovery
    ///
    /// Fix the offending CLI flag or TOML setting named in the message.
    #[error("configuration error: {0}")]
    Config(String),

    /// The bootstrap request is malformed.
    ///
    /// Raised before any resource is created, e.g. when the software name
    /// or version is empty.
    ///
    /// # Recovery
    ///
    /// Fix the request. This error is not recoverable without user
    /// intervention.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Bootstrap was called on a session that already bootstrapped.
    ///
    /// The state created by the first bootstrap is unchanged; keep using it.
    #[error("session already bootstrapped")]
    AlreadyBootstrapped,

    /// A request that requires session state arrived before a successful
    /// bootstrap.
    ///
    /// # Recovery
    ///
    /// Send a bootstrap request and wait for a successful result, then
    /// retry.
    #[error("session not bootstrapped")]
    NotBootstrapped,

    /// The session is no longer accepting requests.
    ///
    /// Returned by `send` and `recv` after the session closed.
    #[error("session terminated")]
    SessionTerminated,

    /// The caller's cancellation token fired.
    ///
    /// When the token is already cancelled on entry, the operation returns
    /// this error without performing any I/O.
    #[error("operation cancelled")]
    Cancelled,

    /// The proxy URL scheme does not match any known tunnel.
    ///
    /// Supported schemes are the empty scheme, `socks5`, `tor`,
    /// `tor+snowflake`, and `psiphon`.
    #[error("unsupported tunnel scheme: {0}")]
    UnsupportedTunnelScheme(String),

    /// The tunnel reported a listener we cannot use as a proxy.
    ///
    /// For example, tor configured with a unix-domain SOCKS listener
    /// rather than a TCP endpoint.
    #[error("unsupported proxy listener: {0}")]
    UnsupportedProxy(String),

    /// Starting the tunnel failed.
    ///
    /// # Recovery
    ///
    /// - Check the tunnel binary is installed and on PATH
    /// - Check the tunnel state directory is writable
    /// - Retry; circumvention bootstraps fail transiently
    #[error("cannot start tunnel: {0}")]
    TunnelStart(String),

    /// Tor control protocol error from stem-rs.
    #[error("tor control error: {0}")]
    Control(#[from] stem_rs::Error),

    /// HTTP round-trip error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Key-value store error.
    ///
    /// # Recovery
    ///
    /// - Check the state directory exists and is writable
    /// - Delete a corrupted record and let the engine recreate it
    #[error("kvstore error: {0}")]
    KvStore(String),

    /// The backend API rejected the call.
    ///
    /// The message carries the HTTP status or the API-level failure reason.
    #[error("backend error: {0}")]
    Backend(String),

    /// Every geolocation lookup service failed.
    #[error("geolocate error: {0}")]
    Geolocate(String),

    /// A handler needed the cached probe location but geolocation
    /// never ran successfully in this session.
    #[error("no cached location: geolocate first")]
    NoLocation,

    /// A handler needed the cached check-in result but check-in never
    /// ran successfully in this session.
    #[error("no cached check-in: check in first")]
    NoCheckIn,
}

/// Result type alias for netprobe-rs operations.
///
/// # Example
///
/// ```rust
/// use netprobe_rs::Result;
///
/// fn ensure_nonempty(name: &str) -> Result<()> {
///     if name.is_empty() {
///         return Err(netprobe_rs::Error::InvalidRequest("empty name".into()));
///     }
///     Ok(())
/// }
/// ```
pub type Result<T> = std::result::Result<T, Error>;
