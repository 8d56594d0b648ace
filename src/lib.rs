//! # netprobe-rs
//!
//! A network-censorship measurement probe engine built around a single
//! concurrent session actor.
//!
//! # Overview
//!
//! Before any measurement can run, a probe must acquire an egress path
//! (direct, SOCKS5, Tor, or Psiphon), resolve its own network location,
//! discover a reachable backend, fetch a work assignment, run the
//! measurement, and submit the result. netprobe-rs sequences these steps
//! behind one uniform request/event protocol:
//!
//! - **Session actor** ([`session`]): typed requests in, typed events out,
//!   exactly one request processed at a time
//! - **Tunnel abstraction** ([`tunnel`]): four egress mechanisms behind one
//!   interface, with [`tor`] and [`psiphon`] lifecycles behind it
//! - **Backend discovery** ([`discovery`]): races candidate endpoints and
//!   picks a working, fast one
//!
//! # Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`session`] | The session actor: requests, events, handlers |
//! | [`bootstrap`] | One-shot construction of all session resources |
//! | [`tunnel`] | Egress abstraction: None, SOCKS5, Tor, Psiphon |
//! | [`tor`] | Tor subprocess and control-port lifecycle |
//! | [`psiphon`] | Psiphon console-client lifecycle |
//! | [`discovery`] | Backend candidate discovery and selection |
//! | [`backend`] | Backend API client: check-in, submit, login |
//! | [`geolocate`] | Probe IP / country / ASN / resolver lookup |
//! | [`httpclient`] | Session HTTP client with proxy routing |
//! | [`resolver`] | Session resolver, proxy-aware |
//! | [`kvstore`] | Filesystem and in-memory key-value stores |
//! | [`bytecounter`] | Session byte accounting |
//! | [`ticker`] | Per-request heartbeat events |
//! | [`model`] | Shared data types and capability traits |
//! | [`config`] | Configuration management (TOML, CLI, environment) |
//! | [`logger`] | Logging infrastructure using tracing |
//! | [`error`] | Error types and [`Result`] alias |
//!
//! # What This Library Does NOT Do
//!
//! - **Measurement algorithms**: plug them in through the
//!   [`Measurer`](model::Measurer) capability
//! - **Result persistence and presentation**: consume the events and store
//!   them however the application wants
//! - **Submission retries**: a failed submit surfaces as an error event and
//!   retry policy belongs to the caller
//! - **Tunnel protocols**: Tor and Psiphon run as external processes; only
//!   their lifecycle integration lives here
//!
//! # Quick Start
//!
//! ## As a Library
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netprobe_rs::{BootstrapRequest, Event, Request, Session, SessionConfig};
//! # use netprobe_rs::model::{Measurement, MeasurementSpec, Measurer};
//! # use tokio_util::sync::CancellationToken;
//! # struct MyMeasurer;
//! # #[async_trait::async_trait]
//! # impl Measurer for MyMeasurer {
//! #     async fn run(&self, _t: CancellationToken, _s: MeasurementSpec)
//! #         -> netprobe_rs::Result<Measurement> { unimplemented!() }
//! # }
//!
//! #[tokio::main]
//! async fn main() -> netprobe_rs::Result<()> {
//!     let session = Session::new(SessionConfig {
//!         measurer: Arc::new(MyMeasurer),
//!         geodb: None,
//!     });
//!     let token = CancellationToken::new();
//!     session.send(&token, Request::Bootstrap(BootstrapRequest {
//!         software_name: "my-app".to_string(),
//!         software_version: "1.0.0".to_string(),
//!         ..Default::default()
//!     })).await?;
//!     loop {
//!         match session.recv(&token).await? {
//!             Event::Bootstrap(result) => { result?; break }
//!             _ => continue,
//!         }
//!     }
//!     // ... send Geolocate / CheckIn / RunMeasurement / Submit ...
//!     session.close().await;
//!     Ok(())
//! }
//! ```
//!
//! ## As a CLI Application
//!
//! ```bash
//! # Measure the check-in assignment over direct egress
//! netprobe-rs
//!
//! # Measure explicit inputs without submitting
//! netprobe-rs -i https://example.com/ -n
//!
//! # Bootstrap a tor tunnel first
//! netprobe-rs --proxy tor://
//!
//! # Generate default configuration file
//! netprobe-rs --generate_config netprobe.conf
//! ```
//!
//! # Concurrency Model
//!
//! Each session runs one background worker that owns every session
//! resource and processes requests strictly in arrival order; there is no
//! lock around the session state because nothing else can touch it.
//! Callers wanting parallel measurements hold multiple sessions. Progress
//! and log events are delivered best-effort so a slow consumer can never
//! stall a measurement; terminal results are always delivered.
//!
//! # Security Considerations
//!
//! - **Memory safety**: the backend account password is cleared from
//!   memory after use (using zeroize) and redacted from debug output
//! - **File permissions**: the state directory is created with
//!   restrictive permissions (0700)
//! - **DNS leaks**: proxied sessions resolve names on the proxy side
//!   (`socks5h`) so lookups cannot escape the tunnel
//!
//! # See Also
//!
//! - [stem-rs documentation](https://stem.tn3w.dev/docs/) - Tor control library used by netprobe-rs
//! - [Tor Control Protocol Specification](https://spec.torproject.org/control-spec) - Protocol reference

#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod backend;
pub mod bootstrap;
pub mod bytecounter;
pub mod config;
pub mod discovery;
pub mod error;
pub mod geolocate;
pub mod httpclient;
pub mod kvstore;
pub mod logger;
pub mod model;
pub mod psiphon;
pub mod resolver;
pub mod session;
pub mod ticker;
pub mod tor;
pub mod tunnel;

pub use bootstrap::BootstrapRequest;
pub use config::{CliArgs, Config};
pub use discovery::{select_best, try_all, Candidate};
pub use error::{Error, Result};
pub use logger::{LogLevel, LogRecord};
pub use model::{
    CheckInResult, GeoDb, Location, Measurement, MeasurementResult, MeasurementSpec, Measurer,
    RunType, ServiceEndpoint,
};
pub use session::{
    BootstrapInfo, CheckInRequest, Event, MeasurementInput, MeasurementRequest, Request, Session,
    SessionConfig, SubmitInfo, SubmitRequest,
};
pub use tunnel::Tunnel;
