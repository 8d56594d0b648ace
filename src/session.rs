//! The measurement session actor.
//!
//! A session owns every resource a measurement needs (store, temp dir,
//! tunnel, resolver, HTTP client, backend client) and sequences the steps
//! that use them. The caller talks to the session through typed messages:
//! it sends a [`Request`], the session processes it, and the outcome comes
//! back as an [`Event`].
//!
//! # Architecture
//!
//! ```text
//!                    bounded request queue
//!   caller ──send──▶ ┌──┬──┬──┬──┐ ──▶ ┌─────────────────────┐
//!                    └──┴──┴──┴──┘     │   session worker    │
//!                                      │  (one per session)  │
//!                    bounded event     │                     │
//!   caller ◀──recv── ┌──┬──┬──┬──┐ ◀── │  SessionState       │
//!                    └──┴──┴──┴──┘     │  (exclusively owned)│
//!                                      └─────────────────────┘
//! ```
//!
//! The worker processes exactly one request at a time, in arrival order.
//! There is no internal concurrency and therefore no locking around the
//! session state; the handlers perform blocking I/O and a lock held across
//! that I/O is precisely the hazard this design avoids. Callers wanting
//! parallel measurements hold multiple independent sessions.
//!
//! # Event Delivery
//!
//! Two delivery policies share the one event queue, so ordering between
//! the two kinds of event is preserved:
//!
//! | Events | Policy |
//! |--------|--------|
//! | [`Event::Log`], [`Event::Progress`] | best-effort: dropped with a warning when the consumer is slow |
//! | terminal results | guaranteed: the worker blocks until the consumer takes them |
//!
//! A slow UI can lose heartbeats; it can never lose a measurement result.
//!
//! # Request Lifecycle
//!
//! Every request except [`Request::Bootstrap`] requires a bootstrapped
//! session and fails with
//! [`Error::NotBootstrapped`](crate::Error::NotBootstrapped) otherwise. A
//! failed request never poisons the session: the error travels inside the
//! terminal event and the next request proceeds normally.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netprobe_rs::session::{Event, Request, Session, SessionConfig};
//! use netprobe_rs::bootstrap::BootstrapRequest;
//! # use netprobe_rs::model::{Measurement, MeasurementSpec, Measurer};
//! # use tokio_util::sync::CancellationToken;
//! # struct NoopMeasurer;
//! # #[async_trait::async_trait]
//! # impl Measurer for NoopMeasurer {
//! #     async fn run(&self, _t: CancellationToken, _s: MeasurementSpec)
//! #         -> netprobe_rs::Result<Measurement> { unimplemented!() }
//! # }
//!
//! # async fn example() -> netprobe_rs::Result<()> {
//! let session = Session::new(SessionConfig {
//!     measurer: Arc::new(NoopMeasurer),
//!     geodb: None,
//! });
//! let token = CancellationToken::new();
//! session.send(&token, Request::Bootstrap(BootstrapRequest {
//!     software_name: "netprobe-example".to_string(),
//!     software_version: "0.1.0".to_string(),
//!     ..Default::default()
//! })).await?;
//! loop {
//!     match session.recv(&token).await? {
//!         Event::Bootstrap(result) => { result?; break }
//!         _ => continue, // logs and progress
//!     }
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::{BootstrapRequest, SessionState};
use crate::error::{Error, Result};
use crate::geolocate::Geolocator;
use crate::logger::{LogRecord, SessionLogger};
use crate::model::{
    CheckInConfig, CheckInConfigWebConnectivity, CheckInResult, GeoDb, Location, Measurement,
    MeasurementResult, MeasurementSpec, Measurer, RunType, StubGeoDb,
};
use crate::ticker::{Ticker, TickerEvent};

/// Capacity of the request queue.
const REQUEST_QUEUE: usize = 16;

/// Capacity of the event queue. Sized so that a consumer draining at a
/// normal pace never sees drops.
const EVENT_QUEUE: usize = 128;

/// A request sent by the caller to the session.
#[derive(Clone, Debug)]
pub enum Request {
    /// Create the session state; must come first and succeed once.
    Bootstrap(BootstrapRequest),
    /// Resolve the probe's network location.
    Geolocate,
    /// Fetch a work assignment from the backend.
    CheckIn(CheckInRequest),
    /// Submit a measurement to the backend.
    Submit(SubmitRequest),
    /// Run one measurement through the measurer capability.
    RunMeasurement(MeasurementRequest),
}

/// Asks the backend for a work assignment.
#[derive(Clone, Debug, Default)]
pub struct CheckInRequest {
    /// Whether the device is charging.
    pub charging: bool,
    /// Whether the device is on wifi.
    pub on_wifi: bool,
    /// The declared run type.
    pub run_type: RunType,
    /// Category codes to select web-connectivity inputs from.
    pub category_codes: Vec<String>,
}

/// Asks the session to submit a measurement.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// The measurement to submit.
    pub measurement: Measurement,
}

/// Selects the input of a measurement.
#[derive(Clone, Debug, Default)]
pub enum MeasurementInput {
    /// The experiment takes no input.
    #[default]
    None,
    /// An explicit caller-chosen input.
    Url(String),
    /// The i-th URL of the cached check-in assignment. Requires a prior
    /// successful check-in.
    CheckInUrl(usize),
}

/// Asks the session to run one measurement.
#[derive(Clone, Debug, Default)]
pub struct MeasurementRequest {
    /// Name of the experiment to run.
    pub test_name: String,
    /// The input to measure.
    pub input: MeasurementInput,
    /// Opaque experiment options forwarded to the measurer.
    pub options: HashMap<String, serde_json::Value>,
}

/// What a successful bootstrap looks like from the outside.
#[derive(Clone, Debug)]
pub struct BootstrapInfo {
    /// The user-agent string the session sends to the backend.
    pub user_agent: String,
    /// How long the tunnel took to bootstrap; zero without a tunnel.
    pub tunnel_bootstrap_time: Duration,
}

/// What a successful submission looks like from the outside.
#[derive(Clone, Debug)]
pub struct SubmitInfo {
    /// The report the measurement was attached to.
    pub report_id: String,
}

/// An event emitted by the session to the caller.
///
/// Exactly one variant per request kind carries that request's terminal
/// result; [`Event::Log`] and [`Event::Progress`] are interleaved
/// best-effort while requests execute.
#[derive(Debug)]
pub enum Event {
    /// A log line from the session.
    Log(LogRecord),
    /// A heartbeat for the request in flight.
    Progress(TickerEvent),
    /// Terminal result of a bootstrap request.
    Bootstrap(Result<BootstrapInfo>),
    /// Terminal result of a geolocate request.
    Geolocate(Result<Location>),
    /// Terminal result of a check-in request.
    CheckIn(Result<CheckInResult>),
    /// Terminal result of a submit request.
    Submit(Result<SubmitInfo>),
    /// Terminal result of a run-measurement request.
    Measurement(Result<MeasurementResult>),
}

/// Configuration for [`Session::new`].
pub struct SessionConfig {
    /// Runs the measurements this session is asked to perform.
    pub measurer: Arc<dyn Measurer>,
    /// ASN lookups for geolocation; a stub resolving nothing is used
    /// when absent.
    pub geodb: Option<Arc<dyn GeoDb>>,
}

/// A request travelling to the worker together with its caller's token,
/// so cancellation reaches the handler and not just the enqueue.
struct Envelope {
    token: CancellationToken,
    request: Request,
}

/// A measurement session.
///
/// See the [module docs](self) for the messaging contract.
pub struct Session {
    request_tx: mpsc::Sender<Envelope>,
    event_rx: tokio::sync::Mutex<mpsc::Receiver<Event>>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl Session {
    /// Creates the session and spawns its worker.
    ///
    /// The session is idle until the caller sends a
    /// [`Request::Bootstrap`].
    pub fn new(config: SessionConfig) -> Self {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let shutdown = CancellationToken::new();
        let actor = Actor {
            logger: SessionLogger::new(event_tx.clone(), false),
            event_tx,
            measurer: config.measurer,
            geodb: config.geodb.unwrap_or_else(|| Arc::new(StubGeoDb)),
            state: None,
            shutdown: shutdown.clone(),
        };
        let worker = tokio::spawn(worker_loop(actor, request_rx, shutdown.clone()));
        Self {
            request_tx,
            event_rx: tokio::sync::Mutex::new(event_rx),
            worker: std::sync::Mutex::new(Some(worker)),
            shutdown,
            closed: AtomicBool::new(false),
        }
    }

    /// Enqueues a request for the worker.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SessionTerminated`] after [`close`](Session::close)
    /// and [`Error::Cancelled`] when `token` fires before the enqueue
    /// succeeds.
    pub async fn send(&self, token: &CancellationToken, request: Request) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::SessionTerminated);
        }
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let envelope = Envelope {
            token: token.clone(),
            request,
        };
        tokio::select! {
            sent = self.request_tx.send(envelope) => {
                sent.map_err(|_| Error::SessionTerminated)
            }
            _ = token.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Dequeues the next event.
    ///
    /// Events arrive in the order the worker emitted them. After
    /// [`close`](Session::close), already-emitted events keep draining;
    /// once the queue is empty this returns
    /// [`Error::SessionTerminated`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] when `token` fires before an event
    /// arrives.
    pub async fn recv(&self, token: &CancellationToken) -> Result<Event> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut event_rx = self.event_rx.lock().await;
        tokio::select! {
            event = event_rx.recv() => event.ok_or(Error::SessionTerminated),
            _ = token.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Stops the worker and releases the session state.
    ///
    /// Waits for the request in flight, if any, to finish. Idempotent:
    /// the resources are released exactly once and repeated calls are
    /// no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

/// Drains the request queue until shutdown, then releases the state.
async fn worker_loop(
    mut actor: Actor,
    mut request_rx: mpsc::Receiver<Envelope>,
    shutdown: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = shutdown.cancelled() => break,
            envelope = request_rx.recv() => match envelope {
                Some(envelope) => envelope,
                // every Session handle is gone
                None => break,
            },
        };
        actor.handle(envelope).await;
    }
    if let Some(mut state) = actor.state.take() {
        state.cleanup(&actor.logger).await;
    }
}

/// The worker-side half of a session: the state and its handlers.
struct Actor {
    event_tx: mpsc::Sender<Event>,
    logger: SessionLogger,
    measurer: Arc<dyn Measurer>,
    geodb: Arc<dyn GeoDb>,
    state: Option<SessionState>,
    shutdown: CancellationToken,
}

impl Actor {
    async fn handle(&mut self, envelope: Envelope) {
        let Envelope { token, request } = envelope;
        let event = if token.is_cancelled() {
            // short-circuit before the handler performs any I/O
            match request {
                Request::Bootstrap(_) => Event::Bootstrap(Err(Error::Cancelled)),
                Request::Geolocate => Event::Geolocate(Err(Error::Cancelled)),
                Request::CheckIn(_) => Event::CheckIn(Err(Error::Cancelled)),
                Request::Submit(_) => Event::Submit(Err(Error::Cancelled)),
                Request::RunMeasurement(_) => Event::Measurement(Err(Error::Cancelled)),
            }
        } else {
            match request {
                Request::Bootstrap(req) => {
                    Event::Bootstrap(self.bootstrap(&token, req).await)
                }
                Request::Geolocate => Event::Geolocate(self.geolocate(&token).await),
                Request::CheckIn(req) => Event::CheckIn(self.check_in(&token, req).await),
                Request::Submit(req) => Event::Submit(self.submit(&token, req).await),
                Request::RunMeasurement(req) => {
                    Event::Measurement(self.run_measurement(&token, req).await)
                }
            }
        };
        // terminal results use the guaranteed path: block rather than
        // drop, so a slow consumer delays but never loses them; a
        // session being closed stops waiting for its consumer
        tokio::select! {
            sent = self.event_tx.send(event) => { let _ = sent; }
            _ = self.shutdown.cancelled() => {}
        }
    }

    async fn bootstrap(
        &mut self,
        token: &CancellationToken,
        req: BootstrapRequest,
    ) -> Result<BootstrapInfo> {
        if self.state.is_some() {
            return Err(Error::AlreadyBootstrapped);
        }
        self.logger = SessionLogger::new(self.event_tx.clone(), req.verbose);
        let ticker = Ticker::start(self.event_tx.clone(), "bootstrap");
        let result = SessionState::bootstrap(token, &req, &self.logger).await;
        ticker.stop();
        let state = result?;
        let info = BootstrapInfo {
            user_agent: state.user_agent.clone(),
            tunnel_bootstrap_time: state.tunnel.bootstrap_time(),
        };
        self.state = Some(state);
        Ok(info)
    }

    async fn geolocate(&mut self, token: &CancellationToken) -> Result<Location> {
        let state = self.state.as_mut().ok_or(Error::NotBootstrapped)?;
        let geolocator = Geolocator::new(
            state.http.clone(),
            state.resolver.clone(),
            self.geodb.clone(),
            self.logger.clone(),
        );
        let ticker = Ticker::start(self.event_tx.clone(), "geolocate");
        let result = geolocator.lookup(token).await;
        ticker.stop();
        let location = result?;
        self.logger.info(&format!(
            "geolocate: {} in {} ({})",
            location.probe_ip,
            location.probe_cc,
            location.probe_asn_string()
        ));
        // cached for later check-in and measurement metadata
        state.location = Some(location.clone());
        Ok(location)
    }

    async fn check_in(
        &mut self,
        token: &CancellationToken,
        req: CheckInRequest,
    ) -> Result<CheckInResult> {
        let state = self.state.as_mut().ok_or(Error::NotBootstrapped)?;
        let location = state.location.as_ref().ok_or(Error::NoLocation)?;
        let config = CheckInConfig {
            charging: req.charging,
            on_wifi: req.on_wifi,
            platform: crate::model::platform_name().to_string(),
            probe_asn: location.probe_asn_string(),
            probe_cc: location.probe_cc.clone(),
            run_type: req.run_type,
            software_name: state.software_name.clone(),
            software_version: state.software_version.clone(),
            web_connectivity: CheckInConfigWebConnectivity {
                category_codes: req.category_codes,
            },
        };
        let ticker = Ticker::start(self.event_tx.clone(), "check-in");
        let result = state.backend.check_in(token, &config).await;
        ticker.stop();
        let check_in = result?;
        state.check_in = Some(check_in.clone());
        Ok(check_in)
    }

    async fn submit(
        &mut self,
        token: &CancellationToken,
        req: SubmitRequest,
    ) -> Result<SubmitInfo> {
        let state = self.state.as_ref().ok_or(Error::NotBootstrapped)?;
        let ticker = Ticker::start(self.event_tx.clone(), "submit");
        let result = state.backend.submit_measurement(token, &req.measurement).await;
        ticker.stop();
        Ok(SubmitInfo { report_id: result? })
    }

    async fn run_measurement(
        &mut self,
        token: &CancellationToken,
        req: MeasurementRequest,
    ) -> Result<MeasurementResult> {
        let state = self.state.as_mut().ok_or(Error::NotBootstrapped)?;
        let (input, report_id) = match &req.input {
            MeasurementInput::None => (String::new(), String::new()),
            MeasurementInput::Url(url) => (url.clone(), String::new()),
            MeasurementInput::CheckInUrl(index) => {
                let check_in = state.check_in.as_ref().ok_or(Error::NoCheckIn)?;
                let assignment = check_in
                    .tests
                    .web_connectivity
                    .as_ref()
                    .ok_or(Error::NoCheckIn)?;
                let url = assignment.urls.get(*index).ok_or_else(|| {
                    Error::InvalidRequest(format!(
                        "check-in assigned {} URLs, index {} is out of range",
                        assignment.urls.len(),
                        index
                    ))
                })?;
                (url.url.clone(), assignment.report_id.clone())
            }
        };
        // location is best-effort here: a measurement without a prior
        // geolocate keeps the ZZ/AS0 defaults
        let location = state.location.clone().unwrap_or_default();
        let sent_before = state.counter.bytes_sent();
        let received_before = state.counter.bytes_received();

        self.logger.info(&format!(
            "measurement: running {} against {:?}",
            req.test_name, input
        ));
        let spec = MeasurementSpec {
            test_name: req.test_name,
            input: input.clone(),
            options: req.options,
        };
        let ticker = Ticker::start(self.event_tx.clone(), "measurement");
        let result = self.measurer.run(token.clone(), spec).await;
        ticker.stop();
        let mut measurement = result?;

        measurement.input = input;
        measurement.probe_asn = location.probe_asn_string();
        measurement.probe_cc = location.probe_cc.clone();
        measurement.software_name = state.software_name.clone();
        measurement.software_version = state.software_version.clone();
        if measurement.report_id.is_empty() {
            measurement.report_id = report_id;
        }
        Ok(MeasurementResult {
            kibi_bytes_sent: (state.counter.bytes_sent() - sent_before) as f64 / 1024.0,
            kibi_bytes_received: (state.counter.bytes_received() - received_before) as f64
                / 1024.0,
            measurement,
        })
    }
}
