//! netprobe-rs CLI application entry point.
//!
//! This binary drives one full measurement session: it bootstraps the
//! session, geolocates the probe, fetches a work assignment (unless
//! explicit inputs were given), runs the measurements, and submits the
//! results.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐       ┌─────────────────┐
//!   │ --generate_config────▶  │ Write default   │────▶ Exit
//!   │    specified?   │       │ config & exit   │
//!   └────────┬────────┘       └─────────────────┘
//!            │ No
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │ ◄── Set up tracing subscriber
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Run the session │ ◄── bootstrap → geolocate → check-in
//!   │                 │     → measure → submit
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │  Exit with      │
//!   │  status code    │
//!   └─────────────────┘
//! ```
//!
//! # Usage Examples
//!
//! ```bash
//! # Measure the check-in assignment over direct egress
//! netprobe-rs
//!
//! # Measure explicit inputs without submitting
//! netprobe-rs -i https://example.com/ -n
//!
//! # Measure through a tor tunnel the probe starts itself
//! netprobe-rs --proxy tor://
//!
//! # Snowflake rendezvous over the AMP cache
//! netprobe-rs --proxy tor+snowflake:// --snowflake-rendezvous amp
//!
//! # Generate default configuration file
//! netprobe-rs --generate_config netprobe.conf
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error (see stderr for details) |
//!
//! # Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `NETPROBE_STATE_DIR` | State directory (equivalent to `--state-dir`) |
//! | `NETPROBE_CONFIG` | Config file path (equivalent to `--config`) |
//!
//! # See Also
//!
//! - [`CliArgs`](netprobe_rs::config::CliArgs) - Command-line argument definitions
//! - [`Session`](netprobe_rs::session::Session) - The engine this binary drives

use std::collections::HashMap;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use netprobe_rs::bootstrap::BootstrapRequest;
use netprobe_rs::config::{self, CliArgs, Config};
use netprobe_rs::logger;
use netprobe_rs::model::{Measurement, MeasurementSpec, Measurer};
use netprobe_rs::session::{
    CheckInRequest, Event, MeasurementInput, MeasurementRequest, Request, Session, SessionConfig,
    SubmitRequest,
};
use netprobe_rs::{Error, Result};

/// Software name this binary declares to the backend.
const SOFTWARE_NAME: &str = "netprobe-cli";

/// Software version this binary declares to the backend.
const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let args = CliArgs::parse();

    // Handle --generate_config
    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(());
    }

    let config = config::load_config(&args)?;
    let _guard = logger::init(config.loglevel, config.logfile.as_deref())?;

    tracing::info!("{} {} starting", SOFTWARE_NAME, SOFTWARE_VERSION);

    // the operator can cancel at any point with ctrl-c
    let token = CancellationToken::new();
    let signal_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted: cancelling the session");
            signal_token.cancel();
        }
    });

    let session = Session::new(SessionConfig {
        measurer: Arc::new(HttpReachabilityMeasurer),
        geodb: None,
    });
    let outcome = drive(&session, &token, &config, args.verbose).await;
    session.close().await;
    outcome
}

/// Runs the full measurement flow on an open session.
async fn drive(
    session: &Session,
    token: &CancellationToken,
    config: &Config,
    verbose: bool,
) -> Result<()> {
    let bootstrap = BootstrapRequest {
        software_name: SOFTWARE_NAME.to_string(),
        software_version: SOFTWARE_VERSION.to_string(),
        state_dir: config.state_dir.clone(),
        temp_dir: config.temp_dir.clone(),
        tunnel_dir: config.tunnel_dir.clone(),
        proxy_url: config.proxy.clone(),
        backend_url: config.backend_url.clone(),
        tor_binary: config.tor_binary.clone(),
        tor_args: config.tor_args.clone(),
        snowflake_rendezvous: config.snowflake_rendezvous.clone(),
        verbose,
    };
    match transact(session, token, Request::Bootstrap(bootstrap)).await? {
        Event::Bootstrap(Ok(info)) => {
            tracing::info!("session ready as {}", info.user_agent);
            if info.tunnel_bootstrap_time > Duration::ZERO {
                tracing::info!(
                    "tunnel bootstrapped in {:.2}s",
                    info.tunnel_bootstrap_time.as_secs_f64()
                );
            }
        }
        Event::Bootstrap(Err(e)) => return Err(e),
        other => return Err(unexpected(other)),
    }

    match transact(session, token, Request::Geolocate).await? {
        Event::Geolocate(Ok(location)) => {
            tracing::info!(
                "probe is {} in {} ({})",
                location.probe_ip,
                location.probe_cc,
                location.probe_asn_string()
            );
        }
        Event::Geolocate(Err(e)) if config.inputs.is_empty() => {
            // check-in needs the location; with explicit inputs we can
            // measure anyway using the defaults
            return Err(e);
        }
        Event::Geolocate(Err(e)) => {
            tracing::warn!("geolocation failed, continuing with defaults: {}", e);
        }
        other => return Err(unexpected(other)),
    }

    let inputs: Vec<MeasurementInput> = if config.inputs.is_empty() {
        let request = CheckInRequest {
            charging: config.charging,
            on_wifi: config.on_wifi,
            category_codes: config.category_codes.clone(),
            ..Default::default()
        };
        match transact(session, token, Request::CheckIn(request)).await? {
            Event::CheckIn(Ok(result)) => {
                let assigned = result
                    .tests
                    .web_connectivity
                    .as_ref()
                    .map(|wc| wc.urls.len())
                    .unwrap_or(0);
                tracing::info!("check-in assigned {} URLs", assigned);
                (0..assigned).map(MeasurementInput::CheckInUrl).collect()
            }
            Event::CheckIn(Err(e)) => return Err(e),
            other => return Err(unexpected(other)),
        }
    } else {
        config
            .inputs
            .iter()
            .map(|input| MeasurementInput::Url(input.clone()))
            .collect()
    };

    let mut measured = 0usize;
    let mut submitted = 0usize;
    for input in inputs {
        let request = MeasurementRequest {
            test_name: config.test_name.clone(),
            input,
            options: HashMap::new(),
        };
        let result = match transact(session, token, Request::RunMeasurement(request)).await? {
            Event::Measurement(Ok(result)) => result,
            Event::Measurement(Err(Error::Cancelled)) => return Err(Error::Cancelled),
            Event::Measurement(Err(e)) => {
                tracing::warn!("measurement failed: {}", e);
                continue;
            }
            other => return Err(unexpected(other)),
        };
        measured += 1;
        tracing::info!(
            "measured {:?} ({:.1} KiB down, {:.1} KiB up)",
            result.measurement.input,
            result.kibi_bytes_received,
            result.kibi_bytes_sent
        );
        if config.no_submit {
            continue;
        }
        let submit = SubmitRequest {
            measurement: result.measurement,
        };
        match transact(session, token, Request::Submit(submit)).await? {
            Event::Submit(Ok(info)) => {
                submitted += 1;
                tracing::info!("submitted to report {}", info.report_id);
            }
            Event::Submit(Err(Error::Cancelled)) => return Err(Error::Cancelled),
            Event::Submit(Err(e)) => {
                tracing::warn!("submission failed: {}", e);
            }
            other => return Err(unexpected(other)),
        }
    }

    tracing::info!("done: {} measured, {} submitted", measured, submitted);
    Ok(())
}

/// Sends a request and waits for its terminal event, surfacing progress
/// heartbeats along the way. Log events are skipped; they already
/// reached the tracing subscriber inside the session.
async fn transact(
    session: &Session,
    token: &CancellationToken,
    request: Request,
) -> Result<Event> {
    session.send(token, request).await?;
    loop {
        match session.recv(token).await? {
            Event::Log(_) => continue,
            Event::Progress(tick) => {
                tracing::debug!("{}: {:.1}s elapsed", tick.operation, tick.elapsed_secs);
            }
            terminal => return Ok(terminal),
        }
    }
}

fn unexpected(event: Event) -> Error {
    Error::InvalidRequest(format!("unexpected terminal event: {:?}", event))
}

/// A minimal example measurer: fetches the input URL and records the
/// HTTP status or the failure string. Real deployments plug their own
/// [`Measurer`] into the session.
struct HttpReachabilityMeasurer;

#[async_trait]
impl Measurer for HttpReachabilityMeasurer {
    async fn run(&self, token: CancellationToken, spec: MeasurementSpec) -> Result<Measurement> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let begin = Instant::now();
        let mut measurement = Measurement::new(&spec.test_name, SOFTWARE_VERSION);
        if spec.input.is_empty() {
            measurement.test_keys = serde_json::json!({
                "status_code": null,
                "failure": "no input to measure",
            });
            return Ok(measurement);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let outcome = tokio::select! {
            r = client.get(&spec.input).send() => r,
            _ = token.cancelled() => return Err(Error::Cancelled),
        };
        measurement.test_keys = match outcome {
            Ok(response) => serde_json::json!({
                "status_code": response.status().as_u16(),
                "failure": null,
            }),
            Err(e) => serde_json::json!({
                "status_code": null,
                "failure": e.to_string(),
            }),
        };
        measurement.test_runtime = begin.elapsed().as_secs_f64();
        Ok(measurement)
    }
}
