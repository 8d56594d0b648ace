//! Shared data types and capability traits.
//!
//! This module defines the data carried across the session boundary: the
//! probe [`Location`], the check-in request/response types, the
//! [`Measurement`] record, and the capability traits the session consumes
//! without implementing:
//!
//! - [`Measurer`]: runs a named experiment against an input and produces a
//!   measurement. The session invokes it and carries its result; the
//!   measurement algorithms themselves live behind this seam.
//! - [`GeoDb`]: resolves an IP address to ASN and network name. Typically
//!   backed by an MMDB snapshot; the session treats it as opaque.
//!
//! # See Also
//!
//! - [`crate::session`] - The actor that moves these types around
//! - [`crate::backend`] - The client speaking the check-in/submit API

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Engine name used in user-agent strings and measurement metadata.
pub const ENGINE_NAME: &str = "netprobe-engine";

/// Engine version string.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the operating system platform name.
pub fn platform_name() -> &'static str {
    if cfg!(target_os = "android") {
        "android"
    } else if cfg!(target_os = "ios") {
        "ios"
    } else if cfg!(target_os = "linux") {
        "linux"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "unknown"
    }
}

/// Country code used when geolocation could not resolve one.
pub const DEFAULT_PROBE_CC: &str = "ZZ";

/// ASN used when geolocation could not resolve one.
pub const DEFAULT_PROBE_ASN: u32 = 0;

/// The resolved network location of the probe.
///
/// Unknown fields keep their defaults (`ZZ` country, zero ASN) rather than
/// failing the lookup, so a partially censored network still yields a
/// usable location.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Location {
    /// The probe's public IP address.
    pub probe_ip: String,
    /// The probe's autonomous system number.
    pub probe_asn: u32,
    /// The probe's two-letter country code.
    pub probe_cc: String,
    /// The name of the network owning [`probe_asn`](Self::probe_asn).
    pub probe_network_name: String,
    /// The IP address of the probe's DNS resolver.
    pub resolver_ip: String,
    /// The ASN of the probe's DNS resolver.
    pub resolver_asn: u32,
    /// The name of the network owning the resolver's ASN.
    pub resolver_network_name: String,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            probe_ip: "127.0.0.1".to_string(),
            probe_asn: DEFAULT_PROBE_ASN,
            probe_cc: DEFAULT_PROBE_CC.to_string(),
            probe_network_name: String::new(),
            resolver_ip: String::new(),
            resolver_asn: DEFAULT_PROBE_ASN,
            resolver_network_name: String::new(),
        }
    }
}

impl Location {
    /// Returns the probe ASN formatted as `AS<number>`.
    pub fn probe_asn_string(&self) -> String {
        format!("AS{}", self.probe_asn)
    }

    /// Returns the resolver ASN formatted as `AS<number>`.
    pub fn resolver_asn_string(&self) -> String {
        format!("AS{}", self.resolver_asn)
    }
}

/// A backend service endpoint.
///
/// The `kind` selects the transport: `https` endpoints are contacted
/// directly, `cloudfront` endpoints are domain-fronted through `front`,
/// and `onion` endpoints require a tor tunnel.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceEndpoint {
    /// Base URL of the service.
    pub address: String,
    /// Transport type: `https`, `cloudfront`, or `onion`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Front domain for `cloudfront` endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub front: Option<String>,
}

/// Test helpers by name, as returned by the backend.
pub type TestHelpersMap = HashMap<String, Vec<ServiceEndpoint>>;

/// The run type declared to the check-in API.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    /// An automated, scheduled run.
    #[default]
    Timed,
    /// A run started manually by the operator.
    Manual,
}

/// Configuration for the check-in API call.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckInConfig {
    /// Whether the device is charging.
    pub charging: bool,
    /// Whether the device is on wifi.
    pub on_wifi: bool,
    /// Platform name, e.g. `linux`.
    pub platform: String,
    /// Probe ASN as `AS<number>`.
    pub probe_asn: String,
    /// Probe country code.
    pub probe_cc: String,
    /// The declared run type.
    pub run_type: RunType,
    /// Software name of the embedding application.
    pub software_name: String,
    /// Software version of the embedding application.
    pub software_version: String,
    /// Web-connectivity specific options.
    pub web_connectivity: CheckInConfigWebConnectivity,
}

/// Web-connectivity options within [`CheckInConfig`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CheckInConfigWebConnectivity {
    /// Category codes to select test inputs from.
    pub category_codes: Vec<String>,
}

/// A URL to measure, as assigned by the check-in API.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct UrlInfo {
    /// The category code of this URL.
    pub category_code: String,
    /// The country code this URL was selected for.
    pub country_code: String,
    /// The URL itself.
    pub url: String,
}

/// The work assignment returned by the check-in API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckInResult {
    /// Probe ASN echoed by the backend.
    #[serde(default)]
    pub probe_asn: String,
    /// Probe country code echoed by the backend.
    #[serde(default)]
    pub probe_cc: String,
    /// Backend UTC time.
    pub utc_time: DateTime<Utc>,
    /// Per-test assignments.
    #[serde(default)]
    pub tests: CheckInResultTests,
    /// Test helpers by name.
    #[serde(default)]
    pub conf: CheckInResultConf,
}

/// The `conf` section of a check-in response.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CheckInResultConf {
    /// Test helpers by name.
    #[serde(default)]
    pub test_helpers: TestHelpersMap,
}

/// The per-test section of a check-in response.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct CheckInResultTests {
    /// Web-connectivity assignment, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_connectivity: Option<CheckInResultWebConnectivity>,
}

/// The web-connectivity section of a check-in response.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CheckInResultWebConnectivity {
    /// The report ID to attach measurements to.
    pub report_id: String,
    /// The URLs to measure.
    #[serde(default)]
    pub urls: Vec<UrlInfo>,
}

/// A single measurement record.
///
/// The metadata fields are stamped by the session from its cached location
/// and check-in state; `test_keys` is the experiment-specific payload and
/// stays opaque to the engine.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Measurement {
    /// Extra key-value annotations.
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    /// Data format version understood by the backend.
    pub data_format_version: String,
    /// The measured input, usually a URL.
    #[serde(default)]
    pub input: String,
    /// When the measurement started, UTC.
    pub measurement_start_time: DateTime<Utc>,
    /// Probe ASN as `AS<number>`.
    pub probe_asn: String,
    /// Probe country code.
    pub probe_cc: String,
    /// The report this measurement belongs to, when known.
    #[serde(default)]
    pub report_id: String,
    /// Software name of the embedding application.
    pub software_name: String,
    /// Software version of the embedding application.
    pub software_version: String,
    /// Experiment-specific results.
    pub test_keys: serde_json::Value,
    /// Name of the experiment that produced this measurement.
    pub test_name: String,
    /// Experiment runtime in seconds.
    pub test_runtime: f64,
    /// When the test series started, UTC.
    pub test_start_time: DateTime<Utc>,
    /// Version of the experiment.
    pub test_version: String,
}

/// The data format version we produce.
pub const DATA_FORMAT_VERSION: &str = "0.2.0";

impl Measurement {
    /// Creates a measurement skeleton for `test_name` with metadata
    /// defaults and empty test keys.
    pub fn new(test_name: &str, test_version: &str) -> Self {
        let now = Utc::now();
        Self {
            annotations: HashMap::new(),
            data_format_version: DATA_FORMAT_VERSION.to_string(),
            input: String::new(),
            measurement_start_time: now,
            probe_asn: format!("AS{}", DEFAULT_PROBE_ASN),
            probe_cc: DEFAULT_PROBE_CC.to_string(),
            report_id: String::new(),
            software_name: String::new(),
            software_version: String::new(),
            test_keys: serde_json::Value::Null,
            test_name: test_name.to_string(),
            test_runtime: 0.0,
            test_start_time: now,
            test_version: test_version.to_string(),
        }
    }
}

/// What to measure: the payload of a run-measurement request after the
/// session resolved the input against its cached check-in state.
#[derive(Clone, Debug)]
pub struct MeasurementSpec {
    /// Name of the experiment to run.
    pub test_name: String,
    /// The input to measure, possibly empty for input-less experiments.
    pub input: String,
    /// Opaque experiment options.
    pub options: HashMap<String, serde_json::Value>,
}

/// The outcome of running one measurement.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MeasurementResult {
    /// KiB received by the session while measuring.
    pub kibi_bytes_received: f64,
    /// KiB sent by the session while measuring.
    pub kibi_bytes_sent: f64,
    /// The measurement itself.
    pub measurement: Measurement,
}

/// Runs a named experiment against an input and produces a measurement.
///
/// The session invokes this capability from its run-measurement handler
/// and never looks inside: implementations own the measurement algorithms,
/// their network traffic, and their test keys. Implementations should
/// return early with [`crate::Error::Cancelled`] when the token fires.
#[async_trait]
pub trait Measurer: Send + Sync {
    /// Runs the experiment described by `spec`.
    async fn run(&self, token: CancellationToken, spec: MeasurementSpec) -> Result<Measurement>;
}

/// Resolves an IP address to autonomous-system metadata.
///
/// Typically backed by an MMDB snapshot shipped with the application. The
/// session consumes this as an opaque capability; [`StubGeoDb`] is the
/// default when the application provides none.
pub trait GeoDb: Send + Sync {
    /// Returns the `(asn, network_name)` owning `ip`.
    fn lookup_asn(&self, ip: &str) -> Result<(u32, String)>;
}

/// A [`GeoDb`] that resolves nothing.
///
/// Returns the zero ASN and an empty network name for every address, which
/// keeps geolocation usable when no database is wired in.
#[derive(Debug, Default)]
pub struct StubGeoDb;

impl GeoDb for StubGeoDb {
    fn lookup_asn(&self, _ip: &str) -> Result<(u32, String)> {
        Ok((DEFAULT_PROBE_ASN, String::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_defaults() {
        let loc = Location::default();
        assert_eq!(loc.probe_cc, "ZZ");
        assert_eq!(loc.probe_asn, 0);
        assert_eq!(loc.probe_asn_string(), "AS0");
    }

    #[test]
    fn test_service_endpoint_serde_type_field() {
        let ep = ServiceEndpoint {
            address: "https://api.example.org".to_string(),
            kind: "https".to_string(),
            front: None,
        };
        let json = serde_json::to_string(&ep).unwrap();
        assert!(json.contains("\"type\":\"https\""));
        assert!(!json.contains("front"));
        let back: ServiceEndpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ep);
    }

    #[test]
    fn test_run_type_serialization() {
        assert_eq!(
            serde_json::to_string(&RunType::Timed).unwrap(),
            "\"timed\""
        );
        assert_eq!(
            serde_json::to_string(&RunType::Manual).unwrap(),
            "\"manual\""
        );
    }

    #[test]
    fn test_measurement_skeleton() {
        let m = Measurement::new("web_connectivity", "0.5.0");
        assert_eq!(m.data_format_version, DATA_FORMAT_VERSION);
        assert_eq!(m.test_name, "web_connectivity");
        assert_eq!(m.probe_cc, "ZZ");
        assert!(m.report_id.is_empty());
    }

    #[test]
    fn test_stub_geodb() {
        let db = StubGeoDb;
        let (asn, name) = db.lookup_asn("8.8.8.8").unwrap();
        assert_eq!(asn, 0);
        assert!(name.is_empty());
    }
}
