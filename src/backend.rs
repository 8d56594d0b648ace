//! Backend API client.
//!
//! Speaks to the measurement backend: fetching work assignments
//! (check-in), opening reports and submitting measurements, and serving
//! the authenticated endpoints (psiphon configuration, tor targets).
//!
//! # Endpoint Binding
//!
//! The client is created with a list of candidate endpoints and binds
//! lazily: the first API call runs
//! [candidate discovery](crate::discovery) over the list and caches the
//! fastest working endpoint for the rest of the session. A single
//! caller-forced endpoint (backend URL override) skips discovery.
//!
//! Domain-fronted endpoints are rewritten at binding time: requests go
//! to the front domain while the `Host` header carries the real
//! service, so a network observer sees only CDN traffic.
//!
//! # Authentication State
//!
//! The psiphon-config and tor-targets endpoints require an account. The
//! client registers one on first use with a random password, logs in
//! for a bearer token, and persists the whole record in the session
//! key-value store under `orchestra.state`; the password is zeroized in
//! memory and redacted from debug output.
//!
//! # See Also
//!
//! - [`crate::discovery`] - Candidate measurement and selection
//! - [`crate::session`] - The handlers calling into this client

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use url::Url;
use zeroize::Zeroize;

use crate::discovery::{self, EndpointProber};
use crate::error::{Error, Result};
use crate::httpclient::SessionHttpClient;
use crate::kvstore::KeyValueStore;
use crate::logger::SessionLogger;
use crate::model::{CheckInConfig, CheckInResult, Measurement, ServiceEndpoint, TestHelpersMap};
use crate::psiphon::PsiphonConfigSource;

/// Key of the persisted authentication state record.
const STATE_KEY: &str = "orchestra.state";

/// Returns the default backend candidates, primaries first.
pub fn default_backend_endpoints() -> Vec<ServiceEndpoint> {
    vec![
        ServiceEndpoint {
            address: "https://api.netprobe.org/".to_string(),
            kind: "https".to_string(),
            front: None,
        },
        ServiceEndpoint {
            address: "https://d33d1gs9kpq1c5.cloudfront.net".to_string(),
            kind: "cloudfront".to_string(),
            front: Some("d33d1gs9kpq1c5.cloudfront.net".to_string()),
        },
    ]
}

/// A string that zeroizes its memory on drop and redacts its debug
/// output. Used for the persisted account password.
#[derive(Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret string.
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Returns the wrapped value.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns whether the secret is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret([REDACTED])")
    }
}

/// The persisted authentication state.
///
/// Round-trips through JSON in the key-value store field-for-field.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct OrchestraState {
    /// Account identifier assigned at registration.
    #[serde(default)]
    pub client_id: String,
    /// Account password generated at registration.
    #[serde(default)]
    pub password: Secret,
    /// Bearer token from the last login.
    #[serde(default)]
    pub token: String,
    /// When the token expires.
    #[serde(default)]
    pub expire: Option<DateTime<Utc>>,
}

impl OrchestraState {
    /// Returns the token when it is still valid.
    pub fn valid_token(&self) -> Option<&str> {
        if self.token.is_empty() {
            return None;
        }
        match self.expire {
            Some(expire) if expire > Utc::now() => Some(&self.token),
            _ => None,
        }
    }

    /// Returns whether we hold usable credentials.
    pub fn has_credentials(&self) -> bool {
        !self.client_id.is_empty() && !self.password.is_empty()
    }

    fn load(kvstore: &dyn KeyValueStore) -> Self {
        kvstore
            .get(STATE_KEY)
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
            .unwrap_or_default()
    }

    fn save(&self, kvstore: &dyn KeyValueStore) -> Result<()> {
        let raw = serde_json::to_vec(self)?;
        kvstore.set(STATE_KEY, &raw)
    }
}

/// A bound endpoint: where requests go and which `Host` they carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BoundEndpoint {
    base_url: Url,
    host_header: Option<String>,
}

/// Resolves an endpoint descriptor into a [`BoundEndpoint`].
///
/// # Errors
///
/// Returns [`Error::Backend`] for onion and unknown endpoint types
/// (they need transports this client does not speak) and for fronted
/// endpoints that are not plain HTTPS.
pub(crate) fn bind_endpoint(endpoint: &ServiceEndpoint) -> Result<BoundEndpoint> {
    match endpoint.kind.as_str() {
        "https" => Ok(BoundEndpoint {
            base_url: Url::parse(&endpoint.address)?,
            host_header: None,
        }),
        "cloudfront" => {
            let real = Url::parse(&endpoint.address)?;
            if real.scheme() != "https" || real.port().is_some() {
                return Err(Error::Backend(format!(
                    "unsupported cloudfront address: {}",
                    endpoint.address
                )));
            }
            let host = real
                .host_str()
                .ok_or_else(|| {
                    Error::Backend(format!("cloudfront address has no host: {}", endpoint.address))
                })?
                .to_string();
            let front = endpoint.front.as_deref().ok_or_else(|| {
                Error::Backend("cloudfront endpoint without front domain".to_string())
            })?;
            Ok(BoundEndpoint {
                base_url: Url::parse(&format!("https://{}/", front))?,
                host_header: Some(host),
            })
        }
        other => Err(Error::Backend(format!(
            "unsupported service type: {}",
            other
        ))),
    }
}

/// Configuration for [`BackendClient::new`].
pub struct BackendClientConfig {
    /// Candidate endpoints, primaries first.
    pub candidates: Vec<ServiceEndpoint>,
    /// The session HTTP client.
    pub http: Arc<SessionHttpClient>,
    /// The session key-value store, holding the authentication state.
    pub kvstore: Arc<dyn KeyValueStore>,
    /// Session logger.
    pub logger: SessionLogger,
    /// Software name declared at registration.
    pub software_name: String,
    /// Software version declared at registration.
    pub software_version: String,
}

/// The backend API client owned by a bootstrapped session.
pub struct BackendClient {
    candidates: Vec<ServiceEndpoint>,
    http: Arc<SessionHttpClient>,
    kvstore: Arc<dyn KeyValueStore>,
    logger: SessionLogger,
    software_name: String,
    software_version: String,
    bound: tokio::sync::Mutex<Option<BoundEndpoint>>,
}

#[derive(Deserialize)]
struct RegisterResponse {
    client_id: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
    expire: DateTime<Utc>,
}

#[derive(Deserialize)]
struct OpenReportResponse {
    report_id: String,
}

impl BackendClient {
    /// Creates the client. No network traffic happens until the first
    /// API call binds an endpoint.
    pub fn new(config: BackendClientConfig) -> Self {
        Self {
            candidates: config.candidates,
            http: config.http,
            kvstore: config.kvstore,
            logger: config.logger,
            software_name: config.software_name,
            software_version: config.software_version,
            bound: tokio::sync::Mutex::new(None),
        }
    }

    /// Returns the endpoint to use, running discovery on first use.
    async fn ensure_bound(&self, token: &CancellationToken) -> Result<BoundEndpoint> {
        let mut bound = self.bound.lock().await;
        if let Some(bound) = bound.as_ref() {
            return Ok(bound.clone());
        }
        // single candidate: no point measuring it against itself
        if self.candidates.len() == 1 {
            let only = bind_endpoint(&self.candidates[0])?;
            *bound = Some(only.clone());
            return Ok(only);
        }
        self.logger.info(&format!(
            "backend: discovering a usable endpoint among {} candidates",
            self.candidates.len()
        ));
        let candidates = discovery::try_all(token, &self.candidates, self).await;
        for candidate in &candidates {
            match &candidate.error {
                None => self.logger.info(&format!(
                    "backend: {} ok in {:.3}s",
                    candidate.endpoint.address,
                    candidate.duration.as_secs_f64()
                )),
                Some(e) => self.logger.warn(&format!(
                    "backend: {} failed: {}",
                    candidate.endpoint.address, e
                )),
            }
        }
        let best = discovery::select_best(&candidates)
            .ok_or_else(|| Error::Backend("all backend candidates failed".to_string()))?;
        self.logger.info(&format!(
            "backend: selected {}",
            best.endpoint.address
        ));
        let selected = bind_endpoint(&best.endpoint)?;
        *bound = Some(selected.clone());
        Ok(selected)
    }

    fn request(
        &self,
        bound: &BoundEndpoint,
        method: reqwest::Method,
        path: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let url = bound.base_url.join(path)?;
        let mut builder = self.http.request(method, url.as_str());
        if let Some(host) = &bound.host_header {
            builder = builder.header(reqwest::header::HOST, host);
        }
        Ok(builder)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &CancellationToken,
        bound: &BoundEndpoint,
        path: &str,
        bearer: Option<&str>,
    ) -> Result<T> {
        let mut builder = self.request(bound, reqwest::Method::GET, path)?;
        if let Some(bearer) = bearer {
            builder = builder.bearer_auth(bearer);
        }
        let response = self.http.execute(token, builder).await?;
        if response.status != 200 {
            return Err(Error::Backend(format!(
                "GET {} returned status {}",
                path, response.status
            )));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        token: &CancellationToken,
        bound: &BoundEndpoint,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let builder = self
            .request(bound, reqwest::Method::POST, path)?
            .json(body);
        let response = self.http.execute(token, builder).await?;
        if response.status != 200 {
            return Err(Error::Backend(format!(
                "POST {} returned status {}",
                path, response.status
            )));
        }
        Ok(serde_json::from_slice(&response.body)?)
    }

    /// Returns the test helpers known to the backend.
    pub async fn get_test_helpers(&self, token: &CancellationToken) -> Result<TestHelpersMap> {
        let bound = self.ensure_bound(token).await?;
        self.get_json(token, &bound, "api/v1/test-helpers", None)
            .await
    }

    /// Calls the check-in API and returns the work assignment.
    pub async fn check_in(
        &self,
        token: &CancellationToken,
        config: &CheckInConfig,
    ) -> Result<CheckInResult> {
        let bound = self.ensure_bound(token).await?;
        self.post_json(token, &bound, "api/v1/check-in", config)
            .await
    }

    /// Submits a measurement, opening a report when the measurement
    /// does not carry a report ID yet. Returns the report ID used.
    pub async fn submit_measurement(
        &self,
        token: &CancellationToken,
        measurement: &Measurement,
    ) -> Result<String> {
        let bound = self.ensure_bound(token).await?;
        let report_id = if measurement.report_id.is_empty() {
            self.open_report(token, &bound, measurement).await?
        } else {
            measurement.report_id.clone()
        };
        #[derive(Serialize)]
        struct SubmitRequest<'a> {
            format: &'static str,
            content: &'a Measurement,
        }
        let _: serde_json::Value = self
            .post_json(
                token,
                &bound,
                &format!("report/{}", report_id),
                &SubmitRequest {
                    format: "json",
                    content: measurement,
                },
            )
            .await?;
        Ok(report_id)
    }

    async fn open_report(
        &self,
        token: &CancellationToken,
        bound: &BoundEndpoint,
        measurement: &Measurement,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct OpenReportRequest<'a> {
            data_format_version: &'a str,
            format: &'static str,
            probe_asn: &'a str,
            probe_cc: &'a str,
            software_name: &'a str,
            software_version: &'a str,
            test_name: &'a str,
            test_start_time: &'a DateTime<Utc>,
            test_version: &'a str,
        }
        let response: OpenReportResponse = self
            .post_json(
                token,
                bound,
                "report",
                &OpenReportRequest {
                    data_format_version: &measurement.data_format_version,
                    format: "json",
                    probe_asn: &measurement.probe_asn,
                    probe_cc: &measurement.probe_cc,
                    software_name: &measurement.software_name,
                    software_version: &measurement.software_version,
                    test_name: &measurement.test_name,
                    test_start_time: &measurement.test_start_time,
                    test_version: &measurement.test_version,
                },
            )
            .await?;
        self.logger
            .info(&format!("backend: opened report {}", response.report_id));
        Ok(response.report_id)
    }

    /// Returns tor bridge targets for `country_code`. Requires login.
    pub async fn fetch_tor_targets(
        &self,
        token: &CancellationToken,
        country_code: &str,
    ) -> Result<HashMap<String, serde_json::Value>> {
        let bound = self.ensure_bound(token).await?;
        let bearer = self.maybe_login(token, &bound).await?;
        self.get_json(
            token,
            &bound,
            &format!("api/v1/test-list/tor-targets?country_code={}", country_code),
            Some(&bearer),
        )
        .await
    }

    async fn fetch_psiphon_config_impl(&self, token: &CancellationToken) -> Result<Vec<u8>> {
        let bound = self.ensure_bound(token).await?;
        let bearer = self.maybe_login(token, &bound).await?;
        let builder = self
            .request(&bound, reqwest::Method::GET, "api/v1/test-list/psiphon-config")?
            .bearer_auth(&bearer);
        let response = self.http.execute(token, builder).await?;
        if response.status != 200 {
            return Err(Error::Backend(format!(
                "psiphon config fetch returned status {}",
                response.status
            )));
        }
        Ok(response.body)
    }

    /// Ensures we hold a valid bearer token, registering and logging in
    /// as needed, and returns it.
    async fn maybe_login(
        &self,
        token: &CancellationToken,
        bound: &BoundEndpoint,
    ) -> Result<String> {
        let mut state = OrchestraState::load(self.kvstore.as_ref());
        if let Some(valid) = state.valid_token() {
            return Ok(valid.to_string());
        }
        if !state.has_credentials() {
            self.logger.info("backend: registering a new account");
            state = self.register(token, bound).await?;
            state.save(self.kvstore.as_ref())?;
        }
        self.logger.debug("backend: logging in");
        #[derive(Serialize)]
        struct LoginRequest<'a> {
            username: &'a str,
            password: &'a str,
        }
        let response: LoginResponse = self
            .post_json(
                token,
                bound,
                "api/v1/login",
                &LoginRequest {
                    username: &state.client_id,
                    password: state.password.as_str(),
                },
            )
            .await?;
        state.token = response.token.clone();
        state.expire = Some(response.expire);
        state.save(self.kvstore.as_ref())?;
        Ok(response.token)
    }

    async fn register(
        &self,
        token: &CancellationToken,
        bound: &BoundEndpoint,
    ) -> Result<OrchestraState> {
        let password: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(64)
            .map(char::from)
            .collect();
        #[derive(Serialize)]
        struct RegisterRequest<'a> {
            password: &'a str,
            platform: &'a str,
            probe_asn: &'a str,
            probe_cc: &'a str,
            software_name: &'a str,
            software_version: &'a str,
            supported_tests: Vec<&'a str>,
        }
        let response: RegisterResponse = self
            .post_json(
                token,
                bound,
                "api/v1/register",
                &RegisterRequest {
                    password: &password,
                    platform: crate::model::platform_name(),
                    probe_asn: "AS0",
                    probe_cc: "ZZ",
                    software_name: &self.software_name,
                    software_version: &self.software_version,
                    supported_tests: vec!["web_connectivity"],
                },
            )
            .await?;
        Ok(OrchestraState {
            client_id: response.client_id,
            password: Secret::new(password),
            token: String::new(),
            expire: None,
        })
    }
}

#[async_trait]
impl EndpointProber for BackendClient {
    async fn probe(
        &self,
        token: &CancellationToken,
        endpoint: &ServiceEndpoint,
    ) -> Result<TestHelpersMap> {
        let bound = bind_endpoint(endpoint)?;
        self.get_json(token, &bound, "api/v1/test-helpers", None)
            .await
    }
}

#[async_trait]
impl PsiphonConfigSource for BackendClient {
    async fn fetch_psiphon_config(&self, token: &CancellationToken) -> Result<Vec<u8>> {
        self.fetch_psiphon_config_impl(token).await
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::Mutex;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use super::*;
    use crate::bytecounter::ByteCounter;
    use crate::httpclient::HttpClientConfig;
    use crate::kvstore::MemoryStore;
    use crate::model::CheckInConfigWebConnectivity;

    /// One request seen by the stub backend.
    #[derive(Clone, Debug)]
    struct SeenRequest {
        method: String,
        path: String,
        bearer: Option<String>,
    }

    /// A local stub backend speaking just enough HTTP for the API
    /// surface under test.
    struct StubBackend {
        addr: SocketAddr,
        seen: Arc<Mutex<Vec<SeenRequest>>>,
    }

    impl StubBackend {
        async fn spawn() -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let seen: Arc<Mutex<Vec<SeenRequest>>> = Arc::new(Mutex::new(Vec::new()));
            let accepted = seen.clone();
            tokio::spawn(async move {
                loop {
                    let (stream, _) = match listener.accept().await {
                        Ok(accepted) => accepted,
                        Err(_) => return,
                    };
                    let seen = accepted.clone();
                    tokio::spawn(async move {
                        let _ = serve_one(stream, seen).await;
                    });
                }
            });
            Self { addr, seen }
        }

        fn seen(&self) -> Vec<SeenRequest> {
            self.seen.lock().unwrap().clone()
        }

        fn endpoint(&self) -> ServiceEndpoint {
            ServiceEndpoint {
                address: format!("http://{}/", self.addr),
                kind: "https".to_string(),
                front: None,
            }
        }
    }

    async fn serve_one(
        mut stream: TcpStream,
        seen: Arc<Mutex<Vec<SeenRequest>>>,
    ) -> std::io::Result<()> {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        let header_end = loop {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            raw.extend_from_slice(&buf[..n]);
            if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
        let mut content_length = 0usize;
        let mut bearer = None;
        for line in head.lines().skip(1) {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => content_length = value.parse().unwrap_or(0),
                "authorization" => {
                    bearer = value.strip_prefix("Bearer ").map(|t| t.to_string());
                }
                _ => {}
            }
        }
        while raw.len() < header_end + content_length {
            let n = stream.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            raw.extend_from_slice(&buf[..n]);
        }
        let request_line = head.lines().next().unwrap_or_default();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();
        seen.lock().unwrap().push(SeenRequest {
            method: method.clone(),
            path: path.clone(),
            bearer: bearer.clone(),
        });

        let authed = bearer.as_deref() == Some("tok-1");
        let (status, body) = match (method.as_str(), path.as_str()) {
            ("GET", "/api/v1/test-helpers") => (
                200,
                r#"{"web-connectivity":[{"address":"https://th.example.org/","type":"https"}]}"#
                    .to_string(),
            ),
            ("POST", "/api/v1/check-in") => (
                200,
                concat!(
                    r#"{"probe_asn":"AS30722","probe_cc":"IT","#,
                    r#""utc_time":"2026-01-01T00:00:00Z","#,
                    r#""tests":{"web_connectivity":{"report_id":"rpt-1","#,
                    r#""urls":[{"category_code":"NEWS","country_code":"IT","#,
                    r#""url":"https://example.com/"}]}},"#,
                    r#""conf":{"test_helpers":{}}}"#,
                )
                .to_string(),
            ),
            ("POST", "/report") => (200, r#"{"report_id":"rpt-stub"}"#.to_string()),
            ("POST", _) if path.starts_with("/report/") => (200, "{}".to_string()),
            ("POST", "/api/v1/register") => (200, r#"{"client_id":"clnt-1"}"#.to_string()),
            ("POST", "/api/v1/login") => {
                let expire = Utc::now() + chrono::Duration::hours(1);
                (
                    200,
                    format!(r#"{{"token":"tok-1","expire":"{}"}}"#, expire.to_rfc3339()),
                )
            }
            ("GET", "/api/v1/test-list/psiphon-config") if authed => {
                (200, r#"{"psiphon":true}"#.to_string())
            }
            ("GET", _) if path.starts_with("/api/v1/test-list/tor-targets") && authed => {
                (200, r#"{"dirauth":{"address":"128.31.0.39:9131"}}"#.to_string())
            }
            _ if !authed && path.starts_with("/api/v1/test-list/") => {
                (401, r#"{"error":"unauthorized"}"#.to_string())
            }
            _ => (404, r#"{"error":"not found"}"#.to_string()),
        };
        let response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        stream.write_all(response.as_bytes()).await?;
        stream.shutdown().await
    }

    fn newclient(stub: &StubBackend, kvstore: Arc<dyn KeyValueStore>) -> BackendClient {
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let http = Arc::new(
            SessionHttpClient::new(HttpClientConfig {
                counter: Arc::new(ByteCounter::new()),
                proxy_url: None,
                user_agent: "netprobe-tests/0.1.0".to_string(),
            })
            .unwrap(),
        );
        BackendClient::new(BackendClientConfig {
            candidates: vec![stub.endpoint()],
            http,
            kvstore,
            logger: SessionLogger::new(tx, false),
            software_name: "netprobe-tests".to_string(),
            software_version: "0.1.0".to_string(),
        })
    }

    #[tokio::test]
    async fn test_check_in_roundtrip() {
        let stub = StubBackend::spawn().await;
        let client = newclient(&stub, Arc::new(MemoryStore::new()));
        let token = CancellationToken::new();
        let config = CheckInConfig {
            charging: true,
            on_wifi: true,
            platform: "linux".to_string(),
            probe_asn: "AS30722".to_string(),
            probe_cc: "IT".to_string(),
            run_type: crate::model::RunType::Timed,
            software_name: "netprobe-tests".to_string(),
            software_version: "0.1.0".to_string(),
            web_connectivity: CheckInConfigWebConnectivity::default(),
        };
        let result = client.check_in(&token, &config).await.unwrap();
        assert_eq!(result.probe_cc, "IT");
        let wc = result.tests.web_connectivity.unwrap();
        assert_eq!(wc.report_id, "rpt-1");
        assert_eq!(wc.urls.len(), 1);
        assert_eq!(wc.urls[0].url, "https://example.com/");
    }

    #[tokio::test]
    async fn test_get_test_helpers() {
        let stub = StubBackend::spawn().await;
        let client = newclient(&stub, Arc::new(MemoryStore::new()));
        let token = CancellationToken::new();
        let helpers = client.get_test_helpers(&token).await.unwrap();
        assert_eq!(helpers["web-connectivity"].len(), 1);
    }

    #[tokio::test]
    async fn test_submit_opens_report_when_needed() {
        let stub = StubBackend::spawn().await;
        let client = newclient(&stub, Arc::new(MemoryStore::new()));
        let token = CancellationToken::new();
        let measurement = Measurement::new("web_connectivity", "0.5.0");
        let report_id = client
            .submit_measurement(&token, &measurement)
            .await
            .unwrap();
        assert_eq!(report_id, "rpt-stub");
        let paths: Vec<String> = stub.seen().iter().map(|r| r.path.clone()).collect();
        assert!(paths.contains(&"/report".to_string()));
        assert!(paths.contains(&"/report/rpt-stub".to_string()));
    }

    #[tokio::test]
    async fn test_submit_reuses_existing_report_id() {
        let stub = StubBackend::spawn().await;
        let client = newclient(&stub, Arc::new(MemoryStore::new()));
        let token = CancellationToken::new();
        let mut measurement = Measurement::new("web_connectivity", "0.5.0");
        measurement.report_id = "rpt-existing".to_string();
        let report_id = client
            .submit_measurement(&token, &measurement)
            .await
            .unwrap();
        assert_eq!(report_id, "rpt-existing");
        let paths: Vec<String> = stub.seen().iter().map(|r| r.path.clone()).collect();
        assert!(!paths.contains(&"/report".to_string()));
        assert!(paths.contains(&"/report/rpt-existing".to_string()));
    }

    #[tokio::test]
    async fn test_fetch_psiphon_config_registers_logs_in_and_persists() {
        let stub = StubBackend::spawn().await;
        let kvstore = Arc::new(MemoryStore::new());
        let client = newclient(&stub, kvstore.clone());
        let token = CancellationToken::new();

        let config = crate::psiphon::PsiphonConfigSource::fetch_psiphon_config(&client, &token)
            .await
            .unwrap();
        assert_eq!(config, br#"{"psiphon":true}"#.to_vec());

        // the account state survived in the store
        let state = OrchestraState::load(kvstore.as_ref());
        assert_eq!(state.client_id, "clnt-1");
        assert_eq!(state.token, "tok-1");
        assert!(state.valid_token().is_some());

        // a second fetch reuses the token: no new register or login
        let before = stub.seen().len();
        let _ = crate::psiphon::PsiphonConfigSource::fetch_psiphon_config(&client, &token)
            .await
            .unwrap();
        let tail: Vec<SeenRequest> = stub.seen().split_off(before);
        assert!(tail
            .iter()
            .all(|r| !r.path.contains("register") && !r.path.contains("login")));
    }

    #[tokio::test]
    async fn test_fetch_tor_targets_uses_bearer() {
        let stub = StubBackend::spawn().await;
        let client = newclient(&stub, Arc::new(MemoryStore::new()));
        let token = CancellationToken::new();
        let targets = client.fetch_tor_targets(&token, "IT").await.unwrap();
        assert!(targets.contains_key("dirauth"));
        let seen = stub.seen();
        let targets_request = seen
            .iter()
            .find(|r| r.path.starts_with("/api/v1/test-list/tor-targets"))
            .unwrap();
        assert_eq!(targets_request.bearer.as_deref(), Some("tok-1"));
        assert!(targets_request.path.contains("country_code=IT"));
        assert_eq!(targets_request.method, "GET");
    }

    #[test]
    fn test_bind_endpoint_https() {
        let bound = bind_endpoint(&ServiceEndpoint {
            address: "https://api.example.org/".to_string(),
            kind: "https".to_string(),
            front: None,
        })
        .unwrap();
        assert_eq!(bound.base_url.as_str(), "https://api.example.org/");
        assert!(bound.host_header.is_none());
    }

    #[test]
    fn test_bind_endpoint_cloudfront_rewrites_host() {
        let bound = bind_endpoint(&ServiceEndpoint {
            address: "https://x.example.org".to_string(),
            kind: "cloudfront".to_string(),
            front: Some("front.cloudfront.net".to_string()),
        })
        .unwrap();
        assert_eq!(bound.base_url.as_str(), "https://front.cloudfront.net/");
        assert_eq!(bound.host_header.as_deref(), Some("x.example.org"));
    }

    #[test]
    fn test_bind_endpoint_cloudfront_rejects_http() {
        let err = bind_endpoint(&ServiceEndpoint {
            address: "http://x.example.org".to_string(),
            kind: "cloudfront".to_string(),
            front: Some("front.cloudfront.net".to_string()),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_bind_endpoint_cloudfront_rejects_port() {
        let err = bind_endpoint(&ServiceEndpoint {
            address: "https://x.example.org:54321".to_string(),
            kind: "cloudfront".to_string(),
            front: Some("front.cloudfront.net".to_string()),
        })
        .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_bind_endpoint_cloudfront_requires_front() {
        let err = bind_endpoint(&ServiceEndpoint {
            address: "https://x.example.org".to_string(),
            kind: "cloudfront".to_string(),
            front: None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Backend(_)));
    }

    #[test]
    fn test_bind_endpoint_onion_unsupported() {
        let err = bind_endpoint(&ServiceEndpoint {
            address: "httpo://example.onion".to_string(),
            kind: "onion".to_string(),
            front: None,
        })
        .unwrap_err();
        match err {
            Error::Backend(msg) => assert!(msg.contains("unsupported service type")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_secret_debug_redacted() {
        let secret = Secret::new("hunter2".to_string());
        let debug = format!("{:?}", secret);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_orchestra_state_roundtrip_through_kvstore() {
        let dir = tempfile::tempdir().unwrap();
        let store = crate::kvstore::FileSystemStore::new(dir.path()).unwrap();
        let state = OrchestraState {
            client_id: "client-123".to_string(),
            password: Secret::new("correct horse battery staple".to_string()),
            token: "bearer-token".to_string(),
            expire: Some(Utc::now() + chrono::Duration::hours(1)),
        };
        state.save(&store).unwrap();
        let loaded = OrchestraState::load(&store);
        assert_eq!(loaded, state);
    }

    #[test]
    fn test_orchestra_state_load_missing_is_default() {
        let store = MemoryStore::new();
        let state = OrchestraState::load(&store);
        assert!(state.client_id.is_empty());
        assert!(!state.has_credentials());
        assert!(state.valid_token().is_none());
    }

    #[test]
    fn test_orchestra_state_expired_token_is_invalid() {
        let state = OrchestraState {
            client_id: "client-123".to_string(),
            password: Secret::new("pw".to_string()),
            token: "stale".to_string(),
            expire: Some(Utc::now() - chrono::Duration::hours(1)),
        };
        assert!(state.valid_token().is_none());
        assert!(state.has_credentials());
    }

    #[test]
    fn test_default_backend_endpoints_order() {
        let endpoints = default_backend_endpoints();
        assert_eq!(endpoints[0].kind, "https");
        assert_eq!(endpoints[1].kind, "cloudfront");
        assert!(endpoints[1].front.is_some());
    }
}
