//! Probe geolocation.
//!
//! Resolves the probe's network location: public IP and country through
//! web lookup services, ASN and network name through the opaque
//! [`GeoDb`](crate::model::GeoDb) capability, and the resolver's IP
//! through a DNS query that echoes the asking resolver.
//!
//! # Lookup Services
//!
//! | Service | Response format |
//! |---------|-----------------|
//! | Cloudflare `/cdn-cgi/trace` | `key=value` lines (`ip=`, `loc=`) |
//! | Ubuntu `geoip.ubuntu.com/lookup` | XML (`<Ip>`, `<CountryCode>`) |
//!
//! Services are tried in random order until one succeeds; censorship of a
//! single lookup endpoint must not pin the probe to one failure mode.
//! When every service fails the lookup fails with
//! [`Error::Geolocate`](crate::Error::Geolocate); partial metadata (no
//! GeoDb, no resolver answer) degrades to the documented defaults instead
//! of failing.

use std::sync::Arc;

use rand::seq::SliceRandom;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::httpclient::SessionHttpClient;
use crate::logger::SessionLogger;
use crate::model::{GeoDb, Location, DEFAULT_PROBE_CC};
use crate::resolver::SessionResolver;

/// Domain whose A record echoes the querying resolver's IP address.
const WHOAMI_DOMAIN: &str = "whoami.akamai.net";

/// One web IP-lookup service.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LookupService {
    WebCloudflare,
    WebUbuntu,
}

impl LookupService {
    fn url(&self) -> &'static str {
        match self {
            LookupService::WebCloudflare => "https://www.cloudflare.com/cdn-cgi/trace",
            LookupService::WebUbuntu => "https://geoip.ubuntu.com/lookup",
        }
    }
}

/// Parses a cloudflare trace response into `(ip, country_code)`.
fn parse_cloudflare_trace(body: &str) -> Option<(String, String)> {
    let mut ip = None;
    let mut cc = None;
    for line in body.lines() {
        if let Some(value) = line.strip_prefix("ip=") {
            ip = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("loc=") {
            cc = Some(value.trim().to_string());
        }
    }
    Some((ip?, cc.unwrap_or_else(|| DEFAULT_PROBE_CC.to_string())))
}

/// Extracts the text of the first `<tag>...</tag>` element.
fn xml_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].trim().to_string())
}

/// Parses an ubuntu geoip response into `(ip, country_code)`.
fn parse_ubuntu_lookup(body: &str) -> Option<(String, String)> {
    let ip = xml_text(body, "Ip")?;
    let cc = xml_text(body, "CountryCode").unwrap_or_else(|| DEFAULT_PROBE_CC.to_string());
    Some((ip, cc))
}

/// Performs the probe location lookup for a session.
pub struct Geolocator {
    http: Arc<SessionHttpClient>,
    resolver: Arc<SessionResolver>,
    geodb: Arc<dyn GeoDb>,
    logger: SessionLogger,
}

impl Geolocator {
    /// Creates a geolocator over the session's collaborators.
    pub fn new(
        http: Arc<SessionHttpClient>,
        resolver: Arc<SessionResolver>,
        geodb: Arc<dyn GeoDb>,
        logger: SessionLogger,
    ) -> Self {
        Self {
            http,
            resolver,
            geodb,
            logger,
        }
    }

    /// Resolves the probe location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Geolocate`] when every IP lookup service fails
    /// and [`Error::Cancelled`] when the token fires.
    pub async fn lookup(&self, token: &CancellationToken) -> Result<Location> {
        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let (probe_ip, probe_cc) = self.lookup_ip_and_cc(token).await?;

        let (probe_asn, probe_network_name) = match self.geodb.lookup_asn(&probe_ip) {
            Ok(pair) => pair,
            Err(e) => {
                self.logger
                    .warn(&format!("geolocate: asn lookup failed: {}", e));
                (0, String::new())
            }
        };

        let resolver_ip = self.lookup_resolver_ip(token).await;
        let (resolver_asn, resolver_network_name) = match resolver_ip.as_deref() {
            Some(ip) => self.geodb.lookup_asn(ip).unwrap_or((0, String::new())),
            None => (0, String::new()),
        };

        Ok(Location {
            probe_ip,
            probe_asn,
            probe_cc,
            probe_network_name,
            resolver_ip: resolver_ip.unwrap_or_default(),
            resolver_asn,
            resolver_network_name,
        })
    }

    /// Tries each lookup service in random order until one yields an IP.
    async fn lookup_ip_and_cc(&self, token: &CancellationToken) -> Result<(String, String)> {
        let mut services = vec![LookupService::WebCloudflare, LookupService::WebUbuntu];
        services.shuffle(&mut rand::thread_rng());

        let mut last_failure = String::from("no services configured");
        for service in services {
            self.logger
                .debug(&format!("geolocate: trying {}", service.url()));
            match self.lookup_with(token, service).await {
                Ok(pair) => return Ok(pair),
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(e) => {
                    self.logger
                        .warn(&format!("geolocate: {} failed: {}", service.url(), e));
                    last_failure = e.to_string();
                }
            }
        }
        Err(Error::Geolocate(format!(
            "all lookup services failed: {}",
            last_failure
        )))
    }

    async fn lookup_with(
        &self,
        token: &CancellationToken,
        service: LookupService,
    ) -> Result<(String, String)> {
        let builder = self.http.request(reqwest::Method::GET, service.url());
        let response = self.http.execute(token, builder).await?;
        if response.status != 200 {
            return Err(Error::Geolocate(format!(
                "{} returned status {}",
                service.url(),
                response.status
            )));
        }
        let body = response.text();
        let parsed = match service {
            LookupService::WebCloudflare => parse_cloudflare_trace(&body),
            LookupService::WebUbuntu => parse_ubuntu_lookup(&body),
        };
        parsed.ok_or_else(|| {
            Error::Geolocate(format!("{}: cannot parse response", service.url()))
        })
    }

    /// Discovers the resolver's IP; `None` when unavailable.
    ///
    /// Skipped for proxied sessions: a local DNS query would bypass the
    /// tunnel and observe the wrong resolver anyway.
    async fn lookup_resolver_ip(&self, token: &CancellationToken) -> Option<String> {
        if self.resolver.is_proxied() {
            self.logger
                .debug("geolocate: proxied session: skipping resolver lookup");
            return None;
        }
        match self.resolver.lookup_host(token, WHOAMI_DOMAIN).await {
            Ok(addrs) => addrs.first().map(|a| a.to_string()),
            Err(e) => {
                self.logger
                    .warn(&format!("geolocate: resolver lookup failed: {}", e));
                None
            }
        }
    }
}

// real-network coverage: cargo test --features integration
#[cfg(all(test, feature = "integration"))]
mod integration_tests {
    use super::*;
    use crate::bytecounter::ByteCounter;
    use crate::httpclient::{HttpClientConfig, SessionHttpClient};
    use crate::model::StubGeoDb;

    #[tokio::test]
    async fn test_lookup_against_real_services() {
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let logger = SessionLogger::new(tx, false);
        let http = Arc::new(
            SessionHttpClient::new(HttpClientConfig {
                counter: Arc::new(ByteCounter::new()),
                proxy_url: None,
                user_agent: "netprobe-tests/0.1.0".to_string(),
            })
            .unwrap(),
        );
        let resolver = Arc::new(SessionResolver::new(None));
        let geolocator = Geolocator::new(http, resolver, Arc::new(StubGeoDb), logger);
        let token = CancellationToken::new();
        let location = geolocator.lookup(&token).await.unwrap();
        assert!(!location.probe_ip.is_empty());
        assert_eq!(location.probe_cc.len(), 2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cloudflare_trace() {
        let body = "fl=123\nh=www.cloudflare.com\nip=93.147.1.2\nts=1.0\nloc=IT\n";
        let (ip, cc) = parse_cloudflare_trace(body).unwrap();
        assert_eq!(ip, "93.147.1.2");
        assert_eq!(cc, "IT");
    }

    #[test]
    fn test_parse_cloudflare_trace_missing_ip() {
        assert!(parse_cloudflare_trace("loc=IT\n").is_none());
    }

    #[test]
    fn test_parse_cloudflare_trace_missing_loc() {
        let (ip, cc) = parse_cloudflare_trace("ip=8.8.8.8\n").unwrap();
        assert_eq!(ip, "8.8.8.8");
        assert_eq!(cc, "ZZ");
    }

    #[test]
    fn test_parse_ubuntu_lookup() {
        let body = concat!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>",
            "<Response><Ip>93.147.1.2</Ip><Status>OK</Status>",
            "<CountryCode>IT</CountryCode><CountryName>Italy</CountryName>",
            "</Response>",
        );
        let (ip, cc) = parse_ubuntu_lookup(body).unwrap();
        assert_eq!(ip, "93.147.1.2");
        assert_eq!(cc, "IT");
    }

    #[test]
    fn test_parse_ubuntu_lookup_missing_ip() {
        assert!(parse_ubuntu_lookup("<Response></Response>").is_none());
    }

    #[test]
    fn test_xml_text_unterminated() {
        assert!(xml_text("<Ip>1.2.3.4", "Ip").is_none());
    }
}
