//! Backend candidate discovery.
//!
//! The backend is reachable through several endpoints: direct HTTPS
//! primaries, and fallbacks for networks where those are blocked
//! (domain-fronted, onion). Discovery measures candidates and picks a
//! working, fast one.
//!
//! # Algorithm
//!
//! ```text
//!   candidates ──▶ partition by transport priority
//!                  (https first, then cloudfront, then onion)
//!                          │
//!                          ▼
//!            attempt EVERY https candidate in order,
//!            recording duration and outcome for each
//!                          │
//!            ┌─────────────┴─────────────┐
//!            │ ≥1 succeeded              │ none succeeded
//!            ▼                           ▼
//!          stop                attempt fallbacks one at a
//!                              time, stop at first success
//! ```
//!
//! Every primary is measured even after one succeeds: primaries are
//! cheap and the comparative latency data feeds
//! [`select_best`]. Fallbacks are escape valves; once one works (or
//! fails) there is little value in measuring the rest, so the sweep
//! short-circuits there.
//!
//! [`try_all`] never fails as a whole: failures are recorded
//! per-candidate and total failure surfaces as [`select_best`]
//! returning `None`, leaving the partial diagnostics inspectable.
//!
//! # See Also
//!
//! - [`crate::backend`] - The client that runs discovery lazily

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::{ServiceEndpoint, TestHelpersMap};

/// One attempted backend endpoint.
///
/// Created per discovery attempt and never mutated afterwards.
#[derive(Debug)]
pub struct Candidate {
    /// The endpoint that was attempted.
    pub endpoint: ServiceEndpoint,
    /// How long the attempt took.
    pub duration: Duration,
    /// The failure, when the attempt failed.
    pub error: Option<Error>,
    /// The discovered test-helper set, when the attempt succeeded.
    pub test_helpers: Option<TestHelpersMap>,
}

impl Candidate {
    /// Returns whether this attempt succeeded.
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Probes one endpoint, returning its test-helper set on success.
///
/// The production prober performs the test-helpers API call through the
/// session HTTP client; tests substitute canned outcomes.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    /// Attempts `endpoint` once.
    async fn probe(
        &self,
        token: &CancellationToken,
        endpoint: &ServiceEndpoint,
    ) -> Result<TestHelpersMap>;
}

/// Transport priority: lower sorts earlier. Fronted endpoints beat
/// onion ones because they do not require a tunnel.
fn priority(endpoint: &ServiceEndpoint) -> u8 {
    match endpoint.kind.as_str() {
        "https" => 0,
        "cloudfront" => 1,
        "onion" => 2,
        _ => 3,
    }
}

/// Partitions candidates by transport priority, preserving input order
/// within each class.
pub fn sort_candidates(endpoints: &[ServiceEndpoint]) -> Vec<ServiceEndpoint> {
    let mut sorted = endpoints.to_vec();
    sorted.sort_by_key(priority); // stable: ties keep input order
    sorted
}

/// Attempts the candidates and returns one [`Candidate`] per attempt,
/// in attempt order.
///
/// See the module docs for the sweep/short-circuit policy. This
/// function does not fail: a cancelled token simply makes every
/// remaining attempt fail fast with its cancellation error, still
/// recorded per candidate.
pub async fn try_all(
    token: &CancellationToken,
    endpoints: &[ServiceEndpoint],
    prober: &dyn EndpointProber,
) -> Vec<Candidate> {
    let sorted = sort_candidates(endpoints);
    let mut results = Vec::with_capacity(sorted.len());
    let mut any_primary_ok = false;

    let mut iter = sorted.into_iter().peekable();
    while let Some(endpoint) = iter.peek() {
        if priority(endpoint) > 0 {
            break;
        }
        let endpoint = iter.next().unwrap();
        let candidate = attempt(token, endpoint, prober).await;
        any_primary_ok = any_primary_ok || candidate.succeeded();
        results.push(candidate);
    }
    if any_primary_ok {
        return results;
    }
    for endpoint in iter {
        let candidate = attempt(token, endpoint, prober).await;
        let ok = candidate.succeeded();
        results.push(candidate);
        if ok {
            break;
        }
    }
    results
}

async fn attempt(
    token: &CancellationToken,
    endpoint: ServiceEndpoint,
    prober: &dyn EndpointProber,
) -> Candidate {
    let begin = Instant::now();
    let outcome = prober.probe(token, &endpoint).await;
    let duration = begin.elapsed();
    match outcome {
        Ok(test_helpers) => Candidate {
            endpoint,
            duration,
            error: None,
            test_helpers: Some(test_helpers),
        },
        Err(error) => Candidate {
            endpoint,
            duration,
            error: Some(error),
            test_helpers: None,
        },
    }
}

/// Returns the fastest successful candidate, or `None` when every
/// attempt failed.
///
/// Ties break to the earliest candidate: only a strictly smaller
/// duration displaces the current best.
pub fn select_best(candidates: &[Candidate]) -> Option<&Candidate> {
    let mut best: Option<&Candidate> = None;
    for candidate in candidates {
        if !candidate.succeeded() {
            continue;
        }
        match best {
            None => best = Some(candidate),
            Some(current) if candidate.duration < current.duration => best = Some(candidate),
            Some(_) => {}
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use proptest::prelude::*;

    use super::*;

    fn https(address: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            address: address.to_string(),
            kind: "https".to_string(),
            front: None,
        }
    }

    fn cloudfront(address: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            address: address.to_string(),
            kind: "cloudfront".to_string(),
            front: Some(address.trim_start_matches("https://").to_string()),
        }
    }

    fn onion(address: &str) -> ServiceEndpoint {
        ServiceEndpoint {
            address: address.to_string(),
            kind: "onion".to_string(),
            front: None,
        }
    }

    /// A prober whose outcome per address is scripted: `Ok(delay)` or
    /// `Err(())`. Records the addresses it attempted.
    struct ScriptedProber {
        outcomes: HashMap<String, std::result::Result<Duration, ()>>,
        attempts: Mutex<Vec<String>>,
    }

    impl ScriptedProber {
        fn new(outcomes: Vec<(&str, std::result::Result<Duration, ()>)>) -> Self {
            Self {
                outcomes: outcomes
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                attempts: Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EndpointProber for ScriptedProber {
        async fn probe(
            &self,
            _token: &CancellationToken,
            endpoint: &ServiceEndpoint,
        ) -> Result<TestHelpersMap> {
            self.attempts.lock().unwrap().push(endpoint.address.clone());
            match self.outcomes.get(&endpoint.address) {
                Some(Ok(delay)) => {
                    tokio::time::sleep(*delay).await;
                    Ok(TestHelpersMap::new())
                }
                _ => Err(Error::Backend("scripted failure".to_string())),
            }
        }
    }

    #[test]
    fn test_sort_candidates_partitions_by_priority() {
        let input = vec![
            onion("httpo://example.onion"),
            https("https://a.example.org"),
            cloudfront("https://front.example.net"),
            https("https://b.example.org"),
        ];
        let sorted = sort_candidates(&input);
        let kinds: Vec<&str> = sorted.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["https", "https", "cloudfront", "onion"]);
        // stable within a class: a before b
        assert_eq!(sorted[0].address, "https://a.example.org");
        assert_eq!(sorted[1].address, "https://b.example.org");
    }

    #[tokio::test]
    async fn test_try_all_measures_every_primary() {
        // first fails, second and third succeed with 50ms and 20ms
        let prober = ScriptedProber::new(vec![
            ("https://one.example.org", Err(())),
            ("https://two.example.org", Ok(Duration::from_millis(50))),
            ("https://three.example.org", Ok(Duration::from_millis(20))),
        ]);
        let endpoints = vec![
            https("https://one.example.org"),
            https("https://two.example.org"),
            https("https://three.example.org"),
        ];
        let token = CancellationToken::new();
        let out = try_all(&token, &endpoints, &prober).await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].endpoint.address, "https://one.example.org");
        assert!(!out[0].succeeded());
        assert!(out[1].succeeded());
        assert!(out[2].succeeded());
        assert!(out[1].duration >= Duration::from_millis(50));
        assert!(out[2].duration >= Duration::from_millis(20));
        assert!(out[2].duration < out[1].duration);

        // the fastest wins even though it is listed later
        let best = select_best(&out).unwrap();
        assert_eq!(best.endpoint.address, "https://three.example.org");
    }

    #[tokio::test]
    async fn test_try_all_falls_back_and_stops_at_first_success() {
        let prober = ScriptedProber::new(vec![
            ("https://one.example.org", Err(())),
            ("https://two.example.org", Err(())),
            (
                "https://front.example.net",
                Ok(Duration::from_millis(5)),
            ),
        ]);
        let endpoints = vec![
            https("https://one.example.org"),
            https("https://two.example.org"),
            cloudfront("https://front.example.net"),
            onion("httpo://example.onion"),
        ];
        let token = CancellationToken::new();
        let out = try_all(&token, &endpoints, &prober).await;

        // len(https) + 1: the onion fallback was never attempted
        assert_eq!(out.len(), 3);
        assert!(out[2].succeeded());
        assert_eq!(out[2].endpoint.kind, "cloudfront");
        assert!(!prober
            .attempts()
            .contains(&"httpo://example.onion".to_string()));
    }

    #[tokio::test]
    async fn test_try_all_attempts_second_fallback_when_first_fails() {
        let prober = ScriptedProber::new(vec![
            ("https://one.example.org", Err(())),
            ("https://front.example.net", Err(())),
            ("httpo://example.onion", Err(())),
        ]);
        let endpoints = vec![
            https("https://one.example.org"),
            cloudfront("https://front.example.net"),
            onion("httpo://example.onion"),
        ];
        let token = CancellationToken::new();
        let out = try_all(&token, &endpoints, &prober).await;
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|c| !c.succeeded()));
    }

    #[tokio::test]
    async fn test_try_all_cancelled_token_records_every_failure() {
        let prober = ScriptedProber::new(vec![]);
        let endpoints = vec![
            https("https://one.example.org"),
            https("https://two.example.org"),
        ];
        let token = CancellationToken::new();
        token.cancel();
        // the scripted prober fails every attempt; every candidate is
        // still recorded with its own error
        let out = try_all(&token, &endpoints, &prober).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| !c.succeeded()));
    }

    #[test]
    fn test_select_best_empty_input() {
        assert!(select_best(&[]).is_none());
    }

    #[test]
    fn test_select_best_only_failures() {
        let candidates = vec![Candidate {
            endpoint: https("https://one.example.org"),
            duration: Duration::from_millis(10),
            error: Some(Error::Backend("down".to_string())),
            test_helpers: None,
        }];
        assert!(select_best(&candidates).is_none());
    }

    #[test]
    fn test_select_best_ties_break_to_first() {
        let make = |address: &str| Candidate {
            endpoint: https(address),
            duration: Duration::from_millis(30),
            error: None,
            test_helpers: Some(TestHelpersMap::new()),
        };
        let candidates = vec![make("https://one.example.org"), make("https://two.example.org")];
        let best = select_best(&candidates).unwrap();
        assert_eq!(best.endpoint.address, "https://one.example.org");
    }

    proptest! {
        /// The selected candidate is always error-free with the minimal
        /// duration, and the first such candidate on ties.
        #[test]
        fn prop_select_best_minimal_error_free(
            outcomes in proptest::collection::vec((0u64..500, any::<bool>()), 0..16),
        ) {
            let candidates: Vec<Candidate> = outcomes
                .iter()
                .enumerate()
                .map(|(i, (millis, ok))| Candidate {
                    endpoint: https(&format!("https://c{}.example.org", i)),
                    duration: Duration::from_millis(*millis),
                    error: if *ok {
                        None
                    } else {
                        Some(Error::Backend("down".to_string()))
                    },
                    test_helpers: if *ok { Some(TestHelpersMap::new()) } else { None },
                })
                .collect();
            match select_best(&candidates) {
                None => prop_assert!(candidates.iter().all(|c| !c.succeeded())),
                Some(best) => {
                    prop_assert!(best.succeeded());
                    let min = candidates
                        .iter()
                        .filter(|c| c.succeeded())
                        .map(|c| c.duration)
                        .min()
                        .unwrap();
                    prop_assert_eq!(best.duration, min);
                    let first_minimal = candidates
                        .iter()
                        .find(|c| c.succeeded() && c.duration == min)
                        .unwrap();
                    prop_assert!(std::ptr::eq(best, first_minimal));
                }
            }
        }
    }
}
