//! Resilient HTTP fetch with exponential backoff, jitter and reactive re-authentication.
//!
//! Retry rules, applied to GET and POST alike:
//!
//! - transport failure or 5xx: sleep `backoff + jitter`, double `backoff` (capped)
//! - 401/403: re-authenticate, sleep a short fixed delay + half jitter, `backoff` untouched
//! - anything else: returned to the caller, which decides what non-200 means
//!
//! Every sleep and every in-flight request races the shutdown token and the
//! optional overall deadline, so a dead PBX never pins the process.

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Method, StatusCode};
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{FetchError, PbxError};
use crate::redact;

pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);
pub const MAX_JITTER: Duration = Duration::from_millis(400);
pub const AUTH_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Longest body excerpt written to debug logs
const PREVIEW_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_jitter: Duration,
    pub auth_delay: Duration,
    /// Overall budget for one retry sequence. `None` retries forever.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: MAX_BACKOFF,
            max_jitter: MAX_JITTER,
            auth_delay: AUTH_RETRY_DELAY,
            deadline: None,
        }
    }
}

/// Doubling backoff with a hard cap.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial.min(max),
            max,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Return the delay for this failure and grow the next one.
    pub fn advance(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(self.current, self.max);
        delay
    }
}

#[inline]
pub fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

/// Uniform random duration in `[0, max)`.
pub fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

/// Session refresh hook invoked on 401/403.
#[allow(async_fn_in_trait)]
pub trait Authenticator {
    async fn authenticate(&self) -> Result<(), PbxError>;
}

/// For endpoints that never need a session.
pub struct NoAuth;

impl Authenticator for NoAuth {
    async fn authenticate(&self) -> Result<(), PbxError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    method: Method,
    url: String,
    json_body: Option<Vec<u8>>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            json_body: None,
        }
    }

    pub fn post_json<T: Serialize + ?Sized>(
        url: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::POST,
            url: url.into(),
            json_body: Some(serde_json::to_vec(payload)?),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub body: String,
}

pub struct Fetcher {
    http: reqwest::Client,
    policy: RetryPolicy,
    cancel: CancellationToken,
    debug: bool,
}

impl Fetcher {
    pub fn new(http: reqwest::Client, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self {
            http,
            policy,
            cancel,
            debug: false,
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `request` until it yields a non-retryable response.
    pub async fn fetch<A: Authenticator>(
        &self,
        request: &FetchRequest,
        auth: &A,
    ) -> Result<FetchResponse, FetchError> {
        let started = Instant::now();
        let deadline = self.policy.deadline.map(|d| started + d);
        let mut backoff = Backoff::new(self.policy.initial_backoff, self.policy.max_backoff);
        let mut attempt: u32 = 1;

        loop {
            self.log_request(request, attempt);

            let delay = match self.guard(started, deadline, self.send(request)).await? {
                Err(e) if e.is_builder() => return Err(FetchError::Request(e)),
                Err(e) => {
                    if self.debug {
                        debug!(
                            "[PBX][ERR] {} {} error: {} (retry in {:?})",
                            request.method,
                            request.url,
                            e,
                            backoff.current()
                        );
                    }
                    backoff.advance() + jitter(self.policy.max_jitter)
                }
                Ok(response) => {
                    if self.debug {
                        debug!(
                            "[PBX][RES] {} {} Body: {}",
                            response.status,
                            request.url,
                            redact::body_preview(&response.body, PREVIEW_LIMIT)
                        );
                    }
                    match response.status {
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                            if let Err(e) = self.guard(started, deadline, auth.authenticate()).await? {
                                warn!("PBX re-authentication failed: {}", e);
                            }
                            self.policy.auth_delay + jitter(self.policy.max_jitter) / 2
                        }
                        status if status.is_server_error() => {
                            if self.debug {
                                debug!(
                                    "[PBX][RETRY] {} returned {}, retry in {:?}",
                                    request.url,
                                    status.as_u16(),
                                    backoff.current()
                                );
                            }
                            backoff.advance() + jitter(self.policy.max_jitter)
                        }
                        _ => return Ok(response),
                    }
                }
            };

            self.guard(started, deadline, sleep(delay)).await?;
            attempt += 1;
        }
    }

    async fn send(&self, request: &FetchRequest) -> Result<FetchResponse, reqwest::Error> {
        let mut builder = self.http.request(request.method.clone(), &request.url);
        if let Some(body) = &request.json_body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(body.clone());
        }
        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        Ok(FetchResponse { status, body })
    }

    /// Race `fut` against shutdown and the sequence deadline.
    async fn guard<F: Future>(
        &self,
        started: Instant,
        deadline: Option<Instant>,
        fut: F,
    ) -> Result<F::Output, FetchError> {
        let expired = async {
            match deadline {
                Some(at) => sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            _ = expired => Err(FetchError::DeadlineExceeded { elapsed: started.elapsed() }),
            out = fut => Ok(out),
        }
    }

    fn log_request(&self, request: &FetchRequest, attempt: u32) {
        if !self.debug {
            return;
        }
        match &request.json_body {
            Some(body) => debug!(
                "[PBX][REQ] {} {} Headers: {{Content-Type: application/json}} Body: {} (attempt={})",
                request.method,
                request.url,
                redact::body_preview(&String::from_utf8_lossy(body), PREVIEW_LIMIT),
                attempt
            ),
            None => debug!("[PBX][REQ] {} {} (attempt={})", request.method, request.url, attempt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            max_jitter: Duration::ZERO,
            auth_delay: Duration::from_millis(5),
            deadline: Some(Duration::from_secs(5)),
        }
    }

    fn fetcher(policy: RetryPolicy) -> Fetcher {
        Fetcher::new(reqwest::Client::new(), policy, CancellationToken::new())
    }

    #[derive(Default)]
    struct CountingAuth {
        calls: AtomicU32,
    }

    impl Authenticator for CountingAuth {
        async fn authenticate(&self) -> Result<(), PbxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Replays `statuses` in order (the last one repeats) and records arrival times.
    #[derive(Clone)]
    struct StatusScript {
        statuses: Arc<Vec<u16>>,
        served: Arc<AtomicUsize>,
        arrivals: Arc<Mutex<Vec<std::time::Instant>>>,
    }

    impl StatusScript {
        fn new(statuses: &[u16]) -> Self {
            Self {
                statuses: Arc::new(statuses.to_vec()),
                served: Arc::new(AtomicUsize::new(0)),
                arrivals: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn gaps(&self) -> Vec<Duration> {
            let arrivals = self.arrivals.lock().unwrap();
            arrivals.windows(2).map(|w| w[1] - w[0]).collect()
        }
    }

    impl Respond for StatusScript {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            self.arrivals.lock().unwrap().push(std::time::Instant::now());
            let index = self.served.fetch_add(1, Ordering::SeqCst);
            let status = self.statuses[index.min(self.statuses.len() - 1)];
            ResponseTemplate::new(status)
        }
    }

    async fn scripted_server(script: &StatusScript) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(script.clone())
            .mount(&server)
            .await;
        server
    }

    #[test]
    fn test_backoff_sequence() {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        let delays: Vec<u64> = (0..8).map(|_| backoff.advance().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 32, 60, 60]);
    }

    #[test]
    fn test_backoff_caps_after_six_failures() {
        let mut backoff = Backoff::new(INITIAL_BACKOFF, MAX_BACKOFF);
        let mut previous = Duration::ZERO;
        for _ in 0..6 {
            let delay = backoff.advance();
            assert!(delay >= previous, "backoff must not shrink");
            assert!(delay <= MAX_BACKOFF);
            previous = delay;
        }
        assert!(backoff.current() <= MAX_BACKOFF);
        assert_eq!(backoff.current(), MAX_BACKOFF);
    }

    #[test]
    fn test_backoff_initial_above_cap_is_clamped() {
        let backoff = Backoff::new(Duration::from_secs(120), MAX_BACKOFF);
        assert_eq!(backoff.current(), MAX_BACKOFF);
    }

    #[test]
    fn test_next_backoff_saturates() {
        assert_eq!(next_backoff(Duration::MAX, MAX_BACKOFF), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_bounds() {
        for _ in 0..1000 {
            assert!(jitter(MAX_JITTER) < MAX_JITTER);
        }
        assert_eq!(jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_default_policy_retries_forever() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_backoff, Duration::from_secs(1));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
        assert!(policy.deadline.is_none());
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"result\":true}"))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest::get(format!("{}/status", server.uri()));
        let response = assert_ok!(fetcher(fast_policy()).fetch(&request, &NoAuth).await);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.body, "{\"result\":true}");
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest::get(format!("{}/status", server.uri()));
        let response = assert_ok!(fetcher(fast_policy()).fetch(&request, &NoAuth).await);
        assert_eq!(response.body, "ok");
    }

    #[tokio::test]
    async fn test_client_errors_are_returned_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let request = FetchRequest::get(format!("{}/missing", server.uri()));
        let response = assert_ok!(fetcher(fast_policy()).fetch(&request, &NoAuth).await);
        assert_eq!(response.status, StatusCode::NOT_FOUND);
        assert_eq!(response.body, "nope");
    }

    #[tokio::test]
    async fn test_unauthorized_triggers_reauthentication() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(403))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let auth = CountingAuth::default();
        let request = FetchRequest::get(format!("{}/status", server.uri()));
        let response = assert_ok!(fetcher(fast_policy()).fetch(&request, &auth).await);
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_server_error_delays_double() {
        let script = StatusScript::new(&[503, 503, 503, 200]);
        let server = scripted_server(&script).await;
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            ..fast_policy()
        };

        let request = FetchRequest::get(format!("{}/status", server.uri()));
        let response = assert_ok!(fetcher(policy).fetch(&request, &NoAuth).await);
        assert_eq!(response.status, StatusCode::OK);

        let gaps = script.gaps();
        assert_eq!(gaps.len(), 3);
        for (gap, expected_ms) in gaps.iter().zip([100u64, 200, 400]) {
            let expected = Duration::from_millis(expected_ms);
            assert!(*gap >= expected, "gap {:?} shorter than {:?}", gap, expected);
            assert!(*gap < expected + Duration::from_millis(90), "gap {:?} longer than {:?}", gap, expected);
        }
    }

    #[tokio::test]
    async fn test_auth_retries_leave_backoff_untouched() {
        let script = StatusScript::new(&[401, 401, 403, 401, 403, 401, 503, 200]);
        let server = scripted_server(&script).await;
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(60),
            ..fast_policy()
        };

        let auth = CountingAuth::default();
        let request = FetchRequest::get(format!("{}/status", server.uri()));
        let started = std::time::Instant::now();
        let response = assert_ok!(fetcher(policy).fetch(&request, &auth).await);
        let elapsed = started.elapsed();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(auth.calls.load(Ordering::SeqCst), 6);
        // Six 5ms auth pauses then one 300ms server-error pause; a grown
        // backoff would have waited 600ms or more on the 503
        assert!(elapsed >= Duration::from_millis(300), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(550), "took {:?}", elapsed);
        let last_gap = script.gaps().last().copied().unwrap_or_default();
        assert!(last_gap < Duration::from_millis(450), "503 pause {:?}", last_gap);
    }

    #[tokio::test]
    async fn test_post_sends_json_body_on_every_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/peer"))
            .and(header("content-type", "application/json"))
            .and(body_json(serde_json::json!({"peer": "201"})))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/peer"))
            .and(body_json(serde_json::json!({"peer": "201"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let payload = serde_json::json!({"peer": "201"});
        let request = assert_ok!(FetchRequest::post_json(format!("{}/peer", server.uri()), &payload));
        let response = assert_ok!(fetcher(fast_policy()).fetch(&request, &NoAuth).await);
        assert_eq!(response.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_deadline_stops_endless_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let policy = RetryPolicy {
            deadline: Some(Duration::from_millis(100)),
            ..fast_policy()
        };
        let request = FetchRequest::get(format!("{}/status", server.uri()));
        let err = assert_err!(fetcher(policy).fetch(&request, &NoAuth).await);
        assert!(matches!(err, FetchError::DeadlineExceeded { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_transport_failures_are_retried_until_deadline() {
        // Nothing listens on port 1
        let policy = RetryPolicy {
            deadline: Some(Duration::from_millis(150)),
            ..fast_policy()
        };
        let request = FetchRequest::get("http://127.0.0.1:1/status");
        let err = assert_err!(fetcher(policy).fetch(&request, &NoAuth).await);
        assert!(matches!(err, FetchError::DeadlineExceeded { .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            deadline: None,
            ..fast_policy()
        };
        let fetcher = Fetcher::new(reqwest::Client::new(), policy, cancel.clone());
        let request = FetchRequest::get(format!("{}/status", server.uri()));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = assert_err!(fetcher.fetch(&request, &NoAuth).await);
        assert!(matches!(err, FetchError::Cancelled));
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried() {
        let request = FetchRequest::get("not a url");
        let err = assert_err!(fetcher(fast_policy()).fetch(&request, &NoAuth).await);
        assert!(matches!(err, FetchError::Request(_)), "got {:?}", err);
    }
}


/// Kani formal verification proofs
#[cfg(kani)]
mod kani_proofs {
    use super::*;

    #[kani::proof]
    fn next_backoff_never_exceeds_cap() {
        let current_ms: u64 = kani::any();
        let max_ms: u64 = kani::any();
        kani::assume(max_ms <= 3_600_000);
        let next = next_backoff(Duration::from_millis(current_ms), Duration::from_millis(max_ms));
        kani::assert(next <= Duration::from_millis(max_ms), "backoff must respect cap");
    }
}
