//! Edge filter: per-client rate limiting in front of every route.

use std::{
    net::SocketAddr,
    rc::Rc,
    sync::{Arc, Mutex},
    time::Duration,
};

use actix_web::{
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    Error as ActixError,
};
use chrono::{DateTime, Utc};

use crate::{
    clock::{Clock, SystemClock},
    error::Error,
    utils::delta,
};

#[derive(Debug)]
struct Window {
    started: DateTime<Utc>,
    count: u64,
}

/// Fixed window request counter keyed by client address.
pub struct RateLimiter {
    limit: u64,
    window: Duration,
    windows: papaya::HashMap<String, Mutex<Window>>,
}

impl RateLimiter {
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: papaya::HashMap::new(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Counts a request from `key`, returning whether it is admitted.
    pub fn check(&self, key: &str, now: DateTime<Utc>) -> bool {
        let windows = self.windows.pin();
        let window = windows.get_or_insert_with(key.to_owned(), || {
            Mutex::new(Window {
                started: now,
                count: 0,
            })
        });

        let mut window = window.lock().unwrap_or_else(|e| e.into_inner());

        if now - window.started >= delta(self.window) {
            window.started = now;
            window.count = 0;
        }

        if window.count >= self.limit {
            return false;
        }

        window.count += 1;
        true
    }

    /// Forgets clients whose window has ended. Returns how many were dropped.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let windows = self.windows.pin();
        let before = windows.len();
        let window = delta(self.window);

        windows.retain(|_, w| {
            let w = w.lock().unwrap_or_else(|e| e.into_inner());
            now - w.started < window
        });

        before.saturating_sub(windows.len())
    }

    pub fn tracked(&self) -> usize {
        self.windows.pin().len()
    }
}

/// Client address used as the rate limit key, without the port.
///
/// By default this is the socket peer. Forwarded headers are set by the client, so they
/// are only honoured when the server sits behind a trusted proxy.
fn client_key(req: &ServiceRequest, trust_forwarded: bool) -> String {
    if trust_forwarded {
        let info = req.connection_info();
        if let Some(addr) = info.realip_remote_addr() {
            return addr
                .parse::<SocketAddr>()
                .map(|s| s.ip().to_string())
                .unwrap_or_else(|_| addr.to_owned());
        }
    }

    req.peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_owned())
}

/// Middleware rejecting clients over their request budget with `429 Too Many Requests`.
#[derive(Clone)]
pub struct RateLimit {
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    trust_forwarded: bool,
}

impl RateLimit {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self {
            limiter,
            clock: Arc::new(SystemClock),
            trust_forwarded: false,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Keys clients on `Forwarded` / `X-Forwarded-For` instead of the socket peer.
    pub fn trust_forwarded(mut self, trust: bool) -> Self {
        self.trust_forwarded = trust;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for RateLimit
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;

    type Error = ActixError;

    type Transform = RateLimitMiddleware<S>;

    type InitError = ();

    type Future = std::future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        std::future::ready(Ok(RateLimitMiddleware {
            service: Rc::new(service),
            limiter: self.limiter.clone(),
            clock: self.clock.clone(),
            trust_forwarded: self.trust_forwarded,
        }))
    }
}

pub struct RateLimitMiddleware<S> {
    service: Rc<S>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
    trust_forwarded: bool,
}

impl<S, B> Service<ServiceRequest> for RateLimitMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = ActixError> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = ActixError;
    type Future =
        std::pin::Pin<Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>>>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let key = client_key(&req, self.trust_forwarded);
        let admitted = self.limiter.check(&key, self.clock.now());

        Box::pin(async move {
            if !admitted {
                tracing::warn!(client = %key, path = req.path(), "Rate limit exceeded");
                return Err(Error::RateLimited.into());
            }

            service.call(req).await
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::{
        dev::ServiceResponse,
        http::StatusCode,
        test::{self, TestRequest},
        web, App, HttpResponse,
    };

    use crate::clock::ManualClock;

    use super::*;

    fn status(res: Result<ServiceResponse, ActixError>) -> StatusCode {
        match res {
            Ok(res) => res.status(),
            Err(e) => e.as_response_error().status_code(),
        }
    }

    fn from_peer(peer: &str) -> TestRequest {
        TestRequest::get().uri("/").peer_addr(peer.parse().unwrap())
    }

    #[actix_web::test]
    async fn test_fixed_window() {
        let limiter = RateLimiter::new(2, Duration::from_secs(300));
        let start = Utc::now();

        assert!(limiter.check("10.0.0.1", start));
        assert!(limiter.check("10.0.0.1", start));
        assert!(!limiter.check("10.0.0.1", start));

        // Other clients have their own budget.
        assert!(limiter.check("10.0.0.2", start));

        let later = start + delta(Duration::from_secs(300));
        assert!(limiter.check("10.0.0.1", later));
    }

    #[actix_web::test]
    async fn test_prune_drops_idle_clients() {
        let limiter = RateLimiter::new(10, Duration::from_secs(60));
        let start = Utc::now();

        limiter.check("a", start);
        limiter.check("b", start + delta(Duration::from_secs(30)));

        assert_eq!(limiter.prune(start + delta(Duration::from_secs(61))), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[actix_web::test]
    async fn test_middleware_rejects_over_limit() {
        let clock = ManualClock::default();
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(300)));

        let app = test::init_service(
            App::new()
                .wrap(RateLimit::new(limiter).with_clock(Arc::new(clock.clone())))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        for _ in 0..2 {
            let res = test::call_service(&app, from_peer("203.0.113.7:50000").to_request()).await;
            assert_eq!(res.status(), StatusCode::OK);
        }

        // The port is not part of the key.
        let res = test::try_call_service(&app, from_peer("203.0.113.7:50001").to_request()).await;
        assert_eq!(status(res), StatusCode::TOO_MANY_REQUESTS);

        // A different client is unaffected.
        let res = test::call_service(&app, from_peer("198.51.100.1:40000").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);

        clock.advance(Duration::from_secs(300));
        let res = test::call_service(&app, from_peer("203.0.113.7:50000").to_request()).await;
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn test_forwarded_header_is_ignored_by_default() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(300)));

        let app = test::init_service(
            App::new()
                .wrap(RateLimit::new(limiter))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let mut admitted = 0;
        for i in 0..20 {
            let req = from_peer("192.0.2.9:1234")
                .insert_header(("x-forwarded-for", format!("10.0.0.{i}")))
                .to_request();
            if status(test::try_call_service(&app, req).await) == StatusCode::OK {
                admitted += 1;
            }
        }

        assert_eq!(admitted, 2);
    }

    #[actix_web::test]
    async fn test_trusted_proxy_keys_on_forwarded_client() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(300)));

        let app = test::init_service(
            App::new()
                .wrap(RateLimit::new(limiter).trust_forwarded(true))
                .route("/", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        // Two clients behind the same proxy.
        for client in ["10.0.0.1", "10.0.0.2"] {
            let req = from_peer("192.0.2.1:443")
                .insert_header(("x-forwarded-for", client))
                .to_request();
            assert_eq!(status(test::try_call_service(&app, req).await), StatusCode::OK);
        }

        let req = from_peer("192.0.2.1:443")
            .insert_header(("x-forwarded-for", "10.0.0.1"))
            .to_request();
        assert_eq!(
            status(test::try_call_service(&app, req).await),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
