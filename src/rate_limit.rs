use axum::{
    Json,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Actor key used when a request carries no client address.
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Per-actor token bucket guarding the expensive endpoints.
pub struct ActorRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
    requests: u32,
    period: Duration,
}

pub type SharedRateLimiter = Arc<ActorRateLimiter>;

impl ActorRateLimiter {
    /// Allow `requests` per `period` for each actor. Zero values are raised
    /// to the smallest usable limit.
    pub fn new(requests: u32, period: Duration) -> Self {
        let burst = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        let replenish = (period / burst.get()).max(Duration::from_millis(1));
        let quota = Quota::with_period(replenish)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        Self {
            limiter: RateLimiter::keyed(quota),
            requests: burst.get(),
            period,
        }
    }

    /// Take one request from the actor's bucket.
    pub fn check(&self, actor: &str) -> bool {
        let allowed = self.limiter.check_key(&actor.to_string()).is_ok();
        if !allowed {
            warn!(
                "Rate limit of {} requests per {:?} exceeded by {}",
                self.requests, self.period, actor
            );
        }
        // Keep the keyed state from growing without bound
        if self.limiter.len() > 10_000 {
            self.limiter.retain_recent();
        }
        allowed
    }
}

/// First `X-Forwarded-For` address, else the peer address, else anonymous.
pub fn actor_key(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    match (forwarded, peer) {
        (Some(address), _) => address.to_string(),
        (None, Some(peer)) => peer.ip().to_string(),
        (None, None) => ANONYMOUS_ACTOR.to_string(),
    }
}

pub async fn rate_limit_middleware(
    State(limiter): State<SharedRateLimiter>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let actor = actor_key(request.headers(), peer);

    if !limiter.check(&actor) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "code": "rate_limit_exceeded",
                "message": "Too many requests. Please try again later.",
            })),
        )
            .into_response();
    }

    debug!("Rate limit check passed for {}", actor);
    next.run(request).await
}
