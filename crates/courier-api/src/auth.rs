use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use courier_types::api::{LoginRequest, RegisterRequest};

use crate::error::ApiError;
use crate::SharedState;

/// An address gets this many register/login attempts per window before it
/// is turned away. Argon2 makes each attempt expensive server-side, which
/// is exactly why the window is small.
const ATTEMPTS_PER_WINDOW: usize = 10;
const ATTEMPT_WINDOW: Duration = Duration::from_secs(60);

struct LimiterState {
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
    /// When the map was last swept of addresses that went quiet.
    swept_at: Instant,
}

/// Sliding-window limiter for the credential endpoints, keyed by client
/// address.
///
/// Each address keeps a deque of its attempt times; the front is popped as
/// attempts age past the window. Addresses that stop showing up would leak
/// map entries, so once per window the whole map is swept.
#[derive(Clone)]
pub struct AuthRateLimiter {
    inner: Arc<Mutex<LimiterState>>,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LimiterState {
                attempts: HashMap::new(),
                swept_at: Instant::now(),
            })),
        }
    }

    /// Record an attempt from `ip` and report whether it is allowed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut state = self.inner.lock().expect("rate limiter lock poisoned");

        if now.duration_since(state.swept_at) >= ATTEMPT_WINDOW {
            state.attempts.retain(|_, window| {
                window
                    .back()
                    .is_some_and(|t| now.duration_since(*t) < ATTEMPT_WINDOW)
            });
            state.swept_at = now;
        }

        let window = state.attempts.entry(ip).or_default();
        while let Some(oldest) = window.front() {
            if now.duration_since(*oldest) < ATTEMPT_WINDOW {
                break;
            }
            window.pop_front();
        }

        if window.len() >= ATTEMPTS_PER_WINDOW {
            return false;
        }
        window.push_back(now);
        true
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn register(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.auth_rate_limiter.check(addr.ip()) {
        return Err(ApiError::TooManyRequests);
    }
    if req.username.is_empty() || req.password.is_empty() {
        return Err(ApiError::BadRequest(
            "username and password are required".into(),
        ));
    }

    let response = state.auth.register(req).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn login(
    State(state): State<SharedState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.auth_rate_limiter.check(addr.ip()) {
        return Err(ApiError::TooManyRequests);
    }

    let response = state.auth.login(req).await?;
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limiter_trips_after_the_window_fills() {
        let limiter = AuthRateLimiter::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();

        for _ in 0..ATTEMPTS_PER_WINDOW {
            assert!(limiter.check(ip));
        }
        assert!(!limiter.check(ip));

        // A different address is unaffected
        let other: IpAddr = "203.0.113.10".parse().unwrap();
        assert!(limiter.check(other));
    }

    #[test]
    fn refused_attempts_do_not_extend_the_window() {
        let limiter = AuthRateLimiter::new();
        let ip: IpAddr = "203.0.113.11".parse().unwrap();

        for _ in 0..ATTEMPTS_PER_WINDOW {
            limiter.check(ip);
        }
        // Refusals are not recorded, so the deque stays at the cap
        assert!(!limiter.check(ip));
        let state = limiter.inner.lock().unwrap();
        assert_eq!(state.attempts[&ip].len(), ATTEMPTS_PER_WINDOW);
    }
}
