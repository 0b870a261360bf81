//! Built-in stages: logging, validation, rate limiting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{info, warn};

use super::chain::{Middleware, Next};
use super::context::CallContext;
use crate::error::{CodemodeError, Result};

/// Sink for call logs, injected into [`LoggingMiddleware`].
pub trait CallLogger: Send + Sync {
    fn call_started(&self, ctx: &CallContext);

    fn call_finished(
        &self,
        ctx: &CallContext,
        duration_ms: u64,
        outcome: std::result::Result<&Value, &CodemodeError>,
    );
}

/// Routes call logs to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingCallLogger;

impl CallLogger for TracingCallLogger {
    fn call_started(&self, ctx: &CallContext) {
        info!(
            event = "call.started",
            call_id = %ctx.call_id(),
            target = %ctx.target(),
            method = %ctx.method(),
            arg_count = ctx.args().len(),
        );
    }

    fn call_finished(
        &self,
        ctx: &CallContext,
        duration_ms: u64,
        outcome: std::result::Result<&Value, &CodemodeError>,
    ) {
        match outcome {
            Ok(_) => info!(
                event = "call.finished",
                call_id = %ctx.call_id(),
                duration_ms = duration_ms,
                success = true,
            ),
            Err(e) => warn!(
                event = "call.finished",
                call_id = %ctx.call_id(),
                duration_ms = duration_ms,
                success = false,
                error = %e,
            ),
        }
    }
}

/// Logs every call before and after the rest of the chain.
pub struct LoggingMiddleware {
    logger: Arc<dyn CallLogger>,
}

impl LoggingMiddleware {
    pub fn new(logger: Arc<dyn CallLogger>) -> Self {
        Self { logger }
    }

    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingCallLogger))
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, ctx: CallContext, next: Next<'_>) -> Result<Value> {
        self.logger.call_started(&ctx);
        let started = std::time::Instant::now();
        let result = next.run(ctx.clone()).await;
        let duration_ms = started.elapsed().as_millis() as u64;
        self.logger.call_finished(&ctx, duration_ms, result.as_ref());
        result
    }
}

/// Verdict of a validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Accept,
    Reject(String),
}

impl From<bool> for Validation {
    fn from(ok: bool) -> Self {
        if ok {
            Validation::Accept
        } else {
            Validation::Reject("validation failed".to_string())
        }
    }
}

/// A string is always a rejection reason.
impl From<String> for Validation {
    fn from(reason: String) -> Self {
        Validation::Reject(reason)
    }
}

impl From<&str> for Validation {
    fn from(reason: &str) -> Self {
        Validation::Reject(reason.to_string())
    }
}

impl From<std::result::Result<(), String>> for Validation {
    fn from(r: std::result::Result<(), String>) -> Self {
        match r {
            Ok(()) => Validation::Accept,
            Err(reason) => Validation::Reject(reason),
        }
    }
}

type Validator = Arc<dyn Fn(&CallContext) -> Validation + Send + Sync>;

/// Rejects calls the validator does not accept, before anything downstream runs.
pub struct ValidationMiddleware {
    name: String,
    validator: Validator,
}

impl ValidationMiddleware {
    pub fn new<F, V>(validator: F) -> Self
    where
        F: Fn(&CallContext) -> V + Send + Sync + 'static,
        V: Into<Validation>,
    {
        Self::named("validation", validator)
    }

    pub fn named<F, V>(name: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&CallContext) -> V + Send + Sync + 'static,
        V: Into<Validation>,
    {
        Self {
            name: name.into(),
            validator: Arc::new(move |ctx: &CallContext| -> Validation { validator(ctx).into() }),
        }
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: CallContext, next: Next<'_>) -> Result<Value> {
        match (self.validator)(&ctx) {
            Validation::Accept => next.run(ctx).await,
            Validation::Reject(reason) => Err(CodemodeError::Rejected {
                middleware: self.name.clone(),
                reason: format!("{}.{}: {reason}", ctx.target(), ctx.method()),
            }),
        }
    }
}

/// Sliding-window limiter: at most `max_calls` admitted within any `window`.
///
/// Rejected calls do not consume capacity.
pub struct RateLimitMiddleware {
    max_calls: usize,
    window: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimitMiddleware {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls,
            window,
            admitted: Mutex::new(VecDeque::with_capacity(max_calls)),
        }
    }

    pub fn per_second(max_calls: usize) -> Self {
        Self::new(max_calls, Duration::from_secs(1))
    }

    fn try_admit(&self) -> bool {
        let now = Instant::now();
        let mut admitted = self.admitted.lock().unwrap_or_else(|p| p.into_inner());
        while admitted
            .front()
            .is_some_and(|t| now.duration_since(*t) >= self.window)
        {
            admitted.pop_front();
        }
        if admitted.len() >= self.max_calls {
            return false;
        }
        admitted.push_back(now);
        true
    }
}

#[async_trait]
impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &str {
        "rate_limit"
    }

    async fn handle(&self, ctx: CallContext, next: Next<'_>) -> Result<Value> {
        if !self.try_admit() {
            return Err(CodemodeError::RateLimited {
                limit: self.max_calls,
                window_ms: self.window.as_millis() as u64,
            });
        }
        next.run(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_conversions() {
        assert_eq!(Validation::from(true), Validation::Accept);
        assert!(matches!(Validation::from(false), Validation::Reject(_)));
        assert_eq!(
            Validation::from("missing id"),
            Validation::Reject("missing id".into())
        );
        assert_eq!(Validation::from(Ok::<(), String>(())), Validation::Accept);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limiter_window_slides() {
        let limiter = RateLimitMiddleware::new(2, Duration::from_millis(1000));
        assert!(limiter.try_admit());
        tokio::time::advance(Duration::from_millis(400)).await;
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit());

        // first admission ages out, second still counts
        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(limiter.try_admit());
        assert!(!limiter.try_admit());
    }
}
