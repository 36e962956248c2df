//! Error classification and retry policy.
//!
//! Classification works from the executor's explicit error kinds. The
//! message-text heuristics only run for `ExecutorError::Other`, as a
//! last-resort fallback — wording is too brittle to be the primary signal.

use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use regex::Regex;
use tracing::{debug, warn};

use crate::config::{BreakerConfig, RetryConfig};
use crate::error::ExecutorError;

use super::breaker::{BreakerRegistry, OperationClass};

/// Broad failure category driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; fail fast.
    Permanent,
    /// One substage degraded; the run can continue.
    Partial,
}

/// What the caller should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecommendedAction {
    Retry,
    Skip,
    Abort,
    ContinuePartial,
}

/// Full resolution for one failure.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub category: ErrorCategory,
    pub should_retry: bool,
    pub retry_delay: Option<Duration>,
    pub can_continue: bool,
    pub recommended_action: RecommendedAction,
    /// Short, actionable, cost-free text safe to show to users.
    pub user_message: String,
}

/// Context for a failure being resolved.
#[derive(Debug, Clone, Copy)]
pub struct ErrorContext {
    pub class: OperationClass,
    /// Execution attempts already finished (the failing one included).
    pub attempt: u32,
    /// Total execution attempts allowed.
    pub max_attempts: u32,
    pub now: DateTime<Utc>,
}

fn transient_text_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)rate.?limit|timed?.?out|timeout|unavailable|overloaded|connection|temporar")
            .expect("transient pattern is valid")
    })
}

/// Classifies failures and computes retry backoff; owns the breakers.
pub struct ErrorClassifier {
    retry: RetryConfig,
    breakers: BreakerRegistry,
}

impl ErrorClassifier {
    pub fn new(retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            retry,
            breakers: BreakerRegistry::new(breaker),
        }
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Categorize an executor failure by its kind.
    pub fn classify(&self, err: &ExecutorError) -> ErrorCategory {
        match err {
            ExecutorError::Timeout { .. }
            | ExecutorError::RateLimited { .. }
            | ExecutorError::Unavailable { .. } => ErrorCategory::Transient,
            ExecutorError::AuthFailed
            | ExecutorError::InvalidInput { .. }
            | ExecutorError::BudgetExceeded { .. } => ErrorCategory::Permanent,
            ExecutorError::StageFailed { .. } => ErrorCategory::Partial,
            ExecutorError::Other(text) => {
                // Fallback heuristic only; explicit kinds are authoritative.
                if transient_text_pattern().is_match(text) {
                    debug!(text = %text, "Classified untyped error as transient by text");
                    ErrorCategory::Transient
                } else {
                    ErrorCategory::Permanent
                }
            }
        }
    }

    /// Deterministic (pre-jitter) backoff delay for a given attempt number.
    ///
    /// `attempt` is 1-based. Rate limits back off steeper than other
    /// transient errors. Capped at the configured maximum.
    pub fn base_delay(&self, err: &ExecutorError, attempt: u32) -> Duration {
        let multiplier = match err {
            ExecutorError::RateLimited { .. } => self.retry.rate_limit_multiplier,
            _ => self.retry.backoff_multiplier,
        };
        let exponent = attempt.saturating_sub(1).min(16);
        let factor = multiplier.powi(exponent as i32);
        let delay = self.retry.base_delay.mul_f64(factor.max(1.0));
        delay.min(self.retry.max_delay)
    }

    /// Apply ±jitter so synchronized clients don't retry in lockstep.
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        let jitter = self.retry.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        delay.mul_f64(factor)
    }

    /// Resolve a failure: category, retry decision, and user-safe message.
    ///
    /// When the class's circuit is open this short-circuits with an abort
    /// recommendation without consulting anything else.
    pub fn handle_error(&self, err: &ExecutorError, ctx: &ErrorContext) -> Resolution {
        if self.breakers.is_open(ctx.class, ctx.now) {
            return Resolution {
                category: self.classify(err),
                should_retry: false,
                retry_delay: None,
                can_continue: false,
                recommended_action: RecommendedAction::Abort,
                user_message: "Enrichment is paused while the service recovers. It will resume automatically.".to_string(),
            };
        }

        self.breakers.record_failure(ctx.class, ctx.now);

        // Full diagnostics stay backend-side; the user message never carries
        // exception text or cost figures.
        warn!(
            class = %ctx.class,
            attempt = ctx.attempt,
            error = ?err,
            "Enrichment failure"
        );

        let category = self.classify(err);
        match category {
            ErrorCategory::Transient => {
                let should_retry = ctx.attempt < ctx.max_attempts;
                let retry_delay =
                    should_retry.then(|| self.with_jitter(self.base_delay(err, ctx.attempt)));
                Resolution {
                    category,
                    should_retry,
                    retry_delay,
                    can_continue: false,
                    recommended_action: if should_retry {
                        RecommendedAction::Retry
                    } else {
                        RecommendedAction::Abort
                    },
                    user_message: if should_retry {
                        "Couldn't reach the enrichment service, retrying...".to_string()
                    } else {
                        "Enrichment couldn't complete after several tries. Please try again later.".to_string()
                    },
                }
            }
            ErrorCategory::Permanent => Resolution {
                category,
                should_retry: false,
                retry_delay: None,
                can_continue: false,
                recommended_action: RecommendedAction::Abort,
                user_message: self.permanent_message(err),
            },
            ErrorCategory::Partial => Resolution {
                category,
                should_retry: false,
                retry_delay: None,
                can_continue: true,
                recommended_action: RecommendedAction::ContinuePartial,
                user_message: self.partial_message(err),
            },
        }
    }

    /// Record a successful operation, advancing breaker recovery.
    pub fn record_success(&self, class: OperationClass) {
        self.breakers.record_success(class);
    }

    fn permanent_message(&self, err: &ExecutorError) -> String {
        match err {
            ExecutorError::AuthFailed => {
                "Enrichment isn't set up correctly. Check your connection settings.".to_string()
            }
            ExecutorError::BudgetExceeded { .. } => {
                "Enrichment is paused because the usage limit was reached.".to_string()
            }
            ExecutorError::InvalidInput { .. } => {
                "This session couldn't be enriched. Its data may be incomplete.".to_string()
            }
            _ => "Enrichment failed. Please try again later.".to_string(),
        }
    }

    fn partial_message(&self, err: &ExecutorError) -> String {
        match err {
            ExecutorError::StageFailed { stage, .. } => {
                format!("The {stage} step couldn't finish; other results are still available.")
            }
            _ => "Part of the enrichment couldn't finish; other results are still available."
                .to_string(),
        }
    }
}
