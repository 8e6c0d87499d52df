//! Decides whether a failed attempt is worth retrying.
//!
//! Rules are applied in order: the retry ceiling first, then the permanent
//! pattern groups, then the transient group. Anything left unrecognized is
//! treated as transient and still bounded by the ceiling.

use once_cell::sync::Lazy;
use regex::RegexSet;
use std::time::Duration;

use crate::config::Config;

/// Why an error can never succeed on retry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermanentReason {
    /// Private, removed, copyright-claimed content or a terminated account.
    Unavailable,
    /// Age or geo restriction.
    Restricted,
    /// Malformed/unsupported URL or no viable format.
    Unsupported,
    /// Sign-in or bot verification challenge.
    CredentialsRequired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    Permanent(PermanentReason),
    Transient,
    Unknown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    Retry { delay: Duration },
    Fail { message: String },
}

static UNAVAILABLE: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bprivate\b",
        r"(?i)\bnot available\b",
        r"(?i)\bno longer available\b",
        r"(?i)\b(video|content|media) (is )?unavailable\b",
        r"(?i)\b(has been|was) (removed|deleted)\b",
        r"(?i)copyright",
        r"(?i)account (has been |was )?(suspended|terminated)",
    ])
    .unwrap()
});

static RESTRICTED: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)age[- ]?restricted",
        r"(?i)confirm your age",
        r"(?i)inappropriate for some users",
        r"(?i)geo[- ]?restrict",
        r"(?i)(blocked|available) in your (country|region)",
    ])
    .unwrap()
});

static UNSUPPORTED: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)unsupported url",
        r"(?i)(invalid|malformed) url",
        r"(?i)is not a valid url",
        r"(?i)no video formats found",
        r"(?i)requested format is not available",
        r"(?i)no suitable formats?",
    ])
    .unwrap()
});

static CREDENTIALS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)sign in to confirm",
        r"(?i)not a bot",
        r"(?i)\bbot\b",
        r"(?i)login required",
        r"(?i)cookies? (are|is) (no longer valid|invalid|expired)",
    ])
    .unwrap()
});

static TRANSIENT: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)timed? ?out",
        r"(?i)\bconnection\b",
        r"(?i)\bnetwork\b",
        r"(?i)temporary failure in name resolution",
        r"(?i)rate[- ]?limit",
        r"(?i)too many requests",
        r"\b(429|5\d\d)\b",
        r"(?i)service unavailable|bad gateway|internal server error",
        r"(?i)incomplete read",
    ])
    .unwrap()
});

/// Sorts error text into a class. Credential challenges are checked before
/// unavailability so "not a bot" pages keep their remediation message.
pub fn categorize(error_text: &str) -> ErrorClass {
    if CREDENTIALS.is_match(error_text) {
        ErrorClass::Permanent(PermanentReason::CredentialsRequired)
    } else if RESTRICTED.is_match(error_text) {
        ErrorClass::Permanent(PermanentReason::Restricted)
    } else if UNSUPPORTED.is_match(error_text) {
        ErrorClass::Permanent(PermanentReason::Unsupported)
    } else if UNAVAILABLE.is_match(error_text) {
        ErrorClass::Permanent(PermanentReason::Unavailable)
    } else if TRANSIENT.is_match(error_text) {
        ErrorClass::Transient
    } else {
        ErrorClass::Unknown
    }
}

/// True for content that no client profile can ever reach.
pub fn is_unconditionally_fatal(error_text: &str) -> bool {
    categorize(error_text) == ErrorClass::Permanent(PermanentReason::Unavailable)
}

/// Retry ceiling aside, the knobs of the retry decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_base: u32,
    pub max_delay: Duration,
    /// One backoff step; also the minimum delay.
    pub unit: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            backoff_base: 2,
            max_delay: Duration::from_secs(60),
            unit: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        RetryPolicy {
            backoff_base: config.retry_backoff_base,
            max_delay: config.retry_backoff_max(),
            unit: Duration::from_secs(1),
        }
    }

    /// `min(base ^ retry_count, max_delay)`, never less than one unit.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let steps = self.backoff_base.checked_pow(retry_count).unwrap_or(u32::MAX);
        let delay = self.unit.saturating_mul(steps).min(self.max_delay);
        delay.max(self.unit)
    }

    pub fn classify(&self, error_text: &str, retry_count: u32, max_retries: u32) -> Decision {
        if retry_count >= max_retries {
            return Decision::Fail {
                message: format!("failed after {} retries: {}", retry_count, error_text),
            };
        }

        match categorize(error_text) {
            ErrorClass::Permanent(PermanentReason::CredentialsRequired) => Decision::Fail {
                message: format!(
                    "{} (sign-in or bot verification required; cookies are likely missing, invalid or expired)",
                    error_text
                ),
            },
            ErrorClass::Permanent(_) => Decision::Fail {
                message: error_text.to_string(),
            },
            ErrorClass::Transient => Decision::Retry {
                delay: self.backoff(retry_count),
            },
            ErrorClass::Unknown => {
                tracing::warn!(error = %error_text, "unclassified error, retrying as transient");
                Decision::Retry {
                    delay: self.backoff(retry_count),
                }
            }
        }
    }
}
