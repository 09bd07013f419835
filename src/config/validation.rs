//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, port hint bounds ordered)
//! - Catch contradictory combinations (HTTP/2 without TLS)
//!
//! # Design Decisions
//! - Returns all validation errors, not just the first
//! - Validation is a pure function over the config
//! - Runs before a config is accepted into the system

use thiserror::Error;

use crate::config::schema::ServerConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("port_hint range is empty: min {min} > max {max}")]
    EmptyHintRange { min: u16, max: u16 },

    #[error("port_hint start {start} is outside [{min}, {max}]")]
    HintStartOutOfRange { start: u16, min: u16, max: u16 },

    #[error("port_hint next step must be at least 1")]
    ZeroHintStep,

    #[error("http2 requires tls; set http2.allow_insecure to opt out")]
    Http2WithoutTls,

    #[error("redirect_plaintext requires tls")]
    RedirectWithoutTls,

    #[error("timeouts.response_secs must be at least 1")]
    ZeroResponseTimeout,

    #[error("limits.max_connections must be at least 1")]
    ZeroConnectionLimit,

    #[error("sse.max_subscribers must be at least 1")]
    ZeroSubscriberLimit,
}

/// Check semantic constraints; collects every violation.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(hint) = &config.port_hint {
        if hint.min > hint.max {
            errors.push(ValidationError::EmptyHintRange {
                min: hint.min,
                max: hint.max,
            });
        } else if hint.start < hint.min || hint.start > hint.max {
            errors.push(ValidationError::HintStartOutOfRange {
                start: hint.start,
                min: hint.min,
                max: hint.max,
            });
        }
        if hint.next == 0 {
            errors.push(ValidationError::ZeroHintStep);
        }
    }

    if config.http2.enabled && config.tls.is_none() && !config.http2.allow_insecure {
        errors.push(ValidationError::Http2WithoutTls);
    }
    if config.redirect_plaintext && config.tls.is_none() {
        errors.push(ValidationError::RedirectWithoutTls);
    }
    if config.timeouts.response_secs == 0 {
        errors.push(ValidationError::ZeroResponseTimeout);
    }
    if config.limits.max_connections == 0 {
        errors.push(ValidationError::ZeroConnectionLimit);
    }
    if config.sse.max_subscribers == 0 {
        errors.push(ValidationError::ZeroSubscriberLimit);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
