//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the server runtime.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind hostname: a literal IP, a DNS name, or "0.0.0.0"/"::" for any
    /// interface.
    pub hostname: String,

    /// Bind port. 0 asks the OS for a random free port. Ignored when a
    /// port hint is configured.
    pub port: u16,

    /// Probe successive ports starting at a hint instead of binding a
    /// fixed port.
    pub port_hint: Option<PortHint>,

    /// TLS material. Required for HTTP/2 unless insecure HTTP/2 is
    /// explicitly allowed.
    pub tls: Option<TlsConfig>,

    /// HTTP/2 settings.
    pub http2: Http2Config,

    /// Whether plaintext requests on a TLS-enabled listener get a 301 to
    /// the https origin instead of a rejection.
    pub redirect_plaintext: bool,

    /// Timeout settings.
    pub timeouts: TimeoutConfig,

    /// Connection limits (backpressure).
    pub limits: LimitsConfig,

    /// Which OS signals trigger shutdown.
    pub shutdown: ShutdownConfig,

    /// Error exposure and failure policy.
    pub errors: ErrorConfig,

    /// Record per-hook timings and emit them as `server-timing` headers.
    pub timing: bool,

    /// Server-sent-event room settings.
    pub sse: SseConfig,
}

/// Bounded linear port probing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PortHint {
    /// First port to try.
    pub start: u16,

    /// Lowest acceptable port.
    pub min: u16,

    /// Highest acceptable port.
    pub max: u16,

    /// Step between probes.
    pub next: u16,
}

impl Default for PortHint {
    fn default() -> Self {
        Self {
            start: 8080,
            min: 1024,
            max: 65535,
            next: 1,
        }
    }
}

/// TLS material for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain file (PEM).
    pub cert_path: String,

    /// Path to private key file (PEM).
    pub key_path: String,
}

/// HTTP/2 settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    /// Offer h2 via ALPN on the TLS listener.
    pub enabled: bool,

    /// Accept the h2 prior-knowledge preface on plaintext connections.
    pub allow_insecure: bool,

    /// Honor `ResponseProperties::push` targets with server push.
    pub push: bool,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            allow_insecure: false,
            push: true,
        }
    }
}

/// Timeout settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time a handler gets to produce a response before a 504 is raced
    /// ahead of it, in seconds.
    pub response_secs: u64,

    /// Time an unconsumed body stream is kept before being reclaimed, in
    /// seconds.
    pub body_abandon_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            response_secs: 600,
            body_abandon_secs: 120,
        }
    }
}

/// Connection limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrently-open connections before accept pauses.
    pub max_connections: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
        }
    }
}

/// Which OS signals trigger shutdown. Each is independently toggleable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub sighup: bool,
    pub sigterm: bool,
    pub sigint: bool,

    /// Set in a non-primary cluster worker: skips the interrupt handler
    /// so the primary's own shutdown is not raced.
    pub worker: bool,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            sighup: true,
            sigterm: true,
            sigint: true,
            worker: false,
        }
    }
}

/// Error exposure and failure policy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ErrorConfig {
    /// Include failure detail in 500 bodies. Off by default so internals
    /// are not leaked.
    pub verbose: bool,

    /// Stop the whole server when a handler fails, instead of answering
    /// that one request with a 500 and carrying on.
    pub internal_error_shutdown: bool,
}

/// Server-sent-event room settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SseConfig {
    /// Events remembered per room for `Last-Event-Id` replay.
    pub history: usize,

    /// Subscribers allowed per room before new ones get a 503.
    pub max_subscribers: usize,

    /// Keep-alive comment interval, in seconds.
    pub keep_alive_secs: u64,
}

impl Default for SseConfig {
    fn default() -> Self {
        Self {
            history: 1000,
            max_subscribers: 100,
            keep_alive_secs: 30,
        }
    }
}

impl ServerConfig {
    /// A listener bound to loopback on a random port; the usual test and
    /// embedding default.
    pub fn local() -> Self {
        Self {
            hostname: "127.0.0.1".to_string(),
            port: 0,
            ..Self::default()
        }
    }

    pub fn hostname_or_any(&self) -> &str {
        if self.hostname.is_empty() {
            "0.0.0.0"
        } else {
            &self.hostname
        }
    }
}
