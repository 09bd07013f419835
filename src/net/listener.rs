//! Listener binding with hostname resolution, port probing, and
//! backpressure.
//!
//! # Responsibilities
//! - Resolve the configured hostname (any-interface, literal IP, DNS name)
//! - Bind an exact port, a random port, or probe a port-hint range
//! - Accept incoming TCP connections under a `max_connections` limit
//!
//! # Design Decisions
//! - "Free port" is decided by a real bind/unbind attempt; only the OS is
//!   authoritative, an availability check would race
//! - The connection permit is held for the connection's lifetime and
//!   released on drop, so backpressure survives handler panics

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use crate::config::schema::{PortHint, ServerConfig};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("failed to resolve hostname {hostname:?}: {source}")]
    Resolve {
        hostname: String,
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("no free port in [{min}, {max}] starting at {start}")]
    NoFreePort { start: u16, min: u16, max: u16 },

    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),
}

/// Resolve a bind hostname to an address. Empty or `"0.0.0.0"`/`"::"`
/// mean any interface; otherwise a literal IP is parsed directly and a
/// DNS name is looked up, falling back to loopback with a warning when
/// the lookup returns nothing usable.
pub async fn resolve_host(hostname: &str) -> Result<IpAddr, ListenerError> {
    if hostname.is_empty() || hostname == "0.0.0.0" {
        return Ok(IpAddr::from([0, 0, 0, 0]));
    }
    if hostname == "::" {
        return Ok(IpAddr::from([0u16, 0, 0, 0, 0, 0, 0, 0]));
    }
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ip);
    }
    match tokio::net::lookup_host((hostname, 0)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => Ok(addr.ip()),
            None => {
                tracing::warn!(
                    hostname,
                    "DNS lookup returned no addresses, falling back to loopback"
                );
                Ok(IpAddr::from([127, 0, 0, 1]))
            }
        },
        Err(source) => Err(ListenerError::Resolve {
            hostname: hostname.to_string(),
            source,
        }),
    }
}

/// Probe ports `start, start+next, …` within `[min, max]` and return the
/// first that is actually bindable right now. Each probe binds and
/// immediately drops the socket.
pub async fn find_free_port(ip: IpAddr, hint: &PortHint) -> Result<u16, ListenerError> {
    let mut port = hint.start.max(hint.min);
    while port <= hint.max {
        match TcpListener::bind(SocketAddr::new(ip, port)).await {
            Ok(probe) => {
                drop(probe);
                return Ok(port);
            }
            Err(e) => {
                tracing::debug!(port, error = %e, "Port probe failed, stepping");
            }
        }
        match port.checked_add(hint.next) {
            Some(p) => port = p,
            None => break,
        }
    }
    Err(ListenerError::NoFreePort {
        start: hint.start,
        min: hint.min,
        max: hint.max,
    })
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is
/// reached, new connections wait until a slot frees up.
pub struct Listener {
    inner: TcpListener,
    connection_limit: Arc<Semaphore>,
    max_connections: usize,
}

impl Listener {
    /// Resolve and bind per the configured hostname, port, and port hint.
    pub async fn bind(config: &ServerConfig) -> Result<Self, ListenerError> {
        let ip = resolve_host(&config.hostname).await?;
        let port = match &config.port_hint {
            Some(hint) => find_free_port(ip, hint).await?,
            None => config.port,
        };
        let addr = SocketAddr::new(ip, port);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ListenerError::Bind { addr, source })?;

        let local_addr = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { addr, source })?;

        tracing::info!(
            address = %local_addr,
            max_connections = config.limits.max_connections,
            "Listener bound"
        );

        Ok(Self {
            inner: listener,
            connection_limit: Arc::new(Semaphore::new(config.limits.max_connections)),
            max_connections: config.limits.max_connections,
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// Waits while the limit is saturated. Returns the stream and a permit
    /// that must be held for the connection's lifetime.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        // Acquire the permit first so a saturated server stops accepting.
        let permit = self
            .connection_limit
            .clone()
            .acquire_owned()
            .await
            .expect("connection semaphore closed");

        let (stream, addr) = self.inner.accept().await.map_err(ListenerError::Accept)?;

        tracing::debug!(
            peer_addr = %addr,
            available_permits = self.connection_limit.available_permits(),
            "Connection accepted"
        );

        Ok((stream, addr, ConnectionPermit { _permit: permit }))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.inner.local_addr()
    }

    pub fn available_permits(&self) -> usize {
        self.connection_limit.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// A permit representing a connection slot.
///
/// Dropping it releases the slot, so backpressure holds even if the
/// connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[tokio::test]
    async fn resolves_any_interface_forms() {
        assert_eq!(
            resolve_host("").await.unwrap(),
            IpAddr::from([0, 0, 0, 0])
        );
        assert_eq!(
            resolve_host("0.0.0.0").await.unwrap(),
            IpAddr::from([0, 0, 0, 0])
        );
        assert_eq!(
            resolve_host("192.168.1.5").await.unwrap(),
            "192.168.1.5".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn probing_skips_an_occupied_port() {
        let taken = TcpListener::bind(SocketAddr::new(loopback(), 0))
            .await
            .unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let hint = PortHint {
            start: taken_port,
            min: taken_port,
            max: taken_port.saturating_add(10),
            next: 1,
        };
        let free = find_free_port(loopback(), &hint).await.unwrap();
        assert_ne!(free, taken_port);
        assert!(free > taken_port && free <= hint.max);
    }

    #[tokio::test]
    async fn probing_exhausted_range_fails() {
        let taken = TcpListener::bind(SocketAddr::new(loopback(), 0))
            .await
            .unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let hint = PortHint {
            start: taken_port,
            min: taken_port,
            max: taken_port,
            next: 1,
        };
        let err = find_free_port(loopback(), &hint).await.unwrap_err();
        assert!(matches!(err, ListenerError::NoFreePort { .. }));
    }

    #[tokio::test]
    async fn bind_with_hint_lands_in_range() {
        let mut config = ServerConfig::local();
        config.http2.enabled = false;
        config.port_hint = Some(PortHint {
            start: 42000,
            min: 42000,
            max: 42999,
            next: 7,
        });
        let listener = Listener::bind(&config).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!((42000..=42999).contains(&port));
        assert_eq!((port - 42000) % 7, 0);
    }
}
