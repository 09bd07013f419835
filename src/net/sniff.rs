//! First-byte protocol sniffing for the polyglot listener.
//!
//! # Responsibilities
//! - Peek the first byte of an accepted socket without consuming it
//! - Classify the connection as TLS, plaintext HTTP, or garbage
//! - Spot the HTTP/2 prior-knowledge preface when insecure h2 is allowed
//!
//! # Design Decisions
//! - A TLS handshake record starts with content-type `0x16`; every HTTP
//!   method starts with a printable ASCII byte; nothing else is served
//! - No sniff timeout: the peek waits as long as the transport's own idle
//!   handling allows
//! - Rejected connections get a minimal hand-written 400 so even a
//!   confused client sees a diagnosis before the socket is destroyed

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// TLS handshake record content type.
const TLS_HANDSHAKE: u8 = 0x16;

/// The HTTP/2 prior-knowledge connection preface starts with this.
const H2_PREFACE_HEAD: &[u8] = b"PRI";

/// What the first byte says this connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tls,
    Http,
    Rejected(u8),
}

/// What [`sniff`] decided for an accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sniffed {
    Tls,
    Http1,
    /// Plaintext HTTP/2 preface, only reported when asked for.
    H2Preface,
    Rejected(u8),
    /// Peer closed before sending anything.
    Closed,
}

/// Classify a connection by its first byte.
pub fn classify(first: u8) -> Protocol {
    match first {
        TLS_HANDSHAKE => Protocol::Tls,
        33..=126 => Protocol::Http,
        other => Protocol::Rejected(other),
    }
}

/// Peek the socket's first bytes and classify without consuming them, so
/// the chosen sub-server reads the stream from the start.
pub async fn sniff(stream: &TcpStream, detect_h2_preface: bool) -> std::io::Result<Sniffed> {
    let mut buf = [0u8; 3];
    let mut seen = 0;
    loop {
        // peek waits for readability; 0 bytes only on EOF
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(Sniffed::Closed);
        }
        match classify(buf[0]) {
            Protocol::Tls => return Ok(Sniffed::Tls),
            Protocol::Rejected(b) => return Ok(Sniffed::Rejected(b)),
            Protocol::Http => {
                if !detect_h2_preface {
                    return Ok(Sniffed::Http1);
                }
                // Need three bytes to tell "PRI * HTTP/2.0" from a
                // plain HTTP/1 request line; keep peeking until the
                // decision is unambiguous.
                if n < H2_PREFACE_HEAD.len() && buf[..n] == H2_PREFACE_HEAD[..n] {
                    if n <= seen {
                        // The bytes already buffered keep the socket
                        // readable, so an immediate re-peek would spin.
                        // Back off until the peer sends more.
                        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
                    }
                    seen = n;
                    continue;
                }
                return Ok(if buf[..H2_PREFACE_HEAD.len().min(n)] == *H2_PREFACE_HEAD {
                    Sniffed::H2Preface
                } else {
                    Sniffed::Http1
                });
            }
        }
    }
}

/// Answer an unclassifiable connection with a minimal 400 and flush; the
/// caller destroys the socket afterwards.
pub async fn write_reject(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(b"HTTP/1.1 400 Bad Request\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await?;
    stream.flush().await
}
