//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use polyserve::config::ServerConfig;
use polyserve::lifecycle::Server;
use polyserve::routing::Router;
use polyserve::Service;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Loopback config with a random port, no TLS, no signal handlers.
pub fn quiet_config() -> ServerConfig {
    let mut config = ServerConfig::local();
    config.http2.enabled = false;
    config.shutdown.sighup = false;
    config.shutdown.sigterm = false;
    config.shutdown.sigint = false;
    config
}

/// Build, start and return a server with the given routes and services.
#[allow(dead_code)]
pub async fn start(
    config: ServerConfig,
    router: Router,
    services: Vec<Arc<dyn Service>>,
) -> (Arc<Server>, SocketAddr) {
    let mut builder = Server::builder(config).router(router);
    for service in services {
        builder = builder.service(service).unwrap();
    }
    let server = builder.build().unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

/// Write raw bytes to the server and return everything it sends back.
#[allow(dead_code)]
pub async fn raw_exchange(addr: SocketAddr, payload: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

/// Read whatever arrives on `stream` until `idle` passes with no data.
#[allow(dead_code)]
pub async fn read_available(stream: &mut TcpStream, idle: Duration) -> String {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match tokio::time::timeout(idle, stream.read(&mut buf)).await {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
            Ok(Err(_)) => break,
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}
