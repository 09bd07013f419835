//! Streaming behavior of the SSE room service over a live server.

use std::sync::Arc;
use std::time::Duration;

use polyserve::config::schema::SseConfig;
use polyserve::lifecycle::StopReason;
use polyserve::routing::Router;
use polyserve::services::sse::SseRoom;
use polyserve::Service;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

mod common;

fn small_room() -> SseRoom {
    SseRoom::new(
        "/events",
        SseConfig {
            history: 50,
            max_subscribers: 4,
            keep_alive_secs: 60,
        },
    )
}

#[tokio::test]
async fn reconnect_replays_strictly_after_last_event_id() {
    let sse = Arc::new(small_room());
    let room = Arc::clone(sse.room());
    let (server, addr) = common::start(
        common::quiet_config(),
        Router::new(),
        vec![sse as Arc<dyn Service>],
    )
    .await;

    for n in 1..=10 {
        room.broadcast(Some("tick"), &format!("payload-{}", n));
    }

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"GET /events HTTP/1.1\r\nhost: localhost\r\nlast-event-id: 5\r\n\r\n",
        )
        .await
        .unwrap();
    let text = common::read_available(&mut stream, Duration::from_millis(300)).await;

    assert!(text.contains("HTTP/1.1 200"));
    assert!(text.contains("content-type: text/event-stream"));
    assert!(!text.contains("id: 5\n"));
    let positions: Vec<usize> = (6..=10)
        .map(|id| {
            text.find(&format!("id: {}\n", id))
                .unwrap_or_else(|| panic!("missing id {}", id))
        })
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "replay out of order");
    assert!(text.contains("event: welcome"));

    server.stop(StopReason::Requested).await;
}

#[tokio::test]
async fn live_broadcast_reaches_an_open_stream() {
    let sse = Arc::new(small_room());
    let room = Arc::clone(sse.room());
    let (server, addr) = common::start(
        common::quiet_config(),
        Router::new(),
        vec![sse as Arc<dyn Service>],
    )
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /events HTTP/1.1\r\nhost: localhost\r\n\r\n")
        .await
        .unwrap();
    // Wait for the join before broadcasting.
    let header = common::read_available(&mut stream, Duration::from_millis(200)).await;
    assert!(header.contains("HTTP/1.1 200"));
    assert_eq!(room.subscriber_count(), 1);

    room.broadcast(Some("news"), "it happened");
    let text = common::read_available(&mut stream, Duration::from_millis(200)).await;
    assert!(text.contains("event: news"));
    assert!(text.contains("data: it happened"));

    server.stop(StopReason::Requested).await;
}

#[tokio::test]
async fn full_room_answers_503_with_retry_after() {
    let sse = Arc::new(SseRoom::new(
        "/events",
        SseConfig {
            history: 10,
            max_subscribers: 0,
            keep_alive_secs: 60,
        },
    ));
    let (server, addr) = common::start(
        common::quiet_config(),
        Router::new(),
        vec![sse as Arc<dyn Service>],
    )
    .await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/events", addr))
        .header("accept", "application/json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    assert_eq!(response.headers().get("retry-after").unwrap(), "5");

    server.stop(StopReason::Requested).await;
}
