//! Server-sent-event rooms.
//!
//! # Responsibilities
//! - Keep a bounded event history with monotonically increasing ids
//! - Let clients join with `Last-Event-Id` replay, strictly after the id
//!   they last saw
//! - Broadcast, send privately, emit periodic keep-alive comments, and
//!   close every client stream on demand
//!
//! # Design Decisions
//! - Client bodies are channel sources with keep-alive connection
//!   semantics; a full room answers new joins with 503 rather than
//!   evicting anyone
//! - Each client channel is sized to hold a full history replay, so a
//!   join never blocks on its own backlog
//! - Dead clients are pruned when a write to them fails, not by timers

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::body::BodySource;
use crate::config::schema::SseConfig;
use crate::http::errors::negotiated_error;
use crate::http::request::Request;
use crate::http::response::ResponseProperties;
use crate::services::{Hook, Service};

/// One remembered event.
#[derive(Debug, Clone)]
struct Event {
    id: u64,
    name: Option<String>,
    data: String,
}

impl Event {
    fn to_wire(&self) -> Bytes {
        let mut out = format!("id: {}\n", self.id);
        if let Some(name) = &self.name {
            out.push_str(&format!("event: {}\n", name));
        }
        for line in self.data.lines() {
            out.push_str(&format!("data: {}\n", line));
        }
        if self.data.is_empty() {
            out.push_str("data: \n");
        }
        out.push('\n');
        Bytes::from(out)
    }
}

struct RoomInner {
    history: VecDeque<Event>,
    next_id: u64,
    clients: HashMap<Uuid, mpsc::Sender<Bytes>>,
    closed: bool,
}

/// Why a join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinError {
    Full,
    Closed,
}

/// A broadcast room with bounded history and capped membership.
pub struct Room {
    config: SseConfig,
    inner: Arc<Mutex<RoomInner>>,
    keep_alive: Mutex<Option<JoinHandle<()>>>,
}

impl Room {
    pub fn new(config: SseConfig) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(RoomInner {
            history: VecDeque::with_capacity(config.history),
            next_id: 1,
            clients: HashMap::new(),
            closed: false,
        }));
        let room = Arc::new(Self {
            config: config.clone(),
            inner: Arc::clone(&inner),
            keep_alive: Mutex::new(None),
        });

        let interval = Duration::from_secs(config.keep_alive_secs.max(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let mut guard = inner.lock().expect("room lock poisoned");
                if guard.closed {
                    break;
                }
                guard
                    .clients
                    .retain(|_, tx| tx.try_send(Bytes::from_static(b": keep-alive\n\n")).is_ok());
            }
        });
        *room.keep_alive.lock().expect("room lock poisoned") = Some(task);
        room
    }

    fn channel_capacity(&self) -> usize {
        self.config.history + 16
    }

    /// Add a client; replays history strictly after `last_event_id`, then
    /// a private welcome event, then live events flow.
    pub fn join(&self, last_event_id: Option<u64>) -> Result<(Uuid, BodySource), JoinError> {
        let mut guard = self.inner.lock().expect("room lock poisoned");
        if guard.closed {
            return Err(JoinError::Closed);
        }
        if guard.clients.len() >= self.config.max_subscribers {
            return Err(JoinError::Full);
        }

        let (tx, rx) = mpsc::channel(self.channel_capacity());
        let id = Uuid::new_v4();

        if let Some(seen) = last_event_id {
            for event in guard.history.iter().filter(|e| e.id > seen) {
                // Capacity covers the whole history; a failure here means
                // the client vanished between connect and join.
                let _ = tx.try_send(event.to_wire());
            }
        }
        let welcome = Event {
            id: 0,
            name: Some("welcome".to_string()),
            data: id.to_string(),
        };
        let _ = tx.try_send(welcome.to_wire());

        guard.clients.insert(id, tx);
        tracing::debug!(client = %id, subscribers = guard.clients.len(), "SSE client joined");
        Ok((id, BodySource::Channel(rx)))
    }

    /// Record and deliver an event to every client.
    pub fn broadcast(&self, name: Option<&str>, data: &str) -> u64 {
        let mut guard = self.inner.lock().expect("room lock poisoned");
        let event = Event {
            id: guard.next_id,
            name: name.map(str::to_string),
            data: data.to_string(),
        };
        guard.next_id += 1;

        let wire = event.to_wire();
        guard
            .clients
            .retain(|client, tx| match tx.try_send(wire.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(client = %client, "Pruning dead SSE client");
                    false
                }
            });

        if guard.history.len() == self.config.history {
            guard.history.pop_front();
        }
        let id = event.id;
        guard.history.push_back(event);
        id
    }

    /// Deliver to one client only; the event is not recorded in history.
    pub fn send(&self, client: Uuid, name: Option<&str>, data: &str) -> bool {
        let guard = self.inner.lock().expect("room lock poisoned");
        let Some(tx) = guard.clients.get(&client) else {
            return false;
        };
        let event = Event {
            id: 0,
            name: name.map(str::to_string),
            data: data.to_string(),
        };
        tx.try_send(event.to_wire()).is_ok()
    }

    pub fn leave(&self, client: Uuid) {
        let mut guard = self.inner.lock().expect("room lock poisoned");
        guard.clients.remove(&client);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("room lock poisoned").clients.len()
    }

    /// End every client stream and refuse further joins.
    pub fn close(&self) {
        let mut guard = self.inner.lock().expect("room lock poisoned");
        guard.closed = true;
        guard.clients.clear();
        drop(guard);
        if let Some(task) = self.keep_alive.lock().expect("room lock poisoned").take() {
            task.abort();
        }
    }
}

/// The room exposed as a service: `GET` on its path joins the stream.
pub struct SseRoom {
    path: String,
    room: Arc<Room>,
}

impl SseRoom {
    pub fn new(path: impl Into<String>, config: SseConfig) -> Self {
        Self {
            path: path.into(),
            room: Room::new(config),
        }
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }
}

/// `Last-Event-Id` header, or the `last-event-id` query parameter for
/// clients that reconnect via a fresh URL.
fn last_event_id(req: &Request) -> Option<u64> {
    req.header("last-event-id")
        .or_else(|| req.query_param("last-event-id"))
        .and_then(|v| v.trim().parse().ok())
}

#[async_trait]
impl Service for SseRoom {
    fn name(&self) -> &'static str {
        "sse-room"
    }

    fn hooks(&self) -> &'static [Hook] {
        &[Hook::HandleRequest, Hook::ServerStopped]
    }

    fn handled_methods(&self) -> Option<Vec<Method>> {
        Some(vec![Method::GET])
    }

    async fn handle_request(
        &self,
        req: &Arc<Request>,
    ) -> Result<Option<ResponseProperties>, crate::error::ServerError> {
        if req.pathname() != self.path {
            return Ok(None);
        }
        match self.room.join(last_event_id(req)) {
            Ok((client, body)) => {
                tracing::debug!(request_id = %req.id(), client = %client, "SSE stream opened");
                Ok(Some(
                    ResponseProperties::new(StatusCode::OK)
                        .with_header("content-type", "text/event-stream")
                        .with_header("cache-control", "no-store")
                        .with_header("connection", "keep-alive")
                        .with_body(body),
                ))
            }
            Err(reason) => {
                tracing::debug!(request_id = %req.id(), ?reason, "SSE join refused");
                Ok(Some(
                    negotiated_error(req, StatusCode::SERVICE_UNAVAILABLE, Some("room is full"))
                        .with_header("retry-after", "5"),
                ))
            }
        }
    }

    async fn server_stopped(&self) {
        self.room.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn small_config() -> SseConfig {
        SseConfig {
            history: 10,
            max_subscribers: 2,
            keep_alive_secs: 30,
        }
    }

    async fn drain_available(source: BodySource) -> String {
        let mut stream = source.into_byte_stream();
        let mut out = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), stream.next()).await
        {
            out.extend_from_slice(&chunk.unwrap());
        }
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn replay_is_strictly_after_last_event_id() {
        let room = Room::new(SseConfig {
            history: 20,
            max_subscribers: 5,
            keep_alive_secs: 30,
        });
        for n in 1..=10 {
            room.broadcast(None, &format!("event-{}", n));
        }
        let (_, body) = room.join(Some(5)).unwrap();
        let text = drain_available(body).await;
        assert!(!text.contains("id: 5\n"));
        for id in 6..=10 {
            assert!(text.contains(&format!("id: {}\n", id)), "missing id {}", id);
        }
        assert!(text.contains("event: welcome"));
    }

    #[tokio::test]
    async fn history_ring_drops_oldest() {
        let room = Room::new(small_config());
        for n in 1..=15 {
            room.broadcast(None, &format!("e{}", n));
        }
        let (_, body) = room.join(Some(0)).unwrap();
        let text = drain_available(body).await;
        // history holds 10; ids 1-5 fell off the ring
        assert!(!text.contains("data: e5\n"));
        assert!(text.contains("data: e6\n"));
        assert!(text.contains("data: e15\n"));
    }

    #[tokio::test]
    async fn full_room_refuses_joins() {
        let room = Room::new(small_config());
        let _a = room.join(None).unwrap();
        let _b = room.join(None).unwrap();
        assert_eq!(room.join(None).unwrap_err(), JoinError::Full);
    }

    #[tokio::test]
    async fn close_ends_streams_and_refuses_joins() {
        let room = Room::new(small_config());
        let (_, body) = room.join(None).unwrap();
        room.close();
        let mut stream = body.into_byte_stream();
        // welcome event, then the channel sender is gone
        assert!(stream.next().await.is_some());
        assert!(stream.next().await.is_none());
        assert_eq!(room.join(None).unwrap_err(), JoinError::Closed);
    }

    #[tokio::test]
    async fn private_send_reaches_one_client() {
        let room = Room::new(small_config());
        let (a, body_a) = room.join(None).unwrap();
        let (_b, body_b) = room.join(None).unwrap();
        assert!(room.send(a, Some("note"), "just you"));
        let text_a = drain_available(body_a).await;
        let text_b = drain_available(body_b).await;
        assert!(text_a.contains("just you"));
        assert!(!text_b.contains("just you"));
    }

    #[tokio::test]
    async fn multiline_data_framing() {
        let event = Event {
            id: 3,
            name: Some("log".into()),
            data: "line one\nline two".into(),
        };
        let wire = String::from_utf8(event.to_wire().to_vec()).unwrap();
        assert_eq!(
            wire,
            "id: 3\nevent: log\ndata: line one\ndata: line two\n\n"
        );
    }
}
