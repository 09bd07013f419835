//! Uniform lazy push-stream over heterogeneous byte sources.
//!
//! # Responsibilities
//! - Adapt {in-memory bytes, file handle, generic byte stream, channel}
//!   into one push-stream with `subscribe`/`unsubscribe`
//! - Destroy the underlying source exactly once, so file descriptors and
//!   sockets never leak
//! - Proactively destroy sources nobody subscribes to within a bounded
//!   lifetime, with a diagnostic warning
//!
//! # Design Decisions
//! - One dispatch function over a closed enum of source kinds, not an
//!   inheritance hierarchy
//! - Subscribing resumes a paused source; dropping the subscription (or the
//!   stream) tears everything down

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use sync_wrapper::SyncWrapper;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default bound on how long an unsubscribed source may sit idle before it
/// is destroyed.
pub const ABANDON_TIMEOUT: Duration = Duration::from_secs(120);

const FILE_CHUNK: usize = 16 * 1024;

/// A byte-producing source in one of the four supported shapes.
pub enum BodySource {
    /// A single in-memory value.
    Bytes(Bytes),
    /// An open file handle, read in chunks.
    File(tokio::fs::File),
    /// An already-conforming byte stream. The wrapper keeps the source
    /// shareable by reference; the stream itself is only ever polled
    /// through `&mut`.
    Stream(SyncWrapper<BoxStream<'static, io::Result<Bytes>>>),
    /// The receiving half of a channel; used for long-lived bodies such as
    /// event streams.
    Channel(mpsc::Receiver<Bytes>),
}

impl BodySource {
    /// Source over a UTF-8 string.
    pub fn text(s: impl Into<String>) -> Self {
        BodySource::Bytes(Bytes::from(s.into()))
    }

    /// Source over an arbitrary byte stream.
    pub fn stream(s: impl Stream<Item = io::Result<Bytes>> + Send + 'static) -> Self {
        BodySource::Stream(SyncWrapper::new(Box::pin(s)))
    }

    /// Whether the source is a plain in-memory value.
    pub fn is_buffered(&self) -> bool {
        matches!(self, BodySource::Bytes(_))
    }

    /// Byte length, when known without reading.
    pub fn known_len(&self) -> Option<usize> {
        match self {
            BodySource::Bytes(b) => Some(b.len()),
            _ => None,
        }
    }

    /// The single adapter-selection point: flatten any source kind into a
    /// pull-stream of chunks.
    pub fn into_byte_stream(self) -> BoxStream<'static, io::Result<Bytes>> {
        match self {
            BodySource::Bytes(bytes) => {
                if bytes.is_empty() {
                    Box::pin(futures_util::stream::empty())
                } else {
                    Box::pin(futures_util::stream::once(async move { Ok(bytes) }))
                }
            }
            BodySource::File(file) => Box::pin(futures_util::stream::unfold(
                Some(file),
                |state| async move {
                    let mut file = state?;
                    let mut buf = BytesMut::zeroed(FILE_CHUNK);
                    match file.read(&mut buf).await {
                        Ok(0) => None,
                        Ok(n) => {
                            buf.truncate(n);
                            Some((Ok(buf.freeze()), Some(file)))
                        }
                        Err(e) => Some((Err(e), None)),
                    }
                },
            )),
            BodySource::Stream(stream) => stream.into_inner(),
            BodySource::Channel(rx) => Box::pin(futures_util::stream::unfold(
                rx,
                |mut rx| async move { rx.recv().await.map(|chunk| (Ok(chunk), rx)) },
            )),
        }
    }
}

impl From<Bytes> for BodySource {
    fn from(b: Bytes) -> Self {
        BodySource::Bytes(b)
    }
}

impl From<&'static str> for BodySource {
    fn from(s: &'static str) -> Self {
        BodySource::Bytes(Bytes::from_static(s.as_bytes()))
    }
}

impl From<Vec<u8>> for BodySource {
    fn from(v: Vec<u8>) -> Self {
        BodySource::Bytes(Bytes::from(v))
    }
}

impl From<String> for BodySource {
    fn from(s: String) -> Self {
        BodySource::Bytes(Bytes::from(s))
    }
}

impl std::fmt::Debug for BodySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BodySource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            BodySource::File(_) => f.write_str("File"),
            BodySource::Stream(_) => f.write_str("Stream"),
            BodySource::Channel(_) => f.write_str("Channel"),
        }
    }
}

/// Push-stream consumer. Methods are invoked from the subscription task.
pub trait Observer: Send {
    /// A chunk of bytes arrived.
    fn next(&mut self, chunk: Bytes);
    /// The source failed; no further calls follow.
    fn error(&mut self, error: io::Error);
    /// The source is exhausted; no further calls follow.
    fn complete(&mut self);
}

/// A lazily-consumed body. Holds the source until someone subscribes or
/// takes it; destroys it if abandoned past the watchdog timeout.
pub struct BodyStream {
    source: Arc<Mutex<Option<BodySource>>>,
    subscribed: Arc<AtomicBool>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl BodyStream {
    /// Wrap a source with the default abandonment watchdog.
    pub fn new(source: BodySource) -> Self {
        Self::with_timeout(source, ABANDON_TIMEOUT)
    }

    /// Wrap a source with a custom abandonment bound.
    pub fn with_timeout(source: BodySource, timeout: Duration) -> Self {
        let needs_watchdog = !source.is_buffered();
        let source = Arc::new(Mutex::new(Some(source)));
        let subscribed = Arc::new(AtomicBool::new(false));
        let watchdog = if needs_watchdog {
            let source = Arc::clone(&source);
            let subscribed = Arc::clone(&subscribed);
            Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                if subscribed.load(Ordering::SeqCst) {
                    return;
                }
                let abandoned = source.lock().expect("body lock poisoned").take();
                if abandoned.is_some() {
                    tracing::warn!(
                        timeout_secs = timeout.as_secs(),
                        "body source never subscribed; destroying it"
                    );
                }
            }))
        } else {
            None
        };
        Self {
            source,
            subscribed,
            watchdog: Mutex::new(watchdog),
        }
    }

    /// Turn off the abandonment watchdog. Used for intentionally long-lived
    /// bodies (`connection: keep-alive` responses, event streams).
    pub fn disable_watchdog(&self) {
        if let Some(task) = self.watchdog.lock().expect("body lock poisoned").take() {
            task.abort();
        }
    }

    /// Take the raw source out, disarming the watchdog. Returns `None` if
    /// the body was already consumed or destroyed.
    pub fn take_source(&self) -> Option<BodySource> {
        self.disable_watchdog();
        self.subscribed.store(true, Ordering::SeqCst);
        self.source.lock().expect("body lock poisoned").take()
    }

    /// Subscribe a push observer. The source starts (or resumes) producing;
    /// dropping the returned [`Subscription`] tears it down exactly once.
    pub fn subscribe<O: Observer + 'static>(&self, mut observer: O) -> Subscription {
        let Some(source) = self.take_source() else {
            observer.error(io::Error::other("body already consumed"));
            return Subscription { task: None };
        };
        let task = tokio::spawn(async move {
            let mut stream = source.into_byte_stream();
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => observer.next(chunk),
                    Some(Err(e)) => {
                        observer.error(e);
                        return;
                    }
                    None => {
                        observer.complete();
                        return;
                    }
                }
            }
        });
        Subscription { task: Some(task) }
    }

    /// Destroy the source without consuming it.
    pub fn destroy(&self) {
        self.disable_watchdog();
        self.source.lock().expect("body lock poisoned").take();
    }

    /// Whether a source is still available.
    pub fn is_available(&self) -> bool {
        self.source.lock().expect("body lock poisoned").is_some()
    }
}

impl std::fmt::Debug for BodyStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyStream")
            .field("available", &self.is_available())
            .field("subscribed", &self.subscribed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for BodyStream {
    fn drop(&mut self) {
        if let Some(task) = self.watchdog.lock().expect("body lock poisoned").take() {
            task.abort();
        }
    }
}

/// Handle to an active subscription. Dropping it (or calling
/// [`unsubscribe`](Subscription::unsubscribe)) stops delivery and destroys
/// the source.
#[derive(Debug)]
pub struct Subscription {
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Tear down listeners and destroy the underlying source.
    pub fn unsubscribe(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Wait for the source to finish delivering.
    pub async fn completed(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Collect an entire source into memory through the push interface.
pub async fn collect(body: &BodyStream) -> io::Result<Bytes> {
    struct Collector {
        buf: BytesMut,
        tx: Option<tokio::sync::oneshot::Sender<io::Result<Bytes>>>,
    }
    impl Observer for Collector {
        fn next(&mut self, chunk: Bytes) {
            self.buf.extend_from_slice(&chunk);
        }
        fn error(&mut self, error: io::Error) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Err(error));
            }
        }
        fn complete(&mut self) {
            if let Some(tx) = self.tx.take() {
                let _ = tx.send(Ok(self.buf.split().freeze()));
            }
        }
    }

    let (tx, rx) = tokio::sync::oneshot::channel();
    let subscription = body.subscribe(Collector {
        buf: BytesMut::new(),
        tx: Some(tx),
    });
    let result = rx
        .await
        .unwrap_or_else(|_| Err(io::Error::other("body subscription dropped")));
    subscription.completed().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_are_shareable_across_tasks() {
        fn check<T: Send + Sync>() {}
        check::<BodySource>();
        check::<BodyStream>();
    }

    #[tokio::test]
    async fn stream_source_collects() {
        let chunks = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"cd")),
        ]);
        let body = BodyStream::new(BodySource::stream(chunks));
        let collected = collect(&body).await.unwrap();
        assert_eq!(&collected[..], b"abcd");
    }

    #[tokio::test]
    async fn bytes_source_collects() {
        let body = BodyStream::new(BodySource::from("hello"));
        let collected = collect(&body).await.unwrap();
        assert_eq!(&collected[..], b"hello");
    }

    #[tokio::test]
    async fn channel_source_streams_in_order() {
        let (tx, rx) = mpsc::channel(4);
        let body = BodyStream::new(BodySource::Channel(rx));
        tokio::spawn(async move {
            tx.send(Bytes::from_static(b"a")).await.unwrap();
            tx.send(Bytes::from_static(b"b")).await.unwrap();
        });
        let collected = collect(&body).await.unwrap();
        assert_eq!(&collected[..], b"ab");
    }

    #[tokio::test]
    async fn body_consumed_only_once() {
        let body = BodyStream::new(BodySource::from("x"));
        let _ = collect(&body).await.unwrap();
        assert!(collect(&body).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_destroys_abandoned_source() {
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let body = BodyStream::with_timeout(BodySource::Channel(rx), Duration::from_secs(1));
        assert!(body.is_available());
        tokio::time::sleep(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert!(!body.is_available());
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_watchdog_keeps_source_alive() {
        let (_tx, rx) = mpsc::channel::<Bytes>(1);
        let body = BodyStream::with_timeout(BodySource::Channel(rx), Duration::from_secs(1));
        body.disable_watchdog();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(body.is_available());
    }

    #[tokio::test]
    async fn unsubscribe_destroys_source() {
        let (tx, rx) = mpsc::channel::<Bytes>(1);
        let body = BodyStream::new(BodySource::Channel(rx));
        struct Ignore;
        impl Observer for Ignore {
            fn next(&mut self, _: Bytes) {}
            fn error(&mut self, _: io::Error) {}
            fn complete(&mut self) {}
        }
        let sub = body.subscribe(Ignore);
        sub.unsubscribe();
        // The receiver was moved into the aborted task and dropped with it.
        for _ in 0..50 {
            if tx.is_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(tx.is_closed());
    }
}
