//! Deterministic racing of named asynchronous sources.
//!
//! The building block for "whichever happens first: client abort, write
//! error, socket close, or normal finish". The first source to produce a
//! value wins; every losing source's cleanup closure runs exactly once and
//! its future is dropped (cancelled).

use std::future::Future;
use std::pin::Pin;

/// One named entrant in a [`race`].
pub struct Contender<T> {
    name: &'static str,
    future: Pin<Box<dyn Future<Output = T> + Send>>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Contender<T> {
    /// Create a contender with no cleanup.
    pub fn new(name: &'static str, future: impl Future<Output = T> + Send + 'static) -> Self {
        Self {
            name,
            future: Box::pin(future),
            cleanup: None,
        }
    }

    /// Attach a cleanup closure, run exactly once if this contender loses.
    pub fn with_cleanup(mut self, cleanup: impl FnOnce() + Send + 'static) -> Self {
        self.cleanup = Some(Box::new(cleanup));
        self
    }
}

impl<T> std::fmt::Debug for Contender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contender").field("name", &self.name).finish()
    }
}

/// Race the contenders; resolve with the winner's name and payload.
///
/// Returns `None` only for an empty field. Losing futures are dropped and
/// their cleanups run before this returns.
pub async fn race<T>(contenders: Vec<Contender<T>>) -> Option<(&'static str, T)> {
    if contenders.is_empty() {
        return None;
    }
    let mut names = Vec::with_capacity(contenders.len());
    let mut cleanups = Vec::with_capacity(contenders.len());
    let mut futures = Vec::with_capacity(contenders.len());
    for c in contenders {
        names.push(c.name);
        cleanups.push(c.cleanup);
        futures.push(c.future);
    }

    let (value, winner, rest) = futures_util::future::select_all(futures).await;
    // Dropping the remaining futures cancels them before cleanup runs.
    drop(rest);
    for (i, cleanup) in cleanups.into_iter().enumerate() {
        if i != winner {
            if let Some(f) = cleanup {
                f();
            }
        }
    }
    Some((names[winner], value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn single_producer_wins_and_losers_clean_up() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c1 = Arc::clone(&cleaned);
        let c2 = Arc::clone(&cleaned);

        let (name, value) = race(vec![
            Contender::new("slow", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                1
            })
            .with_cleanup(move || {
                c1.fetch_add(1, Ordering::SeqCst);
            }),
            Contender::new("fast", async { 2 }).with_cleanup(move || {
                c2.fetch_add(1, Ordering::SeqCst);
            }),
            Contender::new("stuck", std::future::pending()),
        ])
        .await
        .unwrap();

        assert_eq!(name, "fast");
        assert_eq!(value, 2);
        assert_eq!(cleaned.load(Ordering::SeqCst), 1, "only the loser with cleanup runs it");
    }

    #[tokio::test]
    async fn winner_cleanup_does_not_run() {
        let cleaned = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cleaned);
        let (name, _) = race(vec![Contender::new("only", async { () }).with_cleanup(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })])
        .await
        .unwrap();
        assert_eq!(name, "only");
        assert_eq!(cleaned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_field_yields_none() {
        assert!(race::<()>(Vec::new()).await.is_none());
    }
}
