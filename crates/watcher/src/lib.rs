// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Periodic value streams built on `tokio::sync::watch`.
//!
//! A watcher is a receiver that always holds the most recent successfully
//! fetched value. The driver task refreshes it on a fixed interval; a refresh
//! that keeps failing leaves the previous value in place, so readers never
//! observe a gap once the initial value has been produced.

use std::{future::Future, time::Duration};

use tokio::{
    select,
    sync::watch::{self, Ref},
    task::JoinHandle,
    time::{self, sleep},
};
use tracing::warn;

/// Attempts per fetch before a refresh round is given up.
const MAX_RETRIES: u32 = 5;
/// Base delay for exponential backoff between attempts.
const BACKOFF_BASE: Duration = Duration::from_millis(500);
/// Backoff ceiling.
const BACKOFF_CAP: Duration = Duration::from_secs(10);

/// Runs `function` up to [`MAX_RETRIES`] times with exponential backoff
/// capped at [`BACKOFF_CAP`], returning the first success or the last error.
pub async fn with_retry<T, F, Fut>(function: F) -> anyhow::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match function().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt + 1 >= MAX_RETRIES => return Err(err),
            Err(err) => {
                let backoff = BACKOFF_BASE
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(BACKOFF_CAP);
                warn!(error = %err, attempt, "Fetch failed, backing off");
                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Creates a new watcher seeded with an initial fetch and refreshed on
/// `interval`. Construction fails if the initial fetch fails after retries;
/// later refresh failures keep the previous value.
pub async fn new_watcher<T, F, Fut>(
    interval: Duration,
    function: F,
) -> anyhow::Result<watch::Receiver<T>>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    T: Sync + Send + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send,
{
    let initial_value = with_retry(&function).await?;

    let (tx, rx) = watch::channel(initial_value);

    tokio::spawn(async move {
        let mut time_interval = time::interval(interval);
        time_interval.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        // The first tick completes immediately and would re-run the initial
        // fetch back to back, so swallow it.
        time_interval.tick().await;
        loop {
            time_interval.tick().await;
            match with_retry(&function).await {
                Ok(value) => {
                    if tx.send(value).is_err() {
                        // All receivers are gone.
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Refresh failed, keeping previous value");
                }
            }
        }
    });
    Ok(rx)
}

/// Maps a watcher into a derived watcher.
pub fn map_watcher<T1, T2, F>(
    mut receiver: watch::Receiver<T1>,
    map_function: F,
) -> watch::Receiver<T2>
where
    T1: Clone + Send + Sync + 'static,
    T2: Send + Sync + 'static,
    F: Fn(T1) -> T2 + Send + 'static,
{
    let initial_value = map_function(receiver.borrow().clone());
    let (tx, rx) = watch::channel(initial_value);

    tokio::spawn(async move {
        while receiver.changed().await.is_ok() {
            let current = receiver.borrow().clone();
            if tx.send(map_function(current)).is_err() {
                break;
            }
        }
    });
    rx
}

/// Joins two watchers; the output refreshes whenever either input changes.
pub fn join_and_map_watcher<T1, T2, T3, F>(
    mut receiver_1: watch::Receiver<T1>,
    mut receiver_2: watch::Receiver<T2>,
    map_function: F,
) -> watch::Receiver<T3>
where
    T1: Clone + Send + Sync + 'static,
    T2: Clone + Send + Sync + 'static,
    T3: Send + Sync + 'static,
    F: Fn((T1, T2)) -> T3 + Send + 'static,
{
    let initial_value = map_function((receiver_1.borrow().clone(), receiver_2.borrow().clone()));
    let (tx, rx) = watch::channel(initial_value);

    tokio::spawn(async move {
        loop {
            select! {
                res = receiver_1.changed() => if res.is_err() { break },
                res = receiver_2.changed() => if res.is_err() { break },
            }

            let current_val_1 = receiver_1.borrow().clone();
            let current_val_2 = receiver_2.borrow().clone();
            if tx.send(map_function((current_val_1, current_val_2))).is_err() {
                break;
            }
        }
    });
    rx
}

/// Runs `function` for the current value and then once per change. Values
/// arriving while the handler runs collapse to the latest one, so at most one
/// handler execution is in flight at any time.
pub fn watch_pipe<T, F, Fut>(rx: watch::Receiver<T>, function: F) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(Ref<'_, T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut rx = rx;
        let value = rx.borrow_and_update();
        function(value).await;
        loop {
            match rx.changed().await {
                Ok(_) => {
                    let value = rx.borrow_and_update();
                    function(value).await;
                }
                Err(err) => {
                    warn!("{err}");
                    break;
                }
            };
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test]
    async fn watcher_seeds_with_initial_value() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let rx = new_watcher(Duration::from_secs(60), move || {
            let counter = counter_clone.clone();
            async move { Ok(counter.fetch_add(1, Ordering::SeqCst)) }
        })
        .await
        .unwrap();

        assert_eq!(*rx.borrow(), 0);
    }

    #[tokio::test]
    async fn watcher_retries_initial_fetch() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let rx = new_watcher(Duration::from_secs(60), move || {
            let counter = counter_clone.clone();
            async move {
                // Fail the first two attempts.
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("transient");
                }
                Ok(42u32)
            }
        })
        .await
        .unwrap();

        assert_eq!(*rx.borrow(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn map_watcher_tracks_source() {
        let (tx, rx) = watch::channel(2u32);
        let mut mapped = map_watcher(rx, |v| v * 10);
        assert_eq!(*mapped.borrow(), 20);

        tx.send(3).unwrap();
        mapped.changed().await.unwrap();
        assert_eq!(*mapped.borrow(), 30);
    }

    #[tokio::test]
    async fn join_fires_on_either_input() {
        let (tx1, rx1) = watch::channel(1u32);
        let (_tx2, rx2) = watch::channel(10u32);
        let mut joined = join_and_map_watcher(rx1, rx2, |(a, b)| a + b);
        assert_eq!(*joined.borrow(), 11);

        tx1.send(2).unwrap();
        joined.changed().await.unwrap();
        assert_eq!(*joined.borrow(), 12);
    }

    #[tokio::test]
    async fn pipe_collapses_to_latest() {
        let (tx, rx) = watch::channel(0u32);
        let seen = Arc::new(tokio::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handle = watch_pipe(rx, move |value| {
            let seen = seen_clone.clone();
            let value = *value;
            async move {
                seen.lock().await.push(value);
                sleep(Duration::from_millis(50)).await;
            }
        });

        // Burst of updates while the handler sleeps; intermediate values
        // must be skipped, the final one observed.
        for v in 1..=5 {
            tx.send(v).unwrap();
        }
        sleep(Duration::from_millis(200)).await;

        let seen = seen.lock().await.clone();
        assert_eq!(seen.first(), Some(&0));
        assert_eq!(seen.last(), Some(&5));
        assert!(seen.len() < 6);
        handle.abort();
    }
}
