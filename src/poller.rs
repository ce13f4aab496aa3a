//! A background poller thread that periodically reloads flag definitions into a
//! [`DefinitionsStore`].
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    definitions_store::{DefinitionsStore, LoadOutcome},
    Error, Result,
};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests for definitions.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between requests for definitions. This helps
    /// to avoid multiple server instances synchronizing and producing spiky network load.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_JITTER`].
    pub jitter: Duration,
}

impl PollerThreadConfig {
    /// Default value for [`PollerThreadConfig::interval`].
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
    /// Default value for [`PollerThreadConfig::jitter`].
    pub const DEFAULT_POLL_JITTER: Duration = Duration::from_secs(3);

    /// Create a new `PollerThreadConfig` using default configuration.
    pub fn new() -> PollerThreadConfig {
        PollerThreadConfig::default()
    }

    /// Update poll interval with `interval`.
    pub fn with_interval(mut self, interval: Duration) -> PollerThreadConfig {
        self.interval = interval;
        self
    }

    /// Update poll interval jitter with `jitter`.
    pub fn with_jitter(mut self, jitter: Duration) -> PollerThreadConfig {
        self.jitter = jitter;
        self
    }
}

impl Default for PollerThreadConfig {
    fn default() -> PollerThreadConfig {
        PollerThreadConfig {
            interval: PollerThreadConfig::DEFAULT_POLL_INTERVAL,
            jitter: PollerThreadConfig::DEFAULT_POLL_JITTER,
        }
    }
}

/// A definitions poller thread.
///
/// The poller thread calls [`DefinitionsStore::load`] right away and then once per interval until
/// stopped. Overlapping explicit loads are coalesced by the store.
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` if definitions haven't been loaded yet. Holds `Some(Ok(()))` if definitions
    /// have been loaded successfully. Holds `Some(Err(...))` if the poller stopped on an
    /// unrecoverable error before loading definitions.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread with the provided configuration.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the poller thread failed to start.
    pub fn start(
        store: Arc<DefinitionsStore>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync` (shareable between
        // threads). Buffer size of 1 should be enough for our use case as we're sending a stop
        // command, and we can simply `try_send()` and ignore if the buffer is full (another thread
        // has sent a stop command already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value: Result<()>| {
                let mut slot = match result.0.lock() {
                    Ok(slot) => slot,
                    Err(poisoned) => poisoned.into_inner(),
                };
                // Keep the first successful result. Waiters only care about the first load.
                if !matches!(*slot, Some(Ok(()))) {
                    *slot = Some(value);
                }
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("flagcore-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        match store.load() {
                            LoadOutcome::Updated { .. }
                            | LoadOutcome::NotModified
                            | LoadOutcome::Joined => {
                                if store.get().is_some() {
                                    update_result(Ok(()));
                                }
                            }
                            LoadOutcome::Failed(
                                err @ (Error::Unauthorized | Error::InvalidBaseUrl(_)),
                            ) => {
                                // Unrecoverable errors
                                log::warn!(target: "flagcore", "stopping poller: {}", err);
                                update_result(Err(err));
                                return;
                            }
                            LoadOutcome::Failed(_) => {
                                // Other errors are retriable. The store already logged them.
                            }
                            LoadOutcome::ShutDown => {
                                log::debug!(target: "flagcore", "definitions store is shut down, stopping poller");
                                return;
                            }
                        }

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to load new definitions.
                            }
                            Ok(()) => {
                                log::debug!(target: "flagcore", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                // When the other end of channel disconnects, calls to
                                // .recv_timeout() return immediately.
                                // Stop the thread.
                                log::debug!(target: "flagcore", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    // If catch_unwind returns Err, it means a panic occurred.
                    if result.is_err() {
                        update_result(Err(Error::PollerThreadPanicked));
                    }
                })?
        };

        Ok(PollerThread {
            join_handle,
            stop_sender,
            result,
        })
    }

    /// Waits for definitions to be loaded.
    ///
    /// This method blocks until the poller thread has loaded definitions, or has stopped on an
    /// unrecoverable error.
    ///
    /// # Errors
    ///
    /// This method can fail with the following errors:
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidBaseUrl`]
    pub fn wait_for_definitions(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => {
                    return result.clone();
                }
                None => {
                    // Block waiting for definitions to get loaded.
                    lock = self
                        .result
                        .1
                        .wait(lock)
                        .map_err(|_| Error::PollerThreadPanicked)?;
                }
            }
        }
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited) or the channel buffer is
        // full. First case can be ignored as the thread is already stopped. Second case can be
        // ignored as another thread already sent a stop command and the thread will stop anyway.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        // Send stop signal in case it wasn't sent before.
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle
            .join()
            .map_err(|_| Error::PollerThreadPanicked)?;

        Ok(())
    }
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::fetcher::{DefinitionsFetcher, DefinitionsResponse};

    struct CountingFetcher {
        calls: AtomicUsize,
        response: fn() -> Result<DefinitionsResponse>,
    }

    impl DefinitionsFetcher for CountingFetcher {
        fn fetch_definitions(&self, _etag: Option<&str>) -> Result<DefinitionsResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.response)()
        }
    }

    fn empty_definitions() -> Result<DefinitionsResponse> {
        Ok(DefinitionsResponse::Modified {
            definitions: serde_json::from_str(r#"{"flags": []}"#).unwrap(),
            etag: None,
        })
    }

    fn start(
        response: fn() -> Result<DefinitionsResponse>,
        interval: Duration,
    ) -> (Arc<CountingFetcher>, Arc<DefinitionsStore>, PollerThread) {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicUsize::new(0),
            response,
        });
        let store = Arc::new(DefinitionsStore::new(fetcher.clone()));
        let poller = PollerThread::start(
            store.clone(),
            PollerThreadConfig::new()
                .with_interval(interval)
                .with_jitter(Duration::ZERO),
        )
        .unwrap();
        (fetcher, store, poller)
    }

    #[test]
    fn loads_immediately() {
        let (fetcher, store, poller) = start(empty_definitions, Duration::from_secs(60));

        poller.wait_for_definitions().unwrap();
        assert!(store.get().is_some());
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        poller.shutdown().unwrap();
    }

    #[test]
    fn polls_periodically() {
        let (fetcher, _store, poller) = start(empty_definitions, Duration::from_millis(20));

        std::thread::sleep(Duration::from_millis(200));
        poller.shutdown().unwrap();

        assert!(fetcher.calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn stops_on_unauthorized() {
        let (fetcher, _store, poller) =
            start(|| Err(Error::Unauthorized), Duration::from_millis(10));

        assert!(matches!(
            poller.wait_for_definitions(),
            Err(Error::Unauthorized)
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        poller.shutdown().unwrap();
    }

    #[test]
    fn keeps_polling_after_transient_errors() {
        let (fetcher, store, poller) =
            start(|| Err(Error::Api { status: 502 }), Duration::from_millis(10));

        std::thread::sleep(Duration::from_millis(100));
        assert!(fetcher.calls.load(Ordering::SeqCst) >= 2);
        assert!(store.get().is_none());

        poller.shutdown().unwrap();
    }

    #[test]
    fn stops_when_store_is_shut_down() {
        let (fetcher, store, poller) = start(empty_definitions, Duration::from_millis(10));
        poller.wait_for_definitions().unwrap();

        store.shut_down();
        // The thread exits on its own at the next tick.
        std::thread::sleep(Duration::from_millis(50));
        let calls = fetcher.calls.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), calls);

        poller.shutdown().unwrap();
    }
}

#[cfg(test)]
mod jitter_tests {
    use std::time::Duration;

    #[test]
    fn jitter_is_subtractive() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert!(result <= interval, "{result:?} must be <= {interval:?}");
    }

    #[test]
    fn jitter_truncates_to_zero() {
        let interval = Duration::ZERO;
        let jitter = Duration::from_secs(30);

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::ZERO);
    }

    #[test]
    fn jitter_works_with_zero_jitter() {
        let interval = Duration::from_secs(30);
        let jitter = Duration::ZERO;

        let result = super::jitter(interval, jitter);

        assert_eq!(result, Duration::from_secs(30));
    }
}
