//! A background poller thread that periodically fetches toggles and installs them into a
//! [`StateStore`].
use std::{
    sync::{mpsc::RecvTimeoutError, Arc, Condvar, Mutex},
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{
    cache_loader::CacheFiles,
    events::{guarded, ErrorEvent, ErrorHandler, ErrorType, NoopErrorHandler},
    fetcher::{FetchResult, ToggleFetcher},
    state_store::StateStore,
    Error, Result,
};

/// Configuration for [`PollerThread`].
// Not implementing `Copy` as we may add non-copyable fields in the future.
#[derive(Debug, Clone)]
pub struct PollerThreadConfig {
    /// Interval to wait between requests.
    ///
    /// Defaults to [`PollerThreadConfig::DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Maximum random duration subtracted from `interval`, so that many instances started at once
    /// don't poll in lockstep.
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

/// Where fetched toggles are backed up, and who hears about failures.
pub(crate) struct PollerSideEffects {
    pub backup: Option<CacheFiles>,
    pub error_handler: Arc<dyn ErrorHandler + Send + Sync>,
}

impl Default for PollerSideEffects {
    fn default() -> PollerSideEffects {
        PollerSideEffects {
            backup: None,
            error_handler: Arc::new(NoopErrorHandler),
        }
    }
}

impl PollerSideEffects {
    fn report(&self, error_type: ErrorType, error: Error) {
        guarded("error_handler", || {
            self.error_handler.on_error(ErrorEvent { error_type, error })
        });
    }
}

/// A toggle poller thread.
///
/// The poller thread fetches toggles using a [`ToggleFetcher`], sending the current change token
/// so that unchanged state costs a `304`, and installs new collections into the [`StateStore`].
pub struct PollerThread {
    join_handle: std::thread::JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: std::sync::mpsc::SyncSender<()>,

    /// Holds `None` until the first fetch completes. Holds `Some(Ok(()))` once the server has
    /// answered (with new toggles or "not modified"). Holds `Some(Err(...))` if the poller stopped
    /// on an unrecoverable error.
    result: Arc<(Mutex<Option<Result<()>>>, Condvar)>,
}

impl PollerThread {
    /// Starts the poller thread.
    ///
    /// # Errors
    ///
    /// IO Error if poller thread failed to start.
    pub fn start(
        fetcher: impl ToggleFetcher + Send + 'static,
        store: Arc<StateStore>,
        config: PollerThreadConfig,
    ) -> std::io::Result<PollerThread> {
        PollerThread::start_with_side_effects(
            fetcher,
            store,
            config,
            PollerSideEffects::default(),
        )
    }

    pub(crate) fn start_with_side_effects(
        mut fetcher: impl ToggleFetcher + Send + 'static,
        store: Arc<StateStore>,
        config: PollerThreadConfig,
        side_effects: PollerSideEffects,
    ) -> std::io::Result<PollerThread> {
        // Using `sync_channel` here as it makes `stop_sender` `Sync`. Buffer size of 1 is enough:
        // we `try_send()` and ignore a full buffer (another thread has sent a stop command
        // already).
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        let result = Arc::new((Mutex::new(None), Condvar::new()));

        let join_handle = {
            // Cloning Arc for move into thread
            let result = Arc::clone(&result);
            let update_result = move |value| {
                let mut slot = result.0.lock().unwrap_or_else(|err| err.into_inner());
                *slot = Some(value);
                result.1.notify_all();
            };

            std::thread::Builder::new()
                .name("flagwise-poller".to_owned())
                .spawn(move || {
                    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| loop {
                        let token = store.change_token();
                        match fetcher.fetch(&token) {
                            Ok(FetchResult::Modified { collection, token }) => {
                                if let Some(backup) = &side_effects.backup {
                                    if let Err(err) = backup.save(&collection, &token) {
                                        log::warn!(target: "flagwise", "unable to back up toggles: {err}");
                                        side_effects.report(ErrorType::FileCache, err);
                                    }
                                }
                                store.replace(Arc::new(collection), token);
                                update_result(Ok(()));
                            }
                            Ok(FetchResult::NotModified) => update_result(Ok(())),
                            Err(err @ (Error::Unauthorized | Error::InvalidBaseUrl(_))) => {
                                // Unrecoverable errors
                                side_effects.report(ErrorType::TogglesFetch, err.clone());
                                update_result(Err(err));
                                return;
                            }
                            Err(err) => {
                                // Other errors are retried on the next tick.
                                log::warn!(target: "flagwise", "error while fetching toggles: {err}");
                                side_effects.report(ErrorType::TogglesFetch, err);
                            }
                        }

                        let timeout = jitter(config.interval, config.jitter);
                        match stop_receiver.recv_timeout(timeout) {
                            Err(RecvTimeoutError::Timeout) => {
                                // Timed out. Loop back to fetch again.
                            }
                            Ok(()) => {
                                log::debug!(target: "flagwise", "poller thread received stop command");
                                return;
                            }
                            Err(RecvTimeoutError::Disconnected) => {
                                // The `PollerThread` handle was dropped.
                                log::debug!(target: "flagwise", "poller thread received disconnected");
                                return;
                            }
                        }
                    }));

                    if result.is_err() {
                        log::error!(target: "flagwise", "poller thread panicked");
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

    /// Block until the first fetch completes.
    ///
    /// Returns immediately once the server has answered. Transient errors keep it waiting: the
    /// client can still serve toggles loaded from cache or bootstrap in the meantime.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerThreadPanicked`]
    /// - [`Error::Unauthorized`]
    /// - [`Error::InvalidBaseUrl`]
    pub fn wait_for_configuration(&self) -> Result<()> {
        let mut lock = self
            .result
            .0
            .lock()
            .map_err(|_| Error::PollerThreadPanicked)?;
        loop {
            match &*lock {
                Some(result) => return result.clone(),
                None => {
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
        // Error means that the thread already exited or that another stop command is pending.
        let _ = self.stop_sender.try_send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    ///
    /// If you don't need to wait for the thread to exit, use [`PollerThread::stop`] instead.
    ///
    /// # Errors
    ///
    /// [`Error::PollerThreadPanicked`] if the thread has panicked.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

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
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use super::{PollerSideEffects, PollerThread, PollerThreadConfig};
    use crate::{
        cache_loader::CacheFiles,
        fetcher::FetchResult,
        state_store::{ChangeToken, StateStore},
        toggles::{ToggleCollection, ToggleDefinition},
        Error, Result,
    };

    fn fast() -> PollerThreadConfig {
        PollerThreadConfig::new()
            .with_interval(Duration::from_millis(10))
            .with_jitter(Duration::ZERO)
    }

    #[test]
    fn installs_fetched_toggles() {
        let store = Arc::new(StateStore::new());
        let fetcher = |_: &ChangeToken| -> Result<FetchResult> {
            Ok(FetchResult::Modified {
                collection: ToggleCollection::new([ToggleDefinition::new("remote", true)], []),
                token: ChangeToken::from("etag-1"),
            })
        };

        let poller = PollerThread::start(fetcher, store.clone(), fast()).unwrap();
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();

        assert!(store.current().toggle("remote").is_some());
        assert_eq!(store.change_token().as_str(), "etag-1");
    }

    #[test]
    fn sends_current_token_and_keeps_state_on_not_modified() {
        let store = Arc::new(StateStore::new());
        store.replace(
            Arc::new(ToggleCollection::new([ToggleDefinition::new("cached", true)], [])),
            ChangeToken::from("etag-0"),
        );
        let fetcher = |token: &ChangeToken| -> Result<FetchResult> {
            assert_eq!(token.as_str(), "etag-0");
            Ok(FetchResult::NotModified)
        };

        let poller = PollerThread::start(fetcher, store.clone(), fast()).unwrap();
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();

        assert!(store.current().toggle("cached").is_some());
    }

    #[test]
    fn unauthorized_stops_polling() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = {
            let calls = calls.clone();
            move |_: &ChangeToken| -> Result<FetchResult> {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Unauthorized)
            }
        };

        let poller = PollerThread::start(fetcher, Arc::new(StateStore::new()), fast()).unwrap();
        assert!(matches!(
            poller.wait_for_configuration(),
            Err(Error::Unauthorized)
        ));
        poller.shutdown().unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = {
            let calls = calls.clone();
            move |_: &ChangeToken| -> Result<FetchResult> {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::BootstrapFailed { status: 503 })
                } else {
                    Ok(FetchResult::NotModified)
                }
            }
        };

        let poller = PollerThread::start(fetcher, Arc::new(StateStore::new()), fast()).unwrap();
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();

        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn panicking_fetcher_is_reported() {
        let fetcher = |_: &ChangeToken| -> Result<FetchResult> { panic!("fetcher bug") };

        let poller = PollerThread::start(fetcher, Arc::new(StateStore::new()), fast()).unwrap();
        assert!(matches!(
            poller.wait_for_configuration(),
            Err(Error::PollerThreadPanicked)
        ));
        poller.shutdown().unwrap();
    }

    #[test]
    fn backs_up_fetched_toggles() {
        let dir = tempfile::tempdir().unwrap();
        let files = CacheFiles::new(dir.path(), "app");
        let fetcher = |_: &ChangeToken| -> Result<FetchResult> {
            Ok(FetchResult::Modified {
                collection: ToggleCollection::new([ToggleDefinition::new("remote", true)], []),
                token: ChangeToken::from("etag-9"),
            })
        };

        let poller = PollerThread::start_with_side_effects(
            fetcher,
            Arc::new(StateStore::new()),
            fast(),
            PollerSideEffects {
                backup: Some(files.clone()),
                ..PollerSideEffects::default()
            },
        )
        .unwrap();
        poller.wait_for_configuration().unwrap();
        poller.shutdown().unwrap();

        assert_eq!(std::fs::read_to_string(&files.etag_file).unwrap(), "etag-9");
        assert!(std::fs::read_to_string(&files.toggle_file)
            .unwrap()
            .contains("remote"));
    }
}
