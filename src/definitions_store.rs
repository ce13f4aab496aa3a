//! Thread-safe storage for flag definitions used in local evaluation, and the single-flight loader
//! that keeps them fresh.
//!
//! [`DefinitionsStore`] provides concurrent access for readers (flag evaluation) and a single
//! writer at a time (an explicit load or the periodic poller).
use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex, RwLock},
};

use chrono::{DateTime, Utc};

use crate::{
    fetcher::{DefinitionsFetcher, DefinitionsResponse},
    models::{CohortDefinition, FlagDefinition, LocalEvaluationResponse, TryParse},
    Error,
};

/// An immutable set of flag definitions. Replaced wholesale on every successful load.
#[derive(Debug, Clone)]
pub struct DefinitionsSnapshot {
    flags: HashMap<String, FlagDefinition>,
    /// Flag keys in the order the server returned them.
    flag_keys: Vec<String>,
    pub(crate) group_type_mapping: HashMap<String, String>,
    pub(crate) cohorts: HashMap<String, CohortDefinition>,
    etag: Option<String>,
    fetched_at: DateTime<Utc>,
}

impl DefinitionsSnapshot {
    /// Build a snapshot from a local evaluation response. Flags and cohorts that failed to parse
    /// are dropped.
    pub fn from_response(
        response: LocalEvaluationResponse,
        etag: Option<String>,
        fetched_at: DateTime<Utc>,
    ) -> DefinitionsSnapshot {
        let mut flags = HashMap::with_capacity(response.flags.len());
        let mut flag_keys = Vec::with_capacity(response.flags.len());
        for flag in response.flags {
            match flag {
                TryParse::Parsed(flag) => {
                    if flags.contains_key(&flag.key) {
                        continue;
                    }
                    flag_keys.push(flag.key.clone());
                    flags.insert(flag.key.clone(), flag);
                }
                TryParse::ParseFailed(json) => {
                    log::warn!(target: "flagcore",
                               key:? = json.get("key");
                               "skipping flag definition that failed to parse");
                }
            }
        }

        let cohorts = response
            .cohorts
            .into_iter()
            .filter_map(|(id, cohort)| match cohort {
                TryParse::Parsed(cohort) => Some((id, cohort)),
                TryParse::ParseFailed(_) => {
                    log::warn!(target: "flagcore", cohort_id:display = id; "skipping cohort that failed to parse");
                    None
                }
            })
            .collect();

        DefinitionsSnapshot {
            flags,
            flag_keys,
            group_type_mapping: response.group_type_mapping,
            cohorts,
            etag,
            fetched_at,
        }
    }

    /// Find a flag by key.
    pub fn get_flag(&self, key: &str) -> Option<&FlagDefinition> {
        self.flags.get(key)
    }

    /// All flags in server order.
    pub fn flags(&self) -> impl Iterator<Item = &FlagDefinition> {
        self.flag_keys.iter().filter_map(|key| self.flags.get(key))
    }

    /// Number of flags in the snapshot.
    pub fn len(&self) -> usize {
        self.flag_keys.len()
    }

    /// Returns `true` if the snapshot contains no flags.
    pub fn is_empty(&self) -> bool {
        self.flag_keys.is_empty()
    }

    /// Freshness token returned by the server with this snapshot.
    pub fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    /// When the snapshot was fetched.
    pub fn fetched_at(&self) -> DateTime<Utc> {
        self.fetched_at
    }
}

/// Lifecycle of a [`DefinitionsStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// No definitions have been loaded yet and no load is running.
    Empty,
    /// A load is in flight. Readers still see the previous snapshot, if any.
    Loading,
    /// Definitions are available and no load is running.
    Ready,
    /// The store has been shut down and won't load again.
    Shutdown,
}

/// Result of a call to [`DefinitionsStore::load`].
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    /// New definitions were fetched and published.
    Updated {
        /// Number of flags in the new snapshot.
        flags: usize,
    },
    /// The server reported that the current definitions are still fresh.
    NotModified,
    /// Another caller was already loading. This call waited for it and didn't fetch.
    Joined,
    /// The fetch failed. The previous snapshot, if any, is retained.
    Failed(Error),
    /// The store has been shut down.
    ShutDown,
}

impl LoadOutcome {
    /// Returns the error if the load failed.
    pub fn error(&self) -> Option<&Error> {
        match self {
            LoadOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct LoaderState {
    loading: bool,
    shut_down: bool,
    /// Incremented at the end of every load so waiters can tell their load has finished.
    generation: u64,
    last_refresh: Option<DateTime<Utc>>,
}

/// `DefinitionsStore` provides a thread-safe (`Sync`) storage for flag definitions and makes sure
/// that at most one fetch is outstanding at any time.
///
/// [`DefinitionsSnapshot`] itself is always immutable and can only be replaced completely.
pub struct DefinitionsStore {
    snapshot: RwLock<Option<Arc<DefinitionsSnapshot>>>,
    loader: Mutex<LoaderState>,
    load_finished: Condvar,
    fetcher: Arc<dyn DefinitionsFetcher>,
}

impl DefinitionsStore {
    /// Create a new empty store that loads definitions with `fetcher`.
    pub fn new(fetcher: Arc<dyn DefinitionsFetcher>) -> DefinitionsStore {
        DefinitionsStore {
            snapshot: RwLock::new(None),
            loader: Mutex::new(LoaderState::default()),
            load_finished: Condvar::new(),
            fetcher,
        }
    }

    /// Get the current snapshot. Returns `None` if definitions haven't been loaded yet.
    pub fn get(&self) -> Option<Arc<DefinitionsSnapshot>> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen.
        let snapshot = self
            .snapshot
            .read()
            .expect("thread holding definitions lock should not panic");

        snapshot.clone()
    }

    fn set(&self, snapshot: Arc<DefinitionsSnapshot>) {
        let mut slot = self
            .snapshot
            .write()
            .expect("thread holding definitions lock should not panic");

        *slot = Some(snapshot);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StoreState {
        let loader = self.lock_loader();
        if loader.shut_down {
            StoreState::Shutdown
        } else if loader.loading {
            StoreState::Loading
        } else if self.get().is_some() {
            StoreState::Ready
        } else {
            StoreState::Empty
        }
    }

    /// Time of the last successful fetch, including not-modified responses.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.lock_loader().last_refresh
    }

    /// Fetch definitions and publish them.
    ///
    /// If a load is already in flight, waits for it to finish and returns [`LoadOutcome::Joined`]
    /// without fetching. Readers are never blocked: the fetch runs without holding any lock that
    /// [`DefinitionsStore::get`] needs.
    pub fn load(&self) -> LoadOutcome {
        {
            let mut loader = self.lock_loader();
            if loader.shut_down {
                return LoadOutcome::ShutDown;
            }
            if loader.loading {
                log::debug!(target: "flagcore", "definitions load in flight, waiting for it");
                let generation = loader.generation;
                while loader.loading && loader.generation == generation {
                    loader = self
                        .load_finished
                        .wait(loader)
                        .expect("thread holding loader lock should not panic");
                }
                return LoadOutcome::Joined;
            }
            loader.loading = true;
        }

        // Resets `loading` and wakes waiters even if the fetcher panics.
        let guard = LoadGuard {
            store: self,
            refreshed: false,
        };
        guard.run()
    }

    /// Stop accepting new loads. A load that is already in flight still publishes its result.
    pub fn shut_down(&self) {
        let mut loader = self.lock_loader();
        loader.shut_down = true;
        self.load_finished.notify_all();
    }

    fn lock_loader(&self) -> std::sync::MutexGuard<'_, LoaderState> {
        self.loader
            .lock()
            .expect("thread holding loader lock should not panic")
    }
}

struct LoadGuard<'a> {
    store: &'a DefinitionsStore,
    refreshed: bool,
}

impl LoadGuard<'_> {
    fn run(mut self) -> LoadOutcome {
        let current = self.store.get();
        let etag = current.as_ref().and_then(|snapshot| snapshot.etag());

        log::debug!(target: "flagcore", etag:?; "fetching flag definitions");
        match self.store.fetcher.fetch_definitions(etag) {
            Ok(DefinitionsResponse::Modified { definitions, etag }) => {
                let snapshot = DefinitionsSnapshot::from_response(definitions, etag, Utc::now());
                let flags = snapshot.len();
                self.store.set(Arc::new(snapshot));
                self.refreshed = true;
                log::debug!(target: "flagcore", flags; "loaded flag definitions");
                LoadOutcome::Updated { flags }
            }
            Ok(DefinitionsResponse::NotModified) => {
                self.refreshed = true;
                log::debug!(target: "flagcore", "flag definitions not modified");
                LoadOutcome::NotModified
            }
            Err(err) => {
                log::warn!(target: "flagcore", "failed to load flag definitions: {:?}", err);
                LoadOutcome::Failed(err)
            }
        }
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        // Don't panic in drop. A poisoned lock is recovered since the state is plain data.
        let mut loader = match self.store.loader.lock() {
            Ok(loader) => loader,
            Err(poisoned) => poisoned.into_inner(),
        };
        loader.loading = false;
        loader.generation = loader.generation.wrapping_add(1);
        if self.refreshed {
            loader.last_refresh = Some(Utc::now());
        }
        self.store.load_finished.notify_all();
    }
}
