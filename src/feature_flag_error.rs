//! Why a flag lookup could not produce a server-computed value.
use std::{
    collections::HashSet,
    num::NonZeroUsize,
    sync::Mutex,
};

use lru::LruCache;

use crate::{flags_cache::CachedFlags, models::RemoteFlagsResponse, Error};

/// A single reason reported by [`FeatureFlagError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FeatureFlagErrorKind {
    /// The server could only compute some of the flags.
    ErrorsWhileComputingFlags,
    /// The project has exceeded its feature flag quota.
    QuotaLimited,
    /// The flag is not part of the last known flags.
    FlagMissing,
    /// The server answered with a non-success status code.
    ApiError(u16),
    /// The server could not be reached.
    ConnectionError,
    /// The request did not complete in time.
    Timeout,
    /// Nothing is known about the request.
    UnknownError,
}

impl std::fmt::Display for FeatureFlagErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeatureFlagErrorKind::ErrorsWhileComputingFlags => {
                f.write_str("errors_while_computing_flags")
            }
            FeatureFlagErrorKind::QuotaLimited => f.write_str("quota_limited"),
            FeatureFlagErrorKind::FlagMissing => f.write_str("flag_missing"),
            FeatureFlagErrorKind::ApiError(status) => write!(f, "api_error_{status}"),
            FeatureFlagErrorKind::ConnectionError => f.write_str("connection_error"),
            FeatureFlagErrorKind::Timeout => f.write_str("timeout"),
            FeatureFlagErrorKind::UnknownError => f.write_str("unknown_error"),
        }
    }
}

impl From<&Error> for FeatureFlagErrorKind {
    fn from(err: &Error) -> Self {
        match err {
            Error::Api { status } => FeatureFlagErrorKind::ApiError(*status),
            Error::Connection(_) => FeatureFlagErrorKind::ConnectionError,
            Error::Timeout => FeatureFlagErrorKind::Timeout,
            _ => FeatureFlagErrorKind::UnknownError,
        }
    }
}

/// One or more reasons why a flag value was not fully computed by the server.
///
/// Formats as a comma-separated list, e.g. `quota_limited,flag_missing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlagError {
    kinds: Vec<FeatureFlagErrorKind>,
}

impl FeatureFlagError {
    /// Reasons in reporting order.
    pub fn kinds(&self) -> &[FeatureFlagErrorKind] {
        &self.kinds
    }

    /// Returns `true` if `kind` is one of the reasons.
    pub fn contains(&self, kind: FeatureFlagErrorKind) -> bool {
        self.kinds.contains(&kind)
    }
}

impl From<FeatureFlagErrorKind> for FeatureFlagError {
    fn from(kind: FeatureFlagErrorKind) -> Self {
        FeatureFlagError { kinds: vec![kind] }
    }
}

impl std::fmt::Display for FeatureFlagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, kind) in self.kinds.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{kind}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FeatureFlagError {}

/// What is known about the last remote requests for one distinct id.
#[derive(Debug, Default)]
struct FlagsRecord {
    /// Flags and payloads known after merging every response so far.
    known: CachedFlags,
    errors_while_computing_flags: bool,
    quota_limited: bool,
    /// Set when the last request failed. Flags from earlier responses are kept.
    request_error: Option<FeatureFlagErrorKind>,
    /// Flags whose last lookup was answered by local evaluation.
    evaluated_locally: HashSet<String>,
}

impl FlagsRecord {
    fn apply_response(&mut self, response: &RemoteFlagsResponse) {
        self.request_error = None;
        self.errors_while_computing_flags = response.errors_while_computing_flags;
        self.quota_limited = response.is_quota_limited();

        if self.quota_limited {
            self.known.flags.clear();
            self.known.payloads.clear();
        } else if self.errors_while_computing_flags {
            for (key, value) in &response.flags {
                self.known.flags.insert(key.clone(), value.clone());
                // A payload belongs to the value it was served with.
                match response.payloads.get(key) {
                    Some(payload) => self.known.payloads.insert(key.clone(), payload.clone()),
                    None => self.known.payloads.remove(key),
                };
            }
        } else {
            self.known = CachedFlags::from(response);
        }
    }

    fn error_for(&self, flag_key: &str) -> Option<FeatureFlagError> {
        if self.evaluated_locally.contains(flag_key) {
            return None;
        }
        if let Some(kind) = self.request_error {
            return Some(kind.into());
        }

        let mut kinds = Vec::new();
        if self.errors_while_computing_flags {
            kinds.push(FeatureFlagErrorKind::ErrorsWhileComputingFlags);
        }
        if self.quota_limited {
            kinds.push(FeatureFlagErrorKind::QuotaLimited);
        }
        if !self.known.flags.contains_key(flag_key) {
            kinds.push(FeatureFlagErrorKind::FlagMissing);
        }

        (!kinds.is_empty()).then_some(FeatureFlagError { kinds })
    }
}

/// Per-distinct-id bookkeeping behind [`Client::get_feature_flag_error`](crate::Client::get_feature_flag_error).
pub(crate) struct FlagsRecords {
    records: Mutex<LruCache<String, FlagsRecord>>,
}

impl FlagsRecords {
    pub(crate) const DEFAULT_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
        Some(capacity) => capacity,
        None => unreachable!(),
    };

    pub(crate) fn new(capacity: NonZeroUsize) -> FlagsRecords {
        FlagsRecords {
            records: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Merge a remote response into the record. Returns the flags and payloads known after
    /// merging.
    pub(crate) fn record_response(
        &self,
        distinct_id: &str,
        response: &RemoteFlagsResponse,
    ) -> CachedFlags {
        self.update(distinct_id, |record| {
            record.apply_response(response);
            for key in response.flags.keys() {
                record.evaluated_locally.remove(key);
            }
            record.known.clone()
        })
    }

    pub(crate) fn record_failure(&self, distinct_id: &str, err: &Error) {
        self.update(distinct_id, |record| {
            record.request_error = Some(err.into());
        });
    }

    pub(crate) fn record_local(&self, distinct_id: &str, flag_key: &str) {
        self.update(distinct_id, |record| {
            record.evaluated_locally.insert(flag_key.to_owned());
        });
    }

    /// Forget that `flag_key` was evaluated locally, so the next remote lookup decides its error.
    pub(crate) fn record_remote_lookup(&self, distinct_id: &str, flag_key: &str) {
        let mut records = self.lock();
        if let Some(record) = records.get_mut(distinct_id) {
            record.evaluated_locally.remove(flag_key);
        }
    }

    pub(crate) fn error_for(&self, flag_key: &str, distinct_id: &str) -> Option<FeatureFlagError> {
        match self.lock().get(distinct_id) {
            Some(record) => record.error_for(flag_key),
            None => Some(FeatureFlagErrorKind::UnknownError.into()),
        }
    }

    pub(crate) fn clear(&self) {
        self.lock().clear();
    }

    fn update<R>(&self, distinct_id: &str, f: impl FnOnce(&mut FlagsRecord) -> R) -> R {
        let mut records = self.lock();
        let record = records.get_or_insert_mut(distinct_id.to_owned(), FlagsRecord::default);
        f(record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, FlagsRecord>> {
        self.records
            .lock()
            .expect("thread holding records lock should not panic")
    }
}
