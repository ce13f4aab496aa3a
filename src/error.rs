use std::sync::Arc;

use thiserror::Error;

/// Result type used by fallible operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced while talking to the flag service or managing background work.
///
/// Flag lookups on [`Client`](crate::Client) never return these. They surface through
/// [`LoadOutcome`](crate::LoadOutcome), the fetcher traits, and the poller.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, the personal API key is likely invalid.
    #[error("unauthorized, personal_api_key is likely invalid")]
    Unauthorized,

    /// The server answered with a non-success status code.
    #[error("flag service responded with status {status}")]
    Api {
        /// HTTP status code.
        status: u16,
    },

    /// The server could not be reached (DNS failure, refused connection, TLS error).
    #[error("unable to connect to the flag service")]
    Connection(#[source] Arc<reqwest::Error>),

    /// The request did not complete in time.
    #[error("request to the flag service timed out")]
    Timeout,

    /// Any other network error, including undecodable response bodies.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),

    /// A local-evaluation response could not be decoded.
    #[error("error parsing flag definitions")]
    DefinitionsParseError(#[source] Arc<serde_json::Error>),

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),

    /// Indicates that the poller thread panicked. This should normally never happen.
    #[error("poller thread panicked")]
    PollerThreadPanicked,
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            Error::Timeout
        } else if value.is_connect() {
            Error::Connection(Arc::new(value.without_url()))
        } else if let Some(status) = value.status() {
            Error::Api {
                status: status.as_u16(),
            }
        } else {
            Error::Network(Arc::new(value.without_url()))
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::DefinitionsParseError(Arc::new(value))
    }
}

/// The reason a flag could not be decided from local data alone.
///
/// Never surfaced to callers of [`Client`](crate::Client): it triggers a fallback to remote
/// evaluation instead.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InconclusiveMatchError {
    /// The property bag does not contain the key a rule refers to.
    #[error("can't match properties without a value for `{0}`")]
    MissingProperty(String),

    /// The rule references a cohort that is not part of the definitions.
    #[error("cohort {0} is not present in the local definitions")]
    CohortNotFound(String),

    /// A cohort references itself, directly or through other cohorts.
    #[error("cohort {0} references itself")]
    CohortCycle(String),

    /// A cohort rule carries no cohort id.
    #[error("cohort rule is missing its cohort id")]
    MissingCohortId,

    /// A flag dependency rule has no `dependency_chain`.
    #[error("flag dependency `{0}` is missing its dependency chain")]
    MissingDependencyChain(String),

    /// A flag depends on itself, directly or transitively.
    #[error("circular dependency detected for flag `{0}`")]
    CircularDependency(String),

    /// A flag dependency is not present in the local definitions.
    #[error("flag dependency `{0}` is not present in the local definitions")]
    DependencyNotFound(String),

    /// A flag dependency could not be decided locally.
    #[error("flag dependency `{0}` is inconclusive")]
    DependencyInconclusive(String),

    /// A flag dependency rule uses an operator other than `flag_evaluates_to`.
    #[error("flag dependency `{0}` has an invalid operator")]
    InvalidDependencyOperator(String),

    /// The flag aggregates by a group type that is not in the group type mapping.
    #[error("unknown group type index {0}")]
    UnknownGroupTypeIndex(i32),

    /// Flags with experience continuity need server-side hash key overrides.
    #[error("flag `{0}` has experience continuity enabled")]
    ExperienceContinuity(String),

    /// At least one condition could not be decided and none matched.
    #[error("can't determine if flag `{0}` is enabled with the given properties")]
    NoConclusiveCondition(String),

    /// At least one member of a property group could not be decided.
    #[error("can't decide property group locally")]
    PropertyGroup,
}
