//! Local feature flag evaluation for server-side SDKs.
//!
//! # Overview
//!
//! The crate revolves around a [`Client`] that decides feature flag values for a person or a
//! group described by an [`EvaluationContext`]. Flag lookups result in a [`FlagValue`]: either a
//! plain boolean or the key of an experiment variant.
//!
//! When a personal API key is configured, the client downloads flag definitions (rules, rollouts,
//! cohorts) and keeps them fresh with a background [`PollerThread`]. Flags are then evaluated
//! locally, without a network round trip. Whenever a flag can't be decided from local data alone
//! (a property is missing, a cohort is unknown, the flag needs server-side state), the client asks
//! the flag service instead and caches the answer for the exact context.
//!
//! # Error Handling
//!
//! Flag lookups never fail: they return the caller's default value when no value can be
//! determined. [`Client::get_feature_flag_error`] explains why the last lookup for a flag did not
//! produce a fully computed value.
//!
//! Errors talking to the flag service are represented by the [`Error`] enum and surface through
//! [`LoadOutcome`], the fetcher traits, and [`PollerThread::wait_for_definitions`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! target `"flagcore"` and structured key-values. Consider integrating a `log`-compatible logger
//! implementation for better visibility into flag evaluation.
//!
//! # Examples
//!
//! A runnable example lives in the `demos/` directory of the crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod client;
mod cohorts;
mod config;
mod context;
mod definitions_store;
mod error;
mod eval;
mod feature_flag_error;
mod fetcher;
mod flags_cache;
mod models;
mod poller;
mod rules;
mod sharder;

pub use client::Client;
pub use config::ClientConfig;
pub use context::EvaluationContext;
pub use definitions_store::{DefinitionsSnapshot, DefinitionsStore, LoadOutcome, StoreState};
pub use error::{Error, InconclusiveMatchError, Result};
pub use feature_flag_error::{FeatureFlagError, FeatureFlagErrorKind};
pub use fetcher::{DefinitionsFetcher, DefinitionsResponse, FlagsFetcher, FlagsRequest, HttpFetcher};
pub use flags_cache::{CachedFlags, FlagsCache, FlagsCacheKey, LruTtlCache};
pub use models::{
    AttributeValue, CohortDefinition, ConditionGroup, ConditionValue, FlagDefinition, FlagFilters,
    FlagValue, LocalEvaluationResponse, LogicalOperator, MultivariateConfig, Operator, Properties,
    PropertyGroup, PropertyGroupValues, PropertyRule, PropertyType, RemoteFlagsResponse, TryParse,
    Value, VariantDefinition,
};
pub use poller::{PollerThread, PollerThreadConfig};
pub use rules::match_property;
pub use sharder::{Sha1Sharder, Sharder};
