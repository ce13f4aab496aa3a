//! Collaborators that fetch data from the flag service, and a blocking HTTP implementation of
//! them.
use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use reqwest::{
    header::{AUTHORIZATION, ETAG, IF_NONE_MATCH},
    StatusCode, Url,
};
use serde::Serialize;

use crate::{
    context::EvaluationContext,
    models::{LocalEvaluationResponse, Properties, RemoteFlagsResponse},
    Error, Result,
};

/// Response of [`DefinitionsFetcher::fetch_definitions`].
#[derive(Debug, Clone)]
pub enum DefinitionsResponse {
    /// Definitions changed since the given freshness token (or no token was given).
    Modified {
        /// The new definitions.
        definitions: LocalEvaluationResponse,
        /// Freshness token to send with the next request.
        etag: Option<String>,
    },
    /// Definitions are unchanged since the given freshness token.
    NotModified,
}

/// Fetches flag definitions for local evaluation.
pub trait DefinitionsFetcher: Send + Sync {
    /// Fetch definitions. `etag` is the freshness token of the currently held definitions.
    fn fetch_definitions(&self, etag: Option<&str>) -> Result<DefinitionsResponse>;
}

/// Evaluates all flags for a subject on the server.
pub trait FlagsFetcher: Send + Sync {
    /// Ask the server to evaluate flags for `request`.
    fn fetch_flags(&self, request: &FlagsRequest<'_>) -> Result<RemoteFlagsResponse>;
}

/// Subject of a remote flags request.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FlagsRequest<'a> {
    /// Unique identifier of the person.
    pub distinct_id: &'a str,
    /// Group type name to group key.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groups: Option<&'a HashMap<String, String>>,
    /// Properties of the person.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person_properties: Option<&'a Properties>,
    /// Group type name to properties of that group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_properties: Option<&'a HashMap<String, Properties>>,
}

impl<'a> From<&'a EvaluationContext> for FlagsRequest<'a> {
    fn from(context: &'a EvaluationContext) -> Self {
        FlagsRequest {
            distinct_id: &context.distinct_id,
            groups: context.groups.as_ref(),
            person_properties: context.person_properties.as_ref(),
            group_properties: context.group_properties.as_ref(),
        }
    }
}

pub(crate) struct HttpFetcherConfig {
    pub base_url: String,
    pub api_key: String,
    pub personal_api_key: Option<String>,
    pub timeout: Duration,
}

const LOCAL_EVALUATION_ENDPOINT: &str = "/api/feature_flag/local_evaluation/";
const FLAGS_ENDPOINT: &str = "/decide/";

/// Blocking HTTP client for both endpoints.
pub struct HttpFetcher {
    // Client holds a connection pool internally, so we're reusing the client between requests.
    client: reqwest::blocking::Client,
    config: HttpFetcherConfig,
    /// If we receive a 401 Unauthorized error while fetching definitions, the personal API key is
    /// not valid. We cache this error so we don't issue additional requests to the server.
    unauthorized: AtomicBool,
}

#[derive(Serialize)]
struct FlagsRequestBody<'a> {
    api_key: &'a str,
    #[serde(flatten)]
    request: &'a FlagsRequest<'a>,
}

impl HttpFetcher {
    pub(crate) fn new(config: HttpFetcherConfig) -> Result<HttpFetcher> {
        let client = reqwest::blocking::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("flagcore/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(HttpFetcher {
            client,
            config,
            unauthorized: AtomicBool::new(false),
        })
    }

    fn url(&self, endpoint: &str, params: &[(&str, &str)]) -> Result<Url> {
        let base_url = self.config.base_url.trim_end_matches('/');
        Url::parse_with_params(&format!("{base_url}{endpoint}"), params).map_err(Error::InvalidBaseUrl)
    }
}

impl DefinitionsFetcher for HttpFetcher {
    fn fetch_definitions(&self, etag: Option<&str>) -> Result<DefinitionsResponse> {
        if self.unauthorized.load(Ordering::Relaxed) {
            return Err(Error::Unauthorized);
        }
        let Some(personal_api_key) = &self.config.personal_api_key else {
            return Err(Error::Unauthorized);
        };

        let url = self.url(
            LOCAL_EVALUATION_ENDPOINT,
            &[
                ("token", self.config.api_key.as_str()),
                ("send_cohorts", "true"),
            ],
        )?;

        log::debug!(target: "flagcore", "fetching flag definitions");
        let mut request = self
            .client
            .get(url)
            .header(AUTHORIZATION, format!("Bearer {personal_api_key}"));
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        let response = request.send()?;

        match response.status() {
            StatusCode::NOT_MODIFIED => return Ok(DefinitionsResponse::NotModified),
            StatusCode::UNAUTHORIZED => {
                log::warn!(target: "flagcore", "client is not authorized. Check your personal API key");
                self.unauthorized.store(true, Ordering::Relaxed);
                return Err(Error::Unauthorized);
            }
            _ => {}
        }

        let response = response.error_for_status().map_err(|err| {
            log::warn!(target: "flagcore", "received non-200 response while fetching flag definitions: {:?}", err);
            Error::from(err)
        })?;

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes()?;
        let definitions = serde_json::from_slice(&body)?;

        log::debug!(target: "flagcore", "successfully fetched flag definitions");

        Ok(DefinitionsResponse::Modified { definitions, etag })
    }
}

impl FlagsFetcher for HttpFetcher {
    fn fetch_flags(&self, request: &FlagsRequest<'_>) -> Result<RemoteFlagsResponse> {
        let url = self.url(FLAGS_ENDPOINT, &[("v", "3")])?;

        log::debug!(target: "flagcore", distinct_id:display = request.distinct_id; "fetching flags");
        let response = self
            .client
            .post(url)
            .json(&FlagsRequestBody {
                api_key: &self.config.api_key,
                request,
            })
            .send()?
            .error_for_status()
            .map_err(|err| {
                log::warn!(target: "flagcore", "received non-200 response while fetching flags: {:?}", err);
                Error::from(err)
            })?;

        Ok(response.json()?)
    }
}
