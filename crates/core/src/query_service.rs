use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Largest page the query service will hand back in a single fetch.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Opaque identifier for one query run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Service-issued cursor pointing at the next unfetched chunk of rows. Never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContinuationToken(String);

impl ContinuationToken {
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl ExecutionState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    pub reason: Option<String>,
}

impl ExecutionStatus {
    #[must_use]
    pub fn new(state: ExecutionState) -> Self {
        Self {
            state,
            reason: None,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// One positional row as returned by the service. `None` cells are SQL nulls.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRow {
    pub cells: Vec<Option<String>>,
}

impl RawRow {
    #[must_use]
    pub fn new(cells: Vec<Option<String>>) -> Self {
        Self { cells }
    }

    #[must_use]
    pub fn from_values<I, V>(values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            cells: values.into_iter().map(|value| Some(value.into())).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Cell text at `index`, with nulls and missing cells rendered as an empty string.
    #[must_use]
    pub fn text(&self, index: usize) -> &str {
        self.cells
            .get(index)
            .and_then(Option::as_deref)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawPage {
    pub rows: Vec<RawRow>,
    pub next_token: Option<ContinuationToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySubmission {
    pub query: String,
    pub database: String,
    pub output_location: String,
    pub workgroup: String,
}

/// Static submission settings a [`CursorClient`] applies to every query it starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryTarget {
    pub database: String,
    pub output_location: Option<String>,
    pub workgroup: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ServiceError {
    message: String,
}

impl ServiceError {
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("no previous pages available")]
    NoPreviousPage,
    #[error("no next page available")]
    NoNextPage,
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to start query execution: {0}")]
    Submission(String),
    #[error("query {state}: {reason}")]
    ExecutionFailed {
        state: ExecutionState,
        reason: String,
    },
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error("unknown session `{0}`")]
    SessionNotFound(String),
    #[error("query service failed: {0}")]
    Transport(#[source] ServiceError),
}

#[async_trait]
pub trait QueryService: Send + Sync {
    /// Submits a query. `Ok(None)` means the service accepted the call but issued no handle.
    async fn start_query(
        &self,
        submission: &QuerySubmission,
    ) -> Result<Option<ExecutionHandle>, ServiceError>;

    async fn query_status(&self, handle: &ExecutionHandle)
        -> Result<ExecutionStatus, ServiceError>;

    async fn fetch_results(
        &self,
        handle: &ExecutionHandle,
        token: Option<&ContinuationToken>,
        max_results: usize,
    ) -> Result<RawPage, ServiceError>;

    /// Drops anything the service holds locally for `handle`. Unknown handles are ignored.
    async fn release(&self, _handle: &ExecutionHandle) {}

    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }
}

#[derive(Debug)]
pub struct CursorClient<S: QueryService> {
    service: S,
    target: QueryTarget,
}

impl<S: QueryService> CursorClient<S> {
    #[must_use]
    pub fn new(service: S, target: QueryTarget) -> Self {
        Self { service, target }
    }

    #[must_use]
    pub fn service(&self) -> &S {
        &self.service
    }

    #[must_use]
    pub fn target(&self) -> &QueryTarget {
        &self.target
    }

    pub async fn start(&self, query: &str) -> Result<ExecutionHandle, QueryError> {
        let output_location = self
            .target
            .output_location
            .as_deref()
            .map(str::trim)
            .filter(|location| !location.is_empty())
            .ok_or_else(|| {
                QueryError::Configuration("query output location is not configured".to_string())
            })?;

        let submission = QuerySubmission {
            query: query.to_string(),
            database: self.target.database.clone(),
            output_location: output_location.to_string(),
            workgroup: self.target.workgroup.clone(),
        };

        let handle = self
            .service
            .start_query(&submission)
            .await
            .map_err(|error| QueryError::Submission(error.to_string()))?
            .ok_or_else(|| {
                QueryError::Submission("service returned no execution handle".to_string())
            })?;
        debug!(execution = %handle, database = %submission.database, "query submitted");
        Ok(handle)
    }

    pub async fn status(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, QueryError> {
        self.service
            .query_status(handle)
            .await
            .map_err(QueryError::Transport)
    }

    pub async fn release(&self, handle: &ExecutionHandle) {
        self.service.release(handle).await;
        debug!(execution = %handle, "execution released");
    }

    /// Fetches one raw page. `max_results` is clamped to `1..=MAX_PAGE_SIZE`.
    pub async fn fetch_page(
        &self,
        handle: &ExecutionHandle,
        token: Option<&ContinuationToken>,
        max_results: usize,
    ) -> Result<RawPage, QueryError> {
        let max_results = max_results.clamp(1, MAX_PAGE_SIZE);
        let page = self
            .service
            .fetch_results(handle, token, max_results)
            .await
            .map_err(QueryError::Transport)?;
        debug!(
            execution = %handle,
            requested = max_results,
            received = page.rows.len(),
            has_more = page.next_token.is_some(),
            "fetched result page"
        );
        Ok(page)
    }
}
