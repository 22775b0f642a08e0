use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::query_service::{
    ContinuationToken, CursorClient, ExecutionHandle, ExecutionState, ExecutionStatus,
    QueryService, QuerySubmission, QueryTarget, RawPage, RawRow, ServiceError,
};

#[derive(Debug, Default)]
struct ScriptState {
    rows: Vec<RawRow>,
    statuses: VecDeque<ExecutionStatus>,
    withhold_handle: bool,
    fetch_failure: Option<String>,
    successful_fetches_before_failure: usize,
    start_calls: usize,
    status_calls: usize,
    fetch_calls: usize,
    requested_sizes: Vec<usize>,
    last_submission: Option<QuerySubmission>,
    released: Vec<String>,
}

/// In-memory service that serves a fixed result set (header row first) through offset tokens.
#[derive(Debug, Clone, Default)]
pub(crate) struct ScriptedService {
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedService {
    pub(crate) fn with_rows(rows: Vec<RawRow>) -> Self {
        let service = Self::default();
        service.lock().rows = rows;
        service
    }

    /// Header `columns` followed by `data_rows` rows of `r{row}c{column}` cells.
    pub(crate) fn with_table(columns: &[&str], data_rows: usize) -> Self {
        let mut rows = vec![RawRow::from_values(columns.iter().copied())];
        for row in 0..data_rows {
            rows.push(RawRow::from_values(
                (0..columns.len()).map(|column| format!("r{row}c{column}")),
            ));
        }
        Self::with_rows(rows)
    }

    pub(crate) fn with_statuses(self, statuses: Vec<ExecutionStatus>) -> Self {
        self.lock().statuses = statuses.into();
        self
    }

    pub(crate) fn without_handle(self) -> Self {
        self.lock().withhold_handle = true;
        self
    }

    pub(crate) fn failing_fetches(self, message: &str) -> Self {
        self.failing_after(0, message)
    }

    pub(crate) fn failing_after(self, successful_fetches: usize, message: &str) -> Self {
        {
            let mut state = self.lock();
            state.fetch_failure = Some(message.to_string());
            state.successful_fetches_before_failure = successful_fetches;
        }
        self
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.lock().start_calls
    }

    pub(crate) fn status_calls(&self) -> usize {
        self.lock().status_calls
    }

    pub(crate) fn fetch_calls(&self) -> usize {
        self.lock().fetch_calls
    }

    pub(crate) fn requested_sizes(&self) -> Vec<usize> {
        self.lock().requested_sizes.clone()
    }

    pub(crate) fn last_submission(&self) -> Option<QuerySubmission> {
        self.lock().last_submission.clone()
    }

    pub(crate) fn released(&self) -> Vec<String> {
        self.lock().released.clone()
    }

    fn lock(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().expect("script state poisoned")
    }
}

#[async_trait]
impl QueryService for ScriptedService {
    async fn start_query(
        &self,
        submission: &QuerySubmission,
    ) -> Result<Option<ExecutionHandle>, ServiceError> {
        let mut state = self.lock();
        state.start_calls += 1;
        state.last_submission = Some(submission.clone());
        if state.withhold_handle {
            return Ok(None);
        }
        Ok(Some(ExecutionHandle::new(format!(
            "exec-{}",
            state.start_calls
        ))))
    }

    async fn query_status(
        &self,
        _handle: &ExecutionHandle,
    ) -> Result<ExecutionStatus, ServiceError> {
        let mut state = self.lock();
        state.status_calls += 1;
        Ok(state
            .statuses
            .pop_front()
            .unwrap_or_else(|| ExecutionStatus::new(ExecutionState::Succeeded)))
    }

    async fn fetch_results(
        &self,
        _handle: &ExecutionHandle,
        token: Option<&ContinuationToken>,
        max_results: usize,
    ) -> Result<RawPage, ServiceError> {
        let mut state = self.lock();
        state.fetch_calls += 1;
        state.requested_sizes.push(max_results);
        if let Some(message) = &state.fetch_failure {
            if state.fetch_calls > state.successful_fetches_before_failure {
                return Err(ServiceError::new(message.clone()));
            }
        }

        let offset = match token {
            Some(token) => token
                .as_str()
                .strip_prefix("tok-")
                .and_then(|raw| raw.parse::<usize>().ok())
                .ok_or_else(|| ServiceError::new("invalid continuation token"))?,
            None => 0,
        };
        let start = offset.min(state.rows.len());
        let end = (start + max_results).min(state.rows.len());
        let next_token =
            (end < state.rows.len()).then(|| ContinuationToken::new(format!("tok-{end}")));

        Ok(RawPage {
            rows: state.rows[start..end].to_vec(),
            next_token,
        })
    }

    async fn release(&self, handle: &ExecutionHandle) {
        self.lock().released.push(handle.as_str().to_string());
    }
}

pub(crate) fn target() -> QueryTarget {
    QueryTarget {
        database: "analytics".to_string(),
        output_location: Some("s3://results/".to_string()),
        workgroup: "primary".to_string(),
    }
}

pub(crate) fn client(service: &ScriptedService) -> CursorClient<ScriptedService> {
    CursorClient::new(service.clone(), target())
}
