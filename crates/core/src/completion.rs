use std::time::Duration;

use tracing::{debug, info};

use crate::query_service::{CursorClient, ExecutionHandle, ExecutionState, QueryError, QueryService};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1_500);

const MISSING_REASON: &str = "No reason provided.";

/// Polls an execution until it leaves `QUEUED`/`RUNNING`.
///
/// There is no timeout and no cancellation path; a caller that stops waiting simply drops
/// the future.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionWaiter {
    poll_interval: Duration,
}

impl Default for CompletionWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl CompletionWaiter {
    #[must_use]
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub async fn wait_for_completion<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        handle: &ExecutionHandle,
    ) -> Result<(), QueryError> {
        let mut state = ExecutionState::Queued;
        let mut polls = 0_u32;

        while !state.is_terminal() {
            tokio::time::sleep(self.poll_interval).await;
            let status = client.status(handle).await?;
            polls += 1;
            debug!(execution = %handle, state = %status.state, polls, "polled execution status");

            if matches!(
                status.state,
                ExecutionState::Failed | ExecutionState::Cancelled
            ) {
                return Err(QueryError::ExecutionFailed {
                    state: status.state,
                    reason: status
                        .reason
                        .filter(|reason| !reason.trim().is_empty())
                        .unwrap_or_else(|| MISSING_REASON.to_string()),
                });
            }
            state = status.state;
        }

        info!(execution = %handle, polls, "query succeeded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::CompletionWaiter;
    use crate::query_service::{ExecutionHandle, ExecutionState, ExecutionStatus, QueryError};
    use crate::testing::{client, ScriptedService};

    fn waiter() -> CompletionWaiter {
        CompletionWaiter::new(Duration::ZERO)
    }

    #[tokio::test]
    async fn polls_until_succeeded() {
        let service = ScriptedService::with_rows(Vec::new()).with_statuses(vec![
            ExecutionStatus::new(ExecutionState::Queued),
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::new(ExecutionState::Succeeded),
        ]);
        let client = client(&service);

        waiter()
            .wait_for_completion(&client, &ExecutionHandle::new("exec-1"))
            .await
            .expect("query should succeed");

        assert_eq!(service.status_calls(), 4);
    }

    #[tokio::test]
    async fn failure_carries_service_reason() {
        let service = ScriptedService::with_rows(Vec::new()).with_statuses(vec![
            ExecutionStatus::new(ExecutionState::Running),
            ExecutionStatus::new(ExecutionState::Failed).with_reason("SYNTAX_ERROR: line 1:8"),
        ]);
        let client = client(&service);

        let error = waiter()
            .wait_for_completion(&client, &ExecutionHandle::new("exec-1"))
            .await
            .expect_err("failed query must error");

        match error {
            QueryError::ExecutionFailed { state, reason } => {
                assert_eq!(state, ExecutionState::Failed);
                assert_eq!(reason, "SYNTAX_ERROR: line 1:8");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_without_reason_uses_default_message() {
        let service = ScriptedService::with_rows(Vec::new())
            .with_statuses(vec![ExecutionStatus::new(ExecutionState::Cancelled)]);
        let client = client(&service);

        let error = waiter()
            .wait_for_completion(&client, &ExecutionHandle::new("exec-1"))
            .await
            .expect_err("cancelled query must error");

        assert_eq!(error.to_string(), "query CANCELLED: No reason provided.");
    }

    #[test]
    fn default_interval_is_one_and_a_half_seconds() {
        assert_eq!(
            CompletionWaiter::default().poll_interval(),
            Duration::from_millis(1_500)
        );
    }
}
