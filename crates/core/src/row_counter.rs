use tracing::{debug, warn};

use crate::query_service::{
    CursorClient, ExecutionHandle, QueryError, QueryService, MAX_PAGE_SIZE,
};

/// Counts data rows by walking the whole result set, independent of the paged view.
///
/// The walk is not snapshot-consistent with the paged view: if the underlying result
/// changes between traversals the two can disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCounter {
    fetch_size: usize,
}

impl Default for RowCounter {
    fn default() -> Self {
        Self {
            fetch_size: MAX_PAGE_SIZE,
        }
    }
}

impl RowCounter {
    #[must_use]
    pub fn with_fetch_size(fetch_size: usize) -> Self {
        Self {
            fetch_size: fetch_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    /// Total data rows, or `None` when any fetch fails. Never propagates an error.
    pub async fn count_rows<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        handle: &ExecutionHandle,
    ) -> Option<u64> {
        match self.try_count_rows(client, handle).await {
            Ok(total) => Some(total),
            Err(error) => {
                warn!(execution = %handle, %error, "row count unavailable");
                None
            }
        }
    }

    async fn try_count_rows<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        handle: &ExecutionHandle,
    ) -> Result<u64, QueryError> {
        let mut total = 0_u64;
        let mut token = None;
        let mut pages = 0_u64;

        loop {
            let page = client
                .fetch_page(handle, token.as_ref(), self.fetch_size)
                .await?;
            let rows = page.rows.len() as u64;
            total += if pages == 0 { rows.saturating_sub(1) } else { rows };
            pages += 1;
            debug!(execution = %handle, pages, total, "counting rows");

            match page.next_token {
                Some(next) => token = Some(next),
                None => return Ok(total),
            }
        }
    }
}
