//! Request/event contract between the result panel and the engine, plus the host that
//! dispatches requests against the session registry.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::bulk_export::{render_records, BulkExporter, DEFAULT_DELIMITER};
use crate::catalog::{
    preview_query, CatalogBackend, CatalogEntry, CatalogExplorer, Listing, PREVIEW_ROW_LIMIT,
};
use crate::completion::CompletionWaiter;
use crate::pagination::{PageMaterializer, PageResult, Record};
use crate::query_service::{CursorClient, ExecutionHandle, QueryError, QueryService};
use crate::row_counter::RowCounter;
use crate::sessions::{SessionId, SessionRegistry};
use crate::settings::QuerySettings;

pub const DOWNLOAD_FILE_STEM: &str = "query_results";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PanelRequest {
    ExecuteQuery { query: String },
    PreviewTable { database: String, table: String },
    LoadNextPage { session_id: SessionId },
    LoadPreviousPage { session_id: SessionId },
    DownloadAllResults { session_id: SessionId },
    ExportToCsv { records: Vec<Record>, filename: String },
    ListDatabases,
    ListTables { database: String },
    ListColumns { database: String, table: String },
    RefreshCatalog,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PanelEvent {
    ShowResults {
        query: String,
        session_id: SessionId,
        execution_time_ms: u64,
        paginated_results: PageResult,
    },
    UpdateResults {
        session_id: SessionId,
        results: PageResult,
    },
    /// Delimited text ready to be written under `file_stem`.
    CsvReady {
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        file_stem: String,
        content: String,
        total_rows: usize,
    },
    CatalogListing {
        #[serde(skip_serializing_if = "Option::is_none")]
        database: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        table: Option<String>,
        entries: Vec<CatalogEntry>,
        #[serde(skip_serializing_if = "Option::is_none")]
        placeholder_reason: Option<String>,
    },
    CatalogRefreshed,
    ShowError {
        error: String,
    },
}

#[derive(Debug)]
pub struct PanelHost<S: QueryService, C: CatalogBackend> {
    client: Arc<CursorClient<S>>,
    catalog: CatalogExplorer<C>,
    sessions: SessionRegistry<S>,
    waiter: CompletionWaiter,
    counter: RowCounter,
    exporter: BulkExporter,
    page_size: usize,
}

impl<S: QueryService, C: CatalogBackend> PanelHost<S, C> {
    #[must_use]
    pub fn new(client: CursorClient<S>, catalog: C, settings: &QuerySettings) -> Self {
        Self {
            client: Arc::new(client),
            catalog: CatalogExplorer::new(catalog),
            sessions: SessionRegistry::new(),
            waiter: CompletionWaiter::new(settings.poll_interval()),
            counter: RowCounter::default(),
            exporter: BulkExporter::default(),
            page_size: settings.page_size,
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionRegistry<S> {
        &self.sessions
    }

    /// Handles one request; every failure becomes a `ShowError` event.
    pub async fn handle(&mut self, request: PanelRequest) -> PanelEvent {
        match self.dispatch(request).await {
            Ok(event) => event,
            Err(error) => {
                warn!(%error, "panel request failed");
                PanelEvent::ShowError {
                    error: error.to_string(),
                }
            }
        }
    }

    async fn dispatch(&mut self, request: PanelRequest) -> Result<PanelEvent, QueryError> {
        match request {
            PanelRequest::ExecuteQuery { query } => {
                self.execute_query(query, PageMaterializer::new(self.page_size))
                    .await
            }
            PanelRequest::PreviewTable { database, table } => {
                let query = preview_query(self.client.service(), &database, &table);
                self.execute_query(query, PageMaterializer::preview(PREVIEW_ROW_LIMIT))
                    .await
            }
            PanelRequest::LoadNextPage { session_id } => {
                self.navigate(session_id, Direction::Next).await
            }
            PanelRequest::LoadPreviousPage { session_id } => {
                self.navigate(session_id, Direction::Previous).await
            }
            PanelRequest::DownloadAllResults { session_id } => {
                self.download_all(session_id).await
            }
            PanelRequest::ExportToCsv { records, filename } => Ok(PanelEvent::CsvReady {
                session_id: None,
                file_stem: filename,
                content: render_records(&records, DEFAULT_DELIMITER),
                total_rows: records.len(),
            }),
            PanelRequest::ListDatabases => {
                let listing = self.catalog.databases().await;
                Ok(catalog_event(None, None, listing))
            }
            PanelRequest::ListTables { database } => {
                let listing = self.catalog.tables(&database).await;
                Ok(catalog_event(Some(database), None, listing))
            }
            PanelRequest::ListColumns { database, table } => {
                let listing = self.catalog.columns(&database, &table).await;
                Ok(catalog_event(Some(database), Some(table), listing))
            }
            PanelRequest::RefreshCatalog => {
                self.catalog.refresh();
                Ok(PanelEvent::CatalogRefreshed)
            }
        }
    }

    async fn execute_query(
        &mut self,
        query: String,
        materializer: PageMaterializer,
    ) -> Result<PanelEvent, QueryError> {
        let started_at = Instant::now();
        let handle = self.client.start(&query).await?;
        let (total_rows, page) = match self.load_first_page(&handle, materializer).await {
            Ok(loaded) => loaded,
            Err(error) => {
                self.client.release(&handle).await;
                return Err(error);
            }
        };
        let execution_time_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        let session_id = self.sessions.create(
            handle,
            query.clone(),
            Arc::clone(&self.client),
            total_rows,
            materializer,
        );
        if let Some(session) = self.sessions.get_mut(&session_id) {
            session.record_page(page.clone());
        }
        info!(
            session = %session_id,
            rows = page.rows_on_page,
            total_rows = ?total_rows,
            execution_time_ms,
            "query results ready"
        );

        Ok(PanelEvent::ShowResults {
            query,
            session_id,
            execution_time_ms,
            paginated_results: page,
        })
    }

    async fn load_first_page(
        &self,
        handle: &ExecutionHandle,
        materializer: PageMaterializer,
    ) -> Result<(Option<u64>, PageResult), QueryError> {
        self.waiter.wait_for_completion(&self.client, handle).await?;
        let total_rows = self.counter.count_rows(&self.client, handle).await;
        let page = materializer
            .first_page(&self.client, handle, total_rows)
            .await?;
        Ok((total_rows, page))
    }

    async fn navigate(
        &mut self,
        session_id: SessionId,
        direction: Direction,
    ) -> Result<PanelEvent, QueryError> {
        let session = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| QueryError::SessionNotFound(session_id.to_string()))?;
        let client = Arc::clone(&session.client);
        let materializer = session.materializer;

        let page = match session.current_page() {
            Some(current) => match direction {
                Direction::Next => materializer.next_page(&client, current).await?,
                Direction::Previous => materializer.previous_page(&client, current).await?,
            },
            None => {
                materializer
                    .first_page(&client, &session.execution_handle, session.total_rows)
                    .await?
            }
        };
        session.record_page(page.clone());

        Ok(PanelEvent::UpdateResults {
            session_id,
            results: page,
        })
    }

    async fn download_all(&mut self, session_id: SessionId) -> Result<PanelEvent, QueryError> {
        let session = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| QueryError::SessionNotFound(session_id.to_string()))?;
        let export = self
            .exporter
            .export_all(&session.client, &session.execution_handle)
            .await?;

        Ok(PanelEvent::CsvReady {
            session_id: Some(session_id),
            file_stem: DOWNLOAD_FILE_STEM.to_string(),
            content: export.content,
            total_rows: export.total_rows,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Next,
    Previous,
}

fn catalog_event(database: Option<String>, table: Option<String>, listing: Listing) -> PanelEvent {
    let placeholder_reason = listing.placeholder_reason().map(str::to_string);
    let entries = match listing {
        Listing::Live(entries) | Listing::Placeholder { entries, .. } => entries,
    };
    PanelEvent::CatalogListing {
        database,
        table,
        entries,
        placeholder_reason,
    }
}
