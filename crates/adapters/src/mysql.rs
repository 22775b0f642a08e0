//! MySQL behind the execution-handle / token-paged service contract.
//!
//! A submitted statement runs to completion immediately and its result is buffered in
//! memory with a synthetic header row at index 0, the way result-set services hand back
//! their first page. Continuation tokens are `<execution>:<offset>` strings.
//!
//! Buffers are bounded: once more than `buffered_executions` results are held, the least
//! recently used one is evicted and its handle becomes unknown.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::StreamExt;
use mysql_async::prelude::Queryable;
use mysql_async::{Conn, OptsBuilder, Pool, Row, SslOpts, Value};
use quarry_core::catalog::{CatalogBackend, CatalogEntry};
use quarry_core::query_service::{
    ContinuationToken, ExecutionHandle, ExecutionState, ExecutionStatus, QueryService,
    QuerySubmission, RawPage, RawRow, ServiceError, MAX_PAGE_SIZE,
};
use quarry_core::sessions::unix_timestamp_millis;
use quarry_core::settings::{QuerySettings, ServiceEndpoint, TlsMode};
use tracing::{debug, info, warn};

pub const PASSWORD_ENV_VAR: &str = "QUARRY_DB_PASSWORD";

#[derive(Debug)]
struct BufferedExecution {
    status: ExecutionStatus,
    rows: Vec<RawRow>,
}

/// Buffered executions in least-recently-used order.
#[derive(Debug)]
struct ExecutionBuffer {
    capacity: usize,
    entries: HashMap<ExecutionHandle, BufferedExecution>,
    recency: VecDeque<ExecutionHandle>,
}

impl ExecutionBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    /// Returns the handles evicted to make room.
    fn insert(
        &mut self,
        handle: ExecutionHandle,
        execution: BufferedExecution,
    ) -> Vec<ExecutionHandle> {
        self.remove(&handle);
        self.entries.insert(handle.clone(), execution);
        self.recency.push_back(handle);

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some(oldest) = self.recency.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    fn get(&self, handle: &ExecutionHandle) -> Option<&BufferedExecution> {
        self.entries.get(handle)
    }

    fn touch(&mut self, handle: &ExecutionHandle) -> Option<&BufferedExecution> {
        let position = self.recency.iter().position(|held| held == handle)?;
        if let Some(held) = self.recency.remove(position) {
            self.recency.push_back(held);
        }
        self.entries.get(handle)
    }

    fn remove(&mut self, handle: &ExecutionHandle) -> Option<BufferedExecution> {
        self.recency.retain(|held| held != handle);
        self.entries.remove(handle)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

#[derive(Debug, Clone)]
pub struct MysqlQueryService {
    pool: Pool,
    executions: Arc<Mutex<ExecutionBuffer>>,
    sequence: Arc<AtomicU64>,
}

impl MysqlQueryService {
    #[must_use]
    pub fn from_settings(settings: &QuerySettings) -> Self {
        Self {
            pool: Pool::new(opts_from_endpoint(&settings.service, &settings.database)),
            executions: Arc::new(Mutex::new(ExecutionBuffer::new(
                settings.service.buffered_executions,
            ))),
            sequence: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn disconnect(&self) -> Result<(), mysql_async::Error> {
        self.pool.clone().disconnect().await
    }

    /// Number of result sets currently held in memory.
    pub fn buffered_executions(&self) -> Result<usize, ServiceError> {
        Ok(self.executions()?.len())
    }

    fn next_handle(&self) -> ExecutionHandle {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        ExecutionHandle::new(format!("{}-{sequence:06}", unix_timestamp_millis()))
    }

    fn executions(&self) -> Result<MutexGuard<'_, ExecutionBuffer>, ServiceError> {
        self.executions
            .lock()
            .map_err(|_| ServiceError::new("execution registry is unavailable"))
    }

    fn store(
        &self,
        handle: ExecutionHandle,
        execution: BufferedExecution,
    ) -> Result<(), ServiceError> {
        for evicted in self.executions()?.insert(handle, execution) {
            warn!(execution = %evicted, "evicted buffered result set");
        }
        Ok(())
    }

    async fn run_statement(
        conn: &mut Conn,
        submission: &QuerySubmission,
    ) -> Result<Vec<RawRow>, mysql_async::Error> {
        if !submission.database.trim().is_empty() {
            conn.query_drop(format!("USE {}", quote_identifier(&submission.database)))
                .await?;
        }

        let mut result = conn.query_iter(submission.query.as_str()).await?;
        let header = result
            .columns_ref()
            .iter()
            .map(|column| Some(column.name_str().into_owned()))
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        if !header.is_empty() {
            rows.push(RawRow::new(header));
        }
        if let Some(mut stream) = result.stream::<Row>().await? {
            while let Some(row) = stream.next().await {
                rows.push(row_to_raw_row(row?));
            }
        }
        result.drop_result().await?;
        Ok(rows)
    }
}

#[async_trait]
impl QueryService for MysqlQueryService {
    async fn start_query(
        &self,
        submission: &QuerySubmission,
    ) -> Result<Option<ExecutionHandle>, ServiceError> {
        let mut conn = self.pool.get_conn().await.map_err(to_service_error)?;
        let handle = self.next_handle();
        debug!(
            execution = %handle,
            workgroup = %submission.workgroup,
            output_location = %submission.output_location,
            "running statement"
        );

        let execution = match Self::run_statement(&mut conn, submission).await {
            Ok(rows) => {
                info!(execution = %handle, rows = rows.len(), "statement buffered");
                BufferedExecution {
                    status: ExecutionStatus::new(ExecutionState::Succeeded),
                    rows,
                }
            }
            Err(error) => {
                warn!(execution = %handle, %error, "statement failed");
                BufferedExecution {
                    status: ExecutionStatus::new(ExecutionState::Failed)
                        .with_reason(error.to_string()),
                    rows: Vec::new(),
                }
            }
        };
        drop(conn);

        self.store(handle.clone(), execution)?;
        Ok(Some(handle))
    }

    async fn query_status(
        &self,
        handle: &ExecutionHandle,
    ) -> Result<ExecutionStatus, ServiceError> {
        self.executions()?
            .get(handle)
            .map(|execution| execution.status.clone())
            .ok_or_else(|| unknown_execution(handle))
    }

    async fn fetch_results(
        &self,
        handle: &ExecutionHandle,
        token: Option<&ContinuationToken>,
        max_results: usize,
    ) -> Result<RawPage, ServiceError> {
        if max_results == 0 || max_results > MAX_PAGE_SIZE {
            return Err(ServiceError::new(format!(
                "max results must be between 1 and {MAX_PAGE_SIZE}, got {max_results}"
            )));
        }

        let mut executions = self.executions()?;
        let execution = executions
            .touch(handle)
            .ok_or_else(|| unknown_execution(handle))?;
        if execution.status.state != ExecutionState::Succeeded {
            return Err(ServiceError::new(format!(
                "execution {handle} is {}; results are unavailable",
                execution.status.state
            )));
        }

        let total = execution.rows.len();
        let start = match token {
            Some(token) => decode_token(handle, token)?,
            None => 0,
        }
        .min(total);
        let end = start.saturating_add(max_results).min(total);

        Ok(RawPage {
            rows: execution.rows[start..end].to_vec(),
            next_token: (end < total).then(|| encode_token(handle, end)),
        })
    }

    async fn release(&self, handle: &ExecutionHandle) {
        match self.executions() {
            Ok(mut executions) => {
                if executions.remove(handle).is_some() {
                    debug!(execution = %handle, "released buffered result set");
                }
            }
            Err(error) => warn!(execution = %handle, %error, "could not release result set"),
        }
    }

    fn quote_identifier(&self, identifier: &str) -> String {
        quote_identifier(identifier)
    }
}

#[async_trait]
impl CatalogBackend for MysqlQueryService {
    async fn list_databases(&self) -> Result<Vec<CatalogEntry>, ServiceError> {
        let mut conn = self.pool.get_conn().await.map_err(to_service_error)?;
        conn.query_map("SHOW DATABASES", |database: String| {
            CatalogEntry::new(database, "")
        })
        .await
        .map_err(to_service_error)
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<CatalogEntry>, ServiceError> {
        let mut conn = self.pool.get_conn().await.map_err(to_service_error)?;
        conn.exec_map(
            "SELECT TABLE_NAME, TABLE_COMMENT \
             FROM information_schema.TABLES \
             WHERE TABLE_SCHEMA = ? \
             ORDER BY TABLE_NAME",
            (database,),
            |(name, comment): (String, Option<String>)| {
                CatalogEntry::new(name, comment.unwrap_or_default())
            },
        )
        .await
        .map_err(to_service_error)
    }

    async fn list_columns(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<CatalogEntry>, ServiceError> {
        let mut conn = self.pool.get_conn().await.map_err(to_service_error)?;
        conn.exec_map(
            "SELECT COLUMN_NAME, COLUMN_TYPE, COLUMN_COMMENT \
             FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
             ORDER BY ORDINAL_POSITION",
            (database, table),
            |(name, data_type, comment): (String, String, Option<String>)| {
                CatalogEntry::column(name, data_type, comment.unwrap_or_default())
            },
        )
        .await
        .map_err(to_service_error)
    }
}

fn opts_from_endpoint(endpoint: &ServiceEndpoint, database: &str) -> OptsBuilder {
    let mut builder = OptsBuilder::default()
        .ip_or_hostname(endpoint.host.clone())
        .tcp_port(endpoint.port)
        .user(Some(endpoint.user.clone()));

    if let Some(password) = std::env::var(PASSWORD_ENV_VAR)
        .ok()
        .filter(|pw| !pw.is_empty())
    {
        builder = builder.pass(Some(password));
    }

    if !database.trim().is_empty() {
        builder = builder.db_name(Some(database.to_string()));
    }

    if let Some(ssl_opts) = ssl_opts_for(endpoint.tls_mode) {
        builder = builder.ssl_opts(ssl_opts);
    }

    builder
}

fn ssl_opts_for(tls_mode: TlsMode) -> Option<SslOpts> {
    match tls_mode {
        TlsMode::Disabled | TlsMode::Prefer => None,
        TlsMode::Require => Some(SslOpts::default()),
    }
}

fn quote_identifier(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn encode_token(handle: &ExecutionHandle, offset: usize) -> ContinuationToken {
    ContinuationToken::new(format!("{handle}:{offset}"))
}

fn decode_token(
    handle: &ExecutionHandle,
    token: &ContinuationToken,
) -> Result<usize, ServiceError> {
    token
        .as_str()
        .split_once(':')
        .filter(|(owner, _)| *owner == handle.as_str())
        .and_then(|(_, offset)| offset.parse::<usize>().ok())
        .ok_or_else(|| ServiceError::new(format!("invalid continuation token for {handle}")))
}

fn unknown_execution(handle: &ExecutionHandle) -> ServiceError {
    ServiceError::new(format!("unknown execution {handle}"))
}

fn row_to_raw_row(row: Row) -> RawRow {
    RawRow::new(row.unwrap().into_iter().map(mysql_value_to_cell).collect())
}

fn mysql_value_to_cell(value: Value) -> Option<String> {
    let text = match value {
        Value::NULL => return None,
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Value::Int(value) => value.to_string(),
        Value::UInt(value) => value.to_string(),
        Value::Float(value) => value.to_string(),
        Value::Double(value) => value.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}.{micros:06}"
        ),
        Value::Time(is_negative, days, hours, minutes, seconds, micros) => {
            let sign = if is_negative { "-" } else { "" };
            format!("{sign}{days:03} {hours:02}:{minutes:02}:{seconds:02}.{micros:06}")
        }
    };
    Some(text)
}

fn to_service_error(error: mysql_async::Error) -> ServiceError {
    ServiceError::new(error.to_string())
}
