use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::pagination::{PageMaterializer, PageResult};
use crate::query_service::{CursorClient, ExecutionHandle, QueryService};

static NEXT_SESSION_SEQUENCE: AtomicU64 = AtomicU64::new(1);

#[must_use]
pub fn unix_timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Unique per process: wall-clock millis plus a process-wide sequence number.
    #[must_use]
    pub fn generate() -> Self {
        let sequence = NEXT_SESSION_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self(format!("session_{}_{sequence}", unix_timestamp_millis()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Execution context behind one result panel.
#[derive(Debug)]
pub struct Session<S: QueryService> {
    pub execution_handle: ExecutionHandle,
    pub query: String,
    pub client: Arc<CursorClient<S>>,
    pub total_rows: Option<u64>,
    pub materializer: PageMaterializer,
    current_page: Option<PageResult>,
}

impl<S: QueryService> Session<S> {
    #[must_use]
    pub fn current_page(&self) -> Option<&PageResult> {
        self.current_page.as_ref()
    }

    pub fn record_page(&mut self, page: PageResult) {
        self.current_page = Some(page);
    }
}

/// Owns every open session for the lifetime of the host. Sessions are never evicted.
///
/// Navigation against one session must not overlap; callers get that for free by going
/// through `&mut` access.
#[derive(Debug)]
pub struct SessionRegistry<S: QueryService> {
    sessions: HashMap<SessionId, Session<S>>,
}

impl<S: QueryService> Default for SessionRegistry<S> {
    fn default() -> Self {
        Self {
            sessions: HashMap::new(),
        }
    }
}

impl<S: QueryService> SessionRegistry<S> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        execution_handle: ExecutionHandle,
        query: impl Into<String>,
        client: Arc<CursorClient<S>>,
        total_rows: Option<u64>,
        materializer: PageMaterializer,
    ) -> SessionId {
        let mut id = SessionId::generate();
        while self.sessions.contains_key(&id) {
            id = SessionId::generate();
        }
        self.sessions.insert(
            id.clone(),
            Session {
                execution_handle,
                query: query.into(),
                client,
                total_rows,
                materializer,
                current_page: None,
            },
        );
        id
    }

    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<&Session<S>> {
        self.sessions.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Session<S>> {
        self.sessions.get_mut(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
