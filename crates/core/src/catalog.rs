use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::query_service::{QueryService, ServiceError};

pub const PREVIEW_ROW_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

impl CatalogEntry {
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            data_type: None,
        }
    }

    #[must_use]
    pub fn column(
        name: impl Into<String>,
        data_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            data_type: Some(data_type.into()),
        }
    }
}

/// A catalog level as shown in the navigation tree.
///
/// `Placeholder` carries sample entries so the tree stays usable when the backend is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    Live(Vec<CatalogEntry>),
    Placeholder {
        reason: String,
        entries: Vec<CatalogEntry>,
    },
}

impl Listing {
    #[must_use]
    pub fn entries(&self) -> &[CatalogEntry] {
        match self {
            Self::Live(entries) | Self::Placeholder { entries, .. } => entries,
        }
    }

    #[must_use]
    pub fn placeholder_reason(&self) -> Option<&str> {
        match self {
            Self::Live(_) => None,
            Self::Placeholder { reason, .. } => Some(reason),
        }
    }
}

#[async_trait]
pub trait CatalogBackend: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<CatalogEntry>, ServiceError>;
    async fn list_tables(&self, database: &str) -> Result<Vec<CatalogEntry>, ServiceError>;
    async fn list_columns(
        &self,
        database: &str,
        table: &str,
    ) -> Result<Vec<CatalogEntry>, ServiceError>;
}

/// Catalog reads memoized per level until [`CatalogExplorer::refresh`].
#[derive(Debug)]
pub struct CatalogExplorer<B: CatalogBackend> {
    backend: B,
    databases: Option<Vec<CatalogEntry>>,
    tables: HashMap<String, Vec<CatalogEntry>>,
    columns: HashMap<(String, String), Vec<CatalogEntry>>,
}

impl<B: CatalogBackend> CatalogExplorer<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            databases: None,
            tables: HashMap::new(),
            columns: HashMap::new(),
        }
    }

    pub fn refresh(&mut self) {
        self.databases = None;
        self.tables.clear();
        self.columns.clear();
    }

    pub async fn databases(&mut self) -> Listing {
        if let Some(cached) = &self.databases {
            return Listing::Live(cached.clone());
        }
        match self.backend.list_databases().await {
            Ok(entries) => {
                self.databases = Some(entries.clone());
                Listing::Live(entries)
            }
            Err(error) => placeholder("databases", &error, sample_databases()),
        }
    }

    pub async fn tables(&mut self, database: &str) -> Listing {
        if let Some(cached) = self.tables.get(database) {
            return Listing::Live(cached.clone());
        }
        match self.backend.list_tables(database).await {
            Ok(entries) => {
                self.tables.insert(database.to_string(), entries.clone());
                Listing::Live(entries)
            }
            Err(error) => placeholder("tables", &error, sample_tables()),
        }
    }

    pub async fn columns(&mut self, database: &str, table: &str) -> Listing {
        let key = (database.to_string(), table.to_string());
        if let Some(cached) = self.columns.get(&key) {
            return Listing::Live(cached.clone());
        }
        match self.backend.list_columns(database, table).await {
            Ok(entries) => {
                self.columns.insert(key, entries.clone());
                Listing::Live(entries)
            }
            Err(error) => placeholder("columns", &error, sample_columns()),
        }
    }
}

/// `SELECT *` over one table, capped at [`PREVIEW_ROW_LIMIT`] rows, quoted for `service`.
#[must_use]
pub fn preview_query<S: QueryService + ?Sized>(service: &S, database: &str, table: &str) -> String {
    format!(
        "SELECT * FROM {}.{} LIMIT {PREVIEW_ROW_LIMIT}",
        service.quote_identifier(database),
        service.quote_identifier(table)
    )
}

fn placeholder(level: &str, error: &ServiceError, entries: Vec<CatalogEntry>) -> Listing {
    warn!(level, %error, "catalog unavailable, showing placeholder entries");
    Listing::Placeholder {
        reason: format!("failed to load {level}: {error}"),
        entries,
    }
}

fn sample_databases() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new("sample_database", "Sample database for testing"),
        CatalogEntry::new("analytics_db", "Analytics database"),
    ]
}

fn sample_tables() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::new("users", "User data table"),
        CatalogEntry::new("orders", "Order transactions"),
        CatalogEntry::new("products", "Product catalog"),
    ]
}

fn sample_columns() -> Vec<CatalogEntry> {
    vec![
        CatalogEntry::column("id", "bigint", "Primary key"),
        CatalogEntry::column("name", "string", "Name field"),
        CatalogEntry::column("created_at", "timestamp", "Creation timestamp"),
    ]
}
