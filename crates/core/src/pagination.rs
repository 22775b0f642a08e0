//! Turns the query service's token cursor into numbered pages.
//!
//! The first raw page carries a synthetic header row at index 0, so it is fetched one row
//! larger than the window. Later pages are pure data. Backward navigation replays the token
//! that produced the target page instead of caching page contents.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::debug;

use crate::query_service::{
    ContinuationToken, CursorClient, ExecutionHandle, NavigationError, QueryError, QueryService,
    RawPage, RawRow, MAX_PAGE_SIZE,
};

pub const DEFAULT_PAGE_SIZE: usize = 100;

/// One result row keyed by column name, in schema order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    fields: Vec<(String, String)>,
}

impl Record {
    #[must_use]
    pub fn new(fields: Vec<(String, String)>) -> Self {
        Self { fields }
    }

    #[must_use]
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(_, value)| value.as_str())
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(RecordVisitor)
    }
}

struct RecordVisitor;

impl<'de> Visitor<'de> for RecordVisitor {
    type Value = Record;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a map of column names to values")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut fields = Vec::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((name, value)) = access.next_entry::<String, serde_json::Value>()? {
            let text = match value {
                serde_json::Value::Null => String::new(),
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            fields.push((name, text));
        }
        Ok(Record { fields })
    }
}

/// Tokens consumed to reach the current page. Empty iff the current page is page 1.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageHistory(Vec<ContinuationToken>);

impl PageHistory {
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&ContinuationToken> {
        self.0.last()
    }

    pub fn push(&mut self, token: ContinuationToken) {
        self.0.push(token);
    }

    pub fn pop(&mut self) -> Option<ContinuationToken> {
        self.0.pop()
    }

    #[must_use]
    pub fn tokens(&self) -> &[ContinuationToken] {
        &self.0
    }
}

/// Page count shown to the user; `Estimated` values are provisional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum TotalPages {
    Exact(u64),
    Estimated(u64),
}

impl TotalPages {
    #[must_use]
    pub fn value(self) -> u64 {
        match self {
            Self::Exact(pages) | Self::Estimated(pages) => pages,
        }
    }

    #[must_use]
    pub fn is_exact(self) -> bool {
        matches!(self, Self::Exact(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResult {
    pub records: Vec<Record>,
    pub rows_on_page: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_rows_known: Option<u64>,
    pub has_more: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<ContinuationToken>,
    pub page_number: u64,
    pub page_size: usize,
    pub execution_handle: ExecutionHandle,
    pub history: PageHistory,
    pub can_go_back: bool,
    pub total_pages: TotalPages,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageMaterializer {
    page_size: usize,
    preview: bool,
}

impl Default for PageMaterializer {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl PageMaterializer {
    /// The window is clamped so the header-inclusive first fetch stays within the service cap.
    #[must_use]
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size: page_size.clamp(1, MAX_PAGE_SIZE - 1),
            preview: false,
        }
    }

    /// Materializer for queries capped to one window by construction; never reports more rows.
    #[must_use]
    pub fn preview(page_size: usize) -> Self {
        Self {
            preview: true,
            ..Self::new(page_size)
        }
    }

    #[must_use]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[must_use]
    pub fn is_preview(&self) -> bool {
        self.preview
    }

    pub async fn first_page<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        handle: &ExecutionHandle,
        total_rows: Option<u64>,
    ) -> Result<PageResult, QueryError> {
        let raw = client.fetch_page(handle, None, self.page_size + 1).await?;
        Ok(self.materialize_first_page(handle.clone(), raw, total_rows, 0))
    }

    pub async fn next_page<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        current: &PageResult,
    ) -> Result<PageResult, QueryError> {
        let token = current
            .next_token
            .clone()
            .filter(|_| current.has_more)
            .ok_or(NavigationError::NoNextPage)?;

        let raw = client
            .fetch_page(&current.execution_handle, Some(&token), self.page_size)
            .await?;

        let mut history = current.history.clone();
        history.push(token);
        let page_number = current.page_number + 1;
        debug!(execution = %current.execution_handle, page_number, "advanced to next page");

        Ok(self.assemble(
            current.execution_handle.clone(),
            records_from_rows(&raw.rows, &current.columns),
            current.columns.clone(),
            raw.next_token,
            history,
            page_number,
            current.total_rows_known,
            estimate_floor(current.total_pages),
        ))
    }

    /// Re-fetches the page before `current` by replaying the token that produced it.
    ///
    /// Fails without touching the service when `current` has no history.
    pub async fn previous_page<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        current: &PageResult,
    ) -> Result<PageResult, QueryError> {
        let mut history = current.history.clone();
        if history.pop().is_none() {
            return Err(NavigationError::NoPreviousPage.into());
        }
        let page_number = current.page_number.saturating_sub(1).max(1);
        let floor = estimate_floor(current.total_pages);

        let Some(token) = history.last().cloned() else {
            let raw = client
                .fetch_page(&current.execution_handle, None, self.page_size + 1)
                .await?;
            debug!(execution = %current.execution_handle, "returned to first page");
            return Ok(self.materialize_first_page(
                current.execution_handle.clone(),
                raw,
                current.total_rows_known,
                floor,
            ));
        };

        let raw = client
            .fetch_page(&current.execution_handle, Some(&token), self.page_size)
            .await?;
        debug!(execution = %current.execution_handle, page_number, "returned to previous page");

        Ok(self.assemble(
            current.execution_handle.clone(),
            records_from_rows(&raw.rows, &current.columns),
            current.columns.clone(),
            raw.next_token,
            history,
            page_number,
            current.total_rows_known,
            floor,
        ))
    }

    /// Applies header-row semantics to a raw first page.
    #[must_use]
    pub fn materialize_first_page(
        &self,
        handle: ExecutionHandle,
        raw: RawPage,
        total_rows: Option<u64>,
        estimate_floor: u64,
    ) -> PageResult {
        let mut rows = raw.rows.into_iter();
        let columns = rows
            .next()
            .map(|header| column_names(&header))
            .unwrap_or_default();
        let data = rows.collect::<Vec<_>>();

        self.assemble(
            handle,
            records_from_rows(&data, &columns),
            columns,
            raw.next_token,
            PageHistory::default(),
            1,
            total_rows,
            estimate_floor,
        )
    }

    /// Exact when a positive total is known. Otherwise an estimate that never drops below
    /// `estimate_floor`, so stepping backward keeps the furthest estimate seen.
    #[must_use]
    pub fn total_pages(
        &self,
        total_rows: Option<u64>,
        page_number: u64,
        has_more: bool,
        estimate_floor: u64,
    ) -> TotalPages {
        match total_rows.filter(|total| *total > 0) {
            Some(total) => TotalPages::Exact(total.div_ceil(self.page_size as u64)),
            None => {
                TotalPages::Estimated((page_number + u64::from(has_more)).max(estimate_floor))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        &self,
        handle: ExecutionHandle,
        records: Vec<Record>,
        columns: Vec<String>,
        next_token: Option<ContinuationToken>,
        history: PageHistory,
        page_number: u64,
        total_rows: Option<u64>,
        estimate_floor: u64,
    ) -> PageResult {
        let has_more = !self.preview && next_token.is_some();
        PageResult {
            rows_on_page: records.len(),
            records,
            total_rows_known: total_rows,
            has_more,
            next_token: next_token.filter(|_| has_more),
            page_number,
            page_size: self.page_size,
            execution_handle: handle,
            can_go_back: !history.is_empty(),
            history,
            total_pages: self.total_pages(total_rows, page_number, has_more, estimate_floor),
            columns,
        }
    }
}

fn estimate_floor(total_pages: TotalPages) -> u64 {
    match total_pages {
        TotalPages::Estimated(pages) => pages,
        TotalPages::Exact(_) => 0,
    }
}

fn column_names(header: &RawRow) -> Vec<String> {
    header
        .cells
        .iter()
        .enumerate()
        .map(|(index, cell)| match cell.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => format!("col_{index}"),
        })
        .collect()
}

/// Keys every record by `columns`: missing or null cells become `""`, extra cells are dropped.
#[must_use]
pub fn records_from_rows(rows: &[RawRow], columns: &[String]) -> Vec<Record> {
    rows.iter()
        .map(|row| {
            Record::new(
                columns
                    .iter()
                    .enumerate()
                    .map(|(index, column)| (column.clone(), row.text(index).to_string()))
                    .collect(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{PageMaterializer, Record, TotalPages};
    use crate::query_service::{
        ContinuationToken, ExecutionHandle, NavigationError, QueryError, RawPage, RawRow,
    };
    use crate::testing::{client, ScriptedService};

    const COLUMNS: [&str; 3] = ["id", "name", "city"];

    #[tokio::test]
    async fn first_page_splits_header_and_fetches_one_extra_row() {
        let service = ScriptedService::with_table(&COLUMNS, 25);
        let client = client(&service);
        let handle = client.start("SELECT *").await.expect("start");

        let page = PageMaterializer::new(10)
            .first_page(&client, &handle, None)
            .await
            .expect("first page");

        assert_eq!(service.requested_sizes(), vec![11]);
        assert_eq!(page.columns, vec!["id", "name", "city"]);
        assert_eq!(page.records.len(), 10);
        assert_eq!(page.rows_on_page, 10);
        assert_eq!(page.records[0].get("id"), Some("r0c0"));
        assert_eq!(page.page_number, 1);
        assert!(page.has_more);
        assert!(!page.can_go_back);
        assert!(page.history.is_empty());
        assert_eq!(page.total_pages, TotalPages::Estimated(2));
    }

    #[tokio::test]
    async fn every_page_has_schema_width_records() {
        let service = ScriptedService::with_table(&COLUMNS, 23);
        let client = client(&service);
        let handle = client.start("SELECT *").await.expect("start");
        let materializer = PageMaterializer::new(10);

        let mut page = materializer
            .first_page(&client, &handle, None)
            .await
            .expect("first page");
        let mut sizes = vec![page.rows_on_page];
        while page.has_more {
            page = materializer
                .next_page(&client, &page)
                .await
                .expect("next page");
            assert!(page.records.iter().all(|record| record.len() == 3));
            sizes.push(page.rows_on_page);
        }

        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(page.page_number, 3);
        assert_eq!(page.history.len(), 2);
        assert!(page.next_token.is_none());
        assert_eq!(service.requested_sizes(), vec![11, 10, 10]);
    }

    #[tokio::test]
    async fn forward_then_back_reproduces_the_page() {
        let service = ScriptedService::with_table(&COLUMNS, 45);
        let client = client(&service);
        let handle = client.start("SELECT *").await.expect("start");
        let materializer = PageMaterializer::new(10);

        let first = materializer
            .first_page(&client, &handle, None)
            .await
            .expect("first");
        let second = materializer.next_page(&client, &first).await.expect("second");
        let third = materializer.next_page(&client, &second).await.expect("third");
        assert_eq!(third.history.len(), 2);

        let back_to_second = materializer
            .previous_page(&client, &third)
            .await
            .expect("back to second");
        assert_eq!(back_to_second.records, second.records);
        assert_eq!(back_to_second.page_number, 2);
        assert_eq!(back_to_second.history.len(), 1);
        assert_eq!(
            back_to_second.history.tokens(),
            &third.history.tokens()[..1]
        );
        assert!(back_to_second.can_go_back);

        let back_to_first = materializer
            .previous_page(&client, &back_to_second)
            .await
            .expect("back to first");
        assert_eq!(back_to_first.records, first.records);
        assert_eq!(back_to_first.columns, first.columns);
        assert_eq!(back_to_first.page_number, 1);
        assert!(!back_to_first.can_go_back);
        assert_eq!(service.requested_sizes().last(), Some(&11));
    }

    #[tokio::test]
    async fn previous_on_first_page_is_rejected_without_fetching() {
        let service = ScriptedService::with_table(&COLUMNS, 5);
        let client = client(&service);
        let handle = client.start("SELECT *").await.expect("start");
        let materializer = PageMaterializer::new(10);
        let first = materializer
            .first_page(&client, &handle, None)
            .await
            .expect("first");
        let fetches = service.fetch_calls();

        let error = materializer
            .previous_page(&client, &first)
            .await
            .expect_err("no previous page");

        assert!(matches!(
            error,
            QueryError::Navigation(NavigationError::NoPreviousPage)
        ));
        assert_eq!(service.fetch_calls(), fetches);
    }

    #[tokio::test]
    async fn next_on_last_page_is_rejected() {
        let service = ScriptedService::with_table(&COLUMNS, 5);
        let client = client(&service);
        let handle = client.start("SELECT *").await.expect("start");
        let materializer = PageMaterializer::new(10);
        let only = materializer
            .first_page(&client, &handle, None)
            .await
            .expect("first");

        let error = materializer
            .next_page(&client, &only)
            .await
            .expect_err("no next page");
        assert!(matches!(
            error,
            QueryError::Navigation(NavigationError::NoNextPage)
        ));
    }

    #[tokio::test]
    async fn estimate_grows_forward_and_yields_to_exact_count() {
        let service = ScriptedService::with_table(&COLUMNS, 35);
        let client = client(&service);
        let handle = client.start("SELECT *").await.expect("start");
        let materializer = PageMaterializer::new(10);

        let mut page = materializer
            .first_page(&client, &handle, None)
            .await
            .expect("first");
        let mut estimates = vec![page.total_pages];
        while page.has_more {
            page = materializer.next_page(&client, &page).await.expect("next");
            estimates.push(page.total_pages);
        }
        assert_eq!(
            estimates,
            vec![
                TotalPages::Estimated(2),
                TotalPages::Estimated(3),
                TotalPages::Estimated(4),
                TotalPages::Estimated(4),
            ]
        );

        let back = materializer.previous_page(&client, &page).await.expect("back");
        assert_eq!(back.total_pages, TotalPages::Estimated(4));
        assert!(!back.total_pages.is_exact());

        let exact = materializer
            .first_page(&client, &handle, Some(35))
            .await
            .expect("first with count");
        assert_eq!(exact.total_pages, TotalPages::Exact(4));
        assert_eq!(exact.total_rows_known, Some(35));
    }

    #[tokio::test]
    async fn preview_mode_never_reports_more_rows() {
        let service = ScriptedService::with_table(&COLUMNS, 30);
        let client = client(&service);
        let handle = client.start("SELECT * LIMIT 10").await.expect("start");

        let page = PageMaterializer::preview(10)
            .first_page(&client, &handle, None)
            .await
            .expect("preview");

        assert!(!page.has_more);
        assert!(page.next_token.is_none());
        assert_eq!(page.total_pages, TotalPages::Estimated(1));
    }

    #[test]
    fn empty_result_yields_single_empty_page() {
        let page = PageMaterializer::default().materialize_first_page(
            ExecutionHandle::new("exec-1"),
            RawPage::default(),
            None,
            0,
        );

        assert!(page.records.is_empty());
        assert!(page.columns.is_empty());
        assert!(!page.has_more);
        assert_eq!(page.total_pages.value(), 1);
    }

    #[test]
    fn null_and_missing_cells_render_as_empty_strings() {
        let raw = RawPage {
            rows: vec![
                RawRow::new(vec![Some("a".to_string()), None, Some(" ".to_string())]),
                RawRow::new(vec![None, Some("x".to_string())]),
            ],
            next_token: Some(ContinuationToken::new("t")),
        };

        let page = PageMaterializer::default().materialize_first_page(
            ExecutionHandle::new("exec-1"),
            raw,
            None,
            0,
        );

        assert_eq!(page.columns, vec!["a", "col_1", "col_2"]);
        assert_eq!(
            page.records[0],
            Record::new(vec![
                ("a".to_string(), String::new()),
                ("col_1".to_string(), "x".to_string()),
                ("col_2".to_string(), String::new()),
            ])
        );
    }

    #[test]
    fn page_result_serializes_for_the_panel() {
        let raw = RawPage {
            rows: vec![
                RawRow::from_values(["zeta", "alpha"]),
                RawRow::from_values(["1", "2"]),
            ],
            next_token: None,
        };
        let page = PageMaterializer::new(10).materialize_first_page(
            ExecutionHandle::new("exec-9"),
            raw,
            Some(1),
            0,
        );

        let rendered = serde_json::to_string(&page).expect("serialize page");
        assert!(rendered.contains(r#""records":[{"zeta":"1","alpha":"2"}]"#));
        assert!(rendered.contains(r#""totalPages":{"kind":"exact","value":1}"#));
        assert!(rendered.contains(r#""executionHandle":"exec-9""#));
        assert!(rendered.contains(r#""canGoBack":false"#));
        assert!(!rendered.contains("nextToken"));
    }

    #[test]
    fn record_deserializes_in_document_order() {
        let record: Record =
            serde_json::from_str(r#"{"z":"1","a":null,"m":3}"#).expect("parse record");
        assert_eq!(record.columns().collect::<Vec<_>>(), vec!["z", "a", "m"]);
        assert_eq!(record.values().collect::<Vec<_>>(), vec!["1", "", "3"]);
    }

    #[test]
    fn window_is_clamped_below_service_cap() {
        assert_eq!(PageMaterializer::new(0).page_size(), 1);
        assert_eq!(PageMaterializer::new(5_000).page_size(), 999);
    }
}
