use std::borrow::Cow;

use tracing::{debug, info};

use crate::pagination::Record;
use crate::query_service::{
    CursorClient, ExecutionHandle, QueryError, QueryService, RawRow, MAX_PAGE_SIZE,
};

pub const DEFAULT_DELIMITER: char = ',';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelimitedExport {
    pub content: String,
    pub total_rows: usize,
}

/// Streams a whole result set and renders it as delimited text.
///
/// Every row is buffered before rendering, so memory grows with the result size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkExporter {
    fetch_size: usize,
    delimiter: char,
}

impl Default for BulkExporter {
    fn default() -> Self {
        Self {
            fetch_size: MAX_PAGE_SIZE,
            delimiter: DEFAULT_DELIMITER,
        }
    }
}

impl BulkExporter {
    #[must_use]
    pub fn new(fetch_size: usize, delimiter: char) -> Self {
        Self {
            fetch_size: fetch_size.clamp(1, MAX_PAGE_SIZE),
            delimiter,
        }
    }

    pub async fn export_all<S: QueryService>(
        &self,
        client: &CursorClient<S>,
        handle: &ExecutionHandle,
    ) -> Result<DelimitedExport, QueryError> {
        let mut header = Vec::new();
        let mut rows: Vec<RawRow> = Vec::new();
        let mut token = None;
        let mut first_page = true;

        loop {
            let page = client
                .fetch_page(handle, token.as_ref(), self.fetch_size)
                .await?;
            let mut page_rows = page.rows.into_iter();
            if first_page {
                if let Some(leading) = page_rows.next() {
                    header = (0..leading.len())
                        .map(|index| leading.text(index).to_string())
                        .collect();
                }
                first_page = false;
            }
            rows.extend(page_rows);
            debug!(execution = %handle, rows = rows.len(), "downloaded rows");

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        info!(execution = %handle, rows = rows.len(), "bulk export complete");
        Ok(DelimitedExport {
            content: render_raw_rows(&header, &rows, self.delimiter),
            total_rows: rows.len(),
        })
    }
}

/// Renders positional rows under `header`. Without a header there is nothing to render.
#[must_use]
pub fn render_raw_rows(header: &[String], rows: &[RawRow], delimiter: char) -> String {
    if header.is_empty() {
        return String::new();
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(join_fields(header.iter().map(String::as_str), delimiter));
    for row in rows {
        lines.push(join_fields(
            (0..header.len()).map(|index| row.text(index)),
            delimiter,
        ));
    }
    lines.join("\n")
}

/// Renders records the panel already holds; the header is the first record's key order.
#[must_use]
pub fn render_records(records: &[Record], delimiter: char) -> String {
    let Some(first) = records.first() else {
        return String::new();
    };
    let header = first.columns().collect::<Vec<_>>();

    let mut lines = Vec::with_capacity(records.len() + 1);
    lines.push(join_fields(header.iter().copied(), delimiter));
    for record in records {
        lines.push(join_fields(
            header
                .iter()
                .map(|column| record.get(column).unwrap_or("")),
            delimiter,
        ));
    }
    lines.join("\n")
}

/// Quotes a field, doubling inner quotes, when it holds the delimiter, a quote or a newline.
#[must_use]
pub fn escape_field(field: &str, delimiter: char) -> Cow<'_, str> {
    if field.contains([delimiter, '"', '\n', '\r']) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

fn join_fields<'a>(fields: impl Iterator<Item = &'a str>, delimiter: char) -> String {
    let mut line = String::new();
    for (index, field) in fields.enumerate() {
        if index > 0 {
            line.push(delimiter);
        }
        line.push_str(&escape_field(field, delimiter));
    }
    line
}
