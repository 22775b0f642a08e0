use std::path::{Path, PathBuf};

use quarry_adapters::export::write_csv_export;
use quarry_adapters::mysql::MysqlQueryService;
use quarry_core::catalog::CatalogBackend;
use quarry_core::panel::{PanelEvent, PanelHost, PanelRequest};
use quarry_core::query_service::{CursorClient, QueryService};
use quarry_core::settings::QuerySettings;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const LOG_ENV_VAR: &str = "QUARRY_LOG";

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Reads one JSON request per line and answers with one JSON event per line.
///
/// `CsvReady` events are written to `export_dir` and answered with `exportComplete`.
async fn run_host<S, C, R, W>(
    host: &mut PanelHost<S, C>,
    reader: R,
    writer: &mut W,
    export_dir: &Path,
) -> std::io::Result<()>
where
    S: QueryService,
    C: CatalogBackend,
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let reply = match serde_json::from_str::<PanelRequest>(&line) {
            Ok(request) => {
                debug!(?request, "panel request");
                let event = host.handle(request).await;
                reply_for(event, export_dir)
            }
            Err(error) => {
                warn!(%error, "malformed panel request");
                event_json(&PanelEvent::ShowError {
                    error: format!("malformed request: {error}"),
                })
            }
        };

        writer.write_all(reply.to_string().as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }
    Ok(())
}

fn reply_for(event: PanelEvent, export_dir: &Path) -> Value {
    match event {
        PanelEvent::CsvReady {
            file_stem,
            content,
            total_rows,
            ..
        } => match write_csv_export(export_dir, &file_stem, &content) {
            Ok(path) => json!({
                "command": "exportComplete",
                "path": path.display().to_string(),
                "totalRows": total_rows,
            }),
            Err(error) => event_json(&PanelEvent::ShowError {
                error: error.to_string(),
            }),
        },
        other => event_json(&other),
    }
}

fn event_json(event: &PanelEvent) -> Value {
    serde_json::to_value(event).unwrap_or_else(|error| {
        json!({ "command": "showError", "error": error.to_string() })
    })
}

fn export_dir(settings: &QuerySettings) -> PathBuf {
    settings
        .export_dir
        .clone()
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let settings = QuerySettings::load_default()?;
    let service = MysqlQueryService::from_settings(&settings);
    let client = CursorClient::new(service.clone(), settings.query_target());
    let mut host = PanelHost::new(client, service.clone(), &settings);
    info!(
        database = %settings.database,
        page_size = settings.page_size,
        "panel host ready"
    );

    let mut stdout = tokio::io::stdout();
    run_host(
        &mut host,
        BufReader::new(tokio::io::stdin()),
        &mut stdout,
        &export_dir(&settings),
    )
    .await?;

    service.disconnect().await?;
    Ok(())
}
