use std::fs;
use std::path::{Path, PathBuf};

use quarry_core::sessions::unix_timestamp_millis;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("invalid export file name `{0}`")]
    InvalidFileName(String),
    #[error("failed to create export directory at {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Writes `content` to `<dir>/<file_stem>_<unix millis>.csv` and returns the path.
pub fn write_csv_export(
    dir: &Path,
    file_stem: &str,
    content: &str,
) -> Result<PathBuf, ExportError> {
    let stem = sanitize_file_stem(file_stem)?;
    fs::create_dir_all(dir).map_err(|source| ExportError::CreateDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(format!("{stem}_{}.csv", unix_timestamp_millis()));
    fs::write(&path, content).map_err(|source| ExportError::Write {
        path: path.clone(),
        source,
    })?;
    info!(path = %path.display(), bytes = content.len(), "wrote csv export");
    Ok(path)
}

fn sanitize_file_stem(file_stem: &str) -> Result<String, ExportError> {
    let stem = file_stem
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    let stem = stem.trim_matches('.');
    if stem.is_empty() {
        return Err(ExportError::InvalidFileName(file_stem.to_string()));
    }
    Ok(stem.to_string())
}
