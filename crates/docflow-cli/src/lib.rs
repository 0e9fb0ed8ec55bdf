use anyhow::Context;
use docflow_core::models::SourceFile;
use serde::Serialize;
use std::path::Path;

/// Content type declared for a local file, from its extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "pdf" => "application/pdf",
        "txt" | "text" | "log" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "rtf" => "application/rtf",
        "odt" => "application/vnd.oasis.opendocument.text",
        _ => "application/octet-stream",
    }
}

/// Describe a local file for submission. The file is read later, by a worker.
pub async fn source_file(path: &Path) -> anyhow::Result<SourceFile> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("Cannot read {}", path.display()))?;
    if !metadata.is_file() {
        anyhow::bail!("{} is not a regular file", path.display());
    }
    Ok(SourceFile::from_path(
        path,
        metadata.len(),
        content_type_for(path),
    ))
}

/// One JSON line: `{"type": kind, "data": value}`.
pub fn json_line(kind: &str, value: &impl Serialize) -> anyhow::Result<String> {
    let line = serde_json::to_string(&serde_json::json!({ "type": kind, "data": value }))
        .context("Serialize output line")?;
    Ok(line)
}
