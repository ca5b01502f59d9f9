use std::io;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clouddrived::config::DaemonConfig;
use clouddrived::logging::init_logging;
use clouddrived::sync::UploadInfo;
use clouddrived::sync::cache::remove_cached_files;
use clouddrived::sync::paths::{Layout, UPLOAD_DIR};
use clouddrived::sync::registry::scan_cache_dir;
use clouddrived::sync::upload::read_descriptors;
use time::format_description::well_known::Rfc3339;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Pending,
    CacheSize,
    ClearCache,
    Help,
}

fn parse_cli_mode<I>(args: I) -> anyhow::Result<CliMode>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Help;
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--pending" => mode = CliMode::Pending,
            "--cache-size" => mode = CliMode::CacheSize,
            "--clear-cache" => mode = CliMode::ClearCache,
            "--help" | "-h" => mode = CliMode::Help,
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(mode)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = parse_cli_mode(std::env::args())?;
    if mode == CliMode::Help {
        println!("Usage: clouddrived [--pending | --cache-size | --clear-cache]");
        println!("  --pending       List uploads waiting in the upload queue");
        println!("  --cache-size    Print the size of the download cache");
        println!("  --clear-cache   Delete every file in the download cache");
        return Ok(());
    }

    init_logging("info");
    let config = DaemonConfig::from_env()?;
    let layout = Layout::new(&config.cache_root);
    info!(root = %layout.root().display(), "using cache root");

    match mode {
        CliMode::Pending => {
            for upload in pending_uploads(&layout).await? {
                println!("{}", describe_upload(&upload));
            }
        }
        CliMode::CacheSize => {
            let (files, bytes) = cache_usage(&layout).await?;
            println!("{files} files, {bytes} bytes (limit {})", config.cache_max_bytes);
        }
        CliMode::ClearCache => {
            let removed = clear_cache(&layout).await?;
            println!("removed {removed} files");
        }
        CliMode::Help => {}
    }
    Ok(())
}

/// Uploads of every account under `<root>/Upload`, oldest first.
async fn pending_uploads(layout: &Layout) -> anyhow::Result<Vec<UploadInfo>> {
    let upload_root = layout.root().join(UPLOAD_DIR);
    let mut uploads = Vec::new();
    for dir in subdirectories(&upload_root).await? {
        let found = read_descriptors(&dir)
            .await
            .with_context(|| format!("failed to read uploads in {}", dir.display()))?;
        uploads.extend(found);
    }
    uploads.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    Ok(uploads)
}

async fn subdirectories(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(found),
        Err(err) => return Err(err).with_context(|| format!("failed to list {}", dir.display())),
    };
    while let Some(entry) = read_dir.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

fn describe_upload(upload: &UploadInfo) -> String {
    let created = upload
        .created_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| upload.created_at.to_string());
    let kind = if upload.overwrite { "overwrite" } else { "new" };
    format!(
        "{created}  {kind:<9}  {:>12}  {}  ({})",
        upload.length, upload.path, upload.id
    )
}

async fn cache_usage(layout: &Layout) -> anyhow::Result<(usize, u64)> {
    let dir = layout.cache_dir();
    let entries = match scan_cache_dir(&dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to scan {}", dir.display()));
        }
    };
    let bytes = entries.iter().map(|entry| entry.length).sum();
    Ok((entries.len(), bytes))
}

async fn clear_cache(layout: &Layout) -> anyhow::Result<usize> {
    let dir = layout.cache_dir();
    let removal = match remove_cached_files(&dir).await {
        Ok(removal) => removal,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to scan {}", dir.display()));
        }
    };
    if removal.failed > 0 {
        warn!(failed = removal.failed, "some cached files could not be removed");
    }
    Ok(removal.removed)
}
