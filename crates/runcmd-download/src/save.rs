use std::path::{Component, Path};

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Returns the last non-empty path segment of `uri`, which names the downloaded file.
pub fn file_name_from_uri(uri: &str) -> Option<String> {
    let parsed = Url::parse(uri).ok()?;
    let segment = parsed
        .path_segments()?
        .filter(|segment| !segment.is_empty())
        .last()?
        .to_string();
    if segment == "." || segment == ".." {
        return None;
    }
    Some(segment)
}

/// Accepts `name` only when it is a single plain path component, so joining it onto a
/// directory always stays inside that directory.
pub fn checked_file_name(name: &str) -> Result<&str> {
    let trimmed = name.trim();
    let mut components = Path::new(trimmed).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !trimmed.contains(['/', '\\']) => Ok(trimmed),
        _ => bail!("invalid file name '{name}': expected a plain file name without directories"),
    }
}

/// Streams the body of a successful response into `destination`, returning the number of
/// bytes written. The file is created with mode `mode` on unix.
pub async fn save_response_to_file(
    mut response: reqwest::Response,
    destination: &Path,
    mode: u32,
) -> Result<u64> {
    if destination.is_dir() {
        bail!("download destination '{}' is a directory", destination.display());
    }
    let mut options = tokio::fs::OpenOptions::new();
    options.create(true).write(true).truncate(true);
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    let mut file = options
        .open(destination)
        .await
        .with_context(|| format!("failed to open {}", destination.display()))?;

    let mut written = 0_u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .with_context(|| format!("failed to read response body for {}", destination.display()))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("failed to write {}", destination.display()))?;
        written = written.saturating_add(chunk.len() as u64);
    }
    file.flush()
        .await
        .with_context(|| format!("failed to flush {}", destination.display()))?;
    Ok(written)
}
