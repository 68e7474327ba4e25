use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use runcmd_core::write_text_atomic;

/// `<extName>.<seq>.status`, or `<seq>.status` for single-configuration extensions.
pub fn status_file_name(ext_name: &str, seq_num: u64) -> String {
    if ext_name.is_empty() {
        format!("{seq_num}.status")
    } else {
        format!("{ext_name}.{seq_num}.status")
    }
}

/// Writes `body` to the status file through a temp file in the same folder, so a reader sees
/// either the previous complete document or the new one.
pub fn report_local(status_folder: &Path, ext_name: &str, seq_num: u64, body: &str) -> Result<PathBuf> {
    let path = status_folder.join(status_file_name(ext_name, seq_num));
    write_text_atomic(&path, body)
        .with_context(|| format!("failed to save handler status to {}", path.display()))?;
    Ok(path)
}
