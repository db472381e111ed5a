use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use time::format_description::well_known::Rfc3339;
use url::Url;

pub fn ensure_dir(p: &Path) -> Result<()> {
    std::fs::create_dir_all(p).with_context(|| format!("create_dir_all {}", p.display()))
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// `file://` URL for a local path, made absolute against the current dir.
pub fn file_url(path: &Path) -> Result<String> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .with_context(|| "current_dir")?
            .join(path)
    };
    Url::from_file_path(&abs)
        .map(String::from)
        .map_err(|_| anyhow!("cannot express path as file URL: {}", abs.display()))
}
