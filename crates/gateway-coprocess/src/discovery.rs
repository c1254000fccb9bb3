//! Discovery of loadable units on disk

use std::fs;
use std::path::Path;

/// List the stems of files in `dir` carrying `extension`, sorted.
///
/// A missing or unreadable directory yields an empty list.
pub fn discover_units(dir: &Path, extension: &str) -> Vec<String> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), "No units discovered: {}", e);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(extension))
        .filter_map(|path| path.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .collect();

    names.sort();
    names
}
