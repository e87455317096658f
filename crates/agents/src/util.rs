//! Small filesystem helpers shared by the stages.

use std::fs;
use std::path::Path;
use tracing::warn;

/// Copy a directory tree. `skip_git` leaves `.git` behind (the sanitized
/// copy must carry no history). Individual file copy failures are logged
/// and skipped.
pub(crate) fn copy_tree(source: &Path, dest: &Path, skip_git: bool) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in walkdir::WalkDir::new(source)
        .into_iter()
        .filter_entry(|e| !(skip_git && e.file_name() == ".git"))
        .filter_map(Result::ok)
    {
        let rel = entry
            .path()
            .strip_prefix(source)
            .expect("walkdir yields children of source");
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if let Err(e) = fs::copy(entry.path(), &target) {
                warn!(file = %rel.display(), "Failed to copy file: {e}");
            }
        }
    }
    Ok(())
}
