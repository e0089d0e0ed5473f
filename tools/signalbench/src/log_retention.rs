use crate::errors::SignalBenchError;
use std::fs;
use std::path::{Path, PathBuf};

/// Deletes the oldest `.jsonl` run logs in `dir` until the directory's run
/// logs fit in `budget_bytes`. The active log is never deleted.
pub fn enforce_total_budget(
    dir: &Path,
    budget_bytes: u64,
    active: &Path,
) -> Result<Vec<PathBuf>, SignalBenchError> {
    let mut logs = fs::read_dir(dir)
        .map_err(|e| SignalBenchError::Io(e.to_string()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file() && is_run_log(path))
        .filter_map(|path| {
            let meta = fs::metadata(&path).ok()?;
            Some((meta.modified().ok(), meta.len(), path))
        })
        .collect::<Vec<_>>();

    let mut total = logs.iter().map(|(_, len, _)| *len).sum::<u64>();
    if total <= budget_bytes {
        return Ok(Vec::new());
    }

    logs.sort_by(|a, b| a.0.cmp(&b.0));

    let mut deleted = Vec::new();
    for (_, len, path) in logs {
        if total <= budget_bytes {
            break;
        }
        if path == active {
            continue;
        }
        fs::remove_file(&path).map_err(|e| SignalBenchError::Io(e.to_string()))?;
        total = total.saturating_sub(len);
        deleted.push(path);
    }

    Ok(deleted)
}

fn is_run_log(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some("jsonl")
}
