use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};
use tokio::task::JoinSet;

use crate::AppState;
use crate::humanfmt::HumanFmt;
use crate::stats::GroupUsage;

/// File count and byte total of one group directory. Unreadable entries are
/// logged and excluded.
async fn scan_group_dir(root: &Path) -> GroupUsage {
    let mut usage = GroupUsage::default();
    let mut pending: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut dir = match tokio::fs::read_dir(&current).await {
            Ok(dir) => dir,
            Err(err) => {
                warn!("Failed to list directory `{}`:  {err}", current.display());
                continue;
            }
        };

        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    warn!("Failed to iterate directory `{}`:  {err}", current.display());
                    break;
                }
            };

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("Failed to stat `{}`:  {err}", entry.path().display());
                    continue;
                }
            };

            if metadata.is_dir() {
                pending.push(entry.path());
            } else {
                usage.files += 1;
                usage.size += metadata.len();
            }
        }
    }

    usage
}

/// Recomputes the per-group file statistics with one worker per group
/// directory. Feeds the stats endpoint; the data path never waits on it.
pub(crate) async fn task_cache_scan(state: &AppState) {
    let storage_root = state.config.current().storage_root.clone();

    debug!("Starting file stats scan of `{}`...", storage_root.display());

    let mut root_dir = match tokio::fs::read_dir(&storage_root).await {
        Ok(dir) => dir,
        Err(err) => {
            error!(
                "Failed to list storage directory `{}`:  {err}",
                storage_root.display()
            );
            return;
        }
    };

    let mut workers = JoinSet::new();

    loop {
        let entry = match root_dir.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                error!(
                    "Failed to iterate storage directory `{}`:  {err}",
                    storage_root.display()
                );
                break;
            }
        };

        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
            continue;
        }

        match entry.file_type().await {
            Ok(file_type) if file_type.is_dir() => (),
            _ => continue,
        }

        let group_path = entry.path();
        workers.spawn(async move { (name, scan_group_dir(&group_path).await) });
    }

    let mut groups = BTreeMap::new();
    while let Some(result) = workers.join_next().await {
        match result {
            Ok((name, usage)) => {
                groups.insert(name, usage);
            }
            Err(err) => error!("File stats worker failed:  {err}"),
        }
    }

    state.file_stats.replace(groups);

    let (total_files, total_size, _) = state.file_stats.snapshot();
    debug!(
        "File stats updated: {total_files} files, {}",
        HumanFmt::Size(total_size)
    );
}
