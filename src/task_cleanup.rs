use std::path::{Path, PathBuf};
use std::time::SystemTime;

use log::{debug, info, warn};

use crate::AppState;
use crate::cache::sidecar_path;

/// Deletes every non-directory below `root` whose modification time lies
/// before `cutoff`, together with its length sidecar. Errors on individual
/// entries are logged and skipped so one bad subtree never aborts the
/// sweep. Returns the number of removed files.
pub(crate) async fn sweep_storage(root: &Path, cutoff: SystemTime) -> u64 {
    let mut removed = 0;
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

            let entry_path = entry.path();

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) => {
                    warn!("Failed to stat `{}`:  {err}", entry_path.display());
                    continue;
                }
            };

            if metadata.is_dir() {
                pending.push(entry_path);
                continue;
            }

            let Ok(modified) = metadata.modified() else {
                continue;
            };

            if modified >= cutoff {
                continue;
            }

            match tokio::fs::remove_file(&entry_path).await {
                Ok(()) => {
                    debug!("Removed expired cache file `{}`", entry_path.display());
                    let _ = tokio::fs::remove_file(sidecar_path(&entry_path)).await;
                    removed += 1;
                }
                Err(err) => {
                    warn!("Failed to remove `{}`:  {err}", entry_path.display());
                }
            }
        }
    }

    removed
}

/// Periodic retention sweep. At most one sweep runs at a time; the admin
/// trigger and the hourly tick share the guard.
pub(crate) async fn task_cleanup(state: &AppState) {
    static TASK_ACTIVE: parking_lot::Mutex<bool> = parking_lot::Mutex::new(false);

    {
        let mut active = TASK_ACTIVE.lock();
        if *active {
            info!("Skipping cache cleanup since already in progress");
            return;
        }
        *active = true;
    }

    task_cleanup_impl(state).await;

    {
        let mut active = TASK_ACTIVE.lock();
        assert!(*active);
        *active = false;
    }
}

async fn task_cleanup_impl(state: &AppState) {
    let config = state.config.current();

    if !config.cache_retention_enabled {
        info!("Cache retention disabled, skipping cleanup");
        return;
    }

    info!("Starting cache cleanup...");

    let cutoff = SystemTime::now() - config.retention_window();
    let removed = sweep_storage(&config.storage_root, cutoff).await;

    info!("Cache cleanup complete: removed {removed} files");
}
