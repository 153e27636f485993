use std::path::Path;

use anyhow::Context as _;
use log::{debug, info};

use crate::config::Config;

/// Removes `*.tmp` leftovers from a previous crash anywhere below `dir`.
fn remove_stale_temp_files(dir: &Path) -> anyhow::Result<u64> {
    let mut removed = 0;
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)
            .with_context(|| format!("Failed to list directory `{}`", current.display()))?
        {
            let entry_path = entry?.path();

            if entry_path.is_dir() {
                pending.push(entry_path);
            } else if entry_path.extension().is_some_and(|ext| ext == "tmp") {
                debug!("Removing stale file `{}`", entry_path.display());
                std::fs::remove_file(&entry_path).with_context(|| {
                    format!("Failed to remove entry `{}`", entry_path.display())
                })?;
                removed += 1;
            }
        }
    }

    Ok(removed)
}

/// Startup hygiene: create the storage and database directories, verify the
/// filesystem supports modification timestamps (retention depends on them)
/// and clear out interrupted downloads.
pub(crate) fn task_setup(config: &Config) -> anyhow::Result<()> {
    let storage_root = &config.storage_root;

    std::fs::create_dir_all(storage_root)
        .with_context(|| format!("Failed to create directory `{}`", storage_root.display()))?;

    let metadata = std::fs::metadata(storage_root)
        .with_context(|| format!("Failed to inspect directory `{}`", storage_root.display()))?;
    metadata
        .modified()
        .context("No file modification timestamp (mtime) support")?;

    if let Some(database_dir) = config.database_file.parent() {
        std::fs::create_dir_all(database_dir).with_context(|| {
            format!("Failed to create directory `{}`", database_dir.display())
        })?;
    }

    let removed = remove_stale_temp_files(storage_root)
        .context("Failed to clean interrupted downloads")?;
    if removed != 0 {
        info!("Removed {removed} interrupted downloads");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_dir() -> std::path::PathBuf {
        static SEQ: AtomicU32 = AtomicU32::new(0);

        let dir = std::env::temp_dir().join(format!(
            "pkg-cacher-setup-test-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn removes_only_temp_files() {
        let root = scratch_dir();
        let shard = root.join("debian/ab");
        std::fs::create_dir_all(&shard).unwrap();

        std::fs::write(shard.join("abcd_x.deb"), b"data").unwrap();
        std::fs::write(shard.join("abcd_x.deb.meta"), b"4\n").unwrap();
        std::fs::write(shard.join("abcd_y.deb.tmp"), b"partial").unwrap();
        std::fs::write(root.join("stray.tmp"), b"partial").unwrap();

        let removed = remove_stale_temp_files(&root).unwrap();
        assert_eq!(removed, 2);

        assert!(shard.join("abcd_x.deb").exists());
        assert!(shard.join("abcd_x.deb.meta").exists());
        assert!(!shard.join("abcd_y.deb.tmp").exists());
        assert!(!root.join("stray.tmp").exists());
    }
}
