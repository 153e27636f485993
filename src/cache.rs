use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use log::warn;
use md5::{Digest as _, Md5};

use crate::config::{SharedConfig, normalize_path};
use crate::error::ProxyCacheError;

/// Last path segment of the request sub-path, embedded in the cache file
/// name for debuggability. Empty or degenerate paths map to `index`.
#[must_use]
pub(crate) fn basename(subpath: &str) -> &str {
    match Path::new(subpath).file_name().and_then(OsStr::to_str) {
        Some(name) if !name.is_empty() => name,
        _ => "index",
    }
}

#[must_use]
pub(crate) fn sidecar_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".meta");
    PathBuf::from(os)
}

#[must_use]
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// On-disk content store. An artifact for group G with sub-path P lives at
/// `<storage_root>/<G>/<digest[0:2]>/<digest>_<basename(P)>` where digest is
/// the MD5 of P. The two-hex-char shard keeps directory fan-out bounded; the
/// digest keeps colliding basenames apart.
#[derive(Clone, Debug)]
pub(crate) struct CacheStore {
    config: SharedConfig,
}

impl CacheStore {
    #[must_use]
    pub(crate) fn new(config: SharedConfig) -> Self {
        Self { config }
    }

    /// Deterministic cache location for (group, sub-path). Pure; does not
    /// touch the filesystem.
    #[must_use]
    pub(crate) fn entry_path(&self, group: &str, subpath: &str) -> PathBuf {
        let digest = format!("{:x}", Md5::digest(subpath.as_bytes()));
        let filename = basename(subpath);

        let mut path = self.config.current().storage_root.clone();
        path.push(group);
        path.push(&digest[..2]);
        path.push(format!("{digest}_{filename}"));
        path
    }

    /// [`Self::entry_path`] plus shard directory creation.
    pub(crate) async fn path_for(
        &self,
        group: &str,
        subpath: &str,
    ) -> Result<PathBuf, std::io::Error> {
        let path = self.entry_path(group, subpath);
        let shard = path.parent().expect("entry path has a shard directory");
        tokio::fs::create_dir_all(shard).await?;
        Ok(path)
    }

    /// Whether a cache entry exists, is length-consistent with its sidecar
    /// and lies within the retention window. This is the single place where
    /// corrupt entries are detected; a size mismatch removes both files, so
    /// a corrupt entry heals into a miss on the next request.
    pub(crate) async fn is_fresh(&self, path: &Path) -> bool {
        let metadata = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(_) => return false,
        };

        let sidecar = sidecar_path(path);
        match tokio::fs::read_to_string(&sidecar).await {
            Ok(content) => {
                if let Some(declared) = parse_sidecar(&content) {
                    if declared != metadata.len() {
                        warn!(
                            "Cache size mismatch for `{}` (declared {declared}, on disk {}); removing corrupt entry",
                            path.display(),
                            metadata.len()
                        );
                        let _ = tokio::fs::remove_file(path).await;
                        let _ = tokio::fs::remove_file(&sidecar).await;
                        return false;
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => (),
            Err(err) => {
                warn!("Failed to read sidecar `{}`:  {err}", sidecar.display());
            }
        }

        let config = self.config.current();
        if !config.cache_retention_enabled {
            return true;
        }

        /* Retention is keyed on fetch time; serving a file does not refresh it. */
        let age = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.elapsed().ok())
            .unwrap_or_default();

        age < config.retention_window()
    }

    /// Removes a cached artifact and its sidecar. Paths resolving outside
    /// the storage root are rejected.
    pub(crate) async fn delete(&self, path: &Path) -> Result<(), ProxyCacheError> {
        let absolute = if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&std::env::current_dir()?.join(path))
        };

        let storage_root = &self.config.current().storage_root;
        if !absolute.starts_with(storage_root) {
            return Err(ProxyCacheError::PathEscape(path.to_path_buf()));
        }

        let _ = tokio::fs::remove_file(sidecar_path(&absolute)).await;
        tokio::fs::remove_file(&absolute).await?;

        Ok(())
    }
}

#[must_use]
fn parse_sidecar(content: &str) -> Option<u64> {
    content
        .split_whitespace()
        .next()
        .and_then(|token| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    use std::sync::atomic::{AtomicU32, Ordering};

    fn scratch_store() -> (CacheStore, PathBuf) {
        static SEQ: AtomicU32 = AtomicU32::new(0);

        let root = std::env::temp_dir().join(format!(
            "pkg-cacher-cache-test-{}-{}",
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&root).unwrap();

        let config = Config {
            storage_root: root.clone(),
            ..Config::default()
        };
        (CacheStore::new(SharedConfig::new(config)), root)
    }

    #[test]
    fn basename_takes_last_segment() {
        assert_eq!(basename("pool/main/x/x.deb"), "x.deb");
        assert_eq!(basename("x.deb"), "x.deb");
        assert_eq!(basename(""), "index");
        assert_eq!(basename("dists/stable/"), "stable");
        assert_eq!(basename(".."), "index");
    }

    #[test]
    fn entry_path_is_deterministic_and_sharded() {
        let (store, root) = scratch_store();

        let first = store.entry_path("debian", "pool/main/x/x.deb");
        let second = store.entry_path("debian", "pool/main/x/x.deb");
        assert_eq!(first, second);

        /* md5("pool/main/x/x.deb") */
        let digest = "9cb44fac878bb733753b9592aad33830";
        assert_eq!(
            first,
            root.join("debian")
                .join(&digest[..2])
                .join(format!("{digest}_x.deb"))
        );
    }

    #[test]
    fn groups_do_not_share_entries() {
        let (store, _root) = scratch_store();

        let debian = store.entry_path("debian", "pool/main/x/x.deb");
        let ubuntu = store.entry_path("ubuntu", "pool/main/x/x.deb");
        assert_ne!(debian, ubuntu);
    }

    #[test]
    fn colliding_basenames_stay_apart() {
        let (store, _root) = scratch_store();

        let first = store.entry_path("debian", "pool/main/a/x.deb");
        let second = store.entry_path("debian", "pool/main/b/x.deb");
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn path_for_creates_shard_directory() {
        let (store, _root) = scratch_store();

        let path = store.path_for("debian", "pool/main/x/x.deb").await.unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_file_is_not_fresh() {
        let (store, root) = scratch_store();
        assert!(!store.is_fresh(&root.join("debian/ab/no-such-file")).await);
    }

    #[tokio::test]
    async fn consistent_sidecar_is_fresh() {
        let (store, _root) = scratch_store();

        let path = store.path_for("debian", "pool/x.deb").await.unwrap();
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        tokio::fs::write(sidecar_path(&path), "10\n").await.unwrap();

        assert!(store.is_fresh(&path).await);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn size_mismatch_removes_both_files() {
        let (store, _root) = scratch_store();

        let path = store.path_for("debian", "pool/x.deb").await.unwrap();
        tokio::fs::write(&path, b"01234").await.unwrap();
        tokio::fs::write(sidecar_path(&path), "10\n").await.unwrap();

        assert!(!store.is_fresh(&path).await);
        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());

        /* Self-healed: the next check sees a plain miss */
        assert!(!store.is_fresh(&path).await);
    }

    #[tokio::test]
    async fn entry_without_sidecar_is_valid() {
        let (store, _root) = scratch_store();

        let path = store.path_for("debian", "pool/x.deb").await.unwrap();
        tokio::fs::write(&path, b"payload").await.unwrap();

        assert!(store.is_fresh(&path).await);
    }

    #[tokio::test]
    async fn retention_expires_old_entries() {
        let (store, root) = scratch_store();

        {
            let config = Config {
                storage_root: root.clone(),
                cache_retention_enabled: true,
                cache_days: 7,
                ..Config::default()
            };
            store.config.replace(config);
        }

        let path = store.path_for("debian", "pool/x.deb").await.unwrap();
        tokio::fs::write(&path, b"payload").await.unwrap();
        assert!(store.is_fresh(&path).await);

        let stale = std::time::SystemTime::now() - std::time::Duration::from_secs(10 * 24 * 60 * 60);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stale).unwrap();
        drop(file);

        assert!(!store.is_fresh(&path).await);
    }

    #[tokio::test]
    async fn retention_disabled_keeps_old_entries() {
        let (store, _root) = scratch_store();

        let path = store.path_for("debian", "pool/x.deb").await.unwrap();
        tokio::fs::write(&path, b"payload").await.unwrap();

        let stale = std::time::SystemTime::now() - std::time::Duration::from_secs(30 * 24 * 60 * 60);
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(stale).unwrap();
        drop(file);

        assert!(store.is_fresh(&path).await);
    }

    #[tokio::test]
    async fn delete_removes_entry_and_sidecar() {
        let (store, _root) = scratch_store();

        let path = store.path_for("debian", "pool/x.deb").await.unwrap();
        tokio::fs::write(&path, b"payload").await.unwrap();
        tokio::fs::write(sidecar_path(&path), "7\n").await.unwrap();

        store.delete(&path).await.unwrap();
        assert!(!path.exists());
        assert!(!sidecar_path(&path).exists());
    }

    #[tokio::test]
    async fn delete_rejects_path_escapes() {
        let (store, root) = scratch_store();

        let outside = root.join("../escape-target");
        let err = store.delete(&outside).await.unwrap_err();
        assert!(matches!(err, ProxyCacheError::PathEscape(_)));
        assert!(err.to_string().contains("outside storage directory"));
    }

    #[test]
    fn sidecar_parsing() {
        assert_eq!(parse_sidecar("1024\n"), Some(1024));
        assert_eq!(parse_sidecar("1024"), Some(1024));
        assert_eq!(parse_sidecar("  42  trailing"), Some(42));
        assert_eq!(parse_sidecar("garbage"), None);
        assert_eq!(parse_sidecar(""), None);
    }
}
