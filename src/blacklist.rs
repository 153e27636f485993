use std::sync::{Arc, RwLock};

use log::info;

use crate::database::Database;

/// Filename patterns that are never cached. A pattern containing `*` is a
/// case-insensitive glob where `*` matches any run of characters and `.` is
/// literal; any other pattern is a case-insensitive substring match.
/// Matching is unanchored on both ends.
#[derive(Clone, Debug, Default)]
pub(crate) struct Blacklist {
    patterns: Arc<RwLock<Vec<String>>>,
}

impl Blacklist {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn load_from_db(&self, database: &Database) -> Result<(), sqlx::Error> {
        let loaded = database.get_blacklist().await?;
        let count = loaded.len();

        {
            let mut patterns = self.patterns.write().expect("other users should not panic");
            *patterns = loaded;
        }

        info!("Loaded {count} blacklist patterns");
        Ok(())
    }

    #[must_use]
    pub(crate) fn matches(&self, filename: &str) -> bool {
        let filename = filename.to_lowercase();
        let patterns = self.patterns.read().expect("other users should not panic");

        patterns.iter().any(|pattern| {
            let pattern = pattern.to_lowercase();
            if pattern.contains('*') {
                glob_matches(&pattern, &filename)
            } else {
                filename.contains(&pattern)
            }
        })
    }

    #[must_use]
    pub(crate) fn patterns(&self) -> Vec<String> {
        self.patterns
            .read()
            .expect("other users should not panic")
            .clone()
    }

    pub(crate) fn add(&self, pattern: String) {
        let mut patterns = self.patterns.write().expect("other users should not panic");
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }

    pub(crate) fn remove(&self, pattern: &str) {
        let mut patterns = self.patterns.write().expect("other users should not panic");
        patterns.retain(|p| p != pattern);
    }
}

/// Unanchored glob match: the literal segments between `*`s must occur in
/// the name in order. Both inputs are expected lowercased.
#[must_use]
fn glob_matches(pattern: &str, name: &str) -> bool {
    let mut rest = name;

    for segment in pattern.split('*') {
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blacklist_with(patterns: &[&str]) -> Blacklist {
        let blacklist = Blacklist::new();
        for pattern in patterns {
            blacklist.add((*pattern).to_string());
        }
        blacklist
    }

    #[test]
    fn substring_match_is_case_insensitive() {
        let blacklist = blacklist_with(&["nvidia"]);

        assert!(blacklist.matches("nvidia-driver-550_550.54_amd64.deb"));
        assert!(blacklist.matches("NVIDIA-settings.deb"));
        assert!(!blacklist.matches("mesa-vulkan-drivers.deb"));
    }

    #[test]
    fn glob_match_spans_runs() {
        let blacklist = blacklist_with(&["linux-image-*.deb"]);

        assert!(blacklist.matches("linux-image-6.1.0-18-amd64.deb"));
        assert!(blacklist.matches("LINUX-IMAGE-cloud.DEB"));
        assert!(!blacklist.matches("linux-headers-6.1.0-18-amd64.deb"));
    }

    #[test]
    fn glob_dot_is_literal() {
        let blacklist = blacklist_with(&["*.iso"]);

        assert!(blacklist.matches("debian-12.5.0-amd64-netinst.iso"));
        assert!(!blacklist.matches("isolinux.cfg.deb"));
    }

    #[test]
    fn glob_segments_must_appear_in_order() {
        assert!(glob_matches("foo*bar", "xx-foo-yy-bar-zz"));
        assert!(!glob_matches("foo*bar", "bar-foo"));
        assert!(glob_matches("*", "anything"));
    }

    #[test]
    fn add_and_remove_patterns() {
        let blacklist = blacklist_with(&["a", "b"]);
        blacklist.add("a".to_string());
        assert_eq!(blacklist.patterns(), ["a", "b"]);

        blacklist.remove("a");
        assert_eq!(blacklist.patterns(), ["b"]);
        assert!(!blacklist.matches("a-file.deb"));
    }
}
