use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use hyper::{Method, Request, Uri};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::HttpClient;
use crate::database::Database;
use crate::empty;

const MIRROR_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const UBUNTU_CODENAMES: [&str; 3] = ["noble", "jammy", "focal"];
const DEBIAN_CODENAMES: [&str; 3] = ["bookworm", "bullseye", "buster"];

/// Collapses a per-release path prefix onto the distribution family its
/// mirrors are registered under. Clients address `/ubuntu-noble/...` while
/// the registry keys mirrors by `ubuntu`.
///
/// The package path is not consulted; the parameter is reserved for
/// per-pocket routing.
#[must_use]
pub(crate) fn upstream_key<'a>(distro: &'a str, _pkg_path: &str) -> &'a str {
    if distro.starts_with("ubuntu") || UBUNTU_CODENAMES.iter().any(|name| distro.contains(name)) {
        return "ubuntu";
    }

    if distro.starts_with("debian") || DEBIAN_CODENAMES.iter().any(|name| distro.contains(name)) {
        return "debian";
    }

    distro
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum GroupStatus {
    Approved,
    Pending,
    Blocked,
}

impl GroupStatus {
    #[must_use]
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Pending => "pending",
            Self::Blocked => "blocked",
        }
    }

    /// Unrecognized status values keep a group out of routing without
    /// discarding it.
    #[must_use]
    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "approved" => Self::Approved,
            "blocked" => Self::Blocked,
            _ => Self::Pending,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub(crate) struct MirrorGroup {
    pub(crate) urls: Vec<String>,
    pub(crate) status: GroupStatus,
}

/// In-memory snapshot of the upstream mirror groups. Loaded from the
/// database at startup and on reload; mutated only by admin commands.
/// The data path reads a consistent clone out of the lock.
#[derive(Clone, Debug, Default)]
pub(crate) struct MirrorRegistry {
    inner: Arc<RwLock<HashMap<String, MirrorGroup>>>,
}

impl MirrorRegistry {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn load_from_db(&self, database: &Database) -> Result<(), sqlx::Error> {
        let rows = database.get_mirrors().await?;

        let mut groups = HashMap::with_capacity(rows.len());
        for row in rows {
            let urls: Vec<String> = match serde_json::from_str(&row.urls) {
                Ok(urls) => urls,
                Err(err) => {
                    warn!("Skipping mirror group `{}` with invalid URL list:  {err}", row.name);
                    continue;
                }
            };

            let urls = normalize_urls(urls);
            groups.insert(
                row.name,
                MirrorGroup {
                    urls,
                    status: GroupStatus::parse(&row.status),
                },
            );
        }

        let count = groups.len();
        {
            let mut inner = self.inner.write().expect("other users should not panic");
            *inner = groups;
        }

        info!("Loaded {count} mirror groups from database");
        Ok(())
    }

    /// Base URLs of an approved group; `None` if the group is absent,
    /// pending or blocked.
    #[must_use]
    pub(crate) fn urls_for(&self, name: &str) -> Option<Vec<String>> {
        let inner = self.inner.read().expect("other users should not panic");
        inner
            .get(name)
            .filter(|group| group.status == GroupStatus::Approved)
            .map(|group| group.urls.clone())
    }

    /// All approved groups, for the stats endpoint.
    #[must_use]
    pub(crate) fn approved(&self) -> BTreeMap<String, Vec<String>> {
        let inner = self.inner.read().expect("other users should not panic");
        inner
            .iter()
            .filter(|(_, group)| group.status == GroupStatus::Approved)
            .map(|(name, group)| (name.clone(), group.urls.clone()))
            .collect()
    }

    /// Every group regardless of status, for the admin surface.
    #[must_use]
    pub(crate) fn all(&self) -> BTreeMap<String, MirrorGroup> {
        let inner = self.inner.read().expect("other users should not panic");
        inner
            .iter()
            .map(|(name, group)| (name.clone(), group.clone()))
            .collect()
    }

    pub(crate) fn set(&self, name: String, group: MirrorGroup) {
        let mut inner = self.inner.write().expect("other users should not panic");
        inner.insert(name, group);
    }

    pub(crate) fn remove(&self, name: &str) {
        let mut inner = self.inner.write().expect("other users should not panic");
        inner.remove(name);
    }
}

/// Base URLs carry no trailing slash; package paths are appended with an
/// explicit separator.
#[must_use]
fn normalize_urls(urls: Vec<String>) -> Vec<String> {
    urls.into_iter()
        .map(|url| url.trim_end_matches('/').to_string())
        .collect()
}

/// Validates and stores a new mirror group: the group name must not point
/// back at this proxy, and every base URL must answer a HEAD probe. Returns
/// whether the group was stored.
pub(crate) async fn save_group(
    registry: &MirrorRegistry,
    database: &Database,
    client: &HttpClient,
    name: &str,
    urls: Vec<String>,
    status: GroupStatus,
) -> Result<bool, sqlx::Error> {
    if is_self_host(name).await {
        warn!("Skipping self-referencing mirror group `{name}`");
        return Ok(false);
    }

    let mut valid_urls = Vec::with_capacity(urls.len());
    for url in normalize_urls(urls) {
        if probe_mirror(client, &url).await {
            valid_urls.push(url);
        } else {
            warn!("Dropping unreachable base URL `{url}` for group `{name}`");
        }
    }

    if valid_urls.is_empty() {
        warn!("No reachable base URLs for group `{name}`, not storing");
        return Ok(false);
    }

    let urls_json =
        serde_json::to_string(&valid_urls).expect("string array serialization cannot fail");
    database
        .upsert_mirror(name, &urls_json, status.as_str())
        .await?;

    registry.set(
        name.to_string(),
        MirrorGroup {
            urls: valid_urls,
            status,
        },
    );

    info!("Saved mirror group `{name}` (status: {})", status.as_str());
    Ok(true)
}

/// Whether the host names this proxy itself, either literally or by
/// resolving to one of the local interface addresses.
pub(crate) async fn is_self_host(host: &str) -> bool {
    let hostname = host.split(':').next().unwrap_or(host);

    if matches!(hostname, "localhost" | "127.0.0.1" | "::1" | "0.0.0.0") {
        return true;
    }

    let Ok(resolved) = tokio::net::lookup_host((hostname, 0u16)).await else {
        return false;
    };

    let local = local_addresses();
    resolved.into_iter().any(|addr| local.contains(&addr.ip()))
}

#[must_use]
fn local_addresses() -> Vec<IpAddr> {
    let mut addresses = Vec::new();

    let Ok(interfaces) = nix::ifaddrs::getifaddrs() else {
        return addresses;
    };

    for interface in interfaces {
        let Some(storage) = interface.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            addresses.push(IpAddr::V4(sin.ip()));
        } else if let Some(sin6) = storage.as_sockaddr_in6() {
            addresses.push(IpAddr::V6(sin6.ip()));
        }
    }

    addresses
}

async fn probe_mirror(client: &HttpClient, url: &str) -> bool {
    let Ok(uri) = url.parse::<Uri>() else {
        return false;
    };

    let request = Request::builder()
        .method(Method::HEAD)
        .uri(uri)
        .body(empty())
        .expect("request is valid");

    match tokio::time::timeout(MIRROR_PROBE_TIMEOUT, client.request(request)).await {
        Ok(Ok(response)) => response.status().as_u16() < 400,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_ubuntu_and_debian_families() {
        assert_eq!(upstream_key("ubuntu", ""), "ubuntu");
        assert_eq!(upstream_key("ubuntu-security", ""), "ubuntu");
        assert_eq!(upstream_key("ubuntu-noble", ""), "ubuntu");
        assert_eq!(upstream_key("mirror-jammy", ""), "ubuntu");
        assert_eq!(upstream_key("focal-updates", ""), "ubuntu");

        assert_eq!(upstream_key("debian", ""), "debian");
        assert_eq!(upstream_key("debian-security", ""), "debian");
        assert_eq!(upstream_key("bookworm-backports", ""), "debian");
        assert_eq!(upstream_key("oldstable-bullseye", ""), "debian");
        assert_eq!(upstream_key("buster", ""), "debian");

        assert_eq!(upstream_key("fedora", ""), "fedora");
        assert_eq!(upstream_key("archlinux", ""), "archlinux");
    }

    #[test]
    fn routing_never_chains() {
        for distro in [
            "ubuntu-noble",
            "debian-bookworm",
            "fedora",
            "rocky",
            "jammy",
            "buster",
        ] {
            let key = upstream_key(distro, "pool/main/x/x.deb");
            assert_eq!(upstream_key(key, "pool/main/x/x.deb"), key);
        }
    }

    #[test]
    fn router_ignores_package_path() {
        assert_eq!(upstream_key("fedora", "releases/noble/x.rpm"), "fedora");
    }

    #[test]
    fn status_parsing() {
        assert_eq!(GroupStatus::parse("approved"), GroupStatus::Approved);
        assert_eq!(GroupStatus::parse("pending"), GroupStatus::Pending);
        assert_eq!(GroupStatus::parse("blocked"), GroupStatus::Blocked);
        assert_eq!(GroupStatus::parse("garbage"), GroupStatus::Pending);
    }

    #[test]
    fn only_approved_groups_route() {
        let registry = MirrorRegistry::new();
        registry.set(
            "debian".to_string(),
            MirrorGroup {
                urls: vec!["http://deb.debian.org/debian".to_string()],
                status: GroupStatus::Approved,
            },
        );
        registry.set(
            "shady".to_string(),
            MirrorGroup {
                urls: vec!["http://shady.example.org".to_string()],
                status: GroupStatus::Blocked,
            },
        );

        assert!(registry.urls_for("debian").is_some());
        assert!(registry.urls_for("shady").is_none());
        assert!(registry.urls_for("missing").is_none());

        let approved = registry.approved();
        assert_eq!(approved.len(), 1);
        assert!(approved.contains_key("debian"));

        assert_eq!(registry.all().len(), 2);

        registry.remove("shady");
        assert_eq!(registry.all().len(), 1);
    }

    #[test]
    fn urls_are_normalized_without_trailing_slash() {
        let urls = normalize_urls(vec![
            "http://deb.debian.org/debian/".to_string(),
            "http://ftp.de.debian.org/debian".to_string(),
        ]);
        assert_eq!(
            urls,
            [
                "http://deb.debian.org/debian",
                "http://ftp.de.debian.org/debian"
            ]
        );
    }

    #[tokio::test]
    async fn loopback_names_are_self() {
        assert!(is_self_host("localhost").await);
        assert!(is_self_host("127.0.0.1:8080").await);
        assert!(is_self_host("0.0.0.0").await);
    }
}
