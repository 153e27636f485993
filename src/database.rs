use std::path::Path;
use std::time::Duration;

use log::{LevelFilter, debug, info, trace};
use sqlx::{
    ConnectOptions as _, Error, Executor as _, Pool, Row as _, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

use crate::stats::StatsSnapshot;

const STATS_KEYS: [&str; 4] = [
    "requests_total",
    "cache_hits",
    "cache_misses",
    "bytes_served",
];

#[derive(Clone, Debug)]
pub(crate) struct Database {
    conn: Pool<Sqlite>,
}

#[derive(Clone, Debug)]
pub(crate) struct MirrorRow {
    pub(crate) name: String,
    /// JSON array of base URLs.
    pub(crate) urls: String,
    pub(crate) status: String,
}

impl Database {
    pub(crate) async fn connect(path: &Path) -> Result<Self, Error> {
        info!("Opening database `{}`...", path.display());

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(LevelFilter::Trace);

        let conn = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;

        Ok(Self { conn })
    }

    /// In-memory database for tests. Restricted to a single pooled
    /// connection since every SQLite memory connection is its own database.
    #[cfg(test)]
    pub(crate) async fn connect_in_memory() -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new().in_memory(true);

        let conn = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        Ok(Self { conn })
    }

    pub(crate) async fn init_tables(&self) -> Result<(), Error> {
        trace!("Initializing database tables...");

        self.conn
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS stats (
                    key TEXT PRIMARY KEY,
                    value INTEGER
                );
                ",
            )
            .await?;

        self.conn
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS mirrors (
                    name TEXT PRIMARY KEY,
                    urls TEXT,
                    status TEXT DEFAULT 'approved'
                );
                ",
            )
            .await?;

        self.conn
            .execute(
                r"
                CREATE TABLE IF NOT EXISTS package_blacklist (
                    pattern TEXT PRIMARY KEY,
                    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
                );
                ",
            )
            .await?;

        for key in STATS_KEYS {
            sqlx::query("INSERT OR IGNORE INTO stats (key, value) VALUES (?, 0)")
                .bind(key)
                .execute(&self.conn)
                .await?;
        }

        self.seed_default_mirrors().await
    }

    async fn seed_default_mirrors(&self) -> Result<(), Error> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM mirrors")
            .fetch_one(&self.conn)
            .await?
            .try_get("count")?;

        if count > 0 {
            return Ok(());
        }

        info!("Seeding default mirrors");

        for (name, urls) in default_mirrors() {
            let urls_json =
                serde_json::to_string(&urls).expect("string array serialization cannot fail");

            sqlx::query("INSERT INTO mirrors (name, urls, status) VALUES (?, ?, ?)")
                .bind(name)
                .bind(urls_json)
                .bind("approved")
                .execute(&self.conn)
                .await?;
        }

        Ok(())
    }

    pub(crate) async fn load_stats(&self) -> Result<StatsSnapshot, Error> {
        let rows = sqlx::query("SELECT key, value FROM stats")
            .fetch_all(&self.conn)
            .await?;

        let mut snapshot = StatsSnapshot::default();

        for row in rows {
            let key: String = row.try_get("key")?;
            let value: i64 = row.try_get("value")?;
            let value = u64::try_from(value).unwrap_or(0);

            match key.as_str() {
                "requests_total" => snapshot.requests_total = value,
                "cache_hits" => snapshot.cache_hits = value,
                "cache_misses" => snapshot.cache_misses = value,
                "bytes_served" => snapshot.bytes_served = value,
                other => debug!("Ignoring unknown stats key `{other}`"),
            }
        }

        Ok(snapshot)
    }

    /// Persists all four counters in a single transaction.
    pub(crate) async fn save_stats(&self, snapshot: &StatsSnapshot) -> Result<(), Error> {
        let values = [
            ("requests_total", snapshot.requests_total),
            ("cache_hits", snapshot.cache_hits),
            ("cache_misses", snapshot.cache_misses),
            ("bytes_served", snapshot.bytes_served),
        ];

        let mut tx = self.conn.begin().await?;

        for (key, value) in values {
            sqlx::query("UPDATE stats SET value = ? WHERE key = ?")
                .bind(i64::try_from(value).unwrap_or(i64::MAX))
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await
    }

    pub(crate) async fn get_mirrors(&self) -> Result<Vec<MirrorRow>, Error> {
        let rows = sqlx::query("SELECT name, urls, status FROM mirrors")
            .fetch_all(&self.conn)
            .await?;

        rows.into_iter()
            .map(|row| {
                Ok(MirrorRow {
                    name: row.try_get("name")?,
                    urls: row.try_get("urls")?,
                    status: row.try_get("status")?,
                })
            })
            .collect()
    }

    pub(crate) async fn upsert_mirror(
        &self,
        name: &str,
        urls_json: &str,
        status: &str,
    ) -> Result<(), Error> {
        sqlx::query("INSERT OR REPLACE INTO mirrors (name, urls, status) VALUES (?, ?, ?)")
            .bind(name)
            .bind(urls_json)
            .bind(status)
            .execute(&self.conn)
            .await?;

        Ok(())
    }

    pub(crate) async fn update_mirror_urls(&self, name: &str, urls_json: &str) -> Result<(), Error> {
        sqlx::query("UPDATE mirrors SET urls = ? WHERE name = ?")
            .bind(urls_json)
            .bind(name)
            .execute(&self.conn)
            .await?;

        Ok(())
    }

    pub(crate) async fn update_mirror_status(&self, name: &str, status: &str) -> Result<(), Error> {
        sqlx::query("UPDATE mirrors SET status = ? WHERE name = ?")
            .bind(status)
            .bind(name)
            .execute(&self.conn)
            .await?;

        Ok(())
    }

    pub(crate) async fn delete_mirror(&self, name: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM mirrors WHERE name = ?")
            .bind(name)
            .execute(&self.conn)
            .await?;

        Ok(())
    }

    pub(crate) async fn get_blacklist(&self) -> Result<Vec<String>, Error> {
        let rows = sqlx::query("SELECT pattern FROM package_blacklist")
            .fetch_all(&self.conn)
            .await?;

        rows.into_iter().map(|row| row.try_get("pattern")).collect()
    }

    pub(crate) async fn add_blacklist_pattern(&self, pattern: &str) -> Result<(), Error> {
        sqlx::query("INSERT OR IGNORE INTO package_blacklist (pattern) VALUES (?)")
            .bind(pattern)
            .execute(&self.conn)
            .await?;

        Ok(())
    }

    pub(crate) async fn remove_blacklist_pattern(&self, pattern: &str) -> Result<(), Error> {
        sqlx::query("DELETE FROM package_blacklist WHERE pattern = ?")
            .bind(pattern)
            .execute(&self.conn)
            .await?;

        Ok(())
    }
}

/// Mirror groups seeded on first start, when the `mirrors` table is empty.
#[must_use]
fn default_mirrors() -> Vec<(&'static str, Vec<&'static str>)> {
    vec![
        (
            "debian",
            vec![
                "http://deb.debian.org/debian",
                "http://ftp.de.debian.org/debian",
                "http://cdn-fastly.deb.debian.org/debian",
                "http://ftp.us.debian.org/debian",
            ],
        ),
        (
            "debian-security",
            vec![
                "http://security.debian.org/debian-security",
                "http://deb.debian.org/debian-security",
            ],
        ),
        (
            "ubuntu",
            vec![
                "http://archive.ubuntu.com/ubuntu",
                "http://de.archive.ubuntu.com/ubuntu",
                "http://us.archive.ubuntu.com/ubuntu",
                "http://gb.archive.ubuntu.com/ubuntu",
            ],
        ),
        ("ubuntu-security", vec!["http://security.ubuntu.com/ubuntu"]),
        (
            "fedora",
            vec![
                "http://download.fedoraproject.org/pub/fedora/linux",
                "http://archives.fedoraproject.org/pub/fedora/linux",
            ],
        ),
        (
            "centos",
            vec![
                "http://mirror.centos.org/centos",
                "http://vault.centos.org/centos",
            ],
        ),
        (
            "rocky",
            vec![
                "http://download.rockylinux.org/pub/rocky",
                "http://rockylinux.map.fastly.net/pub/rocky",
            ],
        ),
        ("alma", vec!["http://repo.almalinux.org/almalinux"]),
        (
            "opensuse",
            vec![
                "http://download.opensuse.org/distribution",
                "http://download.opensuse.org/update",
                "http://download.opensuse.org/tumbleweed",
            ],
        ),
        (
            "kali",
            vec!["http://http.kali.org/kali", "http://kali.download/kali"],
        ),
        (
            "archlinux",
            vec![
                "http://mirrors.kernel.org/archlinux",
                "http://mirror.rackspace.com/archlinux",
            ],
        ),
        ("alpine", vec!["http://dl-cdn.alpinelinux.org/alpine"]),
        (
            "raspbian",
            vec![
                "http://archive.raspbian.org/raspbian",
                "http://raspbian.raspberrypi.org/raspbian",
            ],
        ),
        ("docker", vec!["https://download.docker.com/linux"]),
        (
            "postgresql",
            vec!["http://apt.postgresql.org/pub/repos/apt"],
        ),
        ("nodesource", vec!["http://deb.nodesource.com/node"]),
        (
            "jenkins",
            vec![
                "http://pkg.jenkins.io/debian",
                "http://pkg.jenkins.io/debian-stable",
            ],
        ),
        ("proxmox", vec!["http://download.proxmox.com/debian"]),
        (
            "nvidia",
            vec!["https://nvidia.github.io/libnvidia-container/stable/deb/amd64"],
        ),
        ("hrfee", vec!["https://apt.hrfee.dev"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_seeds_stats_and_mirrors() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_tables().await.unwrap();

        let snapshot = db.load_stats().await.unwrap();
        assert_eq!(snapshot, StatsSnapshot::default());

        let mirrors = db.get_mirrors().await.unwrap();
        assert_eq!(mirrors.len(), default_mirrors().len());
        assert!(mirrors.iter().all(|row| row.status == "approved"));

        let debian = mirrors.iter().find(|row| row.name == "debian").unwrap();
        let urls: Vec<String> = serde_json::from_str(&debian.urls).unwrap();
        assert_eq!(urls[0], "http://deb.debian.org/debian");

        /* Seeding only applies to an empty table */
        db.delete_mirror("debian").await.unwrap();
        db.init_tables().await.unwrap();
        assert!(
            db.get_mirrors()
                .await
                .unwrap()
                .iter()
                .all(|row| row.name != "debian")
        );
    }

    #[tokio::test]
    async fn stats_round_trip() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_tables().await.unwrap();

        let snapshot = StatsSnapshot {
            requests_total: 100,
            cache_hits: 60,
            cache_misses: 40,
            bytes_served: 1_234_567,
        };

        db.save_stats(&snapshot).await.unwrap();
        assert_eq!(db.load_stats().await.unwrap(), snapshot);
    }

    #[tokio::test]
    async fn mirror_crud() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_tables().await.unwrap();

        db.upsert_mirror("example", r#"["http://mirror.example.org/pkgs"]"#, "pending")
            .await
            .unwrap();

        let mirrors = db.get_mirrors().await.unwrap();
        let row = mirrors.iter().find(|row| row.name == "example").unwrap();
        assert_eq!(row.status, "pending");

        db.update_mirror_status("example", "approved").await.unwrap();
        db.update_mirror_urls("example", r#"["http://other.example.org/pkgs"]"#)
            .await
            .unwrap();

        let mirrors = db.get_mirrors().await.unwrap();
        let row = mirrors.iter().find(|row| row.name == "example").unwrap();
        assert_eq!(row.status, "approved");
        assert!(row.urls.contains("other.example.org"));

        db.delete_mirror("example").await.unwrap();
        let mirrors = db.get_mirrors().await.unwrap();
        assert!(mirrors.iter().all(|row| row.name != "example"));
    }

    #[tokio::test]
    async fn blacklist_round_trip() {
        let db = Database::connect_in_memory().await.unwrap();
        db.init_tables().await.unwrap();

        assert!(db.get_blacklist().await.unwrap().is_empty());

        db.add_blacklist_pattern("*.iso").await.unwrap();
        db.add_blacklist_pattern("nvidia").await.unwrap();
        db.add_blacklist_pattern("nvidia").await.unwrap();

        let mut patterns = db.get_blacklist().await.unwrap();
        patterns.sort();
        assert_eq!(patterns, ["*.iso", "nvidia"]);

        db.remove_blacklist_pattern("*.iso").await.unwrap();
        assert_eq!(db.get_blacklist().await.unwrap(), ["nvidia"]);
    }
}
