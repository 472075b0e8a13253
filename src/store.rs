//! Durable cluster state
//!
//! Clusters are stored as one row per cluster: the full record as a JSON
//! document alongside indexed columns for the fields queries filter on.
//! Soft-deleted rows stay in the table but are invisible to every query;
//! updates match on project and uuid so a caller can never touch another
//! project's cluster.

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

#[cfg(test)]
use mockall::automock;

use crate::model::Cluster;
use crate::{Error, Result};

/// Persistence seam for cluster records
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Persist a new cluster record
    async fn insert(&self, cluster: &Cluster) -> Result<()>;

    /// All live clusters in a project, creation order
    async fn find_all(&self, project_id: &str) -> Result<Vec<Cluster>>;

    /// One live cluster by project and id
    async fn find_one(&self, project_id: &str, uuid: Uuid) -> Result<Cluster>;

    /// Replace the stored record for a live cluster.
    ///
    /// Matches on project and uuid; updating a missing or soft-deleted
    /// cluster is [`Error::NotFound`].
    async fn update(&self, cluster: &Cluster) -> Result<()>;
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clusters (
    uuid        TEXT PRIMARY KEY,
    project_id  TEXT NOT NULL,
    status      TEXT NOT NULL,
    deleted     INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    data        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_clusters_project ON clusters (project_id, deleted);
"#;

/// SQLite-backed [`ClusterStore`]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply the schema
    pub async fn new(url: &str) -> Result<Self> {
        let options: SqliteConnectOptions = url
            .parse::<SqliteConnectOptions>()
            .map_err(|e| Error::store(format!("invalid database url: {e}")))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        info!(url, "cluster store ready");
        Ok(Self { pool })
    }

    /// Wrap an existing pool; the schema must already be applied
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn decode(data: &str) -> Result<Cluster> {
        serde_json::from_str(data).map_err(|e| Error::store(format!("corrupt cluster record: {e}")))
    }

    fn encode(cluster: &Cluster) -> Result<String> {
        serde_json::to_string(cluster)
            .map_err(|e| Error::store(format!("encoding cluster record: {e}")))
    }
}

#[async_trait]
impl ClusterStore for SqliteStore {
    async fn insert(&self, cluster: &Cluster) -> Result<()> {
        let data = Self::encode(cluster)?;
        sqlx::query(
            "INSERT INTO clusters (uuid, project_id, status, deleted, created_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(cluster.uuid.to_string())
        .bind(&cluster.project_id)
        .bind(cluster.status.to_string())
        .bind(cluster.deleted)
        .bind(cluster.created_at.to_rfc3339())
        .bind(data)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_all(&self, project_id: &str) -> Result<Vec<Cluster>> {
        let rows = sqlx::query(
            "SELECT data FROM clusters
             WHERE project_id = ?1 AND deleted = 0
             ORDER BY created_at",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| Self::decode(row.get::<&str, _>("data")))
            .collect()
    }

    async fn find_one(&self, project_id: &str, uuid: Uuid) -> Result<Cluster> {
        let row = sqlx::query(
            "SELECT data FROM clusters
             WHERE project_id = ?1 AND uuid = ?2 AND deleted = 0",
        )
        .bind(project_id)
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("cluster {uuid}")))?;

        Self::decode(row.get::<&str, _>("data"))
    }

    async fn update(&self, cluster: &Cluster) -> Result<()> {
        let data = Self::encode(cluster)?;
        let result = sqlx::query(
            "UPDATE clusters SET status = ?1, deleted = ?2, data = ?3
             WHERE project_id = ?4 AND uuid = ?5 AND deleted = 0",
        )
        .bind(cluster.status.to_string())
        .bind(cluster.deleted)
        .bind(data)
        .bind(&cluster.project_id)
        .bind(cluster.uuid.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("cluster {}", cluster.uuid)));
        }
        Ok(())
    }
}

/// In-memory [`ClusterStore`] for tests and demos
#[derive(Default)]
pub struct MemoryStore {
    clusters: DashMap<Uuid, Cluster>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn insert(&self, cluster: &Cluster) -> Result<()> {
        self.clusters.insert(cluster.uuid, cluster.clone());
        Ok(())
    }

    async fn find_all(&self, project_id: &str) -> Result<Vec<Cluster>> {
        let mut clusters: Vec<Cluster> = self
            .clusters
            .iter()
            .filter(|entry| entry.project_id == project_id && !entry.deleted)
            .map(|entry| entry.value().clone())
            .collect();
        clusters.sort_by_key(|c| c.created_at);
        Ok(clusters)
    }

    async fn find_one(&self, project_id: &str, uuid: Uuid) -> Result<Cluster> {
        self.clusters
            .get(&uuid)
            .filter(|c| c.project_id == project_id && !c.deleted)
            .map(|c| c.value().clone())
            .ok_or_else(|| Error::not_found(format!("cluster {uuid}")))
    }

    async fn update(&self, cluster: &Cluster) -> Result<()> {
        match self.clusters.get_mut(&cluster.uuid) {
            Some(mut existing)
                if existing.project_id == cluster.project_id && !existing.deleted =>
            {
                *existing = cluster.clone();
                Ok(())
            }
            _ => Err(Error::not_found(format!("cluster {}", cluster.uuid))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClusterRequest, ClusterStatus};

    fn cluster(name: &str, project: &str) -> Cluster {
        ClusterRequest {
            name: name.to_string(),
            masters: Some(3),
            workers: 2,
            external_etcd: false,
            etcd: 0,
        }
        .into_cluster(project, "alice")
    }

    async fn sqlite() -> SqliteStore {
        SqliteStore::new("sqlite::memory:").await.expect("store")
    }

    #[tokio::test]
    async fn round_trips_a_full_record() {
        let store = sqlite().await;
        let mut c = cluster("demo", "proj");
        c.status = ClusterStatus::Active;
        store.insert(&c).await.unwrap();

        let found = store.find_one("proj", c.uuid).await.unwrap();
        assert_eq!(found.name, "demo");
        assert_eq!(found.status, ClusterStatus::Active);
        assert_eq!(found.masters, 3);
    }

    #[tokio::test]
    async fn queries_are_scoped_to_the_project() {
        let store = sqlite().await;
        let mine = cluster("mine", "proj-a");
        let theirs = cluster("theirs", "proj-b");
        store.insert(&mine).await.unwrap();
        store.insert(&theirs).await.unwrap();

        let listed = store.find_all("proj-a").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "mine");

        // Knowing another project's uuid is not enough
        let err = store.find_one("proj-a", theirs.uuid).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn soft_deleted_clusters_disappear_from_queries() {
        let store = sqlite().await;
        let mut c = cluster("demo", "proj");
        store.insert(&c).await.unwrap();

        c.status = ClusterStatus::Deleted;
        c.deleted = true;
        store.update(&c).await.unwrap();

        assert!(store.find_all("proj").await.unwrap().is_empty());
        assert!(matches!(
            store.find_one("proj", c.uuid).await.unwrap_err(),
            Error::NotFound(_)
        ));
        // And the tombstone cannot be updated again
        assert!(matches!(
            store.update(&c).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn updating_a_missing_cluster_is_not_found() {
        let store = sqlite().await;
        let c = cluster("ghost", "proj");
        let err = store.update(&c).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn find_all_returns_creation_order() {
        let store = sqlite().await;
        let mut first = cluster("first", "proj");
        first.created_at = chrono::Utc::now() - chrono::Duration::minutes(5);
        let second = cluster("second", "proj");
        store.insert(&second).await.unwrap();
        store.insert(&first).await.unwrap();

        let names: Vec<_> = store
            .find_all("proj")
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn memory_store_matches_sqlite_semantics() {
        let store = MemoryStore::new();
        let mut c = cluster("demo", "proj");
        store.insert(&c).await.unwrap();

        assert_eq!(store.find_all("proj").await.unwrap().len(), 1);
        assert!(store.find_all("other").await.unwrap().is_empty());

        c.deleted = true;
        store.update(&c).await.unwrap();
        assert!(store.find_all("proj").await.unwrap().is_empty());
        assert!(matches!(
            store.update(&c).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }
}
