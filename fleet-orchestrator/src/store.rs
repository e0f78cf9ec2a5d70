use anyhow::{Context, Result};
use async_trait::async_trait;
use fleet_common::{Instance, InstanceFilter, InstancePatch, InstanceStatus, KeyPair, Page};
use sqlx::{Pool, Postgres, QueryBuilder};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// System-of-record operations the engine relies on.
///
/// `InstanceFilter::cluster_names` empty means "any cluster"; with no
/// `statuses`, soft-deleted rows are left out.
#[async_trait]
pub trait FleetStore: Send + Sync {
    /// Insert rows; ids already present are left untouched.
    async fn persist_instances(&self, rows: &[Instance]) -> Result<()>;

    /// Apply `patch` to rows that are not deleted yet. Returns rows changed.
    async fn soft_delete_instances(&self, ids: &[String], patch: &InstancePatch) -> Result<u64>;

    async fn query_instances(
        &self,
        filter: &InstanceFilter,
        page: Page,
    ) -> Result<(Vec<Instance>, i64)>;

    async fn enabled_cluster_names(
        &self,
        account_keys: &[String],
        provider: Option<&str>,
        cluster_name: Option<&str>,
    ) -> Result<Vec<String>>;

    /// `Ok(None)` when no live key pair has that id.
    async fn get_key_pair(&self, key_id: i64) -> Result<Option<KeyPair>>;
}

// --- Postgres ---

pub struct PgFleetStore {
    db: Pool<Postgres>,
}

impl PgFleetStore {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }
}

const INSTANCE_COLUMNS: &str = "instance_id, cluster_name, provider, task_id, ip_inner, ip_outer, \
     eip_id, status, created_at, updated_at, deleted_at";

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &InstanceFilter) {
    qb.push(" WHERE 1=1");
    if !filter.cluster_names.is_empty() {
        qb.push(" AND cluster_name = ANY(")
            .push_bind(filter.cluster_names.clone())
            .push(")");
    }
    if filter.statuses.is_empty() {
        qb.push(" AND deleted_at IS NULL");
    } else {
        let statuses: Vec<String> = filter.statuses.iter().map(|s| s.as_str().to_string()).collect();
        qb.push(" AND status::text = ANY(").push_bind(statuses).push(")");
    }
    if let Some(id) = filter.instance_id.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND instance_id = ").push_bind(id.to_string());
    }
    if let Some(ip) = filter.ip.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND (ip_inner = ")
            .push_bind(ip.to_string())
            .push(" OR ip_outer = ")
            .push_bind(ip.to_string())
            .push(")");
    }
}

#[async_trait]
impl FleetStore for PgFleetStore {
    async fn persist_instances(&self, rows: &[Instance]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO instances
                  (instance_id, cluster_name, provider, task_id, ip_inner, ip_outer, eip_id,
                   status, created_at, updated_at, deleted_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (instance_id) DO NOTHING
                "#,
            )
            .bind(&row.instance_id)
            .bind(&row.cluster_name)
            .bind(&row.provider)
            .bind(row.task_id)
            .bind(&row.ip_inner)
            .bind(&row.ip_outer)
            .bind(&row.eip_id)
            .bind(row.status)
            .bind(row.created_at)
            .bind(row.updated_at)
            .bind(row.deleted_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("insert instance {}", row.instance_id))?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn soft_delete_instances(&self, ids: &[String], patch: &InstancePatch) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let res = sqlx::query(
            r#"
            UPDATE instances
            SET status = $1, updated_at = $2, deleted_at = $3
            WHERE instance_id = ANY($4)
              AND deleted_at IS NULL
            "#,
        )
        .bind(patch.status)
        .bind(patch.updated_at)
        .bind(patch.deleted_at)
        .bind(ids.to_vec())
        .execute(&self.db)
        .await
        .context("soft delete instances")?;
        Ok(res.rows_affected())
    }

    async fn query_instances(
        &self,
        filter: &InstanceFilter,
        page: Page,
    ) -> Result<(Vec<Instance>, i64)> {
        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM instances");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.db).await?;

        let mut select = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM instances", INSTANCE_COLUMNS));
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY created_at DESC, instance_id LIMIT ")
            .push_bind(page.size as i64)
            .push(" OFFSET ")
            .push_bind(page.offset() as i64);
        let rows = select
            .build_query_as::<Instance>()
            .fetch_all(&self.db)
            .await
            .context("query instances")?;
        Ok((rows, total))
    }

    async fn enabled_cluster_names(
        &self,
        account_keys: &[String],
        provider: Option<&str>,
        cluster_name: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT name FROM clusters WHERE enabled = TRUE AND deleted_at IS NULL AND account_key = ANY(",
        );
        qb.push_bind(account_keys.to_vec()).push(")");
        if let Some(p) = provider.filter(|s| !s.is_empty()) {
            qb.push(" AND provider = ").push_bind(p.to_string());
        }
        if let Some(n) = cluster_name.filter(|s| !s.is_empty()) {
            qb.push(" AND name = ").push_bind(n.to_string());
        }
        qb.push(" ORDER BY name");
        let names: Vec<String> = qb.build_query_scalar().fetch_all(&self.db).await?;
        Ok(names)
    }

    async fn get_key_pair(&self, key_id: i64) -> Result<Option<KeyPair>> {
        let key_pair = sqlx::query_as::<_, KeyPair>(
            r#"
            SELECT id, provider, region_id, key_pair_name, key_pair_id, public_key, private_key, key_type
            FROM key_pairs
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.db)
        .await
        .with_context(|| format!("failed to load key pair {}", key_id))?;
        Ok(key_pair)
    }
}

// --- In-memory ---

#[derive(Debug, Clone)]
struct ClusterRow {
    name: String,
    account_key: String,
    provider: String,
    enabled: bool,
}

#[derive(Default)]
struct MemoryState {
    instances: Vec<Instance>,
    clusters: Vec<ClusterRow>,
    key_pairs: HashMap<i64, KeyPair>,
    soft_delete_failures: usize,
    soft_delete_calls: usize,
    key_pair_failures: usize,
}

/// Store kept in process memory. Used by tests and local runs without
/// Postgres.
#[derive(Default)]
pub struct MemoryFleetStore {
    state: Mutex<MemoryState>,
}

impl MemoryFleetStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_cluster(&self, name: &str, account_key: &str, provider: &str, enabled: bool) {
        self.lock().clusters.push(ClusterRow {
            name: name.to_string(),
            account_key: account_key.to_string(),
            provider: provider.to_string(),
            enabled,
        });
    }

    pub fn add_key_pair(&self, key_pair: KeyPair) {
        self.lock().key_pairs.insert(key_pair.id, key_pair);
    }

    pub fn instance(&self, id: &str) -> Option<Instance> {
        self.lock().instances.iter().find(|i| i.instance_id == id).cloned()
    }

    pub fn snapshot(&self) -> Vec<Instance> {
        self.lock().instances.clone()
    }

    /// The next `n` soft deletes fail.
    pub fn fail_soft_deletes(&self, n: usize) {
        self.lock().soft_delete_failures = n;
    }

    /// The next `n` key pair lookups fail as if the database were gone.
    pub fn fail_key_pair_lookups(&self, n: usize) {
        self.lock().key_pair_failures = n;
    }

    pub fn soft_delete_calls(&self) -> usize {
        self.lock().soft_delete_calls
    }
}

fn matches(row: &Instance, filter: &InstanceFilter) -> bool {
    if !filter.cluster_names.is_empty() && !filter.cluster_names.contains(&row.cluster_name) {
        return false;
    }
    if filter.statuses.is_empty() {
        if row.deleted_at.is_some() {
            return false;
        }
    } else if !filter.statuses.contains(&row.status) {
        return false;
    }
    if let Some(id) = filter.instance_id.as_deref().filter(|s| !s.is_empty()) {
        if row.instance_id != id {
            return false;
        }
    }
    if let Some(ip) = filter.ip.as_deref().filter(|s| !s.is_empty()) {
        if row.ip_inner.as_deref() != Some(ip) && row.ip_outer.as_deref() != Some(ip) {
            return false;
        }
    }
    true
}

#[async_trait]
impl FleetStore for MemoryFleetStore {
    async fn persist_instances(&self, rows: &[Instance]) -> Result<()> {
        let mut state = self.lock();
        for row in rows {
            if !state.instances.iter().any(|i| i.instance_id == row.instance_id) {
                state.instances.push(row.clone());
            }
        }
        Ok(())
    }

    async fn soft_delete_instances(&self, ids: &[String], patch: &InstancePatch) -> Result<u64> {
        let mut state = self.lock();
        state.soft_delete_calls += 1;
        if state.soft_delete_failures > 0 {
            state.soft_delete_failures -= 1;
            anyhow::bail!("connection reset by peer");
        }
        let mut changed = 0;
        for row in state
            .instances
            .iter_mut()
            .filter(|i| i.deleted_at.is_none() && ids.contains(&i.instance_id))
        {
            row.status = patch.status;
            row.updated_at = Some(patch.updated_at);
            row.deleted_at = patch.deleted_at;
            changed += 1;
        }
        Ok(changed)
    }

    async fn query_instances(
        &self,
        filter: &InstanceFilter,
        page: Page,
    ) -> Result<(Vec<Instance>, i64)> {
        let state = self.lock();
        let mut hits: Vec<&Instance> = state.instances.iter().filter(|r| matches(r, filter)).collect();
        hits.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        let total = hits.len() as i64;
        let rows = hits
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.size as usize)
            .cloned()
            .collect();
        Ok((rows, total))
    }

    async fn enabled_cluster_names(
        &self,
        account_keys: &[String],
        provider: Option<&str>,
        cluster_name: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .lock()
            .clusters
            .iter()
            .filter(|c| c.enabled && account_keys.contains(&c.account_key))
            .filter(|c| provider.map_or(true, |p| p.is_empty() || c.provider == p))
            .filter(|c| cluster_name.map_or(true, |n| n.is_empty() || c.name == n))
            .map(|c| c.name.clone())
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn get_key_pair(&self, key_id: i64) -> Result<Option<KeyPair>> {
        let mut state = self.lock();
        if state.key_pair_failures > 0 {
            state.key_pair_failures -= 1;
            anyhow::bail!("key pair {} lookup failed: connection reset", key_id);
        }
        Ok(state.key_pairs.get(&key_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn row(id: &str, cluster: &str, minutes_ago: i64) -> Instance {
        Instance {
            instance_id: id.into(),
            cluster_name: cluster.into(),
            provider: "Mock".into(),
            task_id: Some(1),
            ip_inner: Some(format!("10.0.0.{}", minutes_ago)),
            ip_outer: None,
            eip_id: None,
            status: InstanceStatus::Running,
            created_at: Utc::now() - Duration::minutes(minutes_ago),
            updated_at: None,
            deleted_at: None,
        }
    }

    #[tokio::test]
    async fn soft_delete_touches_live_rows_once() {
        let store = MemoryFleetStore::new();
        store
            .persist_instances(&[row("a", "web", 1), row("b", "web", 2)])
            .await
            .unwrap();
        let patch = InstancePatch::deleted(Utc::now());
        let ids = vec!["a".to_string(), "zz".to_string()];
        assert_eq!(store.soft_delete_instances(&ids, &patch).await.unwrap(), 1);
        assert_eq!(store.soft_delete_instances(&ids, &patch).await.unwrap(), 0);
        let a = store.instance("a").unwrap();
        assert_eq!(a.status, InstanceStatus::Deleted);
        assert!(a.is_deleted());
    }

    #[tokio::test]
    async fn query_filters_and_pages_newest_first() {
        let store = MemoryFleetStore::new();
        store
            .persist_instances(&[row("a", "web", 3), row("b", "web", 1), row("c", "db", 2)])
            .await
            .unwrap();
        // duplicate ids are ignored
        store.persist_instances(&[row("a", "db", 9)]).await.unwrap();

        let filter = InstanceFilter {
            cluster_names: vec!["web".into()],
            ..Default::default()
        };
        let (rows, total) = store.query_instances(&filter, Page::new(1, 1)).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows[0].instance_id, "b");
        let (rows, _) = store.query_instances(&filter, Page::new(2, 1)).await.unwrap();
        assert_eq!(rows[0].instance_id, "a");

        let by_ip = InstanceFilter {
            ip: Some("10.0.0.2".into()),
            ..Default::default()
        };
        let (rows, total) = store.query_instances(&by_ip, Page::default()).await.unwrap();
        assert_eq!((rows[0].instance_id.as_str(), total), ("c", 1));
    }

    #[tokio::test]
    async fn deleted_rows_need_an_explicit_status() {
        let store = MemoryFleetStore::new();
        store.persist_instances(&[row("a", "web", 1)]).await.unwrap();
        store
            .soft_delete_instances(&["a".into()], &InstancePatch::deleted(Utc::now()))
            .await
            .unwrap();
        let (_, total) = store
            .query_instances(&InstanceFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(total, 0);
        let deleted = InstanceFilter {
            statuses: vec![InstanceStatus::Deleted],
            ..Default::default()
        };
        let (_, total) = store.query_instances(&deleted, Page::default()).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn enabled_cluster_names_by_account_and_provider() {
        let store = MemoryFleetStore::new();
        store.add_cluster("web", "ak-1", "AlibabaCloud", true);
        store.add_cluster("db", "ak-1", "TencentCloud", true);
        store.add_cluster("old", "ak-1", "AlibabaCloud", false);
        store.add_cluster("other", "ak-2", "AlibabaCloud", true);

        let keys = vec!["ak-1".to_string()];
        assert_eq!(
            store.enabled_cluster_names(&keys, None, None).await.unwrap(),
            vec!["db".to_string(), "web".to_string()]
        );
        assert_eq!(
            store
                .enabled_cluster_names(&keys, Some("AlibabaCloud"), None)
                .await
                .unwrap(),
            vec!["web".to_string()]
        );
        assert!(store.get_key_pair(7).await.unwrap().is_none());
        store.fail_key_pair_lookups(1);
        assert!(store.get_key_pair(7).await.is_err());
    }

    #[tokio::test]
    async fn pg_store_roundtrip() {
        // Skips when no test database is configured.
        let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
            return;
        };
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .unwrap();
        sqlx::migrate!("../sqlx-migrations").run(&pool).await.unwrap();
        let store = PgFleetStore::new(pool);

        let id = format!("pg-test-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
        store.persist_instances(&[row(&id, "pg-test", 0)]).await.unwrap();
        let filter = InstanceFilter {
            instance_id: Some(id.clone()),
            ..Default::default()
        };
        let (rows, total) = store.query_instances(&filter, Page::default()).await.unwrap();
        assert_eq!((total, rows[0].instance_id.clone()), (1, id.clone()));

        let patch = InstancePatch::deleted(Utc::now());
        assert_eq!(store.soft_delete_instances(&[id.clone()], &patch).await.unwrap(), 1);
        assert_eq!(store.soft_delete_instances(&[id], &patch).await.unwrap(), 0);
    }
}
