//! Tenant-Aware KV Store (§4.12).
//!
//! Grounded on `packages/intelligent-crawler/src/storage/
//! crawler_storage.rs`'s `sqlx` query/bind/execute + transaction idiom,
//! with the backend swapped from Postgres to SQLite (the teacher's own
//! `extraction` package already exposes a `sqlite` cargo feature for an
//! embedded-engine backend — see DESIGN.md). Keys are namespaced
//! `tenant:<id>:ns:<namespace>:<key>` exactly as §4.12 specifies; the
//! prefix is computed server-side from the trait's own arguments, never
//! trusted from caller-supplied key strings, which is the security
//! invariant in §4.12 ("no tenant can read or write another tenant's
//! namespace by path manipulation").

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::types::TenantId;

pub const SHARED_POOL_NAMESPACE: &str = "__shared_pool__";
pub const TENANT_REGISTRY_NAMESPACE: &str = "__tenant_registry__";

/// Builds the server-side key prefix. Never derived from caller input —
/// callers pass `tenant`/`namespace`/`key` as separate arguments and this
/// is the only place they are concatenated.
pub fn storage_key(tenant: &TenantId, namespace: &str, key: &str) -> String {
    format!("tenant:{}:ns:{}:{}", tenant.0, namespace, key)
}

/// A tenant's admission flags for the shared pool (§4.12).
#[derive(Debug, Clone, Copy, Default)]
pub struct TenantAdmission {
    pub share_patterns: bool,
    pub consume_shared: bool,
}

/// Capability interface for tenant-scoped, transactional KV storage.
/// Concrete implementations own the connection to the embedded engine
/// and serialise mutations; callers never see a raw map (§9 "Shared
/// mutable registries... Do not expose raw maps").
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>>;
    async fn put(&self, tenant: &TenantId, namespace: &str, key: &str, value: Vec<u8>) -> StoreResult<()>;
    async fn delete(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<()>;
    async fn has(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<bool> {
        Ok(self.get(tenant, namespace, key).await?.is_some())
    }
    async fn keys(&self, tenant: &TenantId, namespace: &str) -> StoreResult<Vec<String>>;
    async fn get_all(&self, tenant: &TenantId, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>>;
    async fn count(&self, tenant: &TenantId, namespace: &str) -> StoreResult<usize> {
        Ok(self.keys(tenant, namespace).await?.len())
    }
    async fn clear(&self, tenant: &TenantId, namespace: &str) -> StoreResult<()>;

    /// Atomic multi-key writes (§4.12 `transaction`). The default
    /// implementation is non-atomic (acceptable for `MemoryKvStore`);
    /// backends with real transactional support override this.
    async fn transaction(&self, ops: Vec<KvWriteOp>) -> StoreResult<()> {
        for op in ops {
            match op {
                KvWriteOp::Put { tenant, namespace, key, value } => {
                    self.put(&tenant, &namespace, &key, value).await?
                }
                KvWriteOp::Delete { tenant, namespace, key } => {
                    self.delete(&tenant, &namespace, &key).await?
                }
            }
        }
        Ok(())
    }

    /// Admission check for the shared pool (§4.12): only tenants with
    /// `share_patterns=true` may contribute; only `consume_shared=true`
    /// tenants may read.
    async fn admission(&self, tenant: &TenantId) -> StoreResult<TenantAdmission>;
    async fn set_admission(&self, tenant: &TenantId, admission: TenantAdmission) -> StoreResult<()>;
}

pub enum KvWriteOp {
    Put {
        tenant: TenantId,
        namespace: String,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        tenant: TenantId,
        namespace: String,
        key: String,
    },
}

/// Typed convenience wrapper over any `KvStore`, following the teacher's
/// pattern of thin typed helpers layered on a byte-oriented store.
pub struct TypedStore<'a, S: KvStore + ?Sized> {
    store: &'a S,
}

impl<'a, S: KvStore + ?Sized> TypedStore<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self { store }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        tenant: &TenantId,
        namespace: &str,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.store.get(tenant, namespace, key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn put_json<T: Serialize + Sync>(
        &self,
        tenant: &TenantId,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.store.put(tenant, namespace, key, bytes).await
    }
}

/// Entry contributed to the shared pool; carries contributor attribution
/// per §4.12 ("every pattern carries its contributor id for
/// attribution").
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SharedPoolEntry {
    pub contributor: String,
    pub domain: Option<String>,
    pub category: Option<String>,
    pub payload: serde_json::Value,
}

/// Reserved tenant id the shared pool's entries are physically stored
/// under, regardless of which real tenant contributed them — the pool
/// is cross-tenant by definition, so it cannot live inside any single
/// tenant's isolated namespace (§4.12 "a distinct namespace into which
/// opted-in tenants may contribute").
fn shared_pool_tenant() -> TenantId {
    TenantId::new("__shared__")
}

/// Contributes a de-identified pattern to the shared pool, enforcing the
/// `share_patterns` admission flag server-side. The entry is written
/// under the reserved shared-pool tenant, keyed by `<contributor>:<key>`
/// so two tenants contributing under the same logical key don't
/// collide, while admission is still checked against the real
/// contributing tenant (§4.12 security invariant: the prefix is always
/// computed server-side, never trusted from caller input).
pub async fn contribute_to_shared_pool<S: KvStore + ?Sized>(
    store: &S,
    tenant: &TenantId,
    key: &str,
    entry: SharedPoolEntry,
) -> StoreResult<()> {
    let admission = store.admission(tenant).await?;
    if !admission.share_patterns {
        return Err(StoreError::SharedPoolDenied(tenant.0.clone()));
    }
    let shared_key = format!("{}:{key}", tenant.0);
    TypedStore::new(store)
        .put_json(&shared_pool_tenant(), SHARED_POOL_NAMESPACE, &shared_key, &entry)
        .await
}

/// Lists shared-pool entries visible to a consuming tenant, filtered by
/// domain or category, enforcing the `consume_shared` admission flag.
pub async fn list_shared_pool<S: KvStore + ?Sized>(
    store: &S,
    consumer: &TenantId,
    domain_filter: Option<&str>,
    category_filter: Option<&str>,
) -> StoreResult<Vec<SharedPoolEntry>> {
    let admission = store.admission(consumer).await?;
    if !admission.consume_shared {
        return Ok(Vec::new());
    }

    let entries = store.get_all(&shared_pool_tenant(), SHARED_POOL_NAMESPACE).await?;
    let mut result = Vec::new();
    for (_key, bytes) in entries {
        let entry: SharedPoolEntry = serde_json::from_slice(&bytes)?;
        if let Some(domain) = domain_filter {
            if entry.domain.as_deref() != Some(domain) {
                continue;
            }
        }
        if let Some(category) = category_filter {
            if entry.category.as_deref() != Some(category) {
                continue;
            }
        }
        result.push(entry);
    }
    Ok(result)
}

pub mod memory {
    //! In-process `KvStore` used for tests and for tenants/deployments
    //! that don't need durability across restarts.

    use super::*;
    use std::collections::HashMap;
    use tokio::sync::RwLock;

    #[derive(Default)]
    pub struct MemoryKvStore {
        data: RwLock<HashMap<String, Vec<u8>>>,
        admissions: RwLock<HashMap<String, TenantAdmission>>,
    }

    impl MemoryKvStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl KvStore for MemoryKvStore {
        async fn get(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
            let prefixed = storage_key(tenant, namespace, key);
            Ok(self.data.read().await.get(&prefixed).cloned())
        }

        async fn put(&self, tenant: &TenantId, namespace: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
            let prefixed = storage_key(tenant, namespace, key);
            self.data.write().await.insert(prefixed, value);
            Ok(())
        }

        async fn delete(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<()> {
            let prefixed = storage_key(tenant, namespace, key);
            self.data.write().await.remove(&prefixed);
            Ok(())
        }

        async fn keys(&self, tenant: &TenantId, namespace: &str) -> StoreResult<Vec<String>> {
            let prefix = storage_key(tenant, namespace, "");
            Ok(self
                .data
                .read()
                .await
                .keys()
                .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
                .collect())
        }

        async fn get_all(&self, tenant: &TenantId, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
            let prefix = storage_key(tenant, namespace, "");
            Ok(self
                .data
                .read()
                .await
                .iter()
                .filter_map(|(k, v)| {
                    k.strip_prefix(&prefix).map(|suffix| (suffix.to_string(), v.clone()))
                })
                .collect())
        }

        async fn clear(&self, tenant: &TenantId, namespace: &str) -> StoreResult<()> {
            let prefix = storage_key(tenant, namespace, "");
            self.data.write().await.retain(|k, _| !k.starts_with(&prefix));
            Ok(())
        }

        async fn admission(&self, tenant: &TenantId) -> StoreResult<TenantAdmission> {
            Ok(self
                .admissions
                .read()
                .await
                .get(&tenant.0)
                .copied()
                .unwrap_or_default())
        }

        async fn set_admission(&self, tenant: &TenantId, admission: TenantAdmission) -> StoreResult<()> {
            self.admissions.write().await.insert(tenant.0.clone(), admission);
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[tokio::test]
        async fn tenant_isolation_holds() {
            let store = MemoryKvStore::new();
            let a = TenantId::new("a");
            let b = TenantId::new("b");
            store.put(&a, "domain_entries", "example.com", b"alice's data".to_vec()).await.unwrap();
            assert!(store.get(&b, "domain_entries", "example.com").await.unwrap().is_none());
            assert_eq!(
                store.get(&a, "domain_entries", "example.com").await.unwrap().unwrap(),
                b"alice's data"
            );
        }

        #[tokio::test]
        async fn shared_pool_requires_admission() {
            let store = MemoryKvStore::new();
            let a = TenantId::new("a");
            let entry = SharedPoolEntry {
                contributor: "a".into(),
                domain: Some("example.com".into()),
                category: Some("api_pattern".into()),
                payload: serde_json::json!({"k": "v"}),
            };
            assert!(contribute_to_shared_pool(&store, &a, "p1", entry.clone())
                .await
                .is_err());

            store
                .set_admission(&a, TenantAdmission { share_patterns: true, consume_shared: false })
                .await
                .unwrap();
            assert!(contribute_to_shared_pool(&store, &a, "p1", entry).await.is_ok());
        }

        #[tokio::test]
        async fn shared_pool_contribution_is_visible_to_other_opted_in_tenants() {
            let store = MemoryKvStore::new();
            let a = TenantId::new("a");
            let b = TenantId::new("b");
            let c = TenantId::new("c");
            store.set_admission(&a, TenantAdmission { share_patterns: true, consume_shared: false }).await.unwrap();
            store.set_admission(&b, TenantAdmission { share_patterns: false, consume_shared: true }).await.unwrap();
            store.set_admission(&c, TenantAdmission { share_patterns: false, consume_shared: false }).await.unwrap();

            let entry = SharedPoolEntry {
                contributor: "a".into(),
                domain: Some("example.com".into()),
                category: Some("api_pattern".into()),
                payload: serde_json::json!({"k": "v"}),
            };
            contribute_to_shared_pool(&store, &a, "p1", entry).await.unwrap();

            let seen_by_b = list_shared_pool(&store, &b, None, None).await.unwrap();
            assert_eq!(seen_by_b.len(), 1);
            assert_eq!(seen_by_b[0].contributor, "a");

            let seen_by_c = list_shared_pool(&store, &c, None, None).await.unwrap();
            assert!(seen_by_c.is_empty());
        }

        #[tokio::test]
        async fn clear_only_touches_target_namespace() {
            let store = MemoryKvStore::new();
            let a = TenantId::new("a");
            store.put(&a, "ns1", "k", b"v".to_vec()).await.unwrap();
            store.put(&a, "ns2", "k", b"v".to_vec()).await.unwrap();
            store.clear(&a, "ns1").await.unwrap();
            assert!(store.get(&a, "ns1", "k").await.unwrap().is_none());
            assert!(store.get(&a, "ns2", "k").await.unwrap().is_some());
        }
    }
}

#[cfg(feature = "sqlite-store")]
pub mod sqlite {
    //! Embedded SQLite-backed `KvStore` (§4.12 "Backed by an embedded
    //! key-value engine"). Schema: a single `kv_entries` table keyed by
    //! the already-prefixed storage key, mirroring
    //! `intelligent-crawler`'s `sqlx::query(...).bind(...).execute(pool)`
    //! idiom with the Postgres pool swapped for a `SqlitePool`.

    use super::*;
    use sqlx::sqlite::SqlitePool;
    use sqlx::Row;

    pub struct SqliteKvStore {
        pool: SqlitePool,
    }

    impl SqliteKvStore {
        pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
            let pool = SqlitePool::connect(url).await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS kv_entries (
                    storage_key TEXT PRIMARY KEY,
                    value BLOB NOT NULL
                )",
            )
            .execute(&pool)
            .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS tenant_admissions (
                    tenant_id TEXT PRIMARY KEY,
                    share_patterns INTEGER NOT NULL DEFAULT 0,
                    consume_shared INTEGER NOT NULL DEFAULT 0
                )",
            )
            .execute(&pool)
            .await?;
            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl KvStore for SqliteKvStore {
        async fn get(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
            let prefixed = storage_key(tenant, namespace, key);
            let row = sqlx::query("SELECT value FROM kv_entries WHERE storage_key = ?")
                .bind(&prefixed)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(row.map(|r| r.get::<Vec<u8>, _>("value")))
        }

        async fn put(&self, tenant: &TenantId, namespace: &str, key: &str, value: Vec<u8>) -> StoreResult<()> {
            let prefixed = storage_key(tenant, namespace, key);
            sqlx::query(
                "INSERT INTO kv_entries (storage_key, value) VALUES (?, ?)
                 ON CONFLICT(storage_key) DO UPDATE SET value = excluded.value",
            )
            .bind(&prefixed)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(())
        }

        async fn delete(&self, tenant: &TenantId, namespace: &str, key: &str) -> StoreResult<()> {
            let prefixed = storage_key(tenant, namespace, key);
            sqlx::query("DELETE FROM kv_entries WHERE storage_key = ?")
                .bind(&prefixed)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(())
        }

        async fn keys(&self, tenant: &TenantId, namespace: &str) -> StoreResult<Vec<String>> {
            let prefix = storage_key(tenant, namespace, "");
            let pattern = format!("{prefix}%");
            let rows = sqlx::query("SELECT storage_key FROM kv_entries WHERE storage_key LIKE ?")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(rows
                .into_iter()
                .map(|r| r.get::<String, _>("storage_key"))
                .filter_map(|k| k.strip_prefix(&prefix).map(|s| s.to_string()))
                .collect())
        }

        async fn get_all(&self, tenant: &TenantId, namespace: &str) -> StoreResult<Vec<(String, Vec<u8>)>> {
            let prefix = storage_key(tenant, namespace, "");
            let pattern = format!("{prefix}%");
            let rows = sqlx::query("SELECT storage_key, value FROM kv_entries WHERE storage_key LIKE ?")
                .bind(&pattern)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(rows
                .into_iter()
                .filter_map(|r| {
                    let key: String = r.get("storage_key");
                    let value: Vec<u8> = r.get("value");
                    key.strip_prefix(&prefix).map(|suffix| (suffix.to_string(), value))
                })
                .collect())
        }

        async fn clear(&self, tenant: &TenantId, namespace: &str) -> StoreResult<()> {
            let prefix = storage_key(tenant, namespace, "");
            let pattern = format!("{prefix}%");
            sqlx::query("DELETE FROM kv_entries WHERE storage_key LIKE ?")
                .bind(&pattern)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(())
        }

        async fn transaction(&self, ops: Vec<KvWriteOp>) -> StoreResult<()> {
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            for op in ops {
                match op {
                    KvWriteOp::Put { tenant, namespace, key, value } => {
                        let prefixed = storage_key(&tenant, &namespace, &key);
                        sqlx::query(
                            "INSERT INTO kv_entries (storage_key, value) VALUES (?, ?)
                             ON CONFLICT(storage_key) DO UPDATE SET value = excluded.value",
                        )
                        .bind(prefixed)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| StoreError::Transaction(e.to_string()))?;
                    }
                    KvWriteOp::Delete { tenant, namespace, key } => {
                        let prefixed = storage_key(&tenant, &namespace, &key);
                        sqlx::query("DELETE FROM kv_entries WHERE storage_key = ?")
                            .bind(prefixed)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| StoreError::Transaction(e.to_string()))?;
                    }
                }
            }
            tx.commit()
                .await
                .map_err(|e| StoreError::Transaction(e.to_string()))?;
            Ok(())
        }

        async fn admission(&self, tenant: &TenantId) -> StoreResult<TenantAdmission> {
            let row = sqlx::query(
                "SELECT share_patterns, consume_shared FROM tenant_admissions WHERE tenant_id = ?",
            )
            .bind(&tenant.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(row
                .map(|r| TenantAdmission {
                    share_patterns: r.get::<i64, _>("share_patterns") != 0,
                    consume_shared: r.get::<i64, _>("consume_shared") != 0,
                })
                .unwrap_or_default())
        }

        async fn set_admission(&self, tenant: &TenantId, admission: TenantAdmission) -> StoreResult<()> {
            sqlx::query(
                "INSERT INTO tenant_admissions (tenant_id, share_patterns, consume_shared)
                 VALUES (?, ?, ?)
                 ON CONFLICT(tenant_id) DO UPDATE SET
                    share_patterns = excluded.share_patterns,
                    consume_shared = excluded.consume_shared",
            )
            .bind(&tenant.0)
            .bind(admission.share_patterns as i64)
            .bind(admission.consume_shared as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(Box::new(e)))?;
            Ok(())
        }
    }
}
