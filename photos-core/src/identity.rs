//! Identity Store: the restart-durable `photo_id ↔ surface_id` bijection.
//!
//! Surface ids are scarce and sequentially allocated by the host, so once a
//! photo is bound to a surface the pair must survive restarts. Mappings are
//! only ever removed by an explicit prune.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use dashmap::DashMap;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tracing::{debug, info};

use crate::error::{PhotoError, StoreError};
use crate::model::{PhotoId, SurfaceId};

/// One persisted binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IdentityMapping {
    pub photo_id: PhotoId,
    pub surface_id: SurfaceId,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Every stored mapping.
    async fn load_all(&self) -> Result<Vec<IdentityMapping>, StoreError>;

    /// Idempotent insert. Binding a pair that already exists is a no-op;
    /// binding either id to something else is an integrity error.
    async fn bind(&self, photo_id: PhotoId, surface_id: SurfaceId) -> Result<(), PhotoError>;

    /// Remove the mappings of the given photos. Returns how many were removed.
    async fn remove(&self, photo_ids: &[PhotoId]) -> Result<u64, StoreError>;
}

/// SQLite-backed identity store, one file per host.
pub struct SqliteIdentityStore {
    pool: SqlitePool,
}

impl SqliteIdentityStore {
    pub async fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Connection(format!("Failed to create directory: {e}"))
                })?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .map_err(|e| StoreError::Connection(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let store = Self::connect(options).await?;
        info!(path = %path.display(), "Identity store opened");
        Ok(store)
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Connection(format!("Invalid SQLite path: {e}")))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect to SQLite: {e}")))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS identity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                photo_id INTEGER NOT NULL UNIQUE,
                surface_id INTEGER NOT NULL UNIQUE
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Migration(format!("Failed to create identity table: {e}")))?;

        Ok(())
    }
}

#[async_trait]
impl IdentityStore for SqliteIdentityStore {
    async fn load_all(&self) -> Result<Vec<IdentityMapping>, StoreError> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT photo_id, surface_id FROM identity ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(photo_id, surface_id)| IdentityMapping {
                photo_id: PhotoId(photo_id),
                surface_id: SurfaceId(surface_id),
            })
            .collect())
    }

    async fn bind(&self, photo_id: PhotoId, surface_id: SurfaceId) -> Result<(), PhotoError> {
        let inserted = sqlx::query(
            "INSERT INTO identity (photo_id, surface_id) VALUES (?, ?) ON CONFLICT DO NOTHING",
        )
        .bind(photo_id.0)
        .bind(surface_id.0)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?
        .rows_affected();

        if inserted == 1 {
            debug!(photo_id = %photo_id, surface_id = %surface_id, "Identity bound");
            return Ok(());
        }

        // Either side is taken. Only the identical pair is a successful rebind.
        let existing: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT photo_id, surface_id FROM identity WHERE photo_id = ? OR surface_id = ?",
        )
        .bind(photo_id.0)
        .bind(surface_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        match existing.as_slice() {
            [(p, s)] if *p == photo_id.0 && *s == surface_id.0 => Ok(()),
            _ => Err(PhotoError::identity_collision(photo_id, surface_id)),
        }
    }

    async fn remove(&self, photo_ids: &[PhotoId]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for photo_id in photo_ids {
            removed += sqlx::query("DELETE FROM identity WHERE photo_id = ?")
                .bind(photo_id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }
}

/// In-memory identity store for tests and throwaway runs.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    by_photo: DashMap<PhotoId, SurfaceId>,
    by_surface: DashMap<SurfaceId, PhotoId>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mappings(mappings: impl IntoIterator<Item = IdentityMapping>) -> Self {
        let store = Self::new();
        for m in mappings {
            store.by_photo.insert(m.photo_id, m.surface_id);
            store.by_surface.insert(m.surface_id, m.photo_id);
        }
        store
    }

    pub fn len(&self) -> usize {
        self.by_photo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_photo.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn load_all(&self) -> Result<Vec<IdentityMapping>, StoreError> {
        let mut mappings: Vec<IdentityMapping> = self
            .by_photo
            .iter()
            .map(|entry| IdentityMapping {
                photo_id: *entry.key(),
                surface_id: *entry.value(),
            })
            .collect();
        mappings.sort_by_key(|m| m.photo_id);
        Ok(mappings)
    }

    async fn bind(&self, photo_id: PhotoId, surface_id: SurfaceId) -> Result<(), PhotoError> {
        let bound_surface = self.by_photo.get(&photo_id).map(|s| *s);
        let bound_photo = self.by_surface.get(&surface_id).map(|p| *p);
        match (bound_surface, bound_photo) {
            (None, None) => {
                self.by_photo.insert(photo_id, surface_id);
                self.by_surface.insert(surface_id, photo_id);
                Ok(())
            }
            (Some(s), Some(p)) if s == surface_id && p == photo_id => Ok(()),
            _ => Err(PhotoError::identity_collision(photo_id, surface_id)),
        }
    }

    async fn remove(&self, photo_ids: &[PhotoId]) -> Result<u64, StoreError> {
        let mut removed = 0;
        for photo_id in photo_ids {
            if let Some((_, surface_id)) = self.by_photo.remove(photo_id) {
                self.by_surface.remove(&surface_id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Two-way lookup over loaded mappings.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    by_photo: HashMap<PhotoId, SurfaceId>,
    by_surface: HashMap<SurfaceId, PhotoId>,
}

impl IdentityMap {
    pub fn new(mappings: impl IntoIterator<Item = IdentityMapping>) -> Self {
        let mut map = Self::default();
        for m in mappings {
            map.insert(m.photo_id, m.surface_id);
        }
        map
    }

    pub fn insert(&mut self, photo_id: PhotoId, surface_id: SurfaceId) {
        self.by_photo.insert(photo_id, surface_id);
        self.by_surface.insert(surface_id, photo_id);
    }

    pub fn remove(&mut self, photo_id: PhotoId) -> Option<SurfaceId> {
        let surface_id = self.by_photo.remove(&photo_id)?;
        self.by_surface.remove(&surface_id);
        Some(surface_id)
    }

    pub fn surface_of(&self, photo_id: PhotoId) -> Option<SurfaceId> {
        self.by_photo.get(&photo_id).copied()
    }

    pub fn photo_on(&self, surface_id: SurfaceId) -> Option<PhotoId> {
        self.by_surface.get(&surface_id).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = IdentityMapping> + '_ {
        self.by_photo.iter().map(|(p, s)| IdentityMapping {
            photo_id: *p,
            surface_id: *s,
        })
    }

    pub fn len(&self) -> usize {
        self.by_photo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_photo.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    async fn exercise(store: &dyn IdentityStore) {
        store.bind(PhotoId(1), SurfaceId(10)).await.unwrap();
        store.bind(PhotoId(2), SurfaceId(11)).await.unwrap();

        // Idempotent
        store.bind(PhotoId(1), SurfaceId(10)).await.unwrap();

        // Either side already bound elsewhere
        assert!(matches!(
            store.bind(PhotoId(1), SurfaceId(12)).await,
            Err(PhotoError::Integrity(_))
        ));
        assert!(matches!(
            store.bind(PhotoId(3), SurfaceId(11)).await,
            Err(PhotoError::Integrity(_))
        ));

        let all = store.load_all().await.unwrap();
        assert_eq!(
            all,
            vec![
                IdentityMapping { photo_id: PhotoId(1), surface_id: SurfaceId(10) },
                IdentityMapping { photo_id: PhotoId(2), surface_id: SurfaceId(11) },
            ]
        );

        assert_eq!(store.remove(&[PhotoId(2), PhotoId(99)]).await.unwrap(), 1);
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        // Freed surface can be bound again
        store.bind(PhotoId(3), SurfaceId(11)).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_store() {
        exercise(&MemoryIdentityStore::new()).await;
    }

    #[tokio::test]
    async fn test_sqlite_in_memory_store() {
        let store = SqliteIdentityStore::new_in_memory().await.unwrap();
        exercise(&store).await;
    }

    #[tokio::test]
    async fn test_sqlite_concurrent_identical_binds_all_succeed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteIdentityStore::new(&dir.path().join("local.db")).await.unwrap());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.bind(PhotoId(1), SurfaceId(10)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        // A rival for the same surface still collides
        assert!(matches!(
            store.bind(PhotoId(2), SurfaceId(10)).await,
            Err(PhotoError::Integrity(_))
        ));
        assert_eq!(
            store.load_all().await.unwrap(),
            vec![IdentityMapping { photo_id: PhotoId(1), surface_id: SurfaceId(10) }]
        );
    }

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/local.db");
        {
            let store = SqliteIdentityStore::new(&path).await.unwrap();
            store.bind(PhotoId(7), SurfaceId(3)).await.unwrap();
        }
        let store = SqliteIdentityStore::new(&path).await.unwrap();
        let all = store.load_all().await.unwrap();
        assert_eq!(all, vec![IdentityMapping { photo_id: PhotoId(7), surface_id: SurfaceId(3) }]);
    }

    #[test]
    fn test_identity_map_lookups() {
        let mut map = IdentityMap::new([IdentityMapping {
            photo_id: PhotoId(1),
            surface_id: SurfaceId(5),
        }]);
        map.insert(PhotoId(2), SurfaceId(6));
        assert_eq!(map.surface_of(PhotoId(2)), Some(SurfaceId(6)));
        assert_eq!(map.photo_on(SurfaceId(5)), Some(PhotoId(1)));
        assert_eq!(map.remove(PhotoId(1)), Some(SurfaceId(5)));
        assert_eq!(map.photo_on(SurfaceId(5)), None);
        assert_eq!(map.len(), 1);
    }
}
