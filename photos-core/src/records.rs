//! Authoritative Store: the canonical photo records shared by every node.
//!
//! Production uses PostgreSQL. Without a `DATABASE_URL` the process falls
//! back to [`MemoryPhotoStore`], which loses everything on exit.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{NewPhoto, OwnerId, PhotoId, PhotoRecord, Rgb};

#[async_trait]
pub trait PhotoStore: Send + Sync {
    /// Insert a record; the store assigns the id.
    async fn insert(&self, input: NewPhoto) -> Result<PhotoRecord, StoreError>;

    /// Overwrite a record unless the stored copy is newer.
    ///
    /// Returns false when nothing was written (record gone or newer).
    async fn update(&self, record: &PhotoRecord) -> Result<bool, StoreError>;

    /// Hard delete. Returns false if the record did not exist.
    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError>;

    async fn find(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError>;

    async fn find_many(&self, ids: &[PhotoId]) -> Result<Vec<PhotoRecord>, StoreError>;

    /// Records with `updated_at >= since`, oldest first.
    async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<PhotoRecord>, StoreError>;

    async fn all(&self) -> Result<Vec<PhotoRecord>, StoreError>;

    /// Reassign every record owned by `from`, stamping `updated_at` to at
    /// least `at`. Returns the ids of the reassigned records.
    async fn transfer_all(
        &self,
        from: OwnerId,
        to: Option<OwnerId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<PhotoId>, StoreError>;
}

/// PostgreSQL-backed Authoritative Store.
#[derive(Clone)]
pub struct PostgresPhotoStore {
    pool: PgPool,
}

/// Row type for database queries.
#[derive(FromRow)]
struct PhotoRow {
    id: i64,
    owner: Option<Uuid>,
    name: String,
    color: i32,
    created: DateTime<Utc>,
    updated: DateTime<Utc>,
}

impl From<PhotoRow> for PhotoRecord {
    fn from(row: PhotoRow) -> Self {
        Self {
            id: PhotoId(row.id),
            owner: row.owner,
            name: row.name,
            color: Rgb::new(row.color as u32),
            created_at: row.created,
            updated_at: row.updated,
        }
    }
}

const SELECT_COLUMNS: &str = "SELECT id, owner, name, color, created, updated FROM photos";

impl PostgresPhotoStore {
    /// Connect and apply migrations.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Authoritative store connected and migrations applied");

        Ok(Self { pool })
    }
}

#[async_trait]
impl PhotoStore for PostgresPhotoStore {
    async fn insert(&self, input: NewPhoto) -> Result<PhotoRecord, StoreError> {
        let row = sqlx::query_as::<_, PhotoRow>(
            r#"
            INSERT INTO photos (owner, name, color, created, updated)
            VALUES ($1, $2, $3, $4, $4)
            RETURNING id, owner, name, color, created, updated
            "#,
        )
        .bind(input.owner)
        .bind(&input.name)
        .bind(input.color.hex() as i32)
        .bind(input.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into())
    }

    async fn update(&self, record: &PhotoRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE photos
            SET owner = $2, name = $3, color = $4, updated = $5
            WHERE id = $1 AND updated <= $5
            "#,
        )
        .bind(record.id.0)
        .bind(record.owner)
        .bind(&record.name)
        .bind(record.color.hex() as i32)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM photos WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError> {
        let row = sqlx::query_as::<_, PhotoRow>(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    async fn find_many(&self, ids: &[PhotoId]) -> Result<Vec<PhotoRecord>, StoreError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let rows = sqlx::query_as::<_, PhotoRow>(&format!(
            "{SELECT_COLUMNS} WHERE id = ANY($1) ORDER BY id"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<PhotoRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PhotoRow>(&format!(
            "{SELECT_COLUMNS} WHERE updated >= $1 ORDER BY updated, id"
        ))
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn all(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        let rows = sqlx::query_as::<_, PhotoRow>(&format!("{SELECT_COLUMNS} ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn transfer_all(
        &self,
        from: OwnerId,
        to: Option<OwnerId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<PhotoId>, StoreError> {
        let ids: Vec<i64> = sqlx::query_scalar(
            "UPDATE photos SET owner = $2, updated = GREATEST(updated, $3) \
             WHERE owner = $1 RETURNING id",
        )
        .bind(from)
        .bind(to)
        .bind(at)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(PhotoId).collect())
    }
}

impl std::fmt::Debug for PostgresPhotoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresPhotoStore")
            .field("pool", &"<PgPool>")
            .finish()
    }
}

/// In-memory Authoritative Store.
#[derive(Debug)]
pub struct MemoryPhotoStore {
    records: DashMap<PhotoId, PhotoRecord>,
    next_id: AtomicI64,
}

impl Default for MemoryPhotoStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }
}

impl MemoryPhotoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn sorted(mut records: Vec<PhotoRecord>) -> Vec<PhotoRecord> {
        records.sort_by_key(|r| r.id);
        records
    }
}

#[async_trait]
impl PhotoStore for MemoryPhotoStore {
    async fn insert(&self, input: NewPhoto) -> Result<PhotoRecord, StoreError> {
        let id = PhotoId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let record = PhotoRecord::from_new(id, input);
        self.records.insert(id, record.clone());
        Ok(record)
    }

    async fn update(&self, record: &PhotoRecord) -> Result<bool, StoreError> {
        match self.records.get_mut(&record.id) {
            Some(mut stored) if stored.updated_at <= record.updated_at => {
                stored.owner = record.owner;
                stored.name = record.name.clone();
                stored.color = record.color;
                stored.updated_at = record.updated_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, id: PhotoId) -> Result<bool, StoreError> {
        Ok(self.records.remove(&id).is_some())
    }

    async fn find(&self, id: PhotoId) -> Result<Option<PhotoRecord>, StoreError> {
        Ok(self.records.get(&id).map(|r| r.clone()))
    }

    async fn find_many(&self, ids: &[PhotoId]) -> Result<Vec<PhotoRecord>, StoreError> {
        Ok(Self::sorted(
            ids.iter()
                .filter_map(|id| self.records.get(id).map(|r| r.clone()))
                .collect(),
        ))
    }

    async fn changed_since(&self, since: DateTime<Utc>) -> Result<Vec<PhotoRecord>, StoreError> {
        let mut records: Vec<PhotoRecord> = self
            .records
            .iter()
            .filter(|r| r.updated_at >= since)
            .map(|r| r.clone())
            .collect();
        records.sort_by_key(|r| (r.updated_at, r.id));
        Ok(records)
    }

    async fn all(&self) -> Result<Vec<PhotoRecord>, StoreError> {
        Ok(Self::sorted(self.records.iter().map(|r| r.clone()).collect()))
    }

    async fn transfer_all(
        &self,
        from: OwnerId,
        to: Option<OwnerId>,
        at: DateTime<Utc>,
    ) -> Result<Vec<PhotoId>, StoreError> {
        let mut ids = Vec::new();
        for mut record in self.records.iter_mut() {
            if record.owner == Some(from) {
                record.owner = to;
                record.updated_at = record.updated_at.max(at);
                ids.push(record.id);
            }
        }
        ids.sort();
        Ok(ids)
    }
}
