use crate::core::error::{ErrorKind, StorageError};
use crate::core::model::{
    ByteRange, ErrorDetail, InlinePayload, Resource, ResourceId, ResourceKind, ResourceStatus, Segment,
    SegmentStatus, SourceLocator,
};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Durable keyed store of resource records. Writes for different
/// resources may arrive concurrently; implementations serialize them.
#[async_trait]
pub trait Repository: Send + Sync {
    async fn upsert(&self, resource: &Resource) -> Result<(), StorageError>;
    async fn upsert_segment(&self, playlist: &ResourceId, segment: &Segment) -> Result<(), StorageError>;
    async fn load_resources(&self) -> Result<Vec<Resource>, StorageError>;
    async fn load_segments(&self, playlist: &ResourceId) -> Result<Vec<Segment>, StorageError>;
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StorageError::Sqlx(sqlx::Error::Io(e)))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Single-connection store that lives only as long as the process.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              locator TEXT NOT NULL,
              title TEXT NOT NULL,
              referer TEXT NULL,
              status TEXT NOT NULL,
              progress REAL NOT NULL DEFAULT 0,
              local_path TEXT NULL,
              error_kind TEXT NULL,
              error_message TEXT NULL,
              attempt INTEGER NOT NULL DEFAULT 0,
              max_attempts INTEGER NOT NULL,
              updated_at INTEGER NOT NULL,
              CHECK ((status = 'completed') = (local_path IS NOT NULL)),
              CHECK ((status = 'failed') = (error_kind IS NOT NULL))
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segments (
              playlist_id TEXT NOT NULL,
              sequence_index INTEGER NOT NULL,
              uri TEXT NOT NULL,
              range_length INTEGER NULL,
              range_offset INTEGER NULL,
              status TEXT NOT NULL,
              updated_at INTEGER NOT NULL,
              PRIMARY KEY (playlist_id, sequence_index)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn now_epoch() -> i64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

#[async_trait]
impl Repository for SqliteStore {
    async fn upsert(&self, r: &Resource) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO resources
              (id, kind, locator, title, referer, status, progress, local_path,
               error_kind, error_message, attempt, max_attempts, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
              kind = excluded.kind,
              locator = excluded.locator,
              title = excluded.title,
              referer = excluded.referer,
              status = excluded.status,
              progress = excluded.progress,
              local_path = excluded.local_path,
              error_kind = excluded.error_kind,
              error_message = excluded.error_message,
              attempt = excluded.attempt,
              max_attempts = excluded.max_attempts,
              updated_at = excluded.updated_at;
            "#,
        )
        .bind(r.id.as_str())
        .bind(r.kind.as_str())
        .bind(r.locator.to_string())
        .bind(&r.title)
        .bind(r.referer.as_deref())
        .bind(r.status.as_str())
        .bind(r.progress)
        .bind(r.local_path.as_ref().map(|p| p.to_string_lossy().to_string()))
        .bind(r.error.as_ref().map(|e| e.kind.as_str()))
        .bind(r.error.as_ref().map(|e| e.message.clone()))
        .bind(r.attempt as i64)
        .bind(r.max_attempts as i64)
        .bind(Self::now_epoch())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_segment(&self, playlist: &ResourceId, s: &Segment) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO segments (playlist_id, sequence_index, uri, range_length, range_offset, status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(playlist_id, sequence_index) DO UPDATE SET
              uri = excluded.uri,
              range_length = excluded.range_length,
              range_offset = excluded.range_offset,
              status = excluded.status,
              updated_at = excluded.updated_at;
            "#,
        )
        .bind(playlist.as_str())
        .bind(s.sequence_index as i64)
        .bind(&s.uri)
        .bind(s.byte_range.map(|b| b.length as i64))
        .bind(s.byte_range.map(|b| b.offset as i64))
        .bind(s.status.as_str())
        .bind(Self::now_epoch())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_resources(&self) -> Result<Vec<Resource>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, locator, title, referer, status, progress, local_path,
                   error_kind, error_message, attempt, max_attempts
            FROM resources
            ORDER BY updated_at ASC, id ASC;
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let id: String = row.get("id");
                let corrupt = |detail: &str| StorageError::Corrupt { id: id.clone(), detail: detail.to_string() };

                let kind = ResourceKind::parse(&row.get::<String, _>("kind")).ok_or_else(|| corrupt("kind"))?;
                let locator_raw: String = row.get("locator");
                let locator = if kind == ResourceKind::InlineData {
                    InlinePayload::parse(&locator_raw).map(SourceLocator::Inline)
                } else {
                    Some(SourceLocator::Url(locator_raw))
                }
                .ok_or_else(|| corrupt("locator"))?;
                let status =
                    ResourceStatus::parse(&row.get::<String, _>("status")).ok_or_else(|| corrupt("status"))?;
                let error = match row.get::<Option<String>, _>("error_kind") {
                    Some(k) => Some(ErrorDetail {
                        kind: ErrorKind::parse(&k).ok_or_else(|| corrupt("error_kind"))?,
                        message: row.get::<Option<String>, _>("error_message").unwrap_or_default(),
                    }),
                    None => None,
                };

                Ok(Resource {
                    id: ResourceId::from_raw(id.clone()),
                    kind,
                    locator,
                    title: row.get("title"),
                    referer: row.get("referer"),
                    status,
                    progress: row.get("progress"),
                    local_path: row.get::<Option<String>, _>("local_path").map(PathBuf::from),
                    error,
                    attempt: row.get::<i64, _>("attempt").max(0) as u32,
                    max_attempts: row.get::<i64, _>("max_attempts").max(1) as u32,
                })
            })
            .collect()
    }

    async fn load_segments(&self, playlist: &ResourceId) -> Result<Vec<Segment>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence_index, uri, range_length, range_offset, status
            FROM segments
            WHERE playlist_id = ?
            ORDER BY sequence_index ASC;
            "#,
        )
        .bind(playlist.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let byte_range = match (
                    row.get::<Option<i64>, _>("range_length"),
                    row.get::<Option<i64>, _>("range_offset"),
                ) {
                    (Some(length), Some(offset)) => Some(ByteRange { length: length as u64, offset: offset as u64 }),
                    _ => None,
                };
                let status = SegmentStatus::parse(&row.get::<String, _>("status")).ok_or_else(|| {
                    StorageError::Corrupt { id: playlist.to_string(), detail: "segment status".to_string() }
                })?;
                Ok(Segment {
                    sequence_index: row.get::<i64, _>("sequence_index") as u64,
                    uri: row.get("uri"),
                    byte_range,
                    status,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::ResourceRef;

    fn sample(url: &str) -> Resource {
        Resource::discovered(
            ResourceRef { kind: ResourceKind::infer(url), locator: SourceLocator::Url(url.into()), title: None },
            Some("https://x.test/".into()),
            3,
        )
    }

    #[tokio::test]
    async fn upsert_replaces_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("db/harvest.sqlite")).await.unwrap();

        let mut r = sample("https://x.test/a.png");
        store.upsert(&r).await.unwrap();
        r.queue().unwrap();
        r.begin().unwrap();
        r.complete(dir.path().join("a.png")).unwrap();
        store.upsert(&r).await.unwrap();

        let all = store.load_resources().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], r);
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harvest.sqlite");
        let mut r = sample("https://x.test/v.mp4");
        r.queue().unwrap();
        r.begin().unwrap();
        r.fail(ErrorDetail { kind: ErrorKind::NetworkPermanent, message: "404".into() }).unwrap();
        {
            let store = SqliteStore::open(&path).await.unwrap();
            store.upsert(&r).await.unwrap();
        }
        let store = SqliteStore::open(&path).await.unwrap();
        let all = store.load_resources().await.unwrap();
        assert_eq!(all, vec![r]);
    }

    #[tokio::test]
    async fn inline_locator_roundtrips() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let locator = SourceLocator::parse("data:image/png;base64,AAAA").unwrap();
        let r = Resource::discovered(ResourceRef { kind: ResourceKind::InlineData, locator, title: None }, None, 3);
        store.upsert(&r).await.unwrap();
        assert_eq!(store.load_resources().await.unwrap(), vec![r]);
    }

    #[tokio::test]
    async fn segments_come_back_in_sequence_order() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let playlist = ResourceId::from_raw("p1");
        for i in [2u64, 0, 1] {
            let s = Segment {
                sequence_index: i,
                uri: format!("https://x.test/seg{i}.ts"),
                byte_range: (i == 1).then_some(ByteRange { length: 100, offset: 200 }),
                status: SegmentStatus::Pending,
            };
            store.upsert_segment(&playlist, &s).await.unwrap();
        }
        let done = Segment {
            sequence_index: 2,
            uri: "https://x.test/seg2.ts".into(),
            byte_range: None,
            status: SegmentStatus::Completed,
        };
        store.upsert_segment(&playlist, &done).await.unwrap();

        let segs = store.load_segments(&playlist).await.unwrap();
        assert_eq!(segs.iter().map(|s| s.sequence_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(segs[1].byte_range, Some(ByteRange { length: 100, offset: 200 }));
        assert_eq!(segs[2].status, SegmentStatus::Completed);
    }
}
