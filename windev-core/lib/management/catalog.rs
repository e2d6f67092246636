//! Forensic partition catalog.
//!
//! The Sleuth Kit's `tsk_loaddb` scans an attached block device once and
//! produces a relational SQLite catalog of partitions and file records. This
//! module builds that catalog (idempotently, at the catalog-file level) and
//! answers the one query the pipeline needs: which partition owns the guest's
//! autostart directory, and therefore which partition device to mount.

use std::path::Path;
use std::sync::Arc;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Pool, Sqlite};

use crate::management::lineage::path_arg;
use crate::process::ProcessRunner;
use crate::utils::path::{CATALOG_DIR_TYPE, STARTUP_DIR_PARENT_PATH, TSK_LOADDB_TOOL};
use crate::{WindevError, WindevResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One partition row from the catalog's volume-system table.
///
/// The partition's rank (its 0-based position when all records of an image
/// are sorted by ascending start offset) is derived at query time, never
/// stored; it becomes the numeric suffix of the mount device path.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PartitionRecord {
    /// Catalog object id of the partition.
    pub obj_id: i64,

    /// Address slot assigned by the volume-system scanner.
    pub addr: i64,

    /// Start offset in sectors.
    pub start: i64,

    /// Length in sectors.
    pub length: i64,

    /// Human-readable partition description.
    pub desc: String,

    /// Volume-system flags.
    pub flags: i64,
}

/// A queryable handle to a built partition catalog.
#[derive(Debug, Clone)]
pub struct PartitionCatalog {
    pool: Pool<Sqlite>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PartitionCatalog {
    /// Builds the catalog for the image attached at `device`, writing it to
    /// `db_path`.
    ///
    /// The caller must sequence `attach -> build -> detach`: the indexing
    /// tool reads the block device, not the image file. Idempotent at the
    /// catalog-file level; an existing catalog is reused without re-scanning.
    pub async fn build(
        runner: &Arc<dyn ProcessRunner>,
        device: &str,
        db_path: &Path,
    ) -> WindevResult<()> {
        if db_path.exists() {
            tracing::info!("reusing existing catalog {}", db_path.display());
            return Ok(());
        }

        let db_str = path_arg(db_path)?;
        runner
            .run_checked(TSK_LOADDB_TOOL, &["-d", &db_str, "-k", device])
            .await?;
        tracing::info!("built catalog {}", db_path.display());
        Ok(())
    }

    /// Opens an existing catalog for querying.
    pub async fn open(db_path: &Path) -> WindevResult<Self> {
        let url = format!("sqlite://{}?mode=ro", path_arg(db_path)?);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&url)
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an already-connected pool. Used by tests with in-memory
    /// databases.
    pub fn from_pool(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// All partition records, ranked by ascending start offset.
    pub async fn partitions(&self) -> WindevResult<Vec<PartitionRecord>> {
        let records = sqlx::query_as::<_, PartitionRecord>(
            "SELECT obj_id, addr, start, length, desc, flags \
             FROM tsk_vs_parts ORDER BY start",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Object id of the partition owning the guest autostart directory.
    ///
    /// Joins file records to their parent objects and those to partition
    /// records, filtered by directory type and the literal autostart path.
    pub async fn startup_partition_object(&self) -> WindevResult<i64> {
        let obj_id: Option<i64> = sqlx::query_scalar(
            "SELECT DISTINCT c.obj_id \
             FROM tsk_files a, tsk_objects b, tsk_vs_parts c \
             WHERE b.par_obj_id = c.obj_id \
               AND a.fs_obj_id = b.obj_id \
               AND a.parent_path = ? \
               AND a.dir_type = ?",
        )
        .bind(STARTUP_DIR_PARENT_PATH)
        .bind(CATALOG_DIR_TYPE)
        .fetch_optional(&self.pool)
        .await?;

        obj_id.ok_or_else(|| WindevError::LocatorNotFound(STARTUP_DIR_PARENT_PATH.to_string()))
    }

    /// Resolves the partition device to mount for the guest system volume.
    ///
    /// Returns `device` with a `p<rank>` suffix where the rank is the 0-based
    /// position of the owning partition among all partitions sorted by start
    /// offset. There is no fallback guess: a locator miss is fatal.
    pub async fn resolve_mount_device(&self, device: &str) -> WindevResult<String> {
        let partitions = self.partitions().await?;
        let obj_id = self.startup_partition_object().await?;

        let rank = partitions
            .iter()
            .position(|p| p.obj_id == obj_id)
            .ok_or_else(|| WindevError::LocatorNotFound(STARTUP_DIR_PARENT_PATH.to_string()))?;

        Ok(format!("{device}p{rank}"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn catalog_with_fixture() -> PartitionCatalog {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();

        for ddl in [
            "CREATE TABLE tsk_vs_parts (
                obj_id INTEGER, addr INTEGER, start INTEGER,
                length INTEGER, desc TEXT, flags INTEGER
             )",
            "CREATE TABLE tsk_objects (obj_id INTEGER, par_obj_id INTEGER)",
            "CREATE TABLE tsk_files (
                parent_path TEXT, dir_type INTEGER, fs_obj_id INTEGER
             )",
        ] {
            sqlx::query(ddl).execute(&pool).await.unwrap();
        }

        PartitionCatalog::from_pool(pool)
    }

    async fn insert_partition(catalog: &PartitionCatalog, obj_id: i64, addr: i64, start: i64) {
        sqlx::query(
            "INSERT INTO tsk_vs_parts (obj_id, addr, start, length, desc, flags) \
             VALUES (?, ?, ?, 4096, 'NTFS', 0)",
        )
        .bind(obj_id)
        .bind(addr)
        .bind(start)
        .execute(&catalog.pool)
        .await
        .unwrap();
    }

    async fn insert_startup_dir(catalog: &PartitionCatalog, fs_obj_id: i64, part_obj_id: i64) {
        sqlx::query("INSERT INTO tsk_objects (obj_id, par_obj_id) VALUES (?, ?)")
            .bind(fs_obj_id)
            .bind(part_obj_id)
            .execute(&catalog.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tsk_files (parent_path, dir_type, fs_obj_id) VALUES (?, ?, ?)",
        )
        .bind(STARTUP_DIR_PARENT_PATH)
        .bind(CATALOG_DIR_TYPE)
        .bind(fs_obj_id)
        .execute(&catalog.pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_resolve_mount_device_uses_start_offset_rank() {
        let catalog = catalog_with_fixture().await;

        // Inserted out of order on purpose; ranking is by start offset, not
        // insertion order or address slot.
        insert_partition(&catalog, 30, 7, 1_048_576).await;
        insert_partition(&catalog, 10, 5, 0).await;
        insert_partition(&catalog, 20, 6, 2048).await;
        insert_startup_dir(&catalog, 100, 30).await;

        let device = catalog.resolve_mount_device("/dev/nbd0").await.unwrap();
        assert_eq!(device, "/dev/nbd0p2");
    }

    #[tokio::test]
    async fn test_resolve_mount_device_fails_without_locator_match() {
        let catalog = catalog_with_fixture().await;
        insert_partition(&catalog, 10, 5, 0).await;

        let err = catalog.resolve_mount_device("/dev/nbd0").await.unwrap_err();
        assert!(matches!(err, WindevError::LocatorNotFound(_)));
    }

    #[tokio::test]
    async fn test_locator_join_ignores_file_records() {
        let catalog = catalog_with_fixture().await;
        insert_partition(&catalog, 10, 5, 0).await;

        // A plain file record under the autostart path must not satisfy the
        // directory-type filter.
        sqlx::query("INSERT INTO tsk_objects (obj_id, par_obj_id) VALUES (100, 10)")
            .execute(&catalog.pool)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO tsk_files (parent_path, dir_type, fs_obj_id) VALUES (?, 5, 100)",
        )
        .bind(STARTUP_DIR_PARENT_PATH)
        .execute(&catalog.pool)
        .await
        .unwrap();

        let err = catalog.startup_partition_object().await.unwrap_err();
        assert!(matches!(err, WindevError::LocatorNotFound(_)));
    }
}
