//! Date-partitioned CSV staging for warehouse loads.
//!
//! Rows land under `{root}/{dataset}/{table}/data_particao=YYYY-MM-DD/{uuid}.csv`,
//! the layout the warehouse external tables read from.

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::FlowError;
use crate::error::FlowResult;

pub const PARTITION_COLUMN: &str = "data_particao";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpMode {
    #[default]
    Append,
    Overwrite,
}

impl std::fmt::Display for DumpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DumpMode::Append => write!(f, "append"),
            DumpMode::Overwrite => write!(f, "overwrite"),
        }
    }
}

/// Destination table of a load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableTarget {
    pub dataset_id: String,
    pub table_id: String,
    #[serde(default)]
    pub dump_mode: DumpMode,
}

impl TableTarget {
    pub fn new(dataset_id: impl Into<String>, table_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            table_id: table_id.into(),
            dump_mode: DumpMode::Append,
        }
    }

    pub fn with_dump_mode(mut self, dump_mode: DumpMode) -> Self {
        self.dump_mode = dump_mode;
        self
    }

    pub fn relative_dir(&self) -> PathBuf {
        PathBuf::from(&self.dataset_id).join(&self.table_id)
    }
}

/// A CSV file written for one partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub partition: NaiveDate,
    pub path: PathBuf,
    /// Path relative to the writer root, `/` separated.
    pub object_name: String,
    pub rows: usize,
}

#[derive(Debug, Clone)]
pub struct PartitionWriter {
    root: PathBuf,
}

impl PartitionWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Writes all `rows` into the partition of `date`.
    ///
    /// Returns `None` when there is nothing to write; an empty CSV would
    /// only carry a header the warehouse cannot type.
    pub fn write<T: Serialize>(
        &self,
        target: &TableTarget,
        date: NaiveDate,
        rows: &[T],
    ) -> FlowResult<Option<StagedFile>> {
        let mut staged = self.write_partitions(target, rows, |_| date)?;
        Ok(staged.pop())
    }

    /// Writes one file per distinct partition returned by `partition_of`,
    /// in date order.
    pub fn write_partitions<T, F>(
        &self,
        target: &TableTarget,
        rows: &[T],
        partition_of: F,
    ) -> FlowResult<Vec<StagedFile>>
    where
        T: Serialize,
        F: Fn(&T) -> NaiveDate,
    {
        let table_dir = self.root.join(target.relative_dir());
        if target.dump_mode == DumpMode::Overwrite && table_dir.exists() {
            std::fs::remove_dir_all(&table_dir).map_err(|err| FlowError::io(&table_dir, err))?;
        }
        if rows.is_empty() {
            info!(
                "No rows for {}.{}; nothing staged.",
                target.dataset_id, target.table_id
            );
            return Ok(Vec::new());
        }

        let mut partitions: BTreeMap<NaiveDate, Vec<&T>> = BTreeMap::new();
        for row in rows {
            partitions.entry(partition_of(row)).or_default().push(row);
        }

        let mut staged = Vec::with_capacity(partitions.len());
        for (date, rows) in partitions {
            staged.push(self.write_file(target, &table_dir, date, &rows)?);
        }
        Ok(staged)
    }

    fn write_file<T: Serialize>(
        &self,
        target: &TableTarget,
        table_dir: &Path,
        date: NaiveDate,
        rows: &[&T],
    ) -> FlowResult<StagedFile> {
        let partition_dir_name = partition_dir(date);
        let partition_dir = table_dir.join(&partition_dir_name);
        std::fs::create_dir_all(&partition_dir).map_err(|err| FlowError::io(&partition_dir, err))?;
        let file_name = format!("{}.csv", Uuid::new_v4());
        let path = partition_dir.join(&file_name);

        let mut writer = csv::Writer::from_path(&path)?;
        for row in rows {
            writer.serialize(row)?;
        }
        writer.flush().map_err(|err| FlowError::io(&path, err))?;

        let object_name = format!(
            "{}/{}/{partition_dir_name}/{file_name}",
            target.dataset_id, target.table_id
        );
        info!("Staged {} rows in {}.", rows.len(), path.display());
        Ok(StagedFile {
            partition: date,
            path,
            object_name,
            rows: rows.len(),
        })
    }
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(
        &self,
        bucket: &str,
        object_name: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> FlowResult<()>;

    /// Names of every object under `prefix`.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> FlowResult<Vec<String>>;

    async fn delete_object(&self, bucket: &str, object_name: &str) -> FlowResult<()>;
}

/// Copies staged files to `gs://{bucket}/staging/...`, the prefix the
/// warehouse external tables are declared on.
#[derive(Clone)]
pub struct GcsUploader {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl std::fmt::Debug for GcsUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsUploader")
            .field("bucket", &self.bucket)
            .finish_non_exhaustive()
    }
}

impl GcsUploader {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Remote prefix holding every staged file of `target`.
    pub fn table_prefix(target: &TableTarget) -> String {
        format!("staging/{}/{}/", target.dataset_id, target.table_id)
    }

    /// Deletes every object under the table's staging prefix and returns how
    /// many were removed.
    pub async fn clear_table(&self, target: &TableTarget) -> FlowResult<usize> {
        let prefix = Self::table_prefix(target);
        let objects = self.store.list_objects(&self.bucket, &prefix).await?;
        for object_name in &objects {
            self.store.delete_object(&self.bucket, object_name).await?;
        }
        info!(
            "Cleared {} objects under gs://{}/{prefix}.",
            objects.len(),
            self.bucket
        );
        Ok(objects.len())
    }

    /// Uploads every file and returns the `gs://` URIs written.
    ///
    /// An overwrite target loses its previous staged objects first, even when
    /// there is nothing new to upload.
    pub async fn upload(
        &self,
        target: &TableTarget,
        files: &[StagedFile],
    ) -> FlowResult<Vec<String>> {
        if target.dump_mode == DumpMode::Overwrite {
            self.clear_table(target).await?;
        }
        let mut uris = Vec::with_capacity(files.len());
        for file in files {
            let body = tokio::fs::read(&file.path)
                .await
                .map_err(|err| FlowError::io(&file.path, err))?;
            let object_name = format!("staging/{}", file.object_name);
            self.store
                .put_object(&self.bucket, &object_name, body, "text/csv")
                .await?;
            let uri = format!("gs://{}/{object_name}", self.bucket);
            info!("Uploaded {uri}.");
            uris.push(uri);
        }
        Ok(uris)
    }
}

pub fn partition_dir(date: NaiveDate) -> String {
    format!("{PARTITION_COLUMN}={}", date.format("%Y-%m-%d"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Serialize)]
    struct Row {
        role: &'static str,
        member: &'static str,
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
    }

    #[test]
    fn writes_rows_under_partition_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let target = TableTarget::new("datalake_gestao", "tables_bindings");
        let staged = writer
            .write(
                &target,
                date(),
                &[
                    Row {
                        role: "roles/viewer",
                        member: "user:a",
                    },
                    Row {
                        role: "roles/owner",
                        member: "user:b",
                    },
                ],
            )
            .unwrap()
            .unwrap();

        assert_eq!(staged.rows, 2);
        assert!(
            staged
                .object_name
                .starts_with("datalake_gestao/tables_bindings/data_particao=2024-03-09/")
        );
        let contents = std::fs::read_to_string(&staged.path).unwrap();
        assert_eq!(contents, "role,member\nroles/viewer,user:a\nroles/owner,user:b\n");
    }

    #[test]
    fn overwrite_clears_previous_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let append = TableTarget::new("d", "t");
        let first = writer
            .write(&append, date(), &[Row { role: "r", member: "m" }])
            .unwrap()
            .unwrap();

        let overwrite = append.clone().with_dump_mode(DumpMode::Overwrite);
        let second = writer
            .write(&overwrite, date(), &[Row { role: "r", member: "n" }])
            .unwrap()
            .unwrap();

        assert!(!first.path.exists());
        assert!(second.path.exists());
    }

    #[test]
    fn groups_rows_by_partition() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let rows = vec![("2024-03-10", "a"), ("2024-03-09", "b"), ("2024-03-10", "c")];
        let staged = writer
            .write_partitions(&TableTarget::new("d", "t"), &rows, |(day, _)| {
                NaiveDate::parse_from_str(day, "%Y-%m-%d").unwrap()
            })
            .unwrap();

        let summary: Vec<(String, usize)> = staged
            .iter()
            .map(|file| (file.partition.to_string(), file.rows))
            .collect();
        assert_eq!(
            summary,
            vec![("2024-03-09".to_string(), 1), ("2024-03-10".to_string(), 2)]
        );
    }

    #[derive(Default)]
    struct RecordingStore {
        objects: std::sync::Mutex<Vec<(String, String, String)>>,
    }

    impl RecordingStore {
        fn names(&self) -> Vec<String> {
            let objects = self.objects.lock().unwrap();
            objects.iter().map(|(_, name, _)| name.clone()).collect()
        }
    }

    #[async_trait]
    impl ObjectStore for RecordingStore {
        async fn put_object(
            &self,
            bucket: &str,
            object_name: &str,
            body: Vec<u8>,
            _content_type: &str,
        ) -> FlowResult<()> {
            self.objects.lock().unwrap().push((
                bucket.to_string(),
                object_name.to_string(),
                String::from_utf8(body).unwrap(),
            ));
            Ok(())
        }

        async fn list_objects(&self, bucket: &str, prefix: &str) -> FlowResult<Vec<String>> {
            let objects = self.objects.lock().unwrap();
            Ok(objects
                .iter()
                .filter(|(b, name, _)| b == bucket && name.starts_with(prefix))
                .map(|(_, name, _)| name.clone())
                .collect())
        }

        async fn delete_object(&self, bucket: &str, object_name: &str) -> FlowResult<()> {
            self.objects
                .lock()
                .unwrap()
                .retain(|(b, name, _)| !(b == bucket && name == object_name));
            Ok(())
        }
    }

    #[tokio::test]
    async fn uploads_under_staging_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let staged = writer
            .write(&TableTarget::new("d", "t"), date(), &[Row { role: "r", member: "m" }])
            .unwrap()
            .unwrap();

        let store = Arc::new(RecordingStore::default());
        let uploader = GcsUploader::new(store.clone(), "bucket");
        let uris = uploader
            .upload(&TableTarget::new("d", "t"), std::slice::from_ref(&staged))
            .await
            .unwrap();

        assert_eq!(uris, vec![format!("gs://bucket/staging/{}", staged.object_name)]);
        let objects = store.objects.lock().unwrap();
        assert_eq!(objects[0].0, "bucket");
        assert_eq!(objects[0].2, "role,member\nr,m\n");
    }

    fn overwrite_row(member: &'static str) -> [Row; 1] {
        [Row { role: "r", member }]
    }

    #[tokio::test]
    async fn overwrite_uploads_replace_remote_objects() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let store = Arc::new(RecordingStore::default());
        let uploader = GcsUploader::new(store.clone(), "bucket");
        let target = TableTarget::new("d", "t").with_dump_mode(DumpMode::Overwrite);
        let other = TableTarget::new("d", "other");

        let kept = writer.write(&other, date(), &overwrite_row("x")).unwrap().unwrap();
        uploader.upload(&other, std::slice::from_ref(&kept)).await.unwrap();
        for member in ["m", "n"] {
            let staged = writer.write(&target, date(), &overwrite_row(member)).unwrap().unwrap();
            uploader.upload(&target, std::slice::from_ref(&staged)).await.unwrap();
        }

        let names = store.names();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("staging/d/other/"));
        assert!(names[1].starts_with("staging/d/t/data_particao=2024-03-09/"));
        assert_eq!(store.objects.lock().unwrap()[1].2, "role,member\nr,n\n");
    }

    #[tokio::test]
    async fn overwrite_without_rows_still_clears_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let store = Arc::new(RecordingStore::default());
        let uploader = GcsUploader::new(store.clone(), "bucket");
        let append = TableTarget::new("d", "t");
        let staged = writer.write(&append, date(), &overwrite_row("m")).unwrap().unwrap();
        uploader.upload(&append, std::slice::from_ref(&staged)).await.unwrap();

        let overwrite = append.with_dump_mode(DumpMode::Overwrite);
        let none = writer.write_partitions::<Row, _>(&overwrite, &[], |_| date()).unwrap();
        let uris = uploader.upload(&overwrite, &none).await.unwrap();

        assert!(uris.is_empty());
        assert!(store.names().is_empty());
    }

    #[tokio::test]
    async fn append_uploads_keep_earlier_objects() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let store = Arc::new(RecordingStore::default());
        let uploader = GcsUploader::new(store.clone(), "bucket");
        let target = TableTarget::new("d", "t");
        for member in ["m", "n"] {
            let staged = writer.write(&target, date(), &overwrite_row(member)).unwrap().unwrap();
            uploader.upload(&target, std::slice::from_ref(&staged)).await.unwrap();
        }
        assert_eq!(store.names().len(), 2);
    }

    #[test]
    fn empty_rows_stage_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let writer = PartitionWriter::new(dir.path());
        let staged = writer
            .write::<Row>(&TableTarget::new("d", "t"), date(), &[])
            .unwrap();
        assert_eq!(staged, None);
    }
}
