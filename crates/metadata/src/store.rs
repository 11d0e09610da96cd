//! Metadata store trait and the JSON file implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{FileRecord, GroupRecord, RecordSet};
use crate::repos::{FileRepo, GroupRepo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + GroupRepo + Send + Sync {
    /// Whether a code is used by any file or group.
    async fn code_exists(&self, code: &str) -> MetadataResult<bool>;

    /// Check that the backing file is writable.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// In-memory view of the record set with code indexes.
#[derive(Default)]
struct Records {
    set: RecordSet,
    files: HashMap<String, usize>,
    groups: HashMap<String, usize>,
}

impl Records {
    /// Index a loaded record set. Later records reusing a code are dropped
    /// and the first occurrence wins.
    fn from_set(set: RecordSet) -> Self {
        let mut records = Self::default();
        for file in set.files {
            if records.files.contains_key(&file.code) {
                warn!(code = %file.code, "Duplicate file code in record file, keeping the first");
                continue;
            }
            records.files.insert(file.code.clone(), records.set.files.len());
            records.set.files.push(file);
        }
        for group in set.groups {
            if records.contains(&group.code) {
                warn!(code = %group.code, "Duplicate group code in record file, keeping the first");
                continue;
            }
            records.groups.insert(group.code.clone(), records.set.groups.len());
            records.set.groups.push(group);
        }
        records
    }

    fn contains(&self, code: &str) -> bool {
        self.files.contains_key(code) || self.groups.contains_key(code)
    }

    fn file(&self, code: &str) -> Option<&FileRecord> {
        self.files.get(code).map(|&i| &self.set.files[i])
    }

    fn group(&self, code: &str) -> Option<&GroupRecord> {
        self.groups.get(code).map(|&i| &self.set.groups[i])
    }
}

/// Metadata store persisted as a single JSON document.
///
/// The whole document is rewritten on every commit, through a temp file and
/// a rename, while the record lock is held. A failed write rolls the
/// in-memory change back so memory never runs ahead of disk.
pub struct JsonStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl JsonStore {
    /// Open the store at `path`. A missing file is an empty store.
    pub async fn open(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }

        let set = match fs::read(&path).await {
            Ok(data) => serde_json::from_slice::<RecordSet>(&data)?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(path = %path.display(), "No record file yet, starting empty");
                RecordSet::default()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            files = set.files.len(),
            groups = set.groups.len(),
            "Loaded metadata records"
        );

        Ok(Self {
            path,
            records: Mutex::new(Records::from_set(set)),
        })
    }

    async fn save(&self, set: &RecordSet) -> MetadataResult<()> {
        let data = serde_json::to_vec_pretty(set)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "metadata.json".to_string());
        let temp_path = self
            .path
            .with_file_name(format!("{file_name}.tmp.{}", Uuid::new_v4()));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }
        debug!(path = %self.path.display(), bytes = data.len(), "Saved metadata records");
        Ok(())
    }
}

#[async_trait]
impl FileRepo for JsonStore {
    async fn insert_file(&self, record: &FileRecord) -> MetadataResult<()> {
        let mut records = self.records.lock().await;
        if records.contains(&record.code) {
            return Err(MetadataError::AlreadyExists(record.code.clone()));
        }

        records.set.files.push(record.clone());
        if let Err(e) = self.save(&records.set).await {
            records.set.files.pop();
            warn!(code = %record.code, error = %e, "Failed to persist file record");
            return Err(e);
        }
        let index = records.set.files.len() - 1;
        records.files.insert(record.code.clone(), index);
        Ok(())
    }

    async fn get_file(&self, code: &str) -> MetadataResult<Option<FileRecord>> {
        Ok(self.records.lock().await.file(code).cloned())
    }

    async fn count_files(&self) -> MetadataResult<usize> {
        Ok(self.records.lock().await.set.files.len())
    }
}

#[async_trait]
impl GroupRepo for JsonStore {
    async fn insert_group(&self, record: &GroupRecord) -> MetadataResult<Vec<FileRecord>> {
        if record.files.is_empty() {
            return Err(MetadataError::InvalidParams(
                "a group needs at least one file".to_string(),
            ));
        }

        let mut records = self.records.lock().await;
        if records.contains(&record.code) {
            return Err(MetadataError::AlreadyExists(record.code.clone()));
        }

        let members = record
            .files
            .iter()
            .map(|code| {
                records
                    .file(code)
                    .cloned()
                    .ok_or_else(|| MetadataError::FileNotFound(code.clone()))
            })
            .collect::<MetadataResult<Vec<_>>>()?;

        records.set.groups.push(record.clone());
        if let Err(e) = self.save(&records.set).await {
            records.set.groups.pop();
            warn!(code = %record.code, error = %e, "Failed to persist group record");
            return Err(e);
        }
        let index = records.set.groups.len() - 1;
        records.groups.insert(record.code.clone(), index);
        Ok(members)
    }

    async fn get_group(&self, code: &str) -> MetadataResult<Option<GroupRecord>> {
        Ok(self.records.lock().await.group(code).cloned())
    }
}

#[async_trait]
impl MetadataStore for JsonStore {
    async fn code_exists(&self, code: &str) -> MetadataResult<bool> {
        Ok(self.records.lock().await.contains(code))
    }

    async fn health_check(&self) -> MetadataResult<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let meta = fs::metadata(&dir).await?;
        if meta.permissions().readonly() {
            return Err(MetadataError::Config(format!(
                "metadata directory is read-only: {}",
                dir.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;

    fn file(code: &str) -> FileRecord {
        FileRecord {
            code: code.to_string(),
            filename: format!("{code}.bin"),
            stored_name: format!("{code}-stored.bin"),
            mime_type: "application/octet-stream".to_string(),
            original_mime_type: None,
            original_size: 3,
            size: 3,
            compressed: false,
            compression_ratio: None,
            created_at: OffsetDateTime::now_utc(),
            chunked: false,
        }
    }

    fn group(code: &str, files: &[&str]) -> GroupRecord {
        GroupRecord {
            code: code.to_string(),
            name: "test group".to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            created_at: OffsetDateTime::now_utc(),
            file_count: files.len(),
        }
    }

    async fn open_temp() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("metadata.json")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_file_is_empty_store() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.count_files().await.unwrap(), 0);
        assert!(store.get_file("AAAAAA").await.unwrap().is_none());
        assert!(store.get_group("AAAAAA").await.unwrap().is_none());
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_and_get_file() {
        let (_dir, store) = open_temp().await;
        store.insert_file(&file("AAAAAA")).await.unwrap();

        let got = store.get_file("AAAAAA").await.unwrap().unwrap();
        assert_eq!(got.filename, "AAAAAA.bin");
        assert_eq!(got.stored_name, "AAAAAA-stored.bin");
        assert!(store.code_exists("AAAAAA").await.unwrap());
        assert!(!store.code_exists("BBBBBB").await.unwrap());
        assert_eq!(store.count_files().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_codes_share_one_namespace() {
        let (_dir, store) = open_temp().await;
        store.insert_file(&file("AAAAAA")).await.unwrap();

        assert!(matches!(
            store.insert_file(&file("AAAAAA")).await,
            Err(MetadataError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.insert_group(&group("AAAAAA", &["AAAAAA"])).await,
            Err(MetadataError::AlreadyExists(_))
        ));

        store.insert_group(&group("BBBBBB", &["AAAAAA"])).await.unwrap();
        assert!(matches!(
            store.insert_file(&file("BBBBBB")).await,
            Err(MetadataError::AlreadyExists(_))
        ));
        assert!(store.code_exists("BBBBBB").await.unwrap());
    }

    #[tokio::test]
    async fn test_group_reports_first_missing_member() {
        let (_dir, store) = open_temp().await;
        store.insert_file(&file("AAAAAA")).await.unwrap();

        match store
            .insert_group(&group("GGGGGG", &["AAAAAA", "MISSNG", "ALSOMS"]))
            .await
        {
            Err(MetadataError::FileNotFound(code)) => assert_eq!(code, "MISSNG"),
            other => panic!("expected FileNotFound, got {other:?}"),
        }
        assert!(store.get_group("GGGGGG").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_group_members_in_order() {
        let (_dir, store) = open_temp().await;
        store.insert_file(&file("AAAAAA")).await.unwrap();
        store.insert_file(&file("BBBBBB")).await.unwrap();

        let members = store
            .insert_group(&group("GGGGGG", &["BBBBBB", "AAAAAA"]))
            .await
            .unwrap();
        let codes: Vec<_> = members.iter().map(|f| f.code.as_str()).collect();
        assert_eq!(codes, vec!["BBBBBB", "AAAAAA"]);
    }

    #[tokio::test]
    async fn test_empty_group_rejected() {
        let (_dir, store) = open_temp().await;
        assert!(matches!(
            store.insert_group(&group("GGGGGG", &[])).await,
            Err(MetadataError::InvalidParams(_))
        ));
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metadata.json");
        {
            let store = JsonStore::open(&path).await.unwrap();
            store.insert_file(&file("AAAAAA")).await.unwrap();
            store.insert_group(&group("GGGGGG", &["AAAAAA"])).await.unwrap();
        }

        let store = JsonStore::open(&path).await.unwrap();
        assert!(store.get_file("AAAAAA").await.unwrap().is_some());
        let group = store.get_group("GGGGGG").await.unwrap().unwrap();
        assert_eq!(group.files, vec!["AAAAAA"]);

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["files"][0]["code"], "AAAAAA");
        assert_eq!(raw["groups"][0]["fileCount"], 1);
    }

    #[tokio::test]
    async fn test_duplicate_codes_keep_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        let mut second = file("AAAAAA");
        second.filename = "second.bin".to_string();
        let set = RecordSet {
            files: vec![file("AAAAAA"), second, file("BBBBBB")],
            groups: vec![group("BBBBBB", &["AAAAAA"]), group("GGGGGG", &["AAAAAA"])],
        };
        std::fs::write(&path, serde_json::to_vec(&set).unwrap()).unwrap();

        let store = JsonStore::open(&path).await.unwrap();
        assert_eq!(store.count_files().await.unwrap(), 2);
        assert_eq!(
            store.get_file("AAAAAA").await.unwrap().unwrap().filename,
            "AAAAAA.bin"
        );
        assert!(store.get_group("BBBBBB").await.unwrap().is_none());
        assert!(store.get_group("GGGGGG").await.unwrap().is_some());

        store.insert_file(&file("CCCCCC")).await.unwrap();
        let reopened = JsonStore::open(&path).await.unwrap();
        assert_eq!(reopened.count_files().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            JsonStore::open(&path).await,
            Err(MetadataError::Serialization(_))
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_failed_save_rolls_back() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let records_dir = dir.path().join("records");
        let store = JsonStore::open(records_dir.join("metadata.json"))
            .await
            .unwrap();

        std::fs::set_permissions(&records_dir, std::fs::Permissions::from_mode(0o500)).unwrap();
        let result = store.insert_file(&file("AAAAAA")).await;
        std::fs::set_permissions(&records_dir, std::fs::Permissions::from_mode(0o700)).unwrap();

        // Root ignores directory permissions; only assert rollback when the write failed.
        if result.is_err() {
            assert!(store.get_file("AAAAAA").await.unwrap().is_none());
            assert_eq!(store.count_files().await.unwrap(), 0);
            store.insert_file(&file("AAAAAA")).await.unwrap();
        }
        assert!(store.get_file("AAAAAA").await.unwrap().is_some());
    }
}
