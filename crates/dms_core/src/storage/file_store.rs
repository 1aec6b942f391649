//! Generic-file backend storing domains and attributes in one JSON document.
//!
//! # Invariants
//! - Writes stay in memory until a committing close.
//! - A commit replaces the file atomically (temp file + rename in the same
//!   directory), so readers never see a partial document.

use crate::model::item::{DomainRange, ValueType, Values};
use crate::storage::{
    file_change_time, file_is_writable, OpenMode, StorageError, StorageFactory, StorageKind,
    StorageManager, StorageResult, TileRange,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tempfile::NamedTempFile;

/// On-disk layout of one generic file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    #[serde(default)]
    pub domains: BTreeMap<String, DomainRange>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Values>,
}

impl FileDocument {
    pub fn load(location: &Path) -> StorageResult<Self> {
        let text = match std::fs::read_to_string(location) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(err) => return Err(err.into()),
        };
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Atomically replaces `location` with this document.
    pub fn persist(&self, location: &Path) -> StorageResult<()> {
        let parent = match location.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut file = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        file.persist(location).map_err(|err| StorageError::Io(err.error))?;
        Ok(())
    }
}

pub struct FileStorage {
    location: PathBuf,
    mode: Option<OpenMode>,
    document: FileDocument,
    dirty: bool,
}

impl FileStorage {
    pub fn new(location: impl Into<PathBuf>) -> Self {
        Self {
            location: location.into(),
            mode: None,
            document: FileDocument::default(),
            dirty: false,
        }
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.mode.is_none() {
            return Err(StorageError::NotOpen(self.location.clone()));
        }
        Ok(())
    }

    fn ensure_write(&self) -> StorageResult<()> {
        match self.mode {
            Some(OpenMode::Write) => Ok(()),
            Some(OpenMode::Read) => Err(StorageError::ReadOnly(self.location.clone())),
            None => Err(StorageError::NotOpen(self.location.clone())),
        }
    }

    fn missing(&self, role: &str) -> StorageError {
        StorageError::MissingRole {
            location: self.location.clone(),
            role: role.to_string(),
        }
    }
}

impl StorageManager for FileStorage {
    fn kind(&self) -> StorageKind {
        StorageKind::GenericFile
    }

    fn location(&self) -> &Path {
        &self.location
    }

    fn open_for_read(&mut self) -> StorageResult<()> {
        if !self.location.exists() {
            return Err(StorageError::NotFound(self.location.clone()));
        }
        self.document = FileDocument::load(&self.location)?;
        self.mode = Some(OpenMode::Read);
        Ok(())
    }

    fn open_for_write(&mut self) -> StorageResult<()> {
        self.document = FileDocument::load(&self.location)?;
        self.mode = Some(OpenMode::Write);
        self.dirty = false;
        Ok(())
    }

    fn close_storage(&mut self, commit: bool) -> StorageResult<()> {
        let mode = self.mode.take();
        let dirty = std::mem::take(&mut self.dirty);
        let document = std::mem::take(&mut self.document);
        if commit && dirty && mode == Some(OpenMode::Write) {
            document.persist(&self.location)?;
            info!(
                "event=file_commit module=storage status=ok location={} domains={} attributes={}",
                self.location.display(),
                document.domains.len(),
                document.attributes.len()
            );
        }
        Ok(())
    }

    fn read_attribute(
        &mut self,
        role: &str,
        tile: TileRange,
        value_type: ValueType,
    ) -> StorageResult<Values> {
        self.ensure_open()?;
        let values = self
            .document
            .attributes
            .get(role)
            .ok_or_else(|| self.missing(role))?;
        if values.value_type() != value_type {
            return Err(StorageError::TypeMismatch {
                role: role.to_string(),
                expected: value_type,
                actual: values.value_type().to_string(),
            });
        }
        Ok(values.slice(tile.start as usize, tile.len as usize))
    }

    fn write_attribute(&mut self, role: &str, values: &Values) -> StorageResult<()> {
        self.ensure_write()?;
        self.document
            .attributes
            .insert(role.to_string(), values.clone());
        self.dirty = true;
        Ok(())
    }

    fn read_domain_range(&mut self, role: &str) -> StorageResult<DomainRange> {
        self.ensure_open()?;
        self.document
            .domains
            .get(role)
            .copied()
            .ok_or_else(|| self.missing(role))
    }

    fn write_domain_range(&mut self, role: &str, range: DomainRange) -> StorageResult<()> {
        self.ensure_write()?;
        self.document.domains.insert(role.to_string(), range);
        self.dirty = true;
        Ok(())
    }

    fn external_change_time(&self) -> StorageResult<Option<SystemTime>> {
        file_change_time(&self.location)
    }
}

/// Factory for `StorageKind::GenericFile`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStorageFactory;

impl StorageFactory for FileStorageFactory {
    fn kind(&self) -> StorageKind {
        StorageKind::GenericFile
    }

    fn create(&self, location: &Path) -> StorageResult<Box<dyn StorageManager>> {
        Ok(Box::new(FileStorage::new(location)))
    }

    fn does_exist(&self, location: &Path) -> bool {
        location.is_file()
    }

    fn is_writable(&self, location: &Path) -> bool {
        file_is_writable(location)
    }
}

#[cfg(test)]
mod tests {
    use super::{FileDocument, FileStorage};
    use crate::model::item::{DomainRange, ValueType, Values};
    use crate::storage::{StorageError, StorageManager, TileRange};

    #[test]
    fn committed_writes_are_readable_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("data.json");

        let mut writer = FileStorage::new(&location);
        writer.open_for_write().expect("open write");
        writer
            .write_domain_range("U", DomainRange::new(3))
            .expect("write domain");
        writer
            .write_attribute("A", &Values::Int32(vec![10, 20, 30]))
            .expect("write attribute");
        writer.close_storage(true).expect("commit");

        let mut reader = FileStorage::new(&location);
        reader.open_for_read().expect("open read");
        assert_eq!(
            reader.read_domain_range("U").expect("domain"),
            DomainRange::new(3)
        );
        let tile = TileRange {
            index: 1,
            start: 1,
            len: 2,
        };
        assert_eq!(
            reader
                .read_attribute("A", tile, ValueType::Int32)
                .expect("attribute"),
            Values::Int32(vec![20, 30])
        );
        reader.close_storage(false).expect("close");
    }

    #[test]
    fn rollback_leaves_file_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("data.json");

        let mut writer = FileStorage::new(&location);
        writer.open_for_write().expect("open write");
        writer
            .write_attribute("A", &Values::Bool(vec![true]))
            .expect("write");
        writer.close_storage(false).expect("rollback");
        assert!(!location.exists());
    }

    #[test]
    fn read_reports_missing_role_and_type_mismatch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let location = dir.path().join("data.json");
        let mut document = FileDocument::default();
        document
            .attributes
            .insert("A".to_string(), Values::Text(vec!["x".to_string()]));
        document.persist(&location).expect("seed");

        let mut reader = FileStorage::new(&location);
        reader.open_for_read().expect("open");
        let err = reader
            .read_attribute("B", TileRange::whole(1), ValueType::Text)
            .expect_err("missing role");
        assert!(matches!(err, StorageError::MissingRole { .. }));
        let err = reader
            .read_attribute("A", TileRange::whole(1), ValueType::Int32)
            .expect_err("type mismatch");
        assert!(matches!(err, StorageError::TypeMismatch { .. }));
    }

    #[test]
    fn operations_require_open_storage() {
        let mut storage = FileStorage::new("/nonexistent/data.json");
        let err = storage
            .read_domain_range("U")
            .expect_err("closed storage must fail");
        assert!(matches!(err, StorageError::NotOpen(_)));
        let err = storage.open_for_read().expect_err("missing file");
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
