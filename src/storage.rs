//! Object-store boundary.
//!
//! The engine only talks to storage through [`ObjectStore`], which models the
//! handful of object-store primitives it needs: metadata lookup, streaming
//! reads, whole-object and streaming writes, conditional create, listing,
//! deletion and rename-based publish.
//!
//! [`LocalObjectStore`] maps `bucket/key` onto `<root>/<bucket>/<key>` on the
//! local filesystem. Every write lands in a temporary file next to its target
//! and is renamed into place, so readers never observe a partial object.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Read, Write},
    path::{Component, Path, PathBuf},
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

const TEMP_MARKER: &str = ".tmp-";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {path}")]
    NotFound { path: String },

    /// Conditional create found an existing object.
    #[error("object already exists: {path}")]
    AlreadyExists { path: String },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }

    fn io(path: &Path, source: io::Error) -> Self {
        let path = path.display().to_string();
        match source.kind() {
            io::ErrorKind::NotFound => StorageError::NotFound { path },
            io::ErrorKind::AlreadyExists => StorageError::AlreadyExists { path },
            _ => StorageError::Io { path, source },
        }
    }
}

impl From<io::Error> for StorageError {
    fn from(source: io::Error) -> Self {
        StorageError::Io {
            path: "<stream>".to_string(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    /// Hex SHA-256 of the object content.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}

/// Streaming writer for one object; nothing is visible until [`finish`].
///
/// Dropping the writer without finishing discards the object.
///
/// [`finish`]: ObjectWriter::finish
pub trait ObjectWriter: Write + Send {
    /// Publishes the object and returns its size in bytes.
    fn finish(self: Box<Self>) -> StorageResult<u64>;
}

pub trait ObjectStore: Send + Sync {
    fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta>;

    fn open(&self, bucket: &str, key: &str) -> StorageResult<Box<dyn Read + Send>>;

    fn put(&self, bucket: &str, key: &str, contents: &[u8]) -> StorageResult<()>;

    fn create(&self, bucket: &str, key: &str) -> StorageResult<Box<dyn ObjectWriter>>;

    /// Keys under `prefix`, sorted.
    fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>>;

    /// Removes one object; a missing object is not an error.
    fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Removes every object under `prefix` and returns how many were removed.
    fn delete_prefix(&self, bucket: &str, prefix: &str) -> StorageResult<usize> {
        let keys = self.list(bucket, prefix)?;
        for key in &keys {
            self.delete(bucket, key)?;
        }
        Ok(keys.len())
    }

    /// Moves an object, replacing any existing object at `to`.
    fn rename(&self, bucket: &str, from: &str, to: &str) -> StorageResult<()>;
}

/// Guard that removes a temporary file on drop unless disarmed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalObjectStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> StorageResult<PathBuf> {
        if bucket.is_empty() || bucket.contains(['/', '\\']) || bucket.starts_with('.') {
            return Err(StorageError::InvalidKey(bucket.to_string()));
        }
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> StorageResult<PathBuf> {
        let relative = Path::new(key);
        let valid = !key.is_empty()
            && !key.ends_with('/')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !valid {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.bucket_dir(bucket)?.join(relative))
    }

    fn temp_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!(".{name}{TEMP_MARKER}{}", uuid::Uuid::new_v4()))
    }

    /// Creates the parent directories of `path`. Retries when a concurrent
    /// prune removes an ancestor between the individual `mkdir` calls.
    fn ensure_parent(path: &Path) -> StorageResult<()> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };
        let mut attempts = 0;
        loop {
            match fs::create_dir_all(parent) {
                Ok(()) => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::NotFound && attempts < 3 => attempts += 1,
                Err(err) => return Err(StorageError::io(parent, err)),
            }
        }
    }

    fn write_temp(target: &Path, contents: &[u8]) -> StorageResult<TempFileGuard> {
        Self::ensure_parent(target)?;
        let tmp = Self::temp_path(target);
        let guard = TempFileGuard::new(tmp.clone());
        let mut file = File::create(&tmp).map_err(|err| StorageError::io(&tmp, err))?;
        file.write_all(contents)
            .and_then(|_| file.sync_all())
            .map_err(|err| StorageError::io(&tmp, err))?;
        Ok(guard)
    }

    /// Removes now-empty directories from `start` up to, not including, `stop`.
    fn prune_empty_dirs(start: Option<&Path>, stop: &Path) {
        let mut current = start;
        while let Some(dir) = current {
            if dir == stop || !dir.starts_with(stop) || fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    fn walk(dir: &Path, base: &Path, out: &mut Vec<String>) -> StorageResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::io(dir, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| StorageError::io(dir, err))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|err| StorageError::io(&path, err))?;
            if file_type.is_dir() {
                Self::walk(&path, base, out)?;
            } else if !entry.file_name().to_string_lossy().contains(TEMP_MARKER)
                && let Ok(relative) = path.strip_prefix(base)
            {
                let key = relative
                    .components()
                    .map(|component| component.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                out.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectMeta> {
        let path = self.object_path(bucket, key)?;
        let metadata = fs::metadata(&path).map_err(|err| StorageError::io(&path, err))?;
        if !metadata.is_file() {
            return Err(StorageError::NotFound {
                path: path.display().to_string(),
            });
        }
        let file = File::open(&path).map_err(|err| StorageError::io(&path, err))?;
        let mut reader = BufReader::new(file);
        let mut hasher = Sha256::new();
        io::copy(&mut reader, &mut hasher).map_err(|err| StorageError::io(&path, err))?;
        let last_modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(ObjectMeta {
            size: metadata.len(),
            etag: format!("{:x}", hasher.finalize()),
            last_modified,
        })
    }

    fn open(&self, bucket: &str, key: &str) -> StorageResult<Box<dyn Read + Send>> {
        let path = self.object_path(bucket, key)?;
        let file = File::open(&path).map_err(|err| StorageError::io(&path, err))?;
        Ok(Box::new(file))
    }

    fn put(&self, bucket: &str, key: &str, contents: &[u8]) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        let mut guard = Self::write_temp(&path, contents)?;
        fs::rename(&guard.path, &path).map_err(|err| StorageError::io(&path, err))?;
        guard.disarm();
        Ok(())
    }

    fn create(&self, bucket: &str, key: &str) -> StorageResult<Box<dyn ObjectWriter>> {
        let target = self.object_path(bucket, key)?;
        Self::ensure_parent(&target)?;
        let tmp = Self::temp_path(&target);
        let guard = TempFileGuard::new(tmp.clone());
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(|err| StorageError::io(&tmp, err))?;
        Ok(Box::new(LocalObjectWriter {
            writer: BufWriter::new(file),
            target,
            guard,
            written: 0,
        }))
    }

    fn list(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let base = self.bucket_dir(bucket)?;
        // Walk from the deepest directory fully named by the prefix.
        let start = match prefix.rfind('/') {
            Some(idx) => base.join(&prefix[..idx]),
            None => base.clone(),
        };
        let mut keys = Vec::new();
        Self::walk(&start, &base, &mut keys)?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let path = self.object_path(bucket, key)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::io(&path, err)),
        }
        Self::prune_empty_dirs(path.parent(), &self.bucket_dir(bucket)?);
        Ok(())
    }

    fn rename(&self, bucket: &str, from: &str, to: &str) -> StorageResult<()> {
        let source = self.object_path(bucket, from)?;
        let target = self.object_path(bucket, to)?;
        Self::ensure_parent(&target)?;
        fs::rename(&source, &target).map_err(|err| StorageError::io(&source, err))?;
        Self::prune_empty_dirs(source.parent(), &self.bucket_dir(bucket)?);
        Ok(())
    }
}

struct LocalObjectWriter {
    writer: BufWriter<File>,
    target: PathBuf,
    guard: TempFileGuard,
    written: u64,
}

impl Write for LocalObjectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl ObjectWriter for LocalObjectWriter {
    fn finish(self: Box<Self>) -> StorageResult<u64> {
        let LocalObjectWriter {
            writer,
            target,
            mut guard,
            written,
        } = *self;
        let file = writer
            .into_inner()
            .map_err(|err| StorageError::io(&guard.path, err.into_error()))?;
        file.sync_all()
            .map_err(|err| StorageError::io(&guard.path, err))?;
        fs::rename(&guard.path, &target).map_err(|err| StorageError::io(&target, err))?;
        guard.disarm();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalObjectStore) {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalObjectStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn put_then_head_reports_size_and_content_hash() {
        let (_dir, store) = store();
        store.put("raw", "in/a.csv", b"id\n1\n").unwrap();
        let meta = store.head("raw", "in/a.csv").unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.etag.len(), 64);

        store.put("raw", "in/b.csv", b"id\n1\n").unwrap();
        assert_eq!(store.head("raw", "in/b.csv").unwrap().etag, meta.etag);
    }

    #[test]
    fn missing_objects_are_not_found() {
        let (_dir, store) = store();
        assert!(store.head("raw", "nope.csv").unwrap_err().is_not_found());
        assert!(store.open("raw", "nope.csv").is_err());
        store.delete("raw", "nope.csv").expect("delete is idempotent");
    }

    #[test]
    fn unfinished_writers_leave_nothing_behind() {
        let (_dir, store) = store();
        {
            let mut writer = store.create("b", "t/part-00000.parquet").unwrap();
            writer.write_all(b"partial").unwrap();
        }
        assert!(store.list("b", "").unwrap().is_empty());

        let mut writer = store.create("b", "t/part-00000.parquet").unwrap();
        writer.write_all(b"complete").unwrap();
        assert_eq!(writer.finish().unwrap(), 8);
        assert_eq!(store.list("b", "t/").unwrap(), vec!["t/part-00000.parquet"]);
    }

    #[test]
    fn list_filters_by_prefix_and_sorts() {
        let (_dir, store) = store();
        for key in ["t/b.parquet", "t/a.parquet", "tx/c.parquet", "u/d.parquet"] {
            store.put("b", key, b"x").unwrap();
        }
        assert_eq!(
            store.list("b", "t/").unwrap(),
            vec!["t/a.parquet", "t/b.parquet"]
        );
        assert_eq!(store.list("b", "t").unwrap().len(), 3);
        assert!(store.list("other", "").unwrap().is_empty());
    }

    #[test]
    fn rename_and_delete_prefix_move_and_clear_objects() {
        let (_dir, store) = store();
        store.put("b", "_staging/j1/part-00000.parquet", b"x").unwrap();
        store
            .rename("b", "_staging/j1/part-00000.parquet", "t/part-00000.parquet")
            .unwrap();
        assert_eq!(store.list("b", "").unwrap(), vec!["t/part-00000.parquet"]);
        assert_eq!(store.delete_prefix("b", "t/").unwrap(), 1);
        assert!(store.list("b", "").unwrap().is_empty());
    }

    #[test]
    fn keys_cannot_escape_the_bucket() {
        let (_dir, store) = store();
        assert!(matches!(
            store.put("b", "../escape.csv", b"x"),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(store.put("b", "/abs.csv", b"x").is_err());
        assert!(store.put("../b", "a.csv", b"x").is_err());
    }
}
