use ferrite::logging;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Failures surfaced to the requester with a stable reason string.
#[derive(Debug, PartialEq, Eq)]
pub enum FileError {
    WriteLimitExceeded,
    StorageQuotaExceeded,
    NotFound,
    OutsideSandbox,
    Io(String),
}

impl FileError {
    pub fn reason(&self) -> &'static str {
        match self {
            FileError::WriteLimitExceeded => "write_limit_exceeded",
            FileError::StorageQuotaExceeded => "storage_quota_exceeded",
            FileError::NotFound => "file-not-found",
            FileError::OutsideSandbox => "path-outside-sandbox",
            FileError::Io(_) => "io-error",
        }
    }
}

impl From<io::Error> for FileError {
    fn from(error: io::Error) -> FileError {
        if error.kind() == io::ErrorKind::NotFound {
            FileError::NotFound
        } else {
            FileError::Io(error.to_string())
        }
    }
}

/// The sandboxed file store. All paths resolve under the configured root;
/// writes respect a per-write cap and a total storage quota.
pub struct FileStore {
    root: PathBuf,
    write_max_bytes: usize,
    storage_quota_bytes: u64,
    bytes_used: u64,
    write_limit_rejections: u64,
    storage_limit_rejections: u64,
    log: logging::Logger,
}

impl FileStore {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        root: PathBuf,
        write_max_bytes: usize,
        storage_quota_bytes: u64,
        log: L,
    ) -> FileStore {
        let store_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let mut store = FileStore {
            root,
            write_max_bytes,
            storage_quota_bytes,
            bytes_used: 0,
            write_limit_rejections: 0,
            storage_limit_rejections: 0,
            log: store_log,
        };

        if let Err(error) = fs::create_dir_all(&store.root) {
            logging::warn!(store.log, "sandbox root not creatable";
                           "root" => %store.root.display(),
                           "error" => %error);
        }
        store.bytes_used = store.measure_usage(&store.root.clone());

        store
    }

    #[inline]
    pub fn bytes_used(&self) -> u64 {
        self.bytes_used
    }

    #[inline]
    pub fn write_limit_rejections(&self) -> u64 {
        self.write_limit_rejections
    }

    #[inline]
    pub fn storage_limit_rejections(&self) -> u64 {
        self.storage_limit_rejections
    }

    /// Whole-file write. Replacing a file credits its old size back against
    /// the quota before the new size is charged.
    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<(), FileError> {
        if data.len() > self.write_max_bytes {
            self.write_limit_rejections += 1;
            return Err(FileError::WriteLimitExceeded);
        }

        let resolved = self.resolve(path)?;
        let existing = fs::metadata(&resolved).map(|meta| meta.len()).unwrap_or(0);

        let projected = self.bytes_used.saturating_sub(existing) + data.len() as u64;
        if projected > self.storage_quota_bytes {
            self.storage_limit_rejections += 1;
            return Err(FileError::StorageQuotaExceeded);
        }

        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&resolved, data)?;

        self.bytes_used = projected;
        logging::debug!(self.log, "file written";
                        "path" => path,
                        "bytes" => data.len(),
                        "bytes_used" => self.bytes_used);
        Ok(())
    }

    /// Reads the whole file; callers chunk it for the wire.
    pub fn read(&self, path: &str) -> Result<Vec<u8>, FileError> {
        let resolved = self.resolve(path)?;
        Ok(fs::read(&resolved)?)
    }

    pub fn remove(&mut self, path: &str) -> Result<(), FileError> {
        let resolved = self.resolve(path)?;
        let size = fs::metadata(&resolved).map(|meta| meta.len())?;

        fs::remove_file(&resolved)?;
        self.bytes_used = self.bytes_used.saturating_sub(size);
        Ok(())
    }

    /// Maps a request path into the sandbox. Leading slashes are stripped;
    /// parent traversal never escapes the root.
    fn resolve(&self, path: &str) -> Result<PathBuf, FileError> {
        let trimmed = path.trim_start_matches('/');
        if trimmed.is_empty() {
            return Err(FileError::OutsideSandbox);
        }

        let mut resolved = self.root.clone();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => (),
                _ => return Err(FileError::OutsideSandbox),
            }
        }

        Ok(resolved)
    }

    fn measure_usage(&self, dir: &Path) -> u64 {
        let mut total = 0;

        if let Ok(entries) = fs::read_dir(dir) {
            for entry in entries.filter_map(|entry| entry.ok()) {
                let path = entry.path();
                if path.is_dir() {
                    total += self.measure_usage(&path);
                } else if let Ok(meta) = entry.metadata() {
                    total += meta.len();
                }
            }
        }

        total
    }
}
