//! Access to the note vault: the documents being synced and the store image kept next to them.
//!
//! Document paths are vault-relative and always use `/` as separator, whatever the platform.

use crate::error::SupertagError;
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    future::Future,
    io::{self, Write},
    path::{Component, Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};
use walkdir::WalkDir;

pub trait DocumentStore: Send + Sync + 'static {
    fn read_text(&self, path: &str)
        -> impl Future<Output = Result<String, SupertagError>> + Send;

    fn read_binary(
        &self,
        path: &str,
    ) -> impl Future<Output = Result<Vec<u8>, SupertagError>> + Send;

    /// Write `bytes`, creating or replacing the document at `path`.
    fn write_binary(
        &self,
        path: &str,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), SupertagError>> + Send;

    fn exists(&self, path: &str) -> impl Future<Output = Result<bool, SupertagError>> + Send;

    /// Every document path in the vault, sorted. Hidden entries are skipped.
    fn list_documents(&self) -> impl Future<Output = Result<Vec<String>, SupertagError>> + Send;
}

/// True when the extension of `path` is one of `extensions` (compared without the dot,
/// case-insensitively).
pub fn has_extension(path: &str, extensions: &[String]) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Replace `target` with what `fill` writes into a sibling temporary file, renamed over the
/// target once complete. Readers see the old content or the new one, never a prefix of it.
fn replace_file<F>(target: &Path, fill: F) -> io::Result<()>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let dir = target.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    // Hidden name, so an interrupted write never shows up as a document.
    let mut staged = tempfile::Builder::new()
        .prefix(".supertag-write")
        .tempfile_in(dir)?;
    fill(staged.as_file_mut())?;
    staged.as_file().sync_all()?;
    staged.persist(target).map_err(|e| e.error)?;
    Ok(())
}

/// Documents on the local filesystem below a root directory.
#[derive(Debug, Clone)]
pub struct FsDocumentStore {
    root: PathBuf,
}

impl FsDocumentStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> FsDocumentStore {
        FsDocumentStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute location of a vault path. Paths escaping the root are refused.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, SupertagError> {
        let relative = Path::new(path);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(SupertagError::PermissionDenied);
        }
        Ok(self.root.join(relative))
    }

    /// Vault path of an absolute location below the root.
    pub fn relativize(&self, absolute: &Path) -> Result<String, SupertagError> {
        let relative = absolute.strip_prefix(&self.root)?;
        let parts: Vec<String> = relative
            .components()
            .filter_map(|c| match c {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        Ok(parts.join("/"))
    }
}

impl DocumentStore for FsDocumentStore {
    async fn read_text(&self, path: &str) -> Result<String, SupertagError> {
        let bytes = tokio::fs::read(self.resolve(path)?).await?;
        Ok(String::from_utf8(bytes)?)
    }

    async fn read_binary(&self, path: &str) -> Result<Vec<u8>, SupertagError> {
        Ok(tokio::fs::read(self.resolve(path)?).await?)
    }

    async fn write_binary(&self, path: &str, bytes: &[u8]) -> Result<(), SupertagError> {
        let target = self.resolve(path)?;
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || replace_file(&target, |file| file.write_all(&bytes)))
            .await
            .map_err(|e| SupertagError::Io(format!("write of {path:?} did not finish: {e}")))??;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, SupertagError> {
        Ok(tokio::fs::try_exists(self.resolve(path)?).await?)
    }

    async fn list_documents(&self) -> Result<Vec<String>, SupertagError> {
        let mut paths = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !is_hidden(&entry.file_name().to_string_lossy())
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("skipping unreadable vault entry: {e}");
                    continue;
                }
            };
            if entry.file_type().is_file() {
                paths.push(self.relativize(entry.path())?);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// A vault held in memory. Clones share their contents, so a test can keep one clone and hand
/// another to the sync service.
#[derive(Debug, Clone, Default)]
pub struct MemoryDocumentStore {
    documents: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
    unreadable: Arc<RwLock<BTreeSet<String>>>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl MemoryDocumentStore {
    pub fn new() -> MemoryDocumentStore {
        MemoryDocumentStore::default()
    }

    pub fn insert_text(&self, path: &str, text: &str) {
        self.documents
            .write()
            .insert(path.to_string(), text.as_bytes().to_vec());
    }

    pub fn insert_binary(&self, path: &str, bytes: Vec<u8>) {
        self.documents.write().insert(path.to_string(), bytes);
    }

    pub fn remove(&self, path: &str) -> Option<Vec<u8>> {
        self.documents.write().remove(path)
    }

    pub fn rename(&self, from: &str, to: &str) -> bool {
        let mut documents = self.documents.write();
        match documents.remove(from) {
            Some(bytes) => {
                documents.insert(to.to_string(), bytes);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.documents.read().get(path).cloned()
    }

    /// Make reads of `path` fail with an I/O error until switched back.
    pub fn set_unreadable(&self, path: &str, unreadable: bool) {
        let mut paths = self.unreadable.write();
        if unreadable {
            paths.insert(path.to_string());
        } else {
            paths.remove(path);
        }
    }

    /// Make every subsequent `write_binary` fail with an I/O error until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `write_binary` calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl DocumentStore for MemoryDocumentStore {
    async fn read_text(&self, path: &str) -> Result<String, SupertagError> {
        let bytes = self.read_binary(path).await?;
        Ok(String::from_utf8(bytes)?)
    }

    async fn read_binary(&self, path: &str) -> Result<Vec<u8>, SupertagError> {
        if self.unreadable.read().contains(path) {
            return Err(SupertagError::Io(format!("read of {path:?} refused")));
        }
        self.get(path)
            .ok_or_else(|| SupertagError::NotFound(format!("no document at {path:?}")))
    }

    async fn write_binary(&self, path: &str, bytes: &[u8]) -> Result<(), SupertagError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SupertagError::Io(format!("write to {path:?} refused")));
        }
        self.insert_binary(path, bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, SupertagError> {
        Ok(self.documents.read().contains_key(path))
    }

    async fn list_documents(&self) -> Result<Vec<String>, SupertagError> {
        Ok(self
            .documents
            .read()
            .keys()
            .filter(|path| !path.split('/').any(is_hidden))
            .cloned()
            .collect())
    }
}
