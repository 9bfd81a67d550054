use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{DEFAULT_HISTORY_CAP, HistoryStore, check_append};
use crate::HistoryEvent;
use crate::errors::StoreError;

/// Filesystem-backed store writing one JSONL file per instance.
///
/// Appends are flushed and `fsync`ed before returning, so a record the
/// runtime acted upon survives a crash. Writes within one process are
/// serialized; the conflict check guards against stale writers.
pub struct FsHistoryStore {
    root: PathBuf,
    cap: usize,
    write_lock: Mutex<()>,
}

impl FsHistoryStore {
    /// Create a store rooted at `root`.
    /// If `reset_on_create` is true, delete any existing data under the root first.
    pub fn new(root: impl AsRef<Path>, reset_on_create: bool) -> Self {
        Self::new_with_cap(root, reset_on_create, DEFAULT_HISTORY_CAP)
    }

    /// Create a store with a custom history cap (useful for tests).
    pub fn new_with_cap(root: impl AsRef<Path>, reset_on_create: bool, cap: usize) -> Self {
        let path = root.as_ref().to_path_buf();
        if reset_on_create {
            let _ = std::fs::remove_dir_all(&path);
        }
        // best-effort create
        let _ = std::fs::create_dir_all(&path);
        Self {
            root: path,
            cap,
            write_lock: Mutex::new(()),
        }
    }

    fn inst_path(&self, instance: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", encode_file_name(instance)))
    }

    async fn read_events(&self, instance: &str, path: &Path) -> Result<Vec<HistoryEvent>, StoreError> {
        let data = match fs::read_to_string(path).await {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let ev = serde_json::from_str::<HistoryEvent>(line).map_err(|e| StoreError::Corrupt {
                instance: instance.to_string(),
                line: idx + 1,
                reason: e.to_string(),
            })?;
            out.push(ev);
        }
        Ok(out)
    }
}

/// Instance ids may contain path separators and `::`; keep file names portable.
fn encode_file_name(instance: &str) -> String {
    let mut out = String::with_capacity(instance.len());
    for b in instance.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

fn decode_file_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[async_trait::async_trait]
impl HistoryStore for FsHistoryStore {
    async fn create_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        fs::create_dir_all(&self.root).await?;
        match fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.inst_path(instance))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::AlreadyExists(instance.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, instance: &str) -> Result<Vec<HistoryEvent>, StoreError> {
        self.read_events(instance, &self.inst_path(instance)).await
    }

    async fn append(&self, instance: &str, events: Vec<HistoryEvent>) -> Result<u64, StoreError> {
        let _g = self.write_lock.lock().await;
        let path = self.inst_path(instance);
        if !fs::try_exists(&path).await? {
            return Err(StoreError::NotFound(instance.to_string()));
        }
        let existing = self.read_events(instance, &path).await?;
        check_append(instance, existing.len(), &events, self.cap)?;

        let mut buf = String::new();
        for ev in &events {
            buf.push_str(&serde_json::to_string(ev)?);
            buf.push('\n');
        }
        let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok((existing.len() + events.len()) as u64)
    }

    async fn list_instances(&self) -> Result<Vec<String>, StoreError> {
        let mut out = Vec::new();
        let mut rd = match fs::read_dir(&self.root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(ent) = rd.next_entry().await? {
            if let Some(name) = ent.file_name().to_str()
                && let Some(stem) = name.strip_suffix(".jsonl")
                && let Some(instance) = decode_file_name(stem)
            {
                out.push(instance);
            }
        }
        out.sort();
        Ok(out)
    }

    async fn remove_instance(&self, instance: &str) -> Result<(), StoreError> {
        let _g = self.write_lock.lock().await;
        match fs::remove_file(self.inst_path(instance)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(instance.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the root directory and all contents.
    async fn reset(&self) {
        let _g = self.write_lock.lock().await;
        let _ = fs::remove_dir_all(&self.root).await;
        let _ = fs::create_dir_all(&self.root).await;
    }
}
