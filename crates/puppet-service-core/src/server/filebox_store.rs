//! Server-side staging area for chunked file transfers.

use crate::config::FileBoxConfig;
use crate::error::{PuppetServiceError, Result};
use crate::filebox::{new_content_id, FileBox, FileBoxAssembler, FileBoxMeta, FileChunk};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Uploads being reassembled and downloads waiting to be fetched, both keyed
/// by content id.
#[derive(Debug, Default)]
pub struct FileBoxStore {
    uploads: Mutex<HashMap<String, FileBoxAssembler>>,
    downloads: Mutex<HashMap<String, FileBox>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl FileBoxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_upload(&self, meta: FileBoxMeta) -> Result<()> {
        let mut uploads = lock(&self.uploads);
        if uploads.contains_key(&meta.content_id) {
            return Err(PuppetServiceError::Validation {
                field: "contentId".to_string(),
                message: format!("Upload {} already in progress", meta.content_id),
            });
        }
        debug!(
            "Upload {} started: {} ({} bytes, {} chunks)",
            meta.content_id, meta.name, meta.size, meta.chunk_count
        );
        let content_id = meta.content_id.clone();
        uploads.insert(content_id, FileBoxAssembler::new(meta)?);
        Ok(())
    }

    /// Add a chunk; returns whether the upload is now complete.
    pub fn push_chunk(&self, chunk: FileChunk) -> Result<bool> {
        let mut uploads = lock(&self.uploads);
        let assembler = uploads
            .get_mut(&chunk.content_id)
            .ok_or_else(|| PuppetServiceError::not_found("Upload", &chunk.content_id))?;
        assembler.push(chunk)?;
        Ok(assembler.is_complete())
    }

    /// Remove a finished upload and return the file.
    pub fn take_upload(&self, content_id: &str) -> Result<FileBox> {
        let assembler = lock(&self.uploads)
            .remove(content_id)
            .ok_or_else(|| PuppetServiceError::not_found("Upload", content_id))?;
        assembler.finish()
    }

    /// Stage a file for download and describe it.
    pub fn offer_download(&self, file: FileBox) -> FileBoxMeta {
        let content_id = new_content_id();
        let meta = file.meta(&content_id, FileBoxConfig::CHUNK_SIZE);
        lock(&self.downloads).insert(content_id, file);
        meta
    }

    /// Serve one chunk of a staged download. The file is dropped after its
    /// last chunk has been served.
    pub fn download_chunk(&self, content_id: &str, index: u32) -> Result<FileChunk> {
        let mut downloads = lock(&self.downloads);
        let file = downloads
            .get(content_id)
            .ok_or_else(|| PuppetServiceError::not_found("Download", content_id))?;

        let chunk_size = FileBoxConfig::CHUNK_SIZE;
        let start = index as usize * chunk_size;
        if start >= file.len() {
            return Err(PuppetServiceError::InvalidParams {
                message: format!("Chunk {} out of range for {}", index, content_id),
            });
        }
        let end = (start + chunk_size).min(file.len());
        let chunk = FileChunk {
            content_id: content_id.to_string(),
            index,
            data: file.data.slice(start..end).to_vec(),
        };

        if end == file.len() {
            downloads.remove(content_id);
            debug!("Download {} fully served", content_id);
        }
        Ok(chunk)
    }

    pub fn pending_uploads(&self) -> usize {
        lock(&self.uploads).len()
    }

    pub fn pending_downloads(&self) -> usize {
        lock(&self.downloads).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_roundtrip() {
        let store = FileBoxStore::new();
        let file = FileBox::new("a.bin", vec![7u8; FileBoxConfig::CHUNK_SIZE + 10]);
        let content_id = new_content_id();

        store
            .begin_upload(file.meta(&content_id, FileBoxConfig::CHUNK_SIZE))
            .unwrap();
        let chunks = file.chunks(&content_id, FileBoxConfig::CHUNK_SIZE);
        assert_eq!(chunks.len(), 2);

        let mut complete = false;
        for chunk in chunks {
            complete = store.push_chunk(chunk).unwrap();
        }
        assert!(complete);

        assert_eq!(store.take_upload(&content_id).unwrap(), file);
        assert_eq!(store.pending_uploads(), 0);
    }

    #[test]
    fn test_duplicate_upload_rejected() {
        let store = FileBoxStore::new();
        let file = FileBox::new("a.txt", &b"abc"[..]);
        store.begin_upload(file.meta("same", 2)).unwrap();
        assert!(store.begin_upload(file.meta("same", 2)).is_err());
    }

    #[test]
    fn test_oversized_upload_rejected() {
        let store = FileBoxStore::new();
        let mut meta = FileBox::new("big.bin", &b"x"[..]).meta("big", FileBoxConfig::CHUNK_SIZE);
        meta.size = FileBoxConfig::MAX_FILE_SIZE + 1;

        assert!(matches!(
            store.begin_upload(meta),
            Err(PuppetServiceError::Validation { .. })
        ));
        assert_eq!(store.pending_uploads(), 0);
    }

    #[test]
    fn test_unknown_upload_chunk_is_not_found() {
        let store = FileBoxStore::new();
        let chunk = FileChunk {
            content_id: "nope".into(),
            index: 0,
            data: vec![1],
        };
        assert!(matches!(
            store.push_chunk(chunk),
            Err(PuppetServiceError::NotFound { .. })
        ));
    }

    #[test]
    fn test_download_dropped_after_last_chunk() {
        let store = FileBoxStore::new();
        let file = FileBox::new("b.bin", vec![1u8; FileBoxConfig::CHUNK_SIZE * 2]);
        let meta = store.offer_download(file);
        assert_eq!(meta.chunk_count, 2);

        let first = store.download_chunk(&meta.content_id, 0).unwrap();
        assert_eq!(first.data.len(), FileBoxConfig::CHUNK_SIZE);
        assert_eq!(store.pending_downloads(), 1);

        store.download_chunk(&meta.content_id, 1).unwrap();
        assert_eq!(store.pending_downloads(), 0);
        assert!(store.download_chunk(&meta.content_id, 0).is_err());
    }
}
