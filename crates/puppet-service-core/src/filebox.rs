//! Binary attachments and their chunked transfer form.
//!
//! Attachments never travel inside a request. They are split into numbered
//! chunks keyed by an opaque content id; the receiver reassembles them with
//! [`FileBoxAssembler`] and only the content id is passed to the puppet call.

use crate::config::FileBoxConfig;
use crate::error::{PuppetServiceError, Result};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// A named binary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBox {
    pub name: String,
    pub mime: Option<String>,
    pub data: Bytes,
}

impl FileBox {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: None,
            data: data.into(),
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Describe this file for transfer under `content_id`.
    pub fn meta(&self, content_id: &str, chunk_size: usize) -> FileBoxMeta {
        FileBoxMeta {
            content_id: content_id.to_string(),
            name: self.name.clone(),
            mime: self.mime.clone(),
            size: self.data.len() as u64,
            chunk_count: self.data.len().div_ceil(chunk_size.max(1)) as u32,
        }
    }

    /// Split into transfer chunks. Slicing `Bytes` does not copy.
    pub fn chunks(&self, content_id: &str, chunk_size: usize) -> Vec<FileChunk> {
        let chunk_size = chunk_size.max(1);
        (0..self.data.len())
            .step_by(chunk_size)
            .enumerate()
            .map(|(index, start)| {
                let end = (start + chunk_size).min(self.data.len());
                FileChunk {
                    content_id: content_id.to_string(),
                    index: index as u32,
                    data: self.data.slice(start..end).to_vec(),
                }
            })
            .collect()
    }
}

/// Generate a fresh opaque content id.
pub fn new_content_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Transfer header for a file box.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileBoxMeta {
    pub content_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    pub size: u64,
    pub chunk_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub content_id: String,
    pub index: u32,
    pub data: Vec<u8>,
}

/// Reassembles chunks received in order.
#[derive(Debug)]
pub struct FileBoxAssembler {
    meta: FileBoxMeta,
    buf: BytesMut,
    next_index: u32,
}

impl FileBoxAssembler {
    /// Fails if the announced size is above [`FileBoxConfig::MAX_FILE_SIZE`].
    pub fn new(meta: FileBoxMeta) -> Result<Self> {
        if meta.size > FileBoxConfig::MAX_FILE_SIZE {
            return Err(PuppetServiceError::Validation {
                field: "size".to_string(),
                message: format!(
                    "{} bytes exceeds the {} byte limit",
                    meta.size,
                    FileBoxConfig::MAX_FILE_SIZE
                ),
            });
        }
        let capacity = usize::try_from(meta.size)
            .unwrap_or(usize::MAX)
            .min(FileBoxConfig::MAX_PREALLOCATION);
        Ok(Self {
            meta,
            buf: BytesMut::with_capacity(capacity),
            next_index: 0,
        })
    }

    pub fn content_id(&self) -> &str {
        &self.meta.content_id
    }

    pub fn push(&mut self, chunk: FileChunk) -> Result<()> {
        if chunk.content_id != self.meta.content_id {
            return Err(PuppetServiceError::payload(
                "file chunk",
                format!(
                    "content id {} does not match {}",
                    chunk.content_id, self.meta.content_id
                ),
            ));
        }
        if chunk.index != self.next_index {
            return Err(PuppetServiceError::payload(
                "file chunk",
                format!("expected chunk {}, got {}", self.next_index, chunk.index),
            ));
        }
        if self.buf.len() as u64 + chunk.data.len() as u64 > self.meta.size {
            return Err(PuppetServiceError::payload(
                "file chunk",
                format!("data exceeds declared size {}", self.meta.size),
            ));
        }

        self.buf.extend_from_slice(&chunk.data);
        self.next_index += 1;
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.next_index == self.meta.chunk_count && self.buf.len() as u64 == self.meta.size
    }

    pub fn finish(self) -> Result<FileBox> {
        if !self.is_complete() {
            return Err(PuppetServiceError::payload(
                "file box",
                format!(
                    "incomplete transfer: {}/{} chunks, {}/{} bytes",
                    self.next_index,
                    self.meta.chunk_count,
                    self.buf.len(),
                    self.meta.size
                ),
            ));
        }
        Ok(FileBox {
            name: self.meta.name,
            mime: self.meta.mime,
            data: self.buf.freeze(),
        })
    }
}
