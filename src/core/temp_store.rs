//! Process-local holder for files picked but not uploaded.

use std::fmt;

use hashbrown::HashMap;
use tracing::debug;

use crate::{
    config::EditorConfig,
    types::{RecordId, TempFileId},
};

const GENERIC_MIME: &str = "application/octet-stream";

/// A file as handed over by the host's file picker.
#[derive(Clone, PartialEq, Eq)]
pub struct PickedFile {
    /// Original file name.
    pub display_name: String,
    /// Declared MIME type; may be empty.
    pub mime_type: String,
    /// File content.
    pub bytes: Vec<u8>,
}

impl PickedFile {
    /// Convenience constructor.
    pub fn new(display_name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            bytes,
        }
    }
}

impl fmt::Debug for PickedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PickedFile")
            .field("display_name", &self.display_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Rejection of a single file-add attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TempFileError {
    /// Attachment exceeds the configured size limit.
    #[error("{name} is {size} bytes, limit is {max}")]
    FileTooLarge {
        /// File name.
        name: String,
        /// Actual size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
    /// Neither the MIME type nor the extension is allowed.
    #[error("{name} has unsupported type {mime_type:?}")]
    UnsupportedType {
        /// File name.
        name: String,
        /// Effective MIME type after sniffing.
        mime_type: String,
    },
}

/// A validated, not-yet-uploaded file.
#[derive(Clone, PartialEq, Eq)]
pub struct TemporaryFile {
    /// Store handle.
    pub id: TempFileId,
    /// Record the file was attached to.
    pub record: RecordId,
    /// Original file name.
    pub display_name: String,
    /// Content length.
    pub byte_size: u64,
    /// Effective MIME type.
    pub mime_type: String,
    bytes: Vec<u8>,
}

impl TemporaryFile {
    /// File content.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Local preview locator; never resolves over the network.
    pub fn preview_locator(&self) -> String {
        format!("local-preview://{}/{}", self.id, self.display_name)
    }
}

impl fmt::Debug for TemporaryFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemporaryFile")
            .field("id", &self.id)
            .field("record", &self.record)
            .field("display_name", &self.display_name)
            .field("byte_size", &self.byte_size)
            .field("mime_type", &self.mime_type)
            .finish()
    }
}

/// In-memory temporary file store owned by one edit session.
#[derive(Debug, Default)]
pub struct TempFileStore {
    files: HashMap<TempFileId, TemporaryFile>,
    config: EditorConfig,
}

impl TempFileStore {
    /// Creates an empty store enforcing `config`'s limits.
    pub fn new(config: EditorConfig) -> Self {
        Self {
            files: HashMap::new(),
            config,
        }
    }

    /// Validates `file` and keeps it under a fresh handle.
    pub fn create(&mut self, file: PickedFile, record: RecordId) -> Result<&TemporaryFile, TempFileError> {
        let mime_type = self.validate(&file)?;
        let byte_size = file.bytes.len() as u64;
        let id = TempFileId::generate();
        debug!(temp_id = %id, record, name = %file.display_name, byte_size, "temporary file created");
        let temp = TemporaryFile {
            id,
            record,
            display_name: file.display_name,
            byte_size,
            mime_type,
            bytes: file.bytes,
        };
        Ok(self.files.entry(id).or_insert(temp))
    }

    /// Checks size and type limits, returning the effective MIME type.
    pub fn validate(&self, file: &PickedFile) -> Result<String, TempFileError> {
        let byte_size = file.bytes.len() as u64;
        if byte_size > self.config.max_file_bytes {
            return Err(TempFileError::FileTooLarge {
                name: file.display_name.clone(),
                size: byte_size,
                max: self.config.max_file_bytes,
            });
        }

        let mime_type = effective_mime(file);
        if !self.config.allows_mime(&mime_type) && !self.config.allows_extension(&file.display_name) {
            return Err(TempFileError::UnsupportedType {
                name: file.display_name.clone(),
                mime_type,
            });
        }
        Ok(mime_type)
    }

    /// Looks up a held file.
    pub fn get(&self, id: TempFileId) -> Option<&TemporaryFile> {
        self.files.get(&id)
    }

    /// Frees a handle. Releasing an unknown handle is a no-op.
    pub fn release(&mut self, id: TempFileId) -> Option<TemporaryFile> {
        let released = self.files.remove(&id);
        if released.is_some() {
            debug!(temp_id = %id, "temporary file released");
        }
        released
    }

    /// Frees every handle, returning how many were held.
    pub fn clear(&mut self) -> usize {
        let n = self.files.len();
        self.files.clear();
        n
    }

    /// Number of held files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when nothing is held.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Active limits.
    pub fn config(&self) -> &EditorConfig {
        &self.config
    }
}

fn effective_mime(file: &PickedFile) -> String {
    let declared = file.mime_type.trim();
    if !declared.is_empty() && !declared.eq_ignore_ascii_case(GENERIC_MIME) {
        return declared.to_string();
    }
    infer::get(&file.bytes)
        .map(|kind| kind.mime_type().to_string())
        .unwrap_or_else(|| GENERIC_MIME.to_string())
}
