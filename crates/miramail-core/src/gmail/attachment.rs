use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::gmail::mime_builder::{DEFAULT_CONTENT_TYPE, MimeAttachment, guess_content_type};

/// How attachments are handled when a message is built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AttachmentPolicy {
    /// Skip attachment parts entirely.
    Ignore,
    /// Record id, name and type; fetch bytes on demand.
    #[default]
    Reference,
    /// Fetch the bytes while the message is built.
    Download,
}

#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error("cannot overwrite {0}; pass overwrite = true to replace it")]
    FileExists(PathBuf),
    #[error("attachment {0} has not been downloaded")]
    NotDownloaded(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// An attachment on a received message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub user_id: String,
    pub message_id: String,
    pub id: String,
    pub filename: String,
    pub filetype: String,
    pub data: Option<Vec<u8>>,
}

impl Attachment {
    pub fn is_downloaded(&self) -> bool {
        self.data.is_some()
    }

    /// Writes the downloaded bytes to `path`, or to the attachment's own
    /// filename when no path is given. Returns the path written.
    pub async fn save(
        &self,
        path: Option<&Path>,
        overwrite: bool,
    ) -> Result<PathBuf, AttachmentError> {
        let target = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(&self.filename));
        let data = self
            .data
            .as_deref()
            .ok_or_else(|| AttachmentError::NotDownloaded(self.id.clone()))?;

        if !overwrite && tokio::fs::try_exists(&target).await? {
            return Err(AttachmentError::FileExists(target));
        }

        tokio::fs::write(&target, data).await?;
        Ok(target)
    }
}

/// In-memory attachment for outgoing mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentData {
    pub raw_data: Vec<u8>,
    pub file_name: String,
    pub content_type: String,
}

impl AttachmentData {
    pub fn new(raw_data: impl Into<Vec<u8>>, file_name: impl Into<String>) -> Self {
        Self {
            raw_data: raw_data.into(),
            file_name: file_name.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Where an outgoing attachment comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentSource {
    Path(PathBuf),
    Data(AttachmentData),
}

impl From<PathBuf> for AttachmentSource {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<AttachmentData> for AttachmentSource {
    fn from(data: AttachmentData) -> Self {
        Self::Data(data)
    }
}

impl AttachmentSource {
    /// Reads file-backed attachments and guesses their content type.
    pub async fn into_mime(self) -> io::Result<MimeAttachment> {
        match self {
            Self::Path(path) => {
                let data = tokio::fs::read(&path).await?;
                let filename = path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "attachment".to_string());
                Ok(MimeAttachment {
                    filename,
                    content_type: guess_content_type(&path).to_string(),
                    data,
                })
            }
            Self::Data(data) => Ok(MimeAttachment {
                filename: data.file_name,
                content_type: data.content_type,
                data: data.raw_data,
            }),
        }
    }
}
