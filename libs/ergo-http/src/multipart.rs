//! `multipart/form-data` encoding.

use crate::error::HttpError;
use crate::params::ParamSet;
use bytes::Bytes;
use rand::Rng;
use std::fmt;
use std::path::Path;
use tokio::io::AsyncRead;

/// Field name used by [`FileUpload::open`].
pub const DEFAULT_UPLOAD_FIELD: &str = "media";

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// A file part of a multipart request.
///
/// The encoder takes ownership of the content and drops it once copied, which
/// closes files and sockets behind it.
pub struct FileUpload {
    pub field_name: String,
    pub file_name: String,
    /// Falls back to `application/octet-stream` when `None`
    pub content_type: Option<String>,
    content: Box<dyn AsyncRead + Send + Unpin>,
}

impl FileUpload {
    pub fn new(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content: impl AsyncRead + Send + Unpin + 'static,
    ) -> Self {
        Self {
            field_name: field_name.into(),
            file_name: file_name.into(),
            content_type: None,
            content: Box::new(content),
        }
    }

    /// Upload backed by an in-memory buffer.
    pub fn from_bytes(
        field_name: impl Into<String>,
        file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self::new(field_name, file_name, std::io::Cursor::new(content.into()))
    }

    /// Opens `path` for upload under the `media` field, named after the file.
    ///
    /// # Errors
    /// Returns `HttpError::File` if the file cannot be opened.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, HttpError> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| HttpError::File {
                path: path.to_path_buf(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(DEFAULT_UPLOAD_FIELD, file_name, file))
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload")
            .field("field_name", &self.field_name)
            .field("file_name", &self.file_name)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// Frames form fields and uploads into one multipart body.
///
/// Fields come first in insertion order, then uploads in list order. The
/// framed body is kept after the first [`encode`](Self::encode), so later
/// calls and [`dump`](Self::dump) return the same bytes.
pub struct MultipartEncoder {
    boundary: String,
    fields: ParamSet,
    uploads: Vec<FileUpload>,
    framed: Option<Bytes>,
    uploaded: u64,
}

impl MultipartEncoder {
    /// Encoder with a random boundary.
    #[must_use]
    pub fn new(fields: ParamSet, uploads: Vec<FileUpload>) -> Self {
        Self::with_boundary(fields, uploads, random_boundary())
    }

    #[must_use]
    pub fn with_boundary(
        fields: ParamSet,
        uploads: Vec<FileUpload>,
        boundary: impl Into<String>,
    ) -> Self {
        Self {
            boundary: boundary.into(),
            fields,
            uploads,
            framed: None,
            uploaded: 0,
        }
    }

    #[must_use]
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `Content-Type` header value for the framed body.
    #[must_use]
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Frames the body, reading every upload to the end.
    ///
    /// # Errors
    /// Returns `HttpError::Upload` if an upload stream fails. Uploads that
    /// were already consumed are gone, so a failed encoder cannot be retried.
    pub async fn encode(&mut self) -> Result<Bytes, HttpError> {
        if let Some(framed) = &self.framed {
            return Ok(framed.clone());
        }

        let mut out = Vec::new();
        let mut first = true;

        for (name, value) in self.fields.pairs() {
            let disposition = format!("form-data; name=\"{}\"", escape_quotes(name));
            start_part(&mut out, &self.boundary, first, &disposition, None);
            out.extend_from_slice(value.as_bytes());
            first = false;
        }

        for mut upload in std::mem::take(&mut self.uploads) {
            let disposition = format!(
                "form-data; name=\"{}\"; filename=\"{}\"",
                escape_quotes(&upload.field_name),
                escape_quotes(&upload.file_name)
            );
            let content_type = upload
                .content_type
                .as_deref()
                .unwrap_or(FALLBACK_CONTENT_TYPE);
            start_part(&mut out, &self.boundary, first, &disposition, Some(content_type));
            first = false;

            let copied = tokio::io::copy(&mut upload.content, &mut out)
                .await
                .map_err(|source| HttpError::Upload {
                    file_name: upload.file_name.clone(),
                    source,
                })?;
            self.uploaded += copied;
            tracing::debug!(
                field = %upload.field_name,
                file = %upload.file_name,
                bytes = copied,
                "multipart upload copied"
            );
        }

        if !first {
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"--");
        out.extend_from_slice(self.boundary.as_bytes());
        out.extend_from_slice(b"--\r\n");

        let framed = Bytes::from(out);
        self.framed = Some(framed.clone());
        Ok(framed)
    }

    /// The framed body, once [`encode`](Self::encode) has run.
    #[must_use]
    pub fn dump(&self) -> Option<&Bytes> {
        self.framed.as_ref()
    }

    /// Bytes copied from upload streams so far.
    #[must_use]
    pub fn bytes_uploaded(&self) -> u64 {
        self.uploaded
    }
}

impl fmt::Debug for MultipartEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartEncoder")
            .field("boundary", &self.boundary)
            .field("fields", &self.fields)
            .field("uploads", &self.uploads)
            .field("framed", &self.framed.as_ref().map(Bytes::len))
            .field("uploaded", &self.uploaded)
            .finish()
    }
}

fn start_part(
    out: &mut Vec<u8>,
    boundary: &str,
    first: bool,
    disposition: &str,
    content_type: Option<&str>,
) {
    if !first {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"\r\nContent-Disposition: ");
    out.extend_from_slice(disposition.as_bytes());
    if let Some(content_type) = content_type {
        out.extend_from_slice(b"\r\nContent-Type: ");
        out.extend_from_slice(content_type.as_bytes());
    }
    out.extend_from_slice(b"\r\n\r\n");
}

fn escape_quotes(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '"' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn random_boundary() -> String {
    let mut raw = [0_u8; 30];
    rand::rng().fill(&mut raw);
    hex::encode(raw)
}
