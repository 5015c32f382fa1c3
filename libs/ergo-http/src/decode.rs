//! Transparent decompression of response bodies.

use crate::error::HttpError;
use crate::pool::PooledBuffer;
use bytes::Bytes;
use flate2::read::{MultiGzDecoder, ZlibDecoder};
use flate2::write;
use http::HeaderMap;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING};
use std::io::{self, Read, Write};

/// Compression applied to a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentCoding {
    Gzip,
    Deflate,
    Identity,
}

impl ContentCoding {
    /// Coding named by `Content-Encoding`, or by `Accept-Encoding` when the
    /// response has no `Content-Encoding`.
    ///
    /// Only the exact values `gzip`, `gzip, deflate` and `deflate` select a
    /// decoder; anything else, stacked codings included, passes through.
    pub(crate) fn from_headers(headers: &HeaderMap) -> Self {
        let value = headers
            .get(CONTENT_ENCODING)
            .or_else(|| headers.get(ACCEPT_ENCODING))
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default();

        match value {
            "gzip" | "gzip, deflate" => Self::Gzip,
            "deflate" => Self::Deflate,
            _ => Self::Identity,
        }
    }
}

/// Decodes `raw` and rejects output larger than `limit` bytes.
///
/// An empty body is returned as is, since `HEAD` and `204` responses may
/// still name a coding.
pub(crate) fn decode_body(
    raw: Bytes,
    coding: ContentCoding,
    limit: usize,
) -> Result<Bytes, HttpError> {
    if raw.is_empty() {
        return Ok(raw);
    }
    let reader: Box<dyn Read + '_> = match coding {
        ContentCoding::Identity => {
            if raw.len() > limit {
                return Err(HttpError::BodyTooLarge {
                    limit,
                    actual: raw.len(),
                });
            }
            return Ok(raw);
        }
        ContentCoding::Gzip => Box::new(MultiGzDecoder::new(raw.as_ref())),
        ContentCoding::Deflate => Box::new(ZlibDecoder::new(raw.as_ref())),
    };

    let mut scratch = PooledBuffer::checkout();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader
        .take(cap)
        .read_to_end(&mut scratch)
        .map_err(|e| HttpError::Body(std::sync::Arc::new(e)))?;

    if scratch.len() > limit {
        return Err(HttpError::BodyTooLarge {
            limit,
            actual: scratch.len(),
        });
    }
    tracing::trace!(?coding, raw = raw.len(), decoded = scratch.len(), "response body decoded");
    Ok(Bytes::copy_from_slice(&scratch))
}

/// Incremental decoder for bodies that are streamed rather than buffered.
///
/// Not size-capped; used when writing a body straight to disk.
pub(crate) struct StreamDecoder {
    kind: StreamKind,
    fed: bool,
}

enum StreamKind {
    Identity,
    Gzip(write::GzDecoder<Vec<u8>>),
    Deflate(write::ZlibDecoder<Vec<u8>>),
}

impl StreamDecoder {
    pub(crate) fn new(coding: ContentCoding) -> Self {
        let kind = match coding {
            ContentCoding::Identity => StreamKind::Identity,
            ContentCoding::Gzip => StreamKind::Gzip(write::GzDecoder::new(Vec::new())),
            ContentCoding::Deflate => StreamKind::Deflate(write::ZlibDecoder::new(Vec::new())),
        };
        Self { kind, fed: false }
    }

    /// Feeds one chunk and returns the output decoded so far.
    pub(crate) fn push(&mut self, chunk: Bytes) -> io::Result<Bytes> {
        if chunk.is_empty() {
            return Ok(chunk);
        }
        self.fed = true;
        match &mut self.kind {
            StreamKind::Identity => Ok(chunk),
            StreamKind::Gzip(decoder) => {
                decoder.write_all(&chunk)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
            StreamKind::Deflate(decoder) => {
                decoder.write_all(&chunk)?;
                Ok(Bytes::from(std::mem::take(decoder.get_mut())))
            }
        }
    }

    /// Flushes trailing output and checks that the stream ended cleanly.
    pub(crate) fn finish(self) -> io::Result<Bytes> {
        if !self.fed {
            return Ok(Bytes::new());
        }
        match self.kind {
            StreamKind::Identity => Ok(Bytes::new()),
            StreamKind::Gzip(decoder) => decoder.finish().map(Bytes::from),
            StreamKind::Deflate(decoder) => decoder.finish().map(Bytes::from),
        }
    }
}
