use crate::charset;
use crate::config::DumpOptions;
use crate::context::{RequestContext, guarded};
use crate::decode::{ContentCoding, StreamDecoder, decode_body};
use crate::error::{BoxError, HttpError, InvalidUriKind};
use crate::multipart::MultipartEncoder;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, TryStreamExt};
use http::{HeaderMap, Method, Response, StatusCode, Version};
use http_body::Frame;
use http_body_util::{BodyExt, Full, StreamBody};
use serde::de::DeserializeOwned;
use std::error::Error;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use url::Url;

/// Type-erased response body as received from the transport.
///
/// Bytes are still content-encoded; only the buffered accessors of
/// [`HttpResponse`] and [`HttpResponse::to_file`] inflate them.
pub type ResponseBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// Snapshot of the request as it was handed to the transport.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    method: Method,
    url: Url,
    headers: HeaderMap,
}

impl RequestInfo {
    pub(crate) fn new(method: Method, url: Url, headers: HeaderMap) -> Self {
        Self {
            method,
            url,
            headers,
        }
    }

    /// Points the snapshot at the last hop of a followed redirect chain.
    pub(crate) fn redirected_to(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Final URL, query string included.
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

#[derive(Debug)]
enum BodyState {
    /// Not yet buffered. `raw` holds bytes already pulled by `limit_bytes`.
    Streaming {
        body: ResponseBody,
        raw: BytesMut,
        done: bool,
    },
    Buffered(Bytes),
    Failed(Arc<dyn Error + Send + Sync>),
    Closed,
}

/// HTTP response with a lazily read, memoized body.
///
/// The first buffered read pulls the whole body, inflates gzip or deflate
/// content and caches the result. Later calls to [`bytes`](Self::bytes),
/// [`text`](Self::text), [`json`](Self::json), [`xml`](Self::xml) and
/// [`to_file`](Self::to_file) reuse the cache and never touch the network
/// again. A failed read is remembered too: every later read returns the same
/// [`HttpError::Body`] instead of an empty body.
///
/// ```ignore
/// let mut resp = client.get("https://example.com/api", options![]).await?;
/// let raw = resp.bytes().await?;
/// let again = resp.text().await?; // served from the cache
/// ```
#[derive(Debug)]
pub struct HttpResponse {
    parts: http::response::Parts,
    body: BodyState,
    pub(crate) request: RequestInfo,
    pub(crate) request_body: Bytes,
    pub(crate) multipart: Option<MultipartEncoder>,
    pub(crate) context: Option<RequestContext>,
    pub(crate) max_body_size: usize,
}

impl HttpResponse {
    pub(crate) fn new(
        response: Response<ResponseBody>,
        request: RequestInfo,
        max_body_size: usize,
    ) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            parts,
            body: BodyState::Streaming {
                body,
                raw: BytesMut::new(),
                done: false,
            },
            request,
            request_body: Bytes::new(),
            multipart: None,
            context: None,
            max_body_size,
        }
    }

    /// Get the response status code
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    /// Get the response headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.parts.version
    }

    /// The request that produced this response.
    #[must_use]
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// Status line, headers and extensions of the response.
    #[must_use]
    pub fn response(&self) -> &http::response::Parts {
        &self.parts
    }

    /// Request body as sent.
    ///
    /// Buffered bodies are kept whole. Streamed bodies keep only their first
    /// [`body_capture_limit`](crate::HttpClientConfig::body_capture_limit)
    /// bytes. Multipart bodies are reachable through
    /// [`multipart`](Self::multipart) instead.
    #[must_use]
    pub fn request_body(&self) -> &Bytes {
        &self.request_body
    }

    /// Encoder of a multipart request, for its framed body and upload count.
    #[must_use]
    pub fn multipart(&self) -> Option<&MultipartEncoder> {
        self.multipart.as_ref()
    }

    /// Returns the configured max body size for this response.
    #[must_use]
    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Check status and return error for non-2xx responses
    ///
    /// Does NOT read the response body.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::HttpStatus` if the response status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.parts.status.is_success() {
            return Ok(self);
        }

        let content_type = self
            .parts
            .headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        Err(HttpError::HttpStatus {
            status: self.parts.status,
            content_type,
        })
    }

    /// Decoded response body.
    ///
    /// Reads and inflates the body on the first call; later calls return the
    /// cached bytes. Bounded by `max_body_size` and by the request context.
    ///
    /// # Errors
    /// Returns `HttpError::Body` wrapping the transport, decode, size or
    /// context failure. The same error is returned by every later read.
    /// Returns `HttpError::BodyClosed` after [`close`](Self::close) or a
    /// streaming accessor consumed the body.
    pub async fn bytes(&mut self) -> Result<Bytes, HttpError> {
        let (body, raw, done) = match std::mem::replace(&mut self.body, BodyState::Closed) {
            BodyState::Streaming { body, raw, done } => (body, raw, done),
            BodyState::Buffered(bytes) => {
                self.body = BodyState::Buffered(bytes.clone());
                return Ok(bytes);
            }
            BodyState::Failed(err) => {
                self.body = BodyState::Failed(Arc::clone(&err));
                return Err(HttpError::Body(err));
            }
            BodyState::Closed => return Err(HttpError::BodyClosed),
        };

        let coding = ContentCoding::from_headers(&self.parts.headers);
        let limit = self.max_body_size;
        let read = async move {
            let raw = read_body_limited_impl(body, raw, done, limit).await?;
            decode_body(raw, coding, limit)
        };

        match guarded(self.context.as_ref(), read).await {
            Ok(bytes) => {
                self.body = BodyState::Buffered(bytes.clone());
                Ok(bytes)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Decoded body as text. Invalid UTF-8 is replaced, not rejected.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes).
    pub async fn text(&mut self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Decoded body parsed as JSON.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes), plus `HttpError::Json` if parsing fails.
    pub async fn json<T: DeserializeOwned>(&mut self) -> Result<T, HttpError> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Decoded body parsed as XML.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes), plus `HttpError::Xml` if parsing fails.
    pub async fn xml<T: DeserializeOwned>(&mut self) -> Result<T, HttpError> {
        let bytes = self.bytes().await?;
        quick_xml::de::from_reader(bytes.as_ref()).map_err(|e| HttpError::Xml(Box::new(e)))
    }

    /// At most `n` bytes of the body, without failing on truncation.
    ///
    /// Once the body is cached this is a prefix of the decoded bytes.
    /// Before that it is a prefix of the bytes as received, still encoded,
    /// and nothing is cached. The bytes pulled here are kept, so a later
    /// [`bytes`](Self::bytes) still sees the whole body.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes).
    pub async fn limit_bytes(&mut self, n: usize) -> Result<Bytes, HttpError> {
        let result = match &mut self.body {
            BodyState::Buffered(bytes) => return Ok(bytes.slice(..n.min(bytes.len()))),
            BodyState::Failed(err) => return Err(HttpError::Body(Arc::clone(err))),
            BodyState::Closed => return Err(HttpError::BodyClosed),
            BodyState::Streaming { body, raw, done } => {
                match guarded(self.context.as_ref(), fill_prefix(body, raw, done, n)).await {
                    Ok(()) => return Ok(Bytes::copy_from_slice(&raw[..n.min(raw.len())])),
                    Err(err) => err,
                }
            }
        };
        Err(self.fail(result))
    }

    /// Writes the decoded body to `path`, creating or truncating the file.
    ///
    /// A cached body is written from memory. Otherwise the body is streamed
    /// to disk without the `max_body_size` cap and is consumed: later reads
    /// return `HttpError::BodyClosed`.
    ///
    /// # Errors
    /// Returns `HttpError::File` if the file cannot be created or written,
    /// and the errors of [`bytes`](Self::bytes) for the body itself.
    pub async fn to_file(&mut self, path: impl AsRef<Path>) -> Result<(), HttpError> {
        let path = path.as_ref();
        let file_error = |source| HttpError::File {
            path: path.to_path_buf(),
            source,
        };

        match &self.body {
            BodyState::Failed(err) => return Err(HttpError::Body(Arc::clone(err))),
            BodyState::Closed => return Err(HttpError::BodyClosed),
            BodyState::Streaming { .. } | BodyState::Buffered(_) => {}
        }
        let mut file = tokio::fs::File::create(path).await.map_err(file_error)?;

        match std::mem::replace(&mut self.body, BodyState::Closed) {
            BodyState::Buffered(bytes) => {
                self.body = BodyState::Buffered(bytes.clone());
                file.write_all(&bytes).await.map_err(file_error)?;
            }
            BodyState::Streaming { body, raw, done } => {
                let coding = ContentCoding::from_headers(&self.parts.headers);
                let download = stream_to_file(body, raw, done, coding, &mut file, path);
                match guarded(self.context.as_ref(), download).await {
                    Ok(written) => {
                        tracing::debug!(
                            path = %path.display(),
                            bytes = written,
                            "response body written to file"
                        );
                    }
                    Err(err @ HttpError::File { .. }) => return Err(err),
                    Err(err) => return Err(self.fail(err)),
                }
            }
            BodyState::Failed(_) | BodyState::Closed => return Err(HttpError::BodyClosed),
        }

        file.flush().await.map_err(file_error)
    }

    /// Releases the network body. Safe to call more than once.
    ///
    /// A cached body stays readable.
    pub fn close(&mut self) {
        if matches!(self.body, BodyState::Streaming { .. }) {
            self.body = BodyState::Closed;
        }
    }

    /// Target of a redirect response, or the request URL otherwise.
    ///
    /// For 301, 302, 303, 307 and 308 the `Location` header is resolved
    /// against the request URL.
    ///
    /// # Errors
    /// Returns `HttpError::MissingLocation` if a redirect status has no
    /// `Location`, and `HttpError::InvalidUri` if it cannot be resolved.
    pub fn url(&self) -> Result<Url, HttpError> {
        let status = self.parts.status;
        let is_redirect = matches!(
            status,
            StatusCode::MOVED_PERMANENTLY
                | StatusCode::FOUND
                | StatusCode::SEE_OTHER
                | StatusCode::TEMPORARY_REDIRECT
                | StatusCode::PERMANENT_REDIRECT
        );
        if !is_redirect {
            return Ok(self.request.url.clone());
        }

        let location = self
            .parts
            .headers
            .get(http::header::LOCATION)
            .ok_or(HttpError::MissingLocation { status })?;
        let location = location.to_str().map_err(|e| HttpError::InvalidUri {
            url: String::from_utf8_lossy(location.as_bytes()).into_owned(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;
        self.request
            .url
            .join(location)
            .map_err(|e| HttpError::InvalidUri {
                url: location.to_owned(),
                kind: InvalidUriKind::ParseError,
                reason: e.to_string(),
            })
    }

    /// Best-guess lowercase charset of the decoded body.
    ///
    /// See [`charset::detect`] for the rules.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes).
    pub async fn charset(&mut self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        Ok(charset::detect(&bytes, &self.parts.headers))
    }

    /// Decoded body transcoded to UTF-8 from its detected charset.
    ///
    /// # Errors
    /// Same as [`bytes`](Self::bytes).
    pub async fn text_utf8(&mut self) -> Result<String, HttpError> {
        let bytes = self.bytes().await?;
        let label = charset::detect(&bytes, &self.parts.headers);
        Ok(charset::convert_to_utf8(&bytes, &label))
    }

    /// Returns the response body as a stream for incremental processing.
    ///
    /// A cached body is replayed from memory. Otherwise the stream yields the
    /// bytes as received (still content-encoded), including any prefix
    /// already pulled by [`limit_bytes`](Self::limit_bytes). No size limit is
    /// enforced and the request context no longer applies.
    ///
    /// # Errors
    /// Returns the stored `HttpError::Body` or `HttpError::BodyClosed`.
    pub fn into_body(self) -> Result<ResponseBody, HttpError> {
        match self.body {
            BodyState::Buffered(bytes) => {
                Ok(Full::new(bytes).map_err(|never| match never {}).boxed())
            }
            BodyState::Streaming { body, raw, done } => {
                if raw.is_empty() {
                    return Ok(body);
                }
                let prefix = futures::stream::once(futures::future::ready(Ok(raw.freeze())));
                if done {
                    return Ok(BodyExt::boxed(StreamBody::new(prefix.map_ok(Frame::data))));
                }
                let rest = body.into_data_stream();
                Ok(BodyExt::boxed(StreamBody::new(
                    prefix.chain(rest).map_ok(Frame::data),
                )))
            }
            BodyState::Failed(err) => Err(HttpError::Body(err)),
            BodyState::Closed => Err(HttpError::BodyClosed),
        }
    }

    /// Wire-like rendering of the exchange.
    ///
    /// Reads and caches the response body when `RESPONSE_BODY` is selected;
    /// a read failure is printed in place of the body.
    pub async fn dump(&mut self, options: DumpOptions) -> String {
        let mut out = String::new();

        if options.contains(DumpOptions::REQUEST_HEAD) {
            let url = &self.request.url;
            let target = match url.query() {
                Some(query) => format!("{}?{query}", url.path()),
                None => url.path().to_owned(),
            };
            _ = writeln!(out, "> {} {target} {:?}", self.request.method, self.parts.version);
            if !self.request.headers.contains_key(http::header::HOST)
                && let Some(host) = url.host_str()
            {
                _ = writeln!(out, "> host: {host}");
            }
            write_headers(&mut out, '>', &self.request.headers);
            out.push_str(">\n");
        }

        if options.contains(DumpOptions::REQUEST_BODY) {
            let body = self
                .multipart
                .as_ref()
                .and_then(MultipartEncoder::dump)
                .unwrap_or(&self.request_body);
            if !body.is_empty() {
                out.push_str(&String::from_utf8_lossy(body));
                out.push('\n');
            }
        }

        if options.contains(DumpOptions::RESPONSE_HEAD) {
            if !out.is_empty() {
                out.push('\n');
            }
            _ = writeln!(out, "< {:?} {}", self.parts.version, self.parts.status);
            write_headers(&mut out, '<', &self.parts.headers);
            out.push_str("<\n");
        }

        if options.contains(DumpOptions::RESPONSE_BODY) {
            match self.bytes().await {
                Ok(body) if body.is_empty() => {}
                Ok(body) => {
                    out.push_str(&String::from_utf8_lossy(&body));
                    out.push('\n');
                }
                Err(err) => {
                    _ = writeln!(out, "<body unavailable: {err}>");
                }
            }
        }

        out
    }

    /// Remembers `err` as the body outcome and returns the shared error.
    fn fail(&mut self, err: HttpError) -> HttpError {
        let shared: Arc<dyn Error + Send + Sync> = match err {
            HttpError::Body(inner) => inner,
            other => Arc::new(other),
        };
        self.body = BodyState::Failed(Arc::clone(&shared));
        HttpError::Body(shared)
    }
}

fn write_headers(out: &mut String, marker: char, headers: &HeaderMap) {
    for (name, value) in headers {
        _ = writeln!(out, "{marker} {name}: {}", String::from_utf8_lossy(value.as_bytes()));
    }
}

/// Reads the rest of `body` after the already pulled `raw` prefix, enforcing
/// the byte limit on the received (still encoded) data.
async fn read_body_limited_impl(
    mut body: ResponseBody,
    mut raw: BytesMut,
    done: bool,
    limit: usize,
) -> Result<Bytes, HttpError> {
    if raw.len() > limit {
        return Err(HttpError::BodyTooLarge {
            limit,
            actual: raw.len(),
        });
    }
    if done {
        return Ok(raw.freeze());
    }

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if raw.len() + chunk.len() > limit {
                return Err(HttpError::BodyTooLarge {
                    limit,
                    actual: raw.len() + chunk.len(),
                });
            }
            raw.extend_from_slice(chunk);
        }
    }

    Ok(raw.freeze())
}

async fn fill_prefix(
    body: &mut ResponseBody,
    raw: &mut BytesMut,
    done: &mut bool,
    n: usize,
) -> Result<(), HttpError> {
    while !*done && raw.len() < n {
        match body.frame().await {
            Some(frame) => {
                if let Some(chunk) = frame.map_err(HttpError::Transport)?.data_ref() {
                    raw.extend_from_slice(chunk);
                }
            }
            None => *done = true,
        }
    }
    Ok(())
}

async fn stream_to_file(
    mut body: ResponseBody,
    raw: BytesMut,
    done: bool,
    coding: ContentCoding,
    file: &mut tokio::fs::File,
    path: &Path,
) -> Result<u64, HttpError> {
    let file_error = |source| HttpError::File {
        path: path.to_path_buf(),
        source,
    };
    let decode_error = |e: std::io::Error| HttpError::Body(Arc::new(e));

    let mut decoder = StreamDecoder::new(coding);
    let mut written = 0_u64;

    let out = decoder.push(raw.freeze()).map_err(decode_error)?;
    file.write_all(&out).await.map_err(file_error)?;
    written += out.len() as u64;

    if !done {
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(HttpError::Transport)?;
            let Ok(chunk) = frame.into_data() else {
                continue;
            };
            let out = decoder.push(chunk).map_err(decode_error)?;
            file.write_all(&out).await.map_err(file_error)?;
            written += out.len() as u64;
        }
    }

    let tail = decoder.finish().map_err(decode_error)?;
    file.write_all(&tail).await.map_err(file_error)?;
    written += tail.len() as u64;
    Ok(written)
}
