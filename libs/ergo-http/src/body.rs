//! Request bodies and their encoders.

use crate::config::{JsonEncodeOptions, XmlEncodeOptions};
use crate::error::{BoxError, HttpError};
use bytes::{Bytes, BytesMut};
use futures::TryStreamExt;
use http_body::{Body, Frame, SizeHint};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Content type set for JSON bodies when the request has none.
pub const JSON_CONTENT_TYPE: &str = "application/json; charset=UTF-8";

/// Content type set for XML bodies when the request has none.
pub const XML_CONTENT_TYPE: &str = "application/xml; charset=UTF-8";

/// Content type of bodies built from form parameters.
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=UTF-8";

const READ_CHUNK: usize = 8 * 1024;

/// Outgoing request body.
///
/// Buffered bodies can be replayed on 307/308 redirects; streamed bodies
/// cannot and stop the redirect chain.
pub struct RequestBody {
    kind: Kind,
}

enum Kind {
    Empty,
    Full(Option<Bytes>),
    Stream {
        inner: UnsyncBoxBody<Bytes, BoxError>,
        len: Option<u64>,
    },
}

impl RequestBody {
    #[must_use]
    pub fn empty() -> Self {
        Self { kind: Kind::Empty }
    }

    #[must_use]
    pub fn full(bytes: Bytes) -> Self {
        Self {
            kind: Kind::Full(Some(bytes)),
        }
    }

    /// Streams `reader`, copying the first `capture_limit` bytes into the
    /// returned [`BodyCapture`].
    pub(crate) fn from_reader(reader: BodyReader, capture_limit: usize) -> (Self, BodyCapture) {
        let capture = BodyCapture::new(capture_limit);
        let recorder = capture.clone();
        let len = reader.len;
        let frames = ReaderStream::with_capacity(reader.inner, READ_CHUNK)
            .inspect_ok(move |chunk| recorder.record(chunk))
            .map_ok(Frame::data);
        let inner = BodyExt::boxed_unsync(BodyExt::map_err(
            StreamBody::new(frames),
            |e: io::Error| -> BoxError { Box::new(e) },
        ));

        let body = Self {
            kind: Kind::Stream { inner, len },
        };
        (body, capture)
    }

    /// Forces the advertised length, as set by an explicit `Content-Length`.
    pub(crate) fn set_declared_len(&mut self, declared: u64) {
        if let Kind::Stream { len, .. } = &mut self.kind {
            *len = Some(declared);
        }
    }

    /// Copy of a buffered body; `None` for streams.
    #[must_use]
    pub fn try_clone(&self) -> Option<Self> {
        match &self.kind {
            Kind::Empty => Some(Self::empty()),
            Kind::Full(bytes) => Some(Self {
                kind: Kind::Full(bytes.clone()),
            }),
            Kind::Stream { .. } => None,
        }
    }
}

impl Default for RequestBody {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        Self::full(bytes)
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Empty => f.write_str("RequestBody::Empty"),
            Kind::Full(bytes) => f
                .debug_tuple("RequestBody::Full")
                .field(&bytes.as_ref().map_or(0, Bytes::len))
                .finish(),
            Kind::Stream { len, .. } => f.debug_tuple("RequestBody::Stream").field(len).finish(),
        }
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match &mut self.get_mut().kind {
            Kind::Empty => Poll::Ready(None),
            Kind::Full(bytes) => Poll::Ready(
                bytes
                    .take()
                    .filter(|b| !b.is_empty())
                    .map(|b| Ok(Frame::data(b))),
            ),
            Kind::Stream { inner, .. } => Pin::new(inner).poll_frame(cx),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Empty => true,
            Kind::Full(bytes) => bytes.as_ref().is_none_or(Bytes::is_empty),
            Kind::Stream { inner, .. } => inner.is_end_stream(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Empty => SizeHint::with_exact(0),
            Kind::Full(bytes) => SizeHint::with_exact(bytes.as_ref().map_or(0, |b| b.len() as u64)),
            Kind::Stream { inner, len } => {
                len.map_or_else(|| inner.size_hint(), SizeHint::with_exact)
            }
        }
    }
}

/// Bounded snapshot of bytes read from a streamed request body.
#[derive(Clone)]
pub(crate) struct BodyCapture {
    buf: Arc<Mutex<BytesMut>>,
    limit: usize,
}

impl BodyCapture {
    fn new(limit: usize) -> Self {
        Self {
            buf: Arc::new(Mutex::new(BytesMut::new())),
            limit,
        }
    }

    fn record(&self, chunk: &[u8]) {
        let mut buf = self.buf.lock();
        let room = self.limit.saturating_sub(buf.len());
        if room > 0 {
            buf.extend_from_slice(&chunk[..room.min(chunk.len())]);
        }
    }

    /// Bytes captured so far.
    pub(crate) fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buf.lock())
    }
}

/// Request body streamed from an async reader.
///
/// Without a known length the body is sent chunked. Only the first bytes
/// (see [`HttpClientConfig::body_capture_limit`](crate::HttpClientConfig::body_capture_limit))
/// are kept for [`HttpResponse::request_body`](crate::HttpResponse::request_body).
pub struct BodyReader {
    inner: Box<dyn AsyncRead + Send + Unpin>,
    len: Option<u64>,
}

impl BodyReader {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            inner: Box::new(reader),
            len: None,
        }
    }

    /// Reader whose total length is known up front.
    pub fn with_len(reader: impl AsyncRead + Send + Unpin + 'static, len: u64) -> Self {
        Self {
            inner: Box::new(reader),
            len: Some(len),
        }
    }

    /// Streams an open file, sized from its metadata.
    ///
    /// # Errors
    /// Returns `HttpError::File` if the metadata cannot be read.
    pub async fn from_file(
        file: tokio::fs::File,
        path: impl AsRef<std::path::Path>,
    ) -> Result<Self, HttpError> {
        let len = file
            .metadata()
            .await
            .map_err(|source| HttpError::File {
                path: path.as_ref().to_path_buf(),
                source,
            })?
            .len();
        Ok(Self::with_len(file, len))
    }

    #[must_use]
    pub fn known_len(&self) -> Option<u64> {
        self.len
    }
}

impl fmt::Debug for BodyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyReader")
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

type JsonEncoder =
    Box<dyn FnOnce(Option<&JsonEncodeOptions>) -> Result<Vec<u8>, serde_json::Error> + Send>;
type XmlEncoder = Box<dyn FnOnce(Option<&XmlEncodeOptions>) -> Result<String, BoxError> + Send>;

enum Payload<E> {
    Raw(Bytes),
    Value(E),
}

/// JSON request body.
///
/// Pre-serialized text passes through untouched; structured values are
/// encoded with the client's [`JsonEncodeOptions`] when the request is built.
/// Either way the request gets `application/json; charset=UTF-8` unless it
/// already carries a `Content-Type`.
pub struct BodyJson(Payload<JsonEncoder>);

impl BodyJson {
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        Self(Payload::Value(Box::new(move |opts| encode_json(&value, opts))))
    }

    /// Already-serialized JSON text or bytes.
    pub fn raw(text: impl Into<Bytes>) -> Self {
        Self(Payload::Raw(text.into()))
    }

    pub(crate) fn encode(self, opts: Option<&JsonEncodeOptions>) -> Result<Bytes, HttpError> {
        match self.0 {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Value(encode) => Ok(Bytes::from(encode(opts)?)),
        }
    }
}

/// XML request body. Pre-serialized text passes through untouched.
pub struct BodyXml(Payload<XmlEncoder>);

impl BodyXml {
    pub fn new<T>(value: T) -> Self
    where
        T: Serialize + Send + 'static,
    {
        Self(Payload::Value(Box::new(move |opts| encode_xml(&value, opts))))
    }

    /// Already-serialized XML text or bytes.
    pub fn raw(text: impl Into<Bytes>) -> Self {
        Self(Payload::Raw(text.into()))
    }

    pub(crate) fn encode(self, opts: Option<&XmlEncodeOptions>) -> Result<Bytes, HttpError> {
        match self.0 {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Value(encode) => encode(opts).map(Bytes::from).map_err(HttpError::Xml),
        }
    }
}

fn encode_json<T: Serialize + ?Sized>(
    value: &T,
    opts: Option<&JsonEncodeOptions>,
) -> Result<Vec<u8>, serde_json::Error> {
    let Some(opts) = opts else {
        return serde_json::to_vec(value);
    };
    let mut out = Vec::new();
    let formatter = OptionsFormatter::new(opts);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    // Stream-encoder framing: one document per line.
    out.push(b'\n');
    Ok(out)
}

fn encode_xml<T: Serialize + ?Sized>(
    value: &T,
    opts: Option<&XmlEncodeOptions>,
) -> Result<String, BoxError> {
    let mut out = String::new();
    let mut serializer = quick_xml::se::Serializer::new(&mut out);
    if let Some(opts) = opts.filter(|o| o.indent_size > 0) {
        serializer.indent(opts.indent_char, opts.indent_size);
    }
    value.serialize(serializer).map_err(|e| -> BoxError { Box::new(e) })?;
    Ok(out)
}

/// `serde_json` formatter honoring [`JsonEncodeOptions`].
struct OptionsFormatter<'a> {
    prefix: &'a [u8],
    indent: &'a [u8],
    escape_html: bool,
    depth: usize,
    has_value: bool,
}

impl<'a> OptionsFormatter<'a> {
    fn new(opts: &'a JsonEncodeOptions) -> Self {
        Self {
            prefix: opts.prefix.as_bytes(),
            indent: opts.indent.as_bytes(),
            escape_html: opts.escape_html,
            depth: 0,
            has_value: false,
        }
    }

    fn indenting(&self) -> bool {
        !self.prefix.is_empty() || !self.indent.is_empty()
    }

    fn newline<W: ?Sized + io::Write>(&self, writer: &mut W) -> io::Result<()> {
        if !self.indenting() {
            return Ok(());
        }
        writer.write_all(b"\n")?;
        writer.write_all(self.prefix)?;
        for _ in 0..self.depth {
            writer.write_all(self.indent)?;
        }
        Ok(())
    }

    fn open<W: ?Sized + io::Write>(&mut self, writer: &mut W, token: &[u8]) -> io::Result<()> {
        self.depth += 1;
        self.has_value = false;
        writer.write_all(token)
    }

    fn close<W: ?Sized + io::Write>(&mut self, writer: &mut W, token: &[u8]) -> io::Result<()> {
        self.depth -= 1;
        if self.has_value {
            self.newline(writer)?;
        }
        writer.write_all(token)
    }

    fn item<W: ?Sized + io::Write>(&self, writer: &mut W, first: bool) -> io::Result<()> {
        if !first {
            writer.write_all(b",")?;
        }
        self.newline(writer)
    }
}

impl serde_json::ser::Formatter for OptionsFormatter<'_> {
    fn begin_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.open(writer, b"[")
    }

    fn end_array<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"]")
    }

    fn begin_array_value<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.item(writer, first)
    }

    fn end_array_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn begin_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.open(writer, b"{")
    }

    fn end_object<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        self.close(writer, b"}")
    }

    fn begin_object_key<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        first: bool,
    ) -> io::Result<()> {
        self.item(writer, first)
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(if self.indenting() { b": " } else { b":" })
    }

    fn end_object_value<W: ?Sized + io::Write>(&mut self, _writer: &mut W) -> io::Result<()> {
        self.has_value = true;
        Ok(())
    }

    fn write_string_fragment<W: ?Sized + io::Write>(
        &mut self,
        writer: &mut W,
        fragment: &str,
    ) -> io::Result<()> {
        if !self.escape_html {
            return writer.write_all(fragment.as_bytes());
        }
        let bytes = fragment.as_bytes();
        let mut start = 0;
        for (i, b) in bytes.iter().enumerate() {
            let escaped: &[u8] = match b {
                b'<' => b"\\u003c",
                b'>' => b"\\u003e",
                b'&' => b"\\u0026",
                _ => continue,
            };
            writer.write_all(&bytes[start..i])?;
            writer.write_all(escaped)?;
            start = i + 1;
        }
        writer.write_all(&bytes[start..])
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Snippet {
        name: &'static str,
        tags: Vec<&'static str>,
    }

    fn snippet() -> Snippet {
        Snippet {
            name: "<b>&",
            tags: vec!["x", "y"],
        }
    }

    #[test]
    fn test_json_without_options_uses_serde_defaults() {
        let bytes = BodyJson::new(snippet()).encode(None).unwrap();
        assert_eq!(bytes, r#"{"name":"<b>&","tags":["x","y"]}"#);
    }

    #[test]
    fn test_json_options_escape_html_compact() {
        let opts = JsonEncodeOptions::default();
        let bytes = BodyJson::new(snippet()).encode(Some(&opts)).unwrap();
        assert_eq!(
            bytes,
            "{\"name\":\"\\u003cb\\u003e\\u0026\",\"tags\":[\"x\",\"y\"]}\n"
        );
    }

    #[test]
    fn test_json_options_indent_and_prefix() {
        let opts = JsonEncodeOptions {
            prefix: ">".to_owned(),
            indent: "  ".to_owned(),
            escape_html: false,
        };
        let bytes = BodyJson::new(snippet()).encode(Some(&opts)).unwrap();
        let expected =
            "{\n>  \"name\": \"<b>&\",\n>  \"tags\": [\n>    \"x\",\n>    \"y\"\n>  ]\n>}\n";
        assert_eq!(std::str::from_utf8(&bytes).unwrap(), expected);
    }

    #[test]
    fn test_json_empty_containers_stay_inline() {
        let opts = JsonEncodeOptions {
            indent: "\t".to_owned(),
            ..JsonEncodeOptions::default()
        };
        let value = serde_json::json!({ "list": [], "map": {} });
        let bytes = BodyJson::new(value).encode(Some(&opts)).unwrap();
        assert_eq!(
            std::str::from_utf8(&bytes).unwrap(),
            "{\n\t\"list\": [],\n\t\"map\": {}\n}\n"
        );
    }

    #[test]
    fn test_trailing_newline_only_with_options() {
        let plain = BodyJson::new(vec![1, 2]).encode(None).unwrap();
        assert_eq!(plain, "[1,2]");

        let opts = JsonEncodeOptions::default();
        let framed = BodyJson::new(vec![1, 2]).encode(Some(&opts)).unwrap();
        assert_eq!(framed, "[1,2]\n");
    }

    #[test]
    fn test_raw_json_passes_through() {
        let opts = JsonEncodeOptions::default();
        let bytes = BodyJson::raw("{\"a\": \"<x>\"}").encode(Some(&opts)).unwrap();
        assert_eq!(bytes, "{\"a\": \"<x>\"}");
    }

    #[derive(Serialize)]
    #[serde(rename = "user")]
    struct User {
        name: String,
        age: u32,
    }

    #[test]
    fn test_xml_compact_and_indented() {
        let user = || User {
            name: "roc".to_owned(),
            age: 30,
        };

        let compact = BodyXml::new(user()).encode(None).unwrap();
        assert_eq!(compact, "<user><name>roc</name><age>30</age></user>");

        let opts = XmlEncodeOptions::default();
        let pretty = BodyXml::new(user()).encode(Some(&opts)).unwrap();
        assert_eq!(
            std::str::from_utf8(&pretty).unwrap(),
            "<user>\n  <name>roc</name>\n  <age>30</age>\n</user>"
        );
    }

    #[test]
    fn test_xml_serialization_failure_is_reported() {
        // A bare number has no element name to serialize under.
        let result = BodyXml::new(42_u32).encode(None);
        assert!(matches!(result, Err(HttpError::Xml(_))));
    }

    #[tokio::test]
    async fn test_reader_body_captures_prefix_only() {
        let data = vec![7_u8; 64];
        let reader = BodyReader::new(std::io::Cursor::new(data.clone()));
        let (body, capture) = RequestBody::from_reader(reader, 10);

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(collected.as_ref(), data.as_slice());
        assert_eq!(capture.snapshot().as_ref(), &data[..10]);
    }

    #[tokio::test]
    async fn test_full_body_clone_and_size_hint() {
        let body = RequestBody::full(Bytes::from_static(b"hello"));
        assert_eq!(body.size_hint().exact(), Some(5));
        let copy = body.try_clone().unwrap();
        assert_eq!(copy.collect().await.unwrap().to_bytes(), "hello");

        let reader = BodyReader::new(std::io::Cursor::new(vec![1]));
        let (stream, _) = RequestBody::from_reader(reader, 1);
        assert!(stream.try_clone().is_none());
    }

    #[test]
    fn test_declared_len_applies_to_streams() {
        let reader = BodyReader::new(std::io::Cursor::new(vec![0_u8; 3]));
        let (mut body, _) = RequestBody::from_reader(reader, 0);
        body.set_declared_len(3);
        assert_eq!(body.size_hint().exact(), Some(3));
    }
}
