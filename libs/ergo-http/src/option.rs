//! Request options.
//!
//! Every argument to [`HttpClient::execute`](crate::HttpClient::execute) is a
//! [`RequestOption`]. Each option kind has its own variant, and `From` impls
//! let callers pass the payload types directly through [`options!`](crate::options).

use crate::body::{BodyJson, BodyReader, BodyXml};
use crate::client::HttpClient;
use crate::context::RequestContext;
use crate::error::{BoxError, HttpError};
use crate::multipart::FileUpload;
use crate::params::ParamSet;
use bytes::Bytes;
use std::fmt;

/// Ordered header pairs.
///
/// Values are appended to the request; a later `Header` with the same key
/// adds a second value rather than replacing the first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header(Vec<(String, String)>);

impl Header {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub(crate) fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }
}

impl<K, V, const N: usize> From<[(K, V); N]> for Header
where
    K: Into<String>,
    V: Into<String>,
{
    fn from(pairs: [(K, V); N]) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// HTTP basic authentication credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl BasicAuth {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Pre-encoded `application/x-www-form-urlencoded` body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormData(pub String);

/// Parameters routed by method: query string for GET and HEAD, form body otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Param(pub ParamSet);

/// Parameters that always go to the query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryParam(pub ParamSet);

macro_rules! display_pairs {
    ($ty:ident) => {
        impl<K, V, const N: usize> From<[(K, V); N]> for $ty
        where
            K: Into<String>,
            V: fmt::Display,
        {
            fn from(pairs: [(K, V); N]) -> Self {
                Self(pairs.into_iter().map(|(k, v)| (k, v.to_string())).collect())
            }
        }

        impl $ty {
            #[must_use]
            pub fn new() -> Self {
                Self::default()
            }

            #[must_use]
            pub fn with(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
                self.0.add(key, value.to_string());
                self
            }
        }
    };
}

display_pairs!(Param);
display_pairs!(QueryParam);

/// Overrides the `Host` the request is sent with.
///
/// An explicit `Host` header option takes priority over this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host(pub String);

/// One argument to a request call.
pub enum RequestOption {
    /// Header pairs, appended in order
    Header(Header),
    /// Raw header multimap, appended in iteration order
    HeaderMap(http::HeaderMap),
    /// Sets `Authorization: Basic ...`
    BasicAuth(BasicAuth),
    /// JSON body with a default JSON content type
    Json(BodyJson),
    /// XML body with a default XML content type
    Xml(BodyXml),
    /// URL values routed like [`Param`]
    Values(ParamSet),
    /// Raw urlencoded body
    FormData(FormData),
    /// Parameters routed by method
    Param(Param),
    /// Parameters that always go to the query string
    QueryParam(QueryParam),
    /// Plain text body
    Text(String),
    /// Byte body
    Bytes(Vec<u8>),
    /// Shared buffer body
    Buffer(Bytes),
    /// Transport to send this request through
    Client(HttpClient),
    /// One file upload
    File(FileUpload),
    /// Several file uploads, in order
    Files(Vec<FileUpload>),
    /// Cookie appended to the `Cookie` header
    Cookie(cookie::Cookie<'static>),
    /// Host override
    Host(Host),
    /// Streamed body from an async reader
    Reader(BodyReader),
    /// Cancellation and deadline for the call and its body reads
    Context(RequestContext),
    /// Aborts the call with this error before any I/O
    Error(HttpError),
}

impl RequestOption {
    /// Option that aborts the call with `err`.
    pub fn error(err: impl Into<BoxError>) -> Self {
        RequestOption::Error(HttpError::caller(err))
    }

    /// Short name of the option kind, for logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RequestOption::Header(_) => "header",
            RequestOption::HeaderMap(_) => "header-map",
            RequestOption::BasicAuth(_) => "basic-auth",
            RequestOption::Json(_) => "json",
            RequestOption::Xml(_) => "xml",
            RequestOption::Values(_) => "values",
            RequestOption::FormData(_) => "form-data",
            RequestOption::Param(_) => "param",
            RequestOption::QueryParam(_) => "query-param",
            RequestOption::Text(_) => "text",
            RequestOption::Bytes(_) => "bytes",
            RequestOption::Buffer(_) => "buffer",
            RequestOption::Client(_) => "client",
            RequestOption::File(_) => "file",
            RequestOption::Files(_) => "files",
            RequestOption::Cookie(_) => "cookie",
            RequestOption::Host(_) => "host",
            RequestOption::Reader(_) => "reader",
            RequestOption::Context(_) => "context",
            RequestOption::Error(_) => "error",
        }
    }
}

impl fmt::Debug for RequestOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestOption::Header(h) => f.debug_tuple("Header").field(h).finish(),
            RequestOption::HeaderMap(h) => f.debug_tuple("HeaderMap").field(h).finish(),
            RequestOption::BasicAuth(a) => f.debug_tuple("BasicAuth").field(a).finish(),
            RequestOption::Values(v) => f.debug_tuple("Values").field(v).finish(),
            RequestOption::FormData(d) => f.debug_tuple("FormData").field(d).finish(),
            RequestOption::Param(p) => f.debug_tuple("Param").field(p).finish(),
            RequestOption::QueryParam(p) => f.debug_tuple("QueryParam").field(p).finish(),
            RequestOption::Text(t) => f.debug_tuple("Text").field(t).finish(),
            RequestOption::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            RequestOption::Buffer(b) => f.debug_tuple("Buffer").field(&b.len()).finish(),
            RequestOption::File(u) => f.debug_tuple("File").field(u).finish(),
            RequestOption::Files(u) => f.debug_tuple("Files").field(u).finish(),
            RequestOption::Cookie(c) => f.debug_tuple("Cookie").field(c).finish(),
            RequestOption::Host(h) => f.debug_tuple("Host").field(h).finish(),
            RequestOption::Context(c) => f.debug_tuple("Context").field(c).finish(),
            RequestOption::Error(e) => f.debug_tuple("Error").field(e).finish(),
            RequestOption::Json(_)
            | RequestOption::Xml(_)
            | RequestOption::Client(_)
            | RequestOption::Reader(_) => f.write_str(self.kind()),
        }
    }
}

macro_rules! option_from {
    ($($ty:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$ty> for RequestOption {
                fn from(value: $ty) -> Self {
                    RequestOption::$variant(value)
                }
            }
        )+
    };
}

option_from! {
    Header => Header,
    http::HeaderMap => HeaderMap,
    BasicAuth => BasicAuth,
    BodyJson => Json,
    BodyXml => Xml,
    ParamSet => Values,
    FormData => FormData,
    Param => Param,
    QueryParam => QueryParam,
    String => Text,
    Vec<u8> => Bytes,
    Bytes => Buffer,
    HttpClient => Client,
    FileUpload => File,
    Vec<FileUpload> => Files,
    cookie::Cookie<'static> => Cookie,
    Host => Host,
    BodyReader => Reader,
    RequestContext => Context,
    HttpError => Error,
}

impl From<&str> for RequestOption {
    fn from(text: &str) -> Self {
        RequestOption::Text(text.to_owned())
    }
}

impl From<&[u8]> for RequestOption {
    fn from(bytes: &[u8]) -> Self {
        RequestOption::Bytes(bytes.to_vec())
    }
}

impl From<tokio_util::sync::CancellationToken> for RequestOption {
    fn from(token: tokio_util::sync::CancellationToken) -> Self {
        RequestOption::Context(RequestContext::from(token))
    }
}

/// Builds a `Vec<RequestOption>` from values convertible into options.
///
/// ```
/// use ergo_http::{Header, QueryParam, options};
///
/// let opts = options![
///     Header::from([("x-trace", "1")]),
///     QueryParam::from([("page", 2)]),
///     "raw body",
/// ];
/// assert_eq!(opts.len(), 3);
/// ```
#[macro_export]
macro_rules! options {
    () => {
        ::std::vec::Vec::<$crate::RequestOption>::new()
    };
    ($($option:expr),+ $(,)?) => {
        ::std::vec![$($crate::RequestOption::from($option)),+]
    };
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_param_from_display_values() {
        let param = Param::from([("page", 2), ("size", 50)]);
        assert_eq!(param.0.encode().unwrap(), "page=2&size=50");

        let query = QueryParam::new().with("flag", true).with("q", "a b");
        assert_eq!(query.0.encode().unwrap(), "flag=true&q=a+b");
    }

    #[test]
    fn test_header_keeps_order() {
        let header = Header::from([("x-a", "1")]).with("x-a", "2");
        assert_eq!(
            header.into_pairs(),
            vec![
                ("x-a".to_owned(), "1".to_owned()),
                ("x-a".to_owned(), "2".to_owned())
            ]
        );
    }

    #[test]
    fn test_options_macro_converts_payloads() {
        let opts = crate::options![
            "text",
            vec![1_u8, 2, 3],
            Bytes::from_static(b"buf"),
            Host("example.org".to_owned()),
            HttpError::Cancelled,
        ];
        let kinds: Vec<_> = opts.iter().map(RequestOption::kind).collect();
        assert_eq!(kinds, ["text", "bytes", "buffer", "host", "error"]);
        assert!(crate::options![].is_empty());
    }

    #[test]
    fn test_basic_auth_debug_redacts_password() {
        let auth = BasicAuth::new("user", "hunter2");
        let debug = format!("{auth:?}");
        assert!(debug.contains("user"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_error_option_wraps_caller_error() {
        let option = RequestOption::error("boom");
        match option {
            RequestOption::Error(HttpError::Caller(source)) => {
                assert_eq!(source.to_string(), "boom");
            }
            other => panic!("unexpected option: {other:?}"),
        }
    }
}
