#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Option-driven async HTTP client
//!
//! Every request is a method, a URL and a list of options. Headers, query
//! and form parameters, bodies, uploads, cookies and cancellation all
//! arrive the same way, in any order:
//!
//! ```ignore
//! use ergo_http::{BodyJson, Header, HttpClient, QueryParam, options};
//!
//! let client = HttpClient::new()?;
//! let mut resp = client
//!     .post(
//!         "https://api.example.com/items",
//!         options![
//!             Header::from([("x-request-id", "42")]),
//!             QueryParam::from([("dry_run", true)]),
//!             BodyJson::new(serde_json::json!({"name": "widget"})),
//!         ],
//!     )
//!     .await?;
//! let created: Item = resp.json().await?;
//! ```
//!
//! The crate provides:
//! - hyper 1.x transport with rustls, connection pooling and HTTP/2 via ALPN
//! - Redirect following, a per-client cookie jar and an optional proxy tunnel
//! - `multipart/form-data` uploads from any `AsyncRead`
//! - Lazily read, memoized response bodies with gzip and deflate decoding
//! - Charset detection and conversion for non-UTF-8 pages ([`charset`])
//!
//! # Body Decoding
//!
//! Compressed bodies are decoded according to `Content-Encoding`. The size
//! limit applies to **decoded** bytes held in memory; streaming accessors
//! (`to_file`, `into_body`) are not limited.

mod body;
mod builder;
pub mod charset;
mod client;
mod config;
mod context;
mod decode;
mod error;
mod layers;
mod multipart;
mod option;
mod params;
mod pool;
mod request;
mod response;
mod tls;

pub use body::{
    BodyJson, BodyReader, BodyXml, FORM_CONTENT_TYPE, JSON_CONTENT_TYPE, RequestBody,
    XML_CONTENT_TYPE,
};
pub use builder::HttpClientBuilder;
pub use client::{HttpClient, delete, execute, get, head, options, patch, post, put};
pub use config::{
    DEFAULT_BODY_CAPTURE_LIMIT, DEFAULT_USER_AGENT, DumpOptions, HttpClientConfig,
    JsonEncodeOptions, RedirectConfig, TlsRootConfig, XmlEncodeOptions,
};
pub use context::RequestContext;
pub use error::{BoxError, HttpError, InvalidUriKind};
pub use layers::{CookieJar, CookieLayer, CookieService, RedirectPolicy};
pub use multipart::{DEFAULT_UPLOAD_FIELD, FileUpload, MultipartEncoder};
pub use option::{BasicAuth, FormData, Header, Host, Param, QueryParam, RequestOption};
pub use params::ParamSet;
pub use response::{HttpResponse, RequestInfo, ResponseBody};
