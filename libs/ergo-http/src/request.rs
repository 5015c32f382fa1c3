use crate::body::{
    BodyCapture, BodyReader, FORM_CONTENT_TYPE, JSON_CONTENT_TYPE, RequestBody, XML_CONTENT_TYPE,
};
use crate::client::{ClientSettings, HttpClient};
use crate::context::RequestContext;
use crate::error::{HttpError, InvalidUriKind};
use crate::multipart::{FileUpload, MultipartEncoder};
use crate::option::RequestOption;
use crate::params::ParamSet;
use crate::response::RequestInfo;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use http::header::{
    AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, HOST, HeaderName, HeaderValue, USER_AGENT,
};
use http::{HeaderMap, Method, Request};
use url::Url;

/// Content type added by the raw [`FormData`](crate::FormData) option.
const RAW_FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

#[derive(Debug, Default)]
enum BodySource {
    #[default]
    None,
    Buffered(Bytes),
    Reader(BodyReader),
}

/// Accumulates options for one call, then builds the outgoing request.
///
/// Options are applied in order by [`apply`](Self::apply). Anything that
/// depends on the whole option list (multipart switch, form routing, query
/// string, default headers) happens afterwards in
/// [`finalize`](Self::finalize), in a fixed order.
pub(crate) struct PendingRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: BodySource,
    query: ParamSet,
    form: ParamSet,
    uploads: Vec<FileUpload>,
    /// Default content types, in registration order; the first one wins
    /// unless a `Content-Type` header was given.
    content_types: Vec<&'static str>,
    host: Option<String>,
    context: Option<RequestContext>,
    client: Option<HttpClient>,
}

/// A request ready for the transport plus what the response keeps about it.
pub(crate) struct Prepared {
    pub(crate) request: Request<RequestBody>,
    pub(crate) info: RequestInfo,
    pub(crate) request_body: Bytes,
    pub(crate) capture: Option<BodyCapture>,
    pub(crate) multipart: Option<MultipartEncoder>,
    pub(crate) context: Option<RequestContext>,
    pub(crate) client: Option<HttpClient>,
}

impl PendingRequest {
    /// Starts a request; fails fast on an empty URL.
    pub(crate) fn new(method: Method, url: &str) -> Result<Self, HttpError> {
        if url.is_empty() {
            return Err(HttpError::InvalidUri {
                url: String::new(),
                kind: InvalidUriKind::Empty,
                reason: "url not specified".to_owned(),
            });
        }
        Ok(Self {
            method,
            url: url.to_owned(),
            headers: HeaderMap::new(),
            body: BodySource::None,
            query: ParamSet::new(),
            form: ParamSet::new(),
            uploads: Vec::new(),
            content_types: Vec::new(),
            host: None,
            context: None,
            client: None,
        })
    }

    /// Applies one option.
    ///
    /// # Errors
    /// Returns the error carried by an `Error` option, or the failure to
    /// encode a body or a header.
    pub(crate) fn apply(
        &mut self,
        option: RequestOption,
        settings: &ClientSettings,
    ) -> Result<(), HttpError> {
        match option {
            RequestOption::Header(header) => {
                for (name, value) in header.into_pairs() {
                    let name = HeaderName::try_from(name)?;
                    let value = HeaderValue::try_from(value)?;
                    self.headers.append(name, value);
                }
            }
            RequestOption::HeaderMap(map) => {
                for (name, value) in &map {
                    self.headers.append(name.clone(), value.clone());
                }
            }
            RequestOption::BasicAuth(auth) => {
                let token = BASE64.encode(format!("{}:{}", auth.username, auth.password));
                let mut value = HeaderValue::try_from(format!("Basic {token}"))?;
                value.set_sensitive(true);
                self.headers.insert(AUTHORIZATION, value);
            }
            RequestOption::Json(json) => {
                self.body = BodySource::Buffered(json.encode(settings.json.as_ref())?);
                self.content_types.push(JSON_CONTENT_TYPE);
            }
            RequestOption::Xml(xml) => {
                self.body = BodySource::Buffered(xml.encode(settings.xml.as_ref())?);
                self.content_types.push(XML_CONTENT_TYPE);
            }
            RequestOption::Values(values) => self.routed_params().extend_from(&values),
            RequestOption::Param(param) => self.routed_params().extend_from(&param.0),
            RequestOption::QueryParam(param) => self.query.extend_from(&param.0),
            RequestOption::FormData(form) => {
                self.body = BodySource::Buffered(Bytes::from(form.0));
                self.headers
                    .append(CONTENT_TYPE, HeaderValue::from_static(RAW_FORM_CONTENT_TYPE));
            }
            RequestOption::Text(text) => self.body = BodySource::Buffered(Bytes::from(text)),
            RequestOption::Bytes(bytes) => self.body = BodySource::Buffered(Bytes::from(bytes)),
            RequestOption::Buffer(bytes) => self.body = BodySource::Buffered(bytes),
            RequestOption::Reader(reader) => self.body = BodySource::Reader(reader),
            RequestOption::Client(client) => self.client = Some(client),
            RequestOption::File(upload) => self.uploads.push(upload),
            RequestOption::Files(uploads) => self.uploads.extend(uploads),
            RequestOption::Cookie(cookie) => {
                let (name, value) = cookie.name_value();
                let pair = format!("{name}={value}");
                let merged = match self.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
                    Some(existing) if !existing.is_empty() => format!("{existing}; {pair}"),
                    _ => pair,
                };
                self.headers.insert(COOKIE, HeaderValue::try_from(merged)?);
            }
            RequestOption::Host(host) => self.host = Some(host.0),
            RequestOption::Context(context) => self.context = Some(context),
            RequestOption::Error(err) => return Err(err),
        }
        Ok(())
    }

    /// Query string for `GET` and `HEAD`, form body for everything else.
    fn routed_params(&mut self) -> &mut ParamSet {
        if self.method == Method::GET || self.method == Method::HEAD {
            &mut self.query
        } else {
            &mut self.form
        }
    }

    fn has_body(&self) -> bool {
        !matches!(self.body, BodySource::None)
    }

    /// Builds the outgoing request.
    ///
    /// # Errors
    /// Returns `HttpError::InvalidUri` for a malformed or non-HTTP URL, and
    /// encoding errors from multipart or form bodies.
    pub(crate) async fn finalize(
        mut self,
        settings: &ClientSettings,
    ) -> Result<Prepared, HttpError> {
        let mut multipart = None;
        let multipart_method = self.method == Method::POST || self.method == Method::PUT;

        if !self.uploads.is_empty() && multipart_method {
            let form = std::mem::take(&mut self.form);
            let mut encoder = MultipartEncoder::new(form, std::mem::take(&mut self.uploads));
            let framed = encoder.encode().await?;
            self.headers
                .insert(CONTENT_TYPE, HeaderValue::try_from(encoder.content_type())?);
            // The caller's length described a body that no longer exists.
            if self.headers.remove(CONTENT_LENGTH).is_some() {
                tracing::debug!("dropped explicit Content-Length for multipart body");
            }
            self.body = BodySource::Buffered(framed);
            multipart = Some(encoder);
        } else {
            if !self.uploads.is_empty() {
                tracing::debug!(
                    method = %self.method,
                    count = self.uploads.len(),
                    "file uploads ignored: multipart needs POST or PUT"
                );
            }
            if !self.form.is_empty() {
                if self.has_body() {
                    let form = std::mem::take(&mut self.form);
                    self.query.extend_from(&form);
                } else {
                    self.body = BodySource::Buffered(Bytes::from(self.form.encode()?));
                    if !self.headers.contains_key(CONTENT_TYPE) {
                        self.headers
                            .insert(CONTENT_TYPE, HeaderValue::from_static(FORM_CONTENT_TYPE));
                    }
                }
            }
        }

        if !self.query.is_empty() {
            let separator = if self.url.contains('?') { '&' } else { '?' };
            self.url.push(separator);
            self.url.push_str(&self.query.encode()?);
        }
        let url = parse_url(&self.url)?;

        if let Some(host) = self.host.take()
            && !self.headers.contains_key(HOST)
        {
            self.headers.insert(HOST, HeaderValue::try_from(host)?);
        }

        if !self.headers.contains_key(CONTENT_TYPE)
            && let Some(&content_type) = self.content_types.first()
        {
            self.headers
                .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }

        if !self.headers.contains_key(USER_AGENT) {
            self.headers.insert(USER_AGENT, settings.user_agent.clone());
        }

        let mut request_body = Bytes::new();
        let mut capture = None;
        let mut body = match self.body {
            BodySource::None => RequestBody::empty(),
            BodySource::Buffered(bytes) => {
                if multipart.is_none() {
                    request_body = bytes.clone();
                }
                RequestBody::full(bytes)
            }
            BodySource::Reader(reader) => {
                let (body, snapshot) =
                    RequestBody::from_reader(reader, settings.body_capture_limit);
                capture = Some(snapshot);
                body
            }
        };

        if let Some(value) = self.headers.get(CONTENT_LENGTH) {
            match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
                Some(declared) => body.set_declared_len(declared),
                None => {
                    tracing::warn!(value = ?value, "ignoring unparsable Content-Length header");
                    self.headers.remove(CONTENT_LENGTH);
                }
            }
        }

        let uri = http::Uri::try_from(url.as_str()).map_err(|e| HttpError::InvalidUri {
            url: url.to_string(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(uri)
            .body(body)?;
        *request.headers_mut() = self.headers.clone();

        Ok(Prepared {
            request,
            info: RequestInfo::new(self.method, url, self.headers),
            request_body,
            capture,
            multipart,
            context: self.context,
            client: self.client,
        })
    }
}

fn parse_url(raw: &str) -> Result<Url, HttpError> {
    let url = Url::parse(raw).map_err(|e| HttpError::InvalidUri {
        url: raw.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(HttpError::InvalidUri {
            url: raw.to_owned(),
            kind: InvalidUriKind::UnsupportedScheme,
            reason: format!(
                "only http:// and https:// schemes are supported, got {}",
                url.scheme()
            ),
        });
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(HttpError::InvalidUri {
            url: raw.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "missing host/authority".to_owned(),
        });
    }
    Ok(url)
}
