use crate::body::RequestBody;
use crate::client::{BufferedService, ClientSettings, HttpClient};
use crate::config::{
    DumpOptions, HttpClientConfig, JsonEncodeOptions, RedirectConfig, TlsRootConfig,
    XmlEncodeOptions,
};
use crate::error::{BoxError, HttpError, InvalidUriKind};
use crate::layers::{CookieJar, CookieLayer, RedirectPolicy};
use crate::response::ResponseBody;
use crate::tls;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::future::BoxFuture;
use http::{HeaderValue, Response, Uri};
use http_body_util::BodyExt;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::connect::proxy::Tunnel;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tower::buffer::Buffer;
use tower::timeout::TimeoutLayer;
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::follow_redirect::FollowRedirectLayer;
use url::Url;

/// Builder for constructing an [`HttpClient`] with a layered tower middleware stack.
pub struct HttpClientBuilder {
    config: HttpClientConfig,
}

impl HttpClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
        }
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: HttpClientConfig) -> Self {
        Self { config }
    }

    /// Set the per-request timeout
    ///
    /// Covers the round trip including redirects, up to the response head.
    /// Body reads are bounded by a `Context` option instead.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Set the default user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the maximum decoded body size held in memory
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    #[must_use]
    pub fn redirect(mut self, config: RedirectConfig) -> Self {
        self.config.redirect = config;
        self
    }

    /// Set the maximum number of redirects to follow
    #[must_use]
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.redirect.max_redirects = max_redirects;
        self
    }

    /// Return 3xx responses to the caller instead of following them
    #[must_use]
    pub fn no_redirects(mut self) -> Self {
        self.config.redirect = RedirectConfig::disabled();
        self
    }

    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Skip server certificate verification
    ///
    /// **WARNING**: only for test hosts with self-signed certificates.
    #[must_use]
    pub fn danger_accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.accept_invalid_certs = accept;
        self
    }

    /// Tunnel every connection through an HTTP proxy
    ///
    /// Userinfo in the URL is sent as `Proxy-Authorization: Basic`.
    #[must_use]
    pub fn proxy(mut self, url: impl Into<String>) -> Self {
        self.config.proxy = Some(url.into());
        self
    }

    /// Enable or disable the in-memory cookie jar
    #[must_use]
    pub fn cookies(mut self, enabled: bool) -> Self {
        self.config.cookies = enabled;
        self
    }

    #[must_use]
    pub fn json_options(mut self, options: JsonEncodeOptions) -> Self {
        self.config.json = Some(options);
        self
    }

    #[must_use]
    pub fn xml_options(mut self, options: XmlEncodeOptions) -> Self {
        self.config.xml = Some(options);
        self
    }

    /// Log a dump of every successful exchange
    #[must_use]
    pub fn dump(mut self, options: DumpOptions) -> Self {
        self.config.dump = Some(options);
        self
    }

    /// Set how many bytes of a streamed request body are kept for inspection
    #[must_use]
    pub fn body_capture_limit(mut self, limit: usize) -> Self {
        self.config.body_capture_limit = limit;
        self
    }

    /// Set the buffer capacity for concurrent request handling
    ///
    /// Tower's Buffer panics with capacity=0, so the value is clamped to 1.
    #[must_use]
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.config.buffer_capacity = capacity.max(1);
        self
    }

    /// Set the idle connection timeout; `None` uses hyper-util's default
    #[must_use]
    pub fn pool_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pool_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_idle_per_host = max;
        self
    }

    /// Build the HTTP client
    ///
    /// Must be called inside a tokio runtime: the buffer worker is spawned
    /// here and lives as long as that runtime.
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails, the proxy URL is invalid,
    /// or the user agent is not a valid header value.
    pub fn build(self) -> Result<HttpClient, HttpError> {
        if self.config.accept_invalid_certs {
            tracing::warn!("TLS certificate verification disabled; use only against test hosts");
        }

        let timeout = self.config.request_timeout;
        let settings = ClientSettings::from_config(&self.config)?;

        let connector = build_connector(self.config.proxy.as_deref())?;
        let https = build_https_connector(
            self.config.tls_roots,
            self.config.accept_invalid_certs,
            connector,
        )?;

        // pool_timer is required for pool_idle_timeout to take effect
        let mut client_builder = Client::builder(TokioExecutor::new());
        client_builder
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .http2_only(false);
        if let Some(idle_timeout) = self.config.pool_idle_timeout {
            client_builder.pool_idle_timeout(idle_timeout);
        }
        let hyper_client = client_builder.build::<_, RequestBody>(https);

        let jar = self.config.cookies.then(CookieJar::default);

        // Request flow (outer to inner):
        //   Buffer -> ErrorMapping -> Timeout -> FollowRedirect -> [Cookies?] -> hyper_client
        //
        // Cookies sit inside FollowRedirect so each hop reads and feeds the
        // jar. 3xx responses surface only when the policy stops the chain.
        let service = ServiceBuilder::new()
            .layer(TimeoutLayer::new(timeout))
            .layer(FollowRedirectLayer::with_policy(RedirectPolicy::new(
                self.config.redirect.clone(),
            )))
            .option_layer(jar.clone().map(CookieLayer::new))
            .service(hyper_client);

        let service = service
            .map_response(box_response)
            .map_err(move |e: tower::BoxError| map_tower_error(e, timeout));

        let buffer_capacity = self.config.buffer_capacity.max(1);
        let buffered: BufferedService = Buffer::new(service.boxed_clone(), buffer_capacity);

        Ok(HttpClient {
            service: buffered,
            settings: Arc::new(settings),
            jar,
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Map tower errors to `HttpError` with the configured timeout
fn map_tower_error(err: tower::BoxError, timeout: Duration) -> HttpError {
    if err.is::<tower::timeout::error::Elapsed>() {
        return HttpError::Timeout(timeout);
    }

    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(other) => HttpError::Transport(other),
    }
}

fn box_response<B>(response: Response<B>) -> Response<ResponseBody>
where
    B: hyper::body::Body<Data = bytes::Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (parts, body) = response.into_parts();
    Response::from_parts(parts, body.map_err(Into::into).boxed())
}

/// TCP connector, optionally tunnelled through an HTTP proxy.
#[derive(Clone)]
pub(crate) enum Connector {
    Direct(HttpConnector),
    Tunnel(Tunnel<HttpConnector>),
}

impl Service<Uri> for Connector {
    type Response = TokioIo<TcpStream>;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match self {
            Connector::Direct(http) => http.poll_ready(cx).map_err(Into::into),
            Connector::Tunnel(tunnel) => tunnel.poll_ready(cx).map_err(Into::into),
        }
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        match self {
            Connector::Direct(http) => {
                let fut = http.call(dst);
                Box::pin(async move { fut.await.map_err(Into::into) })
            }
            Connector::Tunnel(tunnel) => {
                let fut = tunnel.call(dst);
                Box::pin(async move { fut.await.map_err(Into::into) })
            }
        }
    }
}

fn build_connector(proxy: Option<&str>) -> Result<Connector, HttpError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);

    let Some(raw) = proxy else {
        return Ok(Connector::Direct(http));
    };

    let invalid = |kind, reason: String| HttpError::InvalidUri {
        url: raw.to_owned(),
        kind,
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(InvalidUriKind::ParseError, e.to_string()))?;
    if url.scheme() != "http" {
        return Err(invalid(
            InvalidUriKind::UnsupportedScheme,
            format!("proxy must use http://, got {}", url.scheme()),
        ));
    }
    let Some(host) = url.host_str().filter(|h| !h.is_empty()) else {
        return Err(invalid(
            InvalidUriKind::MissingAuthority,
            "proxy URL has no host".to_owned(),
        ));
    };
    let port = url.port_or_known_default().unwrap_or(80);
    let dst: Uri = format!("http://{host}:{port}")
        .parse()
        .map_err(|e: http::uri::InvalidUri| invalid(InvalidUriKind::ParseError, e.to_string()))?;

    let mut tunnel = Tunnel::new(dst, http);
    if !url.username().is_empty() {
        let credentials = format!("{}:{}", url.username(), url.password().unwrap_or_default());
        let mut auth = HeaderValue::try_from(format!("Basic {}", BASE64.encode(credentials)))?;
        auth.set_sensitive(true);
        tunnel = tunnel.with_auth(auth);
    }
    tracing::debug!(proxy = %host, port, "routing connections through proxy");
    Ok(Connector::Tunnel(tunnel))
}

/// Wrap `connector` with TLS for the configured trust roots.
///
/// Both `http` and `https` targets are accepted. HTTP/2 is offered through
/// ALPN on TLS connections.
fn build_https_connector(
    tls_roots: TlsRootConfig,
    accept_invalid_certs: bool,
    connector: Connector,
) -> Result<HttpsConnector<Connector>, HttpError> {
    let builder = if accept_invalid_certs {
        HttpsConnectorBuilder::new().with_tls_config(tls::insecure_client_config()?)
    } else {
        match tls_roots {
            TlsRootConfig::WebPki => HttpsConnectorBuilder::new()
                .with_provider_and_webpki_roots(tls::get_crypto_provider())
                .map_err(|e| HttpError::Tls(Box::new(e)))?,
            TlsRootConfig::Native => {
                HttpsConnectorBuilder::new().with_tls_config(tls::native_roots_client_config()?)
            }
        }
    };

    Ok(builder
        .https_or_http()
        .enable_all_versions()
        .wrap_connector(connector))
}
