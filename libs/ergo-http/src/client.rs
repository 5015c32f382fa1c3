use crate::builder::HttpClientBuilder;
use crate::body::RequestBody;
use crate::config::{
    DEFAULT_USER_AGENT, DumpOptions, HttpClientConfig, JsonEncodeOptions, XmlEncodeOptions,
};
use crate::context::guarded;
use crate::error::HttpError;
use crate::layers::CookieJar;
use crate::option::RequestOption;
use crate::request::{PendingRequest, Prepared};
use crate::response::{HttpResponse, ResponseBody};
use http::{HeaderValue, Method, Request, Response};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tower::Service;
use tower::buffer::Buffer;
use tower_http::follow_redirect::RequestUri;
use url::Url;

/// Type alias for the future type of the inner service
pub type ServiceFuture =
    Pin<Box<dyn Future<Output = Result<Response<ResponseBody>, HttpError>> + Send>>;

/// Type alias for the buffered service
pub type BufferedService = Buffer<Request<RequestBody>, ServiceFuture>;

/// Request-shaping settings of one client.
///
/// Unlike the transport, these always come from the client a call is made
/// on, even when a `Client` option routes the call through another one.
#[derive(Debug, Clone)]
pub(crate) struct ClientSettings {
    pub(crate) user_agent: HeaderValue,
    pub(crate) max_body_size: usize,
    pub(crate) body_capture_limit: usize,
    pub(crate) json: Option<JsonEncodeOptions>,
    pub(crate) xml: Option<XmlEncodeOptions>,
    pub(crate) dump: Option<DumpOptions>,
}

impl ClientSettings {
    pub(crate) fn from_config(config: &HttpClientConfig) -> Result<Self, HttpError> {
        Ok(Self {
            user_agent: HeaderValue::from_str(&config.user_agent)?,
            max_body_size: config.max_body_size,
            body_capture_limit: config.body_capture_limit,
            json: config.json.clone(),
            xml: config.xml,
            dump: config.dump,
        })
    }
}

impl Default for ClientSettings {
    fn default() -> Self {
        let config = HttpClientConfig::default();
        Self {
            user_agent: HeaderValue::from_static(DEFAULT_USER_AGENT),
            max_body_size: config.max_body_size,
            body_capture_limit: config.body_capture_limit,
            json: None,
            xml: None,
            dump: None,
        }
    }
}

/// HTTP client driven by option lists
///
/// Every call takes a method, a URL and a list of [`RequestOption`]s, usually
/// built with [`options!`](crate::options). The response is returned for any
/// status; use [`HttpResponse::error_for_status`] to turn non-2xx into errors.
///
/// # Thread Safety
///
/// `HttpClient` is `Clone + Send + Sync`. Cloning is cheap (internal channel
/// clone) and clones share the connection pool and cookie jar. The client
/// uses `tower::buffer::Buffer` internally, so callers do NOT need to wrap it
/// in a `Mutex`.
///
/// # Example
///
/// ```ignore
/// use ergo_http::{HttpClient, QueryParam, options};
///
/// let client = HttpClient::new()?;
/// let mut resp = client
///     .get("https://example.com/search", options![QueryParam::from([("q", "rust")])])
///     .await?;
/// let page = resp.text_utf8().await?;
/// ```
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) service: BufferedService,
    pub(crate) settings: Arc<ClientSettings>,
    pub(crate) jar: Option<CookieJar>,
}

impl HttpClient {
    /// Create a new HTTP client with default configuration
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails
    pub fn new() -> Result<Self, HttpError> {
        HttpClientBuilder::new().build()
    }

    /// Create a builder for configuring the HTTP client
    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// The client's cookie jar, unless cookies are disabled
    #[must_use]
    pub fn cookie_jar(&self) -> Option<&CookieJar> {
        self.jar.as_ref()
    }

    /// Send one request built from `options`.
    ///
    /// Options are applied in order. Headers accumulate, while bodies and the
    /// `Client` override are replaced by later options of the same kind.
    /// Request-level defaults (user agent, encoder settings, dump) always
    /// come from `self`.
    ///
    /// # Errors
    /// Returns construction errors before any I/O (including an `Error`
    /// option), and transport, timeout or cancellation errors from the round
    /// trip. HTTP error statuses are not errors here.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        let mut pending = PendingRequest::new(method, url)?;
        for option in options {
            pending.apply(option, &self.settings)?;
        }
        let Prepared {
            request,
            info,
            request_body,
            capture,
            multipart,
            context,
            client,
        } = pending.finalize(&self.settings).await?;

        // Building the body may read files; do not dial out for a context that ended meanwhile.
        if let Some(ctx) = &context {
            ctx.check()?;
        }

        tracing::debug!(method = %info.method(), url = %info.url(), "sending request");

        let mut service = client.as_ref().unwrap_or(self).service.clone();
        let response = guarded(context.as_ref(), async move {
            try_acquire_buffer_slot(&mut service).await?;
            service.call(request).await.map_err(map_buffer_error)
        })
        .await?;

        let final_url = response
            .extensions()
            .get::<RequestUri>()
            .and_then(|uri| Url::parse(&uri.0.to_string()).ok());
        let info = match final_url {
            Some(url) if url != *info.url() => info.redirected_to(url),
            _ => info,
        };
        tracing::debug!(status = %response.status(), url = %info.url(), "response received");

        let mut response = HttpResponse::new(response, info, self.settings.max_body_size);
        response.request_body = capture.map_or(request_body, |c| c.snapshot());
        response.multipart = multipart;
        response.context = context;

        if let Some(options) = self.settings.dump {
            let dump = response.dump(options).await;
            tracing::info!(target: "ergo_http::dump", "{dump}");
        }
        Ok(response)
    }

    /// Send a GET request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn get(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::GET, url, options).await
    }

    /// Send a POST request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn post(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::POST, url, options).await
    }

    /// Send a PUT request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn put(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::PUT, url, options).await
    }

    /// Send a PATCH request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn patch(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::PATCH, url, options).await
    }

    /// Send a DELETE request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn delete(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::DELETE, url, options).await
    }

    /// Send a HEAD request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn head(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::HEAD, url, options).await
    }

    /// Send an OPTIONS request
    ///
    /// # Errors
    /// See [`execute`](Self::execute).
    pub async fn options(
        &self,
        url: &str,
        options: impl IntoIterator<Item = RequestOption>,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(Method::OPTIONS, url, options).await
    }
}

/// Send a request through a fresh default client.
///
/// A new client is built per call because the buffer worker is bound to the
/// runtime that created it. Cookies do not carry over between calls; keep an
/// [`HttpClient`] for that.
///
/// # Errors
/// See [`HttpClient::execute`]; also fails if the default client cannot be built.
pub async fn execute(
    method: Method,
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    HttpClient::new()?.execute(method, url, options).await
}

/// GET through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn get(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::GET, url, options).await
}

/// POST through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn post(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::POST, url, options).await
}

/// PUT through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn put(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::PUT, url, options).await
}

/// PATCH through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn patch(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::PATCH, url, options).await
}

/// DELETE through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn delete(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::DELETE, url, options).await
}

/// HEAD through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn head(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::HEAD, url, options).await
}

/// OPTIONS through a fresh default client.
///
/// # Errors
/// See [`execute`].
pub async fn options(
    url: &str,
    options: impl IntoIterator<Item = RequestOption>,
) -> Result<HttpResponse, HttpError> {
    execute(Method::OPTIONS, url, options).await
}

/// Map buffer errors to `HttpError`
///
/// Buffer can return `ServiceError` which wraps the inner service error,
/// or `Closed` if the buffer worker has shut down.
pub fn map_buffer_error(err: tower::BoxError) -> HttpError {
    match err.downcast::<HttpError>() {
        Ok(http_err) => *http_err,
        Err(err) => {
            // Worker panicked or its runtime shut down. Distinct from
            // Overloaded, which is a normal full-buffer condition.
            tracing::error!(
                error = %err,
                "buffer worker closed unexpectedly; service unavailable"
            );
            HttpError::ServiceClosed
        }
    }
}

/// Try to acquire a buffer slot with fail-fast semantics.
///
/// If the buffer is full, returns `HttpError::Overloaded` immediately instead
/// of blocking. This prevents request pile-up under load.
pub async fn try_acquire_buffer_slot(service: &mut BufferedService) -> Result<(), HttpError> {
    use std::task::Poll;

    let poll_result = std::future::poll_fn(|cx| match service.poll_ready(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await;

    match poll_result {
        Some(Ok(())) => Ok(()),
        Some(Err(e)) => Err(map_buffer_error(e)),
        None => Err(HttpError::Overloaded),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::{HttpClient, map_buffer_error};
    use crate::config::{HttpClientConfig, RedirectConfig};
    use crate::context::RequestContext;
    use crate::error::HttpError;
    use crate::option::{Header, Param, QueryParam};
    use crate::options;
    use crate::builder::HttpClientBuilder;
    use httpmock::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn test_client() -> HttpClient {
        HttpClientBuilder::with_config(HttpClientConfig::for_testing())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_client_get_with_query() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/search").query_param("q", "rust");
            then.status(200).json_body(json!({"success": true}));
        });

        let client = test_client();
        let url = format!("{}/search", server.base_url());
        let mut resp = client
            .get(&url, options![Param::from([("q", "rust")])])
            .await
            .unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["success"], true);
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_http_client_post_form() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/submit")
                .header("content-type", "application/x-www-form-urlencoded; charset=UTF-8")
                .body("key1=value1&key2=value2");
            then.status(200);
        });

        let client = test_client();
        let url = format!("{}/submit", server.base_url());
        let resp = client
            .post(&url, options![Param::from([("key1", "value1"), ("key2", "value2")])])
            .await
            .unwrap();

        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.request_body(), "key1=value1&key2=value2");
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_custom_user_agent_and_override() {
        let server = MockServer::start();
        let default_ua = server.mock(|when, then| {
            when.method(GET).path("/ua").header("user-agent", "custom/1.0");
            then.status(200);
        });

        let client = HttpClientBuilder::with_config(HttpClientConfig::for_testing())
            .user_agent("custom/1.0")
            .build()
            .unwrap();
        let url = format!("{}/ua", server.base_url());
        client.get(&url, options![]).await.unwrap();
        assert_eq!(default_ua.calls(), 1);

        let explicit = server.mock(|when, then| {
            when.method(GET).path("/ua").header("user-agent", "caller/2.0");
            then.status(204);
        });
        let resp = client
            .get(&url, options![Header::from([("User-Agent", "caller/2.0")])])
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::NO_CONTENT);
        assert_eq!(explicit.calls(), 1);
    }

    #[tokio::test]
    async fn test_body_size_limit() {
        let server = MockServer::start();
        let large_body = "x".repeat(64 * 1024);
        server.mock(|when, then| {
            when.method(GET).path("/large");
            then.status(200).body(&large_body);
        });

        let client = HttpClientBuilder::with_config(HttpClientConfig::for_testing())
            .max_body_size(1024)
            .build()
            .unwrap();
        let url = format!("{}/large", server.base_url());
        let mut resp = client.get(&url, options![]).await.unwrap();
        let err = resp.bytes().await.unwrap_err();

        let HttpError::Body(inner) = err else {
            panic!("expected body error, got {err:?}");
        };
        assert!(matches!(
            inner.downcast_ref::<HttpError>(),
            Some(HttpError::BodyTooLarge { limit: 1024, .. })
        ));
    }

    #[tokio::test]
    async fn test_non_2xx_is_a_response() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404)
                .header("content-type", "application/json")
                .json_body(json!({"error": "not found"}));
        });

        let client = test_client();
        let url = format!("{}/missing", server.base_url());
        let resp = client.get(&url, options![]).await.unwrap();
        assert_eq!(resp.status(), http::StatusCode::NOT_FOUND);

        match resp.error_for_status() {
            Err(HttpError::HttpStatus { status, .. }) => {
                assert_eq!(status, http::StatusCode::NOT_FOUND);
            }
            other => panic!(
                "expected HttpStatus error, got {:?}",
                other.as_ref().map(crate::HttpResponse::status)
            ),
        }
    }

    #[tokio::test]
    async fn test_redirect_followed_and_recorded() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/old");
            then.status(302).header("location", "/new");
        });
        server.mock(|when, then| {
            when.method(GET).path("/new");
            then.status(200).body("moved here");
        });

        let client = test_client();
        let mut resp = client
            .get(&format!("{}/old", server.base_url()), options![])
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::OK);
        assert_eq!(resp.request().url().path(), "/new");
        assert_eq!(resp.text().await.unwrap(), "moved here");
    }

    #[tokio::test]
    async fn test_redirect_disabled_exposes_location() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/old");
            then.status(301).header("location", "/new?x=1");
        });

        let client = HttpClientBuilder::with_config(HttpClientConfig {
            redirect: RedirectConfig::disabled(),
            ..HttpClientConfig::for_testing()
        })
        .build()
        .unwrap();
        let resp = client
            .get(&format!("{}/old", server.base_url()), options![])
            .await
            .unwrap();
        assert_eq!(resp.status(), http::StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            resp.url().unwrap().as_str(),
            format!("{}/new?x=1", server.base_url())
        );
    }

    #[tokio::test]
    async fn test_cookie_jar_replays_cookies() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/login");
            then.status(200).header("set-cookie", "session=abc; Path=/");
        });
        let profile = server.mock(|when, then| {
            when.method(GET)
                .path("/profile")
                .header("cookie", "session=abc");
            then.status(200);
        });

        let client = test_client();
        client
            .get(&format!("{}/login", server.base_url()), options![])
            .await
            .unwrap();
        client
            .get(&format!("{}/profile", server.base_url()), options![])
            .await
            .unwrap();
        assert_eq!(profile.calls(), 1);
    }

    #[tokio::test]
    async fn test_client_option_routes_through_other_client() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/set");
            then.status(200).header("set-cookie", "k=v; Path=/");
        });

        let main = test_client();
        let other = test_client();
        main.get(&format!("{}/set", server.base_url()), options![other.clone()])
            .await
            .unwrap();

        let url = url::Url::parse(&server.base_url()).unwrap();
        let stored_in_other = other
            .cookie_jar()
            .unwrap()
            .lock()
            .get_request_values(&url)
            .count();
        let stored_in_main = main
            .cookie_jar()
            .unwrap()
            .lock()
            .get_request_values(&url)
            .count();
        assert_eq!(stored_in_other, 1);
        assert_eq!(stored_in_main, 0);
    }

    #[tokio::test]
    async fn test_cancelled_context_aborts_call() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/never");
            then.status(200);
        });

        let ctx = RequestContext::new();
        ctx.cancel();
        let client = test_client();
        let result = client
            .get(&format!("{}/never", server.base_url()), options![ctx])
            .await;
        assert!(matches!(result, Err(HttpError::Cancelled)));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_expired_deadline_skips_io() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/late");
            then.status(200);
        });

        let ctx = RequestContext::new().with_timeout(Duration::ZERO);
        let client = test_client();
        let result = client
            .get(&format!("{}/late", server.base_url()), options![ctx])
            .await;
        assert!(matches!(result, Err(HttpError::DeadlineExceeded(_))));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_error_option_skips_io() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/x");
            then.status(200);
        });

        let client = test_client();
        let result = client
            .delete(
                &format!("{}/x", server.base_url()),
                options![QueryParam::from([("a", 1)]), HttpError::Overloaded],
            )
            .await;
        assert!(matches!(result, Err(HttpError::Overloaded)));
        assert_eq!(mock.calls(), 0);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport_error() {
        let client = test_client();
        // Port 9 (discard) is almost never served locally
        let result = client.get("http://127.0.0.1:9/", options![]).await;
        assert!(matches!(result, Err(HttpError::Transport(_))));
    }

    #[test]
    fn test_map_buffer_error_passthrough() {
        let err: tower::BoxError = Box::new(HttpError::Overloaded);
        assert!(matches!(map_buffer_error(err), HttpError::Overloaded));

        let err: tower::BoxError = "worker gone".into();
        assert!(matches!(map_buffer_error(err), HttpError::ServiceClosed));
    }
}
