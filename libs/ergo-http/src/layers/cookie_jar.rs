use cookie::Cookie;
use cookie_store::CookieStore;
use futures::future::BoxFuture;
use http::header::{COOKIE, SET_COOKIE};
use http::{HeaderMap, HeaderValue, Request, Response};
use parking_lot::Mutex;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use url::Url;

/// Shared cookie jar of one client.
pub type CookieJar = Arc<Mutex<CookieStore>>;

/// Tower layer that keeps cookies across requests.
///
/// Sits inside the redirect layer so every hop both sends the matching
/// cookies and stores `Set-Cookie` headers from its response.
#[derive(Clone, Default)]
pub struct CookieLayer {
    jar: CookieJar,
}

impl CookieLayer {
    #[must_use]
    pub fn new(jar: CookieJar) -> Self {
        Self { jar }
    }

    #[must_use]
    pub fn jar(&self) -> &CookieJar {
        &self.jar
    }
}

impl<S> Layer<S> for CookieLayer {
    type Service = CookieService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CookieService {
            inner,
            jar: Arc::clone(&self.jar),
        }
    }
}

/// Service that attaches stored cookies and records new ones
#[derive(Clone)]
pub struct CookieService<S> {
    inner: S,
    jar: CookieJar,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for CookieService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ResBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let url = Url::parse(&req.uri().to_string()).ok();
        if let Some(url) = &url {
            attach_cookies(&self.jar, url, req.headers_mut());
        }

        let jar = Arc::clone(&self.jar);
        let fut = self.inner.call(req);
        Box::pin(async move {
            let response = fut.await?;
            if let Some(url) = &url {
                store_cookies(&jar, url, response.headers());
            }
            Ok(response)
        })
    }
}

/// Appends jar cookies after any `Cookie` header set by the caller.
fn attach_cookies(jar: &CookieJar, url: &Url, headers: &mut HeaderMap) {
    let stored: Vec<String> = jar
        .lock()
        .get_request_values(url)
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    if stored.is_empty() {
        return;
    }

    let joined = stored.join("; ");
    let merged = match headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.is_empty() => format!("{existing}; {joined}"),
        _ => joined,
    };
    match HeaderValue::try_from(merged) {
        Ok(value) => {
            headers.insert(COOKIE, value);
        }
        Err(e) => tracing::warn!(error = %e, "stored cookies do not form a valid header"),
    }
}

fn store_cookies(jar: &CookieJar, url: &Url, headers: &HeaderMap) {
    let cookies = headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|raw| Cookie::parse(raw.to_owned()).ok());
    jar.lock().store_response_cookies(cookies, url);
}
