//! Redirect policy for the client stack.
//!
//! Redirects are followed across hosts like a browser would, up to
//! [`RedirectConfig::max_redirects`](crate::RedirectConfig) hops. Once the
//! chain leaves the original origin, credentials and any `Host` override are
//! removed from every following request. HTTPS to HTTP hops stop the chain
//! unless allowed.

use crate::body::RequestBody;
use crate::config::RedirectConfig;
use http::{Request, Uri, header};
use tower_http::follow_redirect::policy::{Action, Attempt, Policy};

/// Headers removed once a redirect chain crosses origins
const SENSITIVE_HEADERS: &[header::HeaderName] = &[
    header::AUTHORIZATION,
    header::COOKIE,
    header::PROXY_AUTHORIZATION,
];

/// Redirect policy used by [`HttpClient`](crate::HttpClient).
///
/// Cloned per request by `FollowRedirect`, so the hop counter starts at zero
/// for every call.
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    config: RedirectConfig,
    redirect_count: usize,
    cross_origin_detected: bool,
}

impl RedirectPolicy {
    #[must_use]
    pub fn new(config: RedirectConfig) -> Self {
        Self {
            config,
            redirect_count: 0,
            cross_origin_detected: false,
        }
    }

    /// Same scheme, host and effective port.
    fn is_same_origin(original: &Uri, target: &Uri) -> bool {
        let orig_scheme = original.scheme_str().unwrap_or("https");
        let target_scheme = target.scheme_str().unwrap_or("https");

        let orig_port = original
            .port_u16()
            .unwrap_or_else(|| default_port(orig_scheme));
        let target_port = target
            .port_u16()
            .unwrap_or_else(|| default_port(target_scheme));

        orig_scheme == target_scheme
            && original.host().unwrap_or("") == target.host().unwrap_or("")
            && orig_port == target_port
    }

    fn is_https_downgrade(original: &Uri, target: &Uri) -> bool {
        original.scheme_str() == Some("https") && target.scheme_str() == Some("http")
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "http" => 80,
        "https" => 443,
        _ => 0,
    }
}

impl<E> Policy<RequestBody, E> for RedirectPolicy {
    fn redirect(&mut self, attempt: &Attempt<'_>) -> Result<Action, E> {
        self.redirect_count += 1;
        if self.redirect_count > self.config.max_redirects {
            tracing::debug!(
                count = self.redirect_count,
                max = self.config.max_redirects,
                status = %attempt.status(),
                "redirect limit reached, returning 3xx response"
            );
            return Ok(Action::Stop);
        }

        let previous = attempt.previous();
        let target = attempt.location();

        if !self.config.allow_https_downgrade && Self::is_https_downgrade(previous, target) {
            tracing::warn!(
                previous = %previous,
                target = %target,
                "blocking HTTPS to HTTP downgrade redirect"
            );
            return Ok(Action::Stop);
        }

        if !Self::is_same_origin(previous, target) {
            self.cross_origin_detected = true;
            tracing::debug!(previous = %previous, target = %target, "cross-origin redirect");
        }

        Ok(Action::Follow)
    }

    fn on_request(&mut self, request: &mut Request<RequestBody>) {
        if !self.cross_origin_detected {
            return;
        }
        // A virtual host override only makes sense for the origin it was set for.
        if request.headers_mut().remove(header::HOST).is_some() {
            tracing::debug!("dropped Host override on cross-origin redirect");
        }
        if self.config.strip_sensitive_headers {
            let headers = request.headers_mut();
            for name in SENSITIVE_HEADERS {
                if headers.remove(name).is_some() {
                    tracing::debug!(header = %name, "stripped sensitive header on redirect");
                }
            }
        }
    }

    /// Buffered bodies are replayed on 307/308; streamed bodies stop the chain.
    fn clone_body(&self, body: &RequestBody) -> Option<RequestBody> {
        body.try_clone()
    }
}
