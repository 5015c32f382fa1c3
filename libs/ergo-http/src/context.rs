use crate::error::HttpError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline for one request.
///
/// Passed as [`RequestOption::Context`](crate::RequestOption::Context). It
/// bounds the round trip and every later body read of the same response.
/// Cancelling the token or reaching the deadline aborts whichever of them
/// is in flight.
///
/// ```
/// use ergo_http::RequestContext;
/// use std::time::Duration;
///
/// let ctx = RequestContext::new().with_timeout(Duration::from_secs(2));
/// let handle = ctx.clone();
/// handle.cancel();
/// assert!(ctx.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl RequestContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the request once `timeout` has elapsed from now.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some((Instant::now() + timeout, timeout));
        self
    }

    /// Uses `token` for cancellation instead of a private one.
    #[must_use]
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails immediately when the context is already done.
    pub(crate) fn check(&self) -> Result<(), HttpError> {
        if self.token.is_cancelled() {
            return Err(HttpError::Cancelled);
        }
        match self.deadline {
            Some((at, timeout)) if Instant::now() >= at => {
                Err(HttpError::DeadlineExceeded(timeout))
            }
            _ => Ok(()),
        }
    }

    /// Drives `fut` until it completes or the context ends.
    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T, HttpError>
    where
        F: Future<Output = Result<T, HttpError>>,
    {
        let bounded = async {
            match self.deadline {
                Some((at, timeout)) => tokio::time::timeout_at(at, fut)
                    .await
                    .map_err(|_| HttpError::DeadlineExceeded(timeout))?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(HttpError::Cancelled),
            result = bounded => result,
        }
    }
}

impl From<CancellationToken> for RequestContext {
    fn from(token: CancellationToken) -> Self {
        Self::new().with_token(token)
    }
}

/// Runs `fut` under `ctx` when one was supplied.
pub(crate) async fn guarded<T, F>(ctx: Option<&RequestContext>, fut: F) -> Result<T, HttpError>
where
    F: Future<Output = Result<T, HttpError>>,
{
    match ctx {
        Some(ctx) => ctx.run(fut).await,
        None => fut.await,
    }
}
