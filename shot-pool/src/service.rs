use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use futures::future::BoxFuture;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tower::Service;

use shot_permit::AcquireError;
use shot_permit::TokenSource;

use crate::error::JobError;

/// Gates an inner service on permits from a [`TokenSource`].
///
/// `poll_ready` first waits for the inner service, then for one permit. The
/// permit is spent by the next `call`. Waiting for the permit can be cancelled
/// through the service's [`CancellationToken`], in which case readiness fails
/// with [`AcquireError`].
pub struct AdmissionService<L, S>
where
    L: ?Sized,
{
    inner: S,
    source: Arc<L>,
    cancel: CancellationToken,
    acquiring: Option<BoxFuture<'static, Result<(), AcquireError>>>,
    permit_acquired: bool,
    timeout: Option<Duration>,
}

pin_project! {
    /// A future that wraps the inner service future with the job timeout.
    pub struct ResponseFuture<F> {
        #[pin]
        inner: F,
        deadline: Option<Pin<Box<Sleep>>>,
        limit: Duration,
    }
}

impl<F> ResponseFuture<F> {
    fn new(inner: F, limit: Option<Duration>) -> Self {
        Self {
            inner,
            deadline: limit.map(|limit| Box::pin(sleep(limit))),
            limit: limit.unwrap_or_default(),
        }
    }
}

impl<F, T, E> Future for ResponseFuture<F>
where
    F: Future<Output = Result<T, E>>,
    E: From<BoxError>,
{
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(res) = this.inner.poll(cx) {
            return Poll::Ready(res);
        }
        if let Some(deadline) = this.deadline.as_mut()
            && deadline.as_mut().poll(cx).is_ready()
        {
            let err: BoxError = Box::new(JobError::TimedOut(*this.limit));
            return Poll::Ready(Err(E::from(err)));
        }
        Poll::Pending
    }
}

// Manually implement Clone because the in-flight acquisition cannot be cloned
impl<L, S> Clone for AdmissionService<L, S>
where
    L: ?Sized,
    S: Clone,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            source: Arc::clone(&self.source),
            cancel: self.cancel.clone(),
            // We start with a fresh permit state for the new clone
            acquiring: None,
            permit_acquired: false,
            timeout: self.timeout,
        }
    }
}

impl<L, S> std::fmt::Debug for AdmissionService<L, S>
where
    L: std::fmt::Debug + ?Sized,
    S: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionService")
            .field("inner", &self.inner)
            .field("source", &self.source)
            .field("permit_acquired", &self.permit_acquired)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<L, S, Req> Service<Req> for AdmissionService<L, S>
where
    L: TokenSource + ?Sized + 'static,
    S: Service<Req, Error = BoxError>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // 1. Check inner service readiness FIRST to avoid holding a permit we can't use
        match self.inner.poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }

        if self.permit_acquired {
            return Poll::Ready(Ok(()));
        }

        // 2. Fast path: a stored permit
        if self.acquiring.is_none()
            && let ControlFlow::Continue(()) = self.source.try_acquire()
        {
            self.permit_acquired = true;
            return Poll::Ready(Ok(()));
        }

        // 3. Otherwise wait for one
        let acquiring = self.acquiring.get_or_insert_with(|| {
            let source = Arc::clone(&self.source);
            let cancel = self.cancel.clone();
            let fut: BoxFuture<'static, Result<(), AcquireError>> =
                Box::pin(async move { source.acquire(&cancel).await });
            fut
        });

        match acquiring.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => {
                self.acquiring = None;
                match res {
                    Ok(()) => {
                        self.permit_acquired = true;
                        Poll::Ready(Ok(()))
                    }
                    Err(err) => Poll::Ready(Err(err.into())),
                }
            }
        }
    }

    fn call(&mut self, req: Req) -> Self::Future {
        self.permit_acquired = false;
        ResponseFuture::new(self.inner.call(req), self.timeout)
    }
}

impl<L, S> AdmissionService<L, S>
where
    L: ?Sized,
{
    pub fn new(inner: S, source: Arc<L>) -> Self {
        Self {
            inner,
            source,
            cancel: CancellationToken::new(),
            acquiring: None,
            permit_acquired: false,
            timeout: None,
        }
    }

    /// Abandon permit waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail calls that take longer than `timeout` with [`JobError::TimedOut`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}
