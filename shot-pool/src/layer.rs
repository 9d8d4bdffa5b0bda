use std::sync::Arc;
use std::time::Duration;

use shot_permit::TokenSource;
use tokio_util::sync::CancellationToken;
use tower::Layer;

use crate::service::AdmissionService;

/// Applies permit based admission to a work function.
#[derive(Debug)]
pub struct AdmissionLayer<L>
where
    L: ?Sized,
{
    source: Arc<L>,
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl<L> Clone for AdmissionLayer<L>
where
    L: ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            cancel: self.cancel.clone(),
            timeout: self.timeout,
        }
    }
}

impl<L> AdmissionLayer<L>
where
    L: TokenSource + ?Sized,
{
    /// Create an AdmissionLayer
    pub fn new(source: Arc<L>) -> Self {
        AdmissionLayer {
            source,
            cancel: None,
            timeout: None,
        }
    }

    /// Release services blocked waiting for a permit when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Set a per-call execution timeout.
    ///
    /// The timeout covers the inner call only, not the wait for a permit.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<L, S> Layer<S> for AdmissionLayer<L>
where
    L: ?Sized,
{
    type Service = AdmissionService<L, S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc = AdmissionService::new(service, self.source.clone());
        if let Some(cancel) = &self.cancel {
            svc = svc.with_cancellation(cancel.clone());
        }
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
