use std::ops::ControlFlow;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::AcquireError;
use super::Reason;
use super::TokenSource;

/// A source that admits everyone immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl TokenSource for Unlimited {
    #[inline]
    fn try_acquire(&self) -> ControlFlow<Reason> {
        ControlFlow::Continue(())
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Result<(), AcquireError> {
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }
        Ok(())
    }
}
