//! The persisted and transient shapes described in §3.

mod asset;
mod contract;
mod ticker;

pub use asset::{Asset, AssetStatus};
pub use contract::Contract;
pub use ticker::Ticker;

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A cancellation token checked at stage boundaries and parallel batch
/// boundaries (§4.4, §5).
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: std::sync::Arc<CancellationInner>,
}

#[derive(Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }
}
