//! Clock-offset provider seam
//!
//! The offset measurement itself (round-trip sampling against a timeserver)
//! lives behind [`ClockOffsetProvider`]. A [`ClockBinder`] creates one
//! provider per channel when the server names the channel's timeserver.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use syncsocket_core::{SyncResult, TimeserverId};

/// Future returned by [`ClockOffsetProvider::sync`]
pub type SyncFuture<'a> = Pin<Box<dyn Future<Output = SyncResult> + Send + 'a>>;

/// Measures the offset between the local clock and a timeserver.
///
/// `adjust` in the result is `remote - local` in milliseconds. Timeouts and
/// retries inside one measurement are the provider's own business; a
/// measurement that gives up resolves with `successful = false`.
pub trait ClockOffsetProvider: Send + Sync {
    fn sync(&self) -> SyncFuture<'_>;
}

/// Creates a provider bound to a timeserver
pub trait ClockBinder: Send + Sync {
    fn bind(&self, timeserver: &TimeserverId) -> Arc<dyn ClockOffsetProvider>;
}

impl<F> ClockBinder for F
where
    F: Fn(&TimeserverId) -> Arc<dyn ClockOffsetProvider> + Send + Sync,
{
    fn bind(&self, timeserver: &TimeserverId) -> Arc<dyn ClockOffsetProvider> {
        self(timeserver)
    }
}
