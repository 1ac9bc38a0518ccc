//! Small helpers shared by the gateway actors.

use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use tokio::task::AbortHandle;
use tracing::trace;

/// Resolves to pending if the inner is `None`.
///
/// Lets a `select!` arm stay dormant until it is armed, which is how the
/// actors handle their optional request and refresh deadlines.
#[derive(Debug)]
pub(crate) struct MaybeFuture<T> {
    /// Future to be polled.
    pub inner: Option<T>,
}

impl<T: Future + Unpin> Future for MaybeFuture<T> {
    type Output = T::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            Some(ref mut t) => Pin::new(t).poll(cx),
            None => Poll::Pending,
        }
    }
}

/// Aborts the wrapped task when dropped.
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    task_name: &'static str,
    handle: AbortHandle,
}

impl CancelOnDrop {
    pub(crate) fn new(task_name: &'static str, handle: AbortHandle) -> Self {
        CancelOnDrop { task_name, handle }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.handle.abort();
        trace!("{} task cancelled", self.task_name);
    }
}

/// Unix wall-clock time, in milliseconds.
pub(crate) fn now_unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock set before the unix epoch")
        .as_millis() as u64
}

/// Random port in the IANA dynamic range (49152-65535).
pub(crate) fn ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(49152..=65535)
}
