use crate::core::StreamCancelHandle;
use axum::body::Bytes;
use futures::stream::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Response body wrapper that fires its cancel handle when dropped.
///
/// Hyper drops the body when the client goes away, which is how the stream
/// driver learns to stop reading upstream. A normal end of stream marks the
/// handle completed first, so the drop is then a no-op.
pub struct DisconnectStream<S> {
    pub stream: S,
    pub cancel_handle: StreamCancelHandle,
}

impl<S, E> Stream for DisconnectStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl<S> Drop for DisconnectStream<S> {
    fn drop(&mut self) {
        if !self.cancel_handle.is_completed() {
            tracing::debug!("Client disconnect detected - stream cancelled");
        }
        self.cancel_handle.cancel();
    }
}
