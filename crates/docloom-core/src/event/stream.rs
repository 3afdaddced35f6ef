//! Server-sent-events rendering of a progress subscription.

use std::time::Duration;

use futures_util::Stream;

use super::bus::Subscription;

/// SSE comment line emitted when the subscription has been idle for a full window.
pub const KEEPALIVE_FRAME: &str = ": keepalive\n\n";

/// Shortest idle window; a zero window would emit keep-alives back to back.
pub const MIN_KEEPALIVE: Duration = Duration::from_secs(1);

/// Turn a subscription into a stream of SSE frames.
///
/// Yields `event: <type>\ndata: <json>\n\n` per event (starting with
/// `connected`) and a keep-alive comment after every `keepalive` of silence
/// (at least [`MIN_KEEPALIVE`]).
/// The stream ends after a terminal event. Dropping it drops the
/// subscription, which unsubscribes from the bus.
pub fn progress_stream(mut subscription: Subscription, keepalive: Duration) -> impl Stream<Item = String> + Send {
    let keepalive = keepalive.max(MIN_KEEPALIVE);
    async_stream::stream! {
        let execution_id = subscription.execution_id();
        loop {
            match tokio::time::timeout(keepalive, subscription.recv()).await {
                Ok(Some(event)) => {
                    let terminal = event.event_type.is_terminal();
                    yield event.to_sse_frame();
                    if terminal {
                        tracing::debug!(execution_id = %execution_id, "terminal event sent, closing progress stream");
                        break;
                    }
                }
                Ok(None) => break,
                Err(_) => yield KEEPALIVE_FRAME.to_string(),
            }
        }
    }
}
