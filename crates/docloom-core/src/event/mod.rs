//! Per-execution progress fan-out.
//!
//! - `ProgressBus`: multicast of [`ProgressEvent`](docloom_types::event::ProgressEvent)s to per-subscriber queues
//! - `stream`: server-sent-events rendering with keep-alives

pub mod bus;
pub mod stream;

pub use bus::{ProgressBus, Subscription};
pub use stream::progress_stream;
