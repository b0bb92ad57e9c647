//! Stream plumbing: producer-side staging, consumer-side queues and the
//! readiness policies that sit between them.
//!
//! Every logical stream has one [`OutputStreamManager`](output::OutputStreamManager)
//! on the producer side and one [`InputStreamManager`](input::InputStreamManager)
//! per consumer. Stream managers are allocated once at graph initialization
//! and referenced by index everywhere else, so no component ever holds a
//! pointer into another component.

pub mod handler;
pub mod input;
pub mod output;

pub use handler::InputStreamHandler;
pub use output::OutputStreamShard;
