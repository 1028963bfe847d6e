//! Structured activity events for the flurry proxy.
//!
//! The proxy core never talks to an operator surface directly; it emits
//! [`ProxyEvent`] values through a cheap, cloneable [`EventSink`]. A
//! single background [`Reporter`] consumes the stream, keeps the
//! connected-client tally, logs activity through `tracing`, and (when a
//! path is configured) appends every event as one JSON object per line,
//! producing a [JSON Lines](https://jsonlines.org/) activity log that is
//! easy to ship, parse, and replay.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use proxy_events::{EventKind, EventSink, Reporter};
//!
//! # async fn example() {
//! let (sink, stream) = EventSink::channel();
//! let _reporter = Reporter::new(None).spawn(stream);
//!
//! sink.emit(None, EventKind::ProxyStarted {
//!     version: "0.1.0".to_string(),
//! });
//! # }
//! ```

pub mod event;
pub mod sink;

// Re-export the primary public types at the crate root for convenience.
pub use event::{EventKind, ProxyEvent};
pub use sink::{EventSink, EventStream, Reporter};
