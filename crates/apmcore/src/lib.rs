//! In-process telemetry aggregation core.
//!
//! An embedding host pushes completed request/span/event data in through
//! [`span::SpanApi`] or [`events::EventsPath`]; [`collector`] normalizes,
//! filters, and samples it into the shared [`buffer::Buffer`];
//! [`flusher::Flusher`] periodically drains the buffer, folds it through
//! [`aggregator`], and hands the result to a [`persistence::PersistenceAdapter`].
//! [`lifecycle`] owns the process-wide instance and keeps the flusher's
//! background task alive across a `fork()`.

pub mod aggregator;
pub mod buffer;
pub mod circuit;
pub mod collector;
pub mod config;
pub mod digest;
pub mod error;
pub mod event;
pub mod events;
pub mod fingerprint;
pub mod flusher;
pub mod lifecycle;
pub mod merge;
pub mod persistence;
pub mod segment;
pub mod span;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{BufferItem, CustomEvent, Event, ErrorPayload, Kind, SampleType};
pub use lifecycle::{global, install_global, Core, Lifecycle};
pub use persistence::PersistenceAdapter;
pub use span::SpanApi;

#[cfg(any(test, feature = "test-support"))]
pub use persistence::testing;
