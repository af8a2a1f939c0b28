//! Live transcoding fan-out: one engine-driven graph per resource, its output
//! broadcast to every attached client with the stream header replayed to late
//! joiners.

pub mod client;
pub mod engine;
pub mod error;
pub mod faker;
pub mod gst;
pub mod header;
pub mod pipeline;
pub mod profile;
pub mod sink;

pub use error::{Result, TranscodeError};
