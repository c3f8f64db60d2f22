//! Streaming response assembly.
//!
//! Raw provider bytes flow through two stages:
//!
//! ```text
//! bytes --> StreamFrameParser --> StreamFrame --> DeltaMerger --> MergedMessage
//!                                                     |
//!                                                     +--> Fragment / ToolWait (live)
//! ```
//!
//! Both stages are synchronous and process input strictly in arrival order.

mod merger;
mod parser;

pub use merger::{DeltaMerger, MergeEvent, MergedMessage, MergedMessageBuilder, ResponseKey};
pub use parser::{parse_stream, StreamEvent, StreamFrameParser};
