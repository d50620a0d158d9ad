//! Run log handling.

pub mod reformatter;

pub use reformatter::{reformat_log_stream, LogReformatter, LINE_BLOCK_SIZE, SENTINEL_TIMESTAMP};
