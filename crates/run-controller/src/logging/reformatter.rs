//! Repairs the timestamped log format produced by the kubelet.
//!
//! Every physical write in the source is prefixed with an RFC 3339 timestamp
//! and a space. A logical line longer than [`LINE_BLOCK_SIZE`] is split into
//! several physical writes, each with its own timestamp. The reformatter drops
//! those continuation timestamps so every logical line carries exactly one.

use crate::store::LogStream;
use bytes::Bytes;
use chrono::DateTime;
use futures::stream::{self, StreamExt};

/// Size of a physical log block; longer lines are split at this boundary.
pub const LINE_BLOCK_SIZE: usize = 16384;

/// Prefix emitted for lines that arrive without a timestamp.
pub const SENTINEL_TIMESTAMP: &[u8] = b"0001-01-01T00:00:00.000000000Z ";

/// Longest token still considered a candidate timestamp.
const MAX_TIMESTAMP_LEN: usize = 64;

/// Resumable state of the transform. Feed chunks with [`LogReformatter::process`]
/// and call [`LogReformatter::finish`] at end of input.
#[derive(Debug, Default, Clone)]
pub struct LogReformatter {
    /// Message bytes left in the current physical block; zero means a timestamp comes next.
    remaining_block_bytes: usize,
    /// The next timestamp continues a split line and is dropped.
    discard_next_timestamp: bool,
    /// Bytes of a timestamp that started in an earlier chunk.
    pending: Vec<u8>,
}

fn is_timestamp(token: &[u8]) -> bool {
    std::str::from_utf8(token)
        .ok()
        .and_then(|token| DateTime::parse_from_rfc3339(token).ok())
        .is_some()
}

impl LogReformatter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transform one chunk, appending the corrected bytes to `output`.
    pub fn process(&mut self, mut input: &[u8], output: &mut Vec<u8>) {
        while !input.is_empty() {
            if self.remaining_block_bytes == 0 {
                self.read_timestamp(&mut input, output);
            } else {
                self.read_message(&mut input, output);
            }
        }
    }

    /// Flush whatever is still held back at end of input.
    pub fn finish(&mut self, output: &mut Vec<u8>) {
        if self.pending.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.pending);
        if !self.discard_next_timestamp && !is_timestamp(&tail) {
            output.extend_from_slice(SENTINEL_TIMESTAMP);
        }
        output.extend_from_slice(&tail);
        self.remaining_block_bytes = 0;
        self.discard_next_timestamp = false;
    }

    fn read_timestamp(&mut self, input: &mut &[u8], output: &mut Vec<u8>) {
        let budget = MAX_TIMESTAMP_LEN.saturating_sub(self.pending.len());
        let window = &input[..input.len().min(budget)];

        match window.iter().position(|&b| b == b' ' || b == b'\n') {
            Some(end) if window[end] == b' ' => {
                self.pending.extend_from_slice(&window[..end]);
                *input = &input[end + 1..];
                let token = std::mem::take(&mut self.pending);

                if is_timestamp(&token) {
                    if !self.discard_next_timestamp {
                        output.extend_from_slice(&token);
                        output.push(b' ');
                    }
                    self.remaining_block_bytes = LINE_BLOCK_SIZE;
                } else {
                    // Not a timestamp: the token is message content.
                    if !self.discard_next_timestamp {
                        output.extend_from_slice(SENTINEL_TIMESTAMP);
                    }
                    output.extend_from_slice(&token);
                    output.push(b' ');
                    self.remaining_block_bytes = LINE_BLOCK_SIZE - (token.len() + 1);
                }
                self.discard_next_timestamp = true;
            }
            Some(end) => {
                // A whole line with no separator at all.
                self.pending.extend_from_slice(&window[..=end]);
                *input = &input[end + 1..];
                let line = std::mem::take(&mut self.pending);
                if !self.discard_next_timestamp {
                    output.extend_from_slice(SENTINEL_TIMESTAMP);
                }
                output.extend_from_slice(&line);
                self.discard_next_timestamp = false;
            }
            None if window.len() == input.len()
                && self.pending.len() + window.len() < MAX_TIMESTAMP_LEN =>
            {
                // Ran out of input mid-token; resume on the next chunk.
                self.pending.extend_from_slice(window);
                *input = &[];
            }
            None => {
                // Too long to be a timestamp: treat it as the start of an untimestamped line.
                self.pending.extend_from_slice(window);
                *input = &input[window.len()..];
                let content = std::mem::take(&mut self.pending);
                if !self.discard_next_timestamp {
                    output.extend_from_slice(SENTINEL_TIMESTAMP);
                }
                output.extend_from_slice(&content);
                self.remaining_block_bytes = LINE_BLOCK_SIZE - content.len();
                self.discard_next_timestamp = true;
            }
        }
    }

    fn read_message(&mut self, input: &mut &[u8], output: &mut Vec<u8>) {
        let window = &input[..input.len().min(self.remaining_block_bytes)];

        if let Some(newline) = window.iter().position(|&b| b == b'\n') {
            output.extend_from_slice(&window[..=newline]);
            *input = &input[newline + 1..];
            self.remaining_block_bytes = 0;
            self.discard_next_timestamp = false;
        } else {
            // Either the chunk ended or the block was split; in the latter case
            // `discard_next_timestamp` is still set from the block's own timestamp.
            output.extend_from_slice(window);
            self.remaining_block_bytes -= window.len();
            *input = &input[window.len()..];
        }
    }
}

/// Apply [`LogReformatter`] to a stream, emitting the output of each chunk as it is processed.
pub fn reformat_log_stream(logs: LogStream) -> LogStream {
    let logs = stream::unfold(Some((logs, LogReformatter::new())), |state| async move {
        let (mut logs, mut reformatter) = state?;
        loop {
            match logs.next().await {
                Some(Ok(chunk)) => {
                    let mut output = Vec::with_capacity(chunk.len());
                    reformatter.process(&chunk, &mut output);
                    if !output.is_empty() {
                        return Some((Ok(Bytes::from(output)), Some((logs, reformatter))));
                    }
                }
                Some(Err(e)) => return Some((Err(e), None)),
                None => {
                    let mut output = Vec::new();
                    reformatter.finish(&mut output);
                    return (!output.is_empty()).then(|| (Ok(Bytes::from(output)), None));
                }
            }
        }
    });
    Box::pin(logs)
}
