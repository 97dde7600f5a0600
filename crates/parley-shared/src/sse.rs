//! Incremental Server-Sent Events decoder.
//!
//! Bytes are pushed in whatever chunks the transport delivers; complete
//! frames come out in arrival order. A frame is dispatched on a blank line.
//! Comment lines (starting with `:`) and unknown fields are ignored, multiple
//! `data:` lines are joined with `\n`.

use thiserror::Error;

use crate::constants::{MAX_SSE_FRAME_BYTES, MAX_SSE_LINE_BYTES};

/// One dispatched SSE frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    pub data: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SseError {
    #[error("SSE line exceeds {0} bytes")]
    LineTooLong(usize),

    #[error("SSE frame exceeds {0} bytes")]
    FrameTooLarge(usize),
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    /// Bytes held in `data`.
    data_len: usize,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes, returning every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, SseError> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line)? {
                frames.push(frame);
            }
        }

        if self.buf.len() > MAX_SSE_LINE_BYTES {
            return Err(SseError::LineTooLong(MAX_SSE_LINE_BYTES));
        }
        Ok(frames)
    }

    /// `true` when bytes or fields of an undispatched frame are pending.
    /// At end of stream this means the peer stopped mid-frame.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty() || self.event.is_some() || !self.data.is_empty()
    }

    fn process_line(&mut self, line: &str) -> Result<Option<SseFrame>, SseError> {
        if line.is_empty() {
            return Ok(self.dispatch());
        }
        if line.starts_with(':') {
            return Ok(None);
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                self.data_len += value.len() + 1;
                if self.data_len > MAX_SSE_FRAME_BYTES {
                    return Err(SseError::FrameTooLarge(MAX_SSE_FRAME_BYTES));
                }
                self.data.push(value.to_string());
            }
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        Ok(None)
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let frame = SseFrame {
            event: self.event.take(),
            id: self.id.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        self.data_len = 0;
        Some(frame)
    }
}
