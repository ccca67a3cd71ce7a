use std::io::{self, Write};

use bytes::Bytes;

use crate::engine::TransferId;

/// State for one submitted input line.
///
/// A record whose `transfer` is `None` is final: its transfer finished (or it
/// never had one) and it may be written once it reaches the queue head.
#[derive(Debug)]
pub struct RequestRecord {
    identity: Option<String>,
    transfer: Option<TransferId>,
    chunks: Vec<Bytes>,
    error: String,
}

impl RequestRecord {
    pub fn fetch(url: impl Into<String>, transfer: TransferId) -> Self {
        Self {
            identity: Some(url.into()),
            transfer: Some(transfer),
            chunks: Vec::new(),
            error: String::new(),
        }
    }

    /// A passthrough line, final from the start.
    pub fn literal(line: Bytes) -> Self {
        Self {
            identity: None,
            transfer: None,
            chunks: vec![line],
            error: String::new(),
        }
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn transfer(&self) -> Option<TransferId> {
        self.transfer
    }

    pub fn is_final(&self) -> bool {
        self.transfer.is_none()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    pub fn error(&self) -> &str {
        &self.error
    }

    pub fn body_len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn push_chunk(&mut self, chunk: Bytes) {
        self.chunks.push(chunk);
    }

    /// Detach from the engine. Passing an error records it as the terminal error.
    pub fn finish(&mut self, error: Option<String>) {
        self.transfer = None;
        if let Some(error) = error {
            self.error = error;
        }
    }

    /// Write every chunk followed by `delimiter`.
    pub fn write_to<W: Write>(&self, sink: &mut W, delimiter: u8) -> io::Result<usize> {
        for chunk in &self.chunks {
            sink.write_all(chunk)?;
            sink.write_all(&[delimiter])?;
        }
        Ok(self.chunks.len())
    }
}
