use std::collections::VecDeque;
use std::io::{self, Write};

use crate::record::RequestRecord;

/// Records written by one [`OutputQueue::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Flushed {
    pub records: usize,
    pub chunks: usize,
}

/// Submission-ordered records awaiting output.
///
/// Records are appended at the tail and only ever leave from the head, and only
/// while the head is final. Each record gets a sequence number at push time so
/// callbacks can reach it without scanning.
#[derive(Debug)]
pub struct OutputQueue {
    records: VecDeque<RequestRecord>,
    head_seq: u64,
    delimiter: u8,
}

impl OutputQueue {
    pub fn new(delimiter: u8) -> Self {
        Self {
            records: VecDeque::new(),
            head_seq: 0,
            delimiter,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append at the tail; returns the record's sequence number.
    pub fn push(&mut self, record: RequestRecord) -> u64 {
        let seq = self.head_seq + self.records.len() as u64;
        self.records.push_back(record);
        seq
    }

    pub fn get_mut(&mut self, seq: u64) -> Option<&mut RequestRecord> {
        let index = seq.checked_sub(self.head_seq)?;
        self.records.get_mut(usize::try_from(index).ok()?)
    }

    pub fn head(&self) -> Option<&RequestRecord> {
        self.records.front()
    }

    /// Write out the run of final records at the head.
    pub fn flush<W: Write>(&mut self, sink: &mut W) -> io::Result<Flushed> {
        let mut flushed = Flushed::default();
        while self.records.front().is_some_and(RequestRecord::is_final) {
            let Some(record) = self.records.pop_front() else {
                break;
            };
            self.head_seq += 1;
            flushed.chunks += record.write_to(sink, self.delimiter)?;
            flushed.records += 1;
        }
        Ok(flushed)
    }
}
