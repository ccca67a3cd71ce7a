//! Input line classification and the reader's watch state.

use std::io;

use bytes::Bytes;
use tracing::{debug, info};

use crate::mux::{Interest, MuxError, Multiplexer, WatchKey};

/// Longest line treated as a fetch request, excluding the newline.
pub const DEFAULT_MAX_LINE_LEN: usize = 1023;

const FETCH_PREFIX: &[u8] = b"http";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineRead {
    /// One line, newline included when present.
    Line(Vec<u8>),
    /// Nothing complete available right now.
    Pending,
    Eof,
}

/// Where input lines come from.
pub trait LineSource {
    fn next_line(&mut self) -> io::Result<LineRead>;
}

/// A classified input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    Fetch { url: String, post: Option<Bytes> },
    Literal(Bytes),
}

impl Line {
    /// Lines starting with `http` are fetches: URL up to the first tab, POST
    /// payload after it. Everything else, including fetch lines that are too
    /// long or have no usable URL, passes through literally.
    pub fn classify(raw: &[u8], max_len: usize) -> Line {
        let line = raw.strip_suffix(b"\n").unwrap_or(raw);
        if !line.starts_with(FETCH_PREFIX) || line.len() > max_len {
            return Line::Literal(Bytes::copy_from_slice(line));
        }

        let (url, post) = match line.iter().position(|&b| b == b'\t') {
            Some(tab) => (&line[..tab], Some(Bytes::copy_from_slice(&line[tab + 1..]))),
            None => (line, None),
        };
        match std::str::from_utf8(url) {
            Ok(url) if !url.is_empty() => Line::Fetch {
                url: url.to_string(),
                post,
            },
            _ => Line::Literal(Bytes::copy_from_slice(line)),
        }
    }
}

/// Owns the line source and whether the input is currently watched.
pub struct IngestionReader<L> {
    source: L,
    max_line_len: usize,
    watching: bool,
    eof: bool,
    resume_requested: bool,
    lines: u64,
}

impl<L: LineSource> IngestionReader<L> {
    pub fn new(source: L, max_line_len: usize) -> Self {
        Self {
            source,
            max_line_len,
            watching: false,
            eof: false,
            resume_requested: false,
            lines: 0,
        }
    }

    pub fn is_watching(&self) -> bool {
        self.watching
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    pub fn start<M: Multiplexer>(&mut self, mux: &mut M) -> Result<(), MuxError> {
        if self.eof || self.watching {
            return Ok(());
        }
        mux.watch(WatchKey::Input, Interest::READABLE)?;
        self.watching = true;
        Ok(())
    }

    /// Read and classify the next line.
    pub fn next(&mut self) -> io::Result<Option<Line>> {
        match self.source.next_line()? {
            LineRead::Line(raw) => {
                self.lines += 1;
                Ok(Some(Line::classify(&raw, self.max_line_len)))
            }
            LineRead::Pending => Ok(None),
            LineRead::Eof => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    /// Stop watching until a completion makes room.
    pub fn pause<M: Multiplexer>(&mut self, mux: &mut M) {
        if self.watching {
            debug!(lines = self.lines, "ceiling reached, pausing input");
            mux.unwatch(WatchKey::Input);
            self.watching = false;
        }
    }

    /// Stop watching for good.
    pub fn finish<M: Multiplexer>(&mut self, mux: &mut M) {
        if self.watching {
            mux.unwatch(WatchKey::Input);
            self.watching = false;
        }
        info!(lines = self.lines, "end of input");
    }

    pub fn request_resume(&mut self) {
        self.resume_requested = true;
    }

    pub fn take_resume(&mut self) -> bool {
        std::mem::take(&mut self.resume_requested)
    }

    /// Re-arm the input watch after a pause. Returns true when the reader was
    /// paused and should be run right away.
    pub fn resume<M: Multiplexer>(&mut self, mux: &mut M) -> Result<bool, MuxError> {
        if self.eof || self.watching {
            return Ok(false);
        }
        debug!("room available, resuming input");
        self.start(mux)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(url: &str, post: Option<&'static str>) -> Line {
        Line::Fetch {
            url: url.to_string(),
            post: post.map(|p| Bytes::from_static(p.as_bytes())),
        }
    }

    fn literal(text: &'static str) -> Line {
        Line::Literal(Bytes::from_static(text.as_bytes()))
    }

    #[test]
    fn test_classify_get() {
        assert_eq!(Line::classify(b"http://a\n", 1023), fetch("http://a", None));
        assert_eq!(
            Line::classify(b"https://example.com/x?y=1", 1023),
            fetch("https://example.com/x?y=1", None)
        );
    }

    #[test]
    fn test_classify_post_splits_on_first_tab() {
        assert_eq!(
            Line::classify(b"http://b\thello\n", 1023),
            fetch("http://b", Some("hello"))
        );
        assert_eq!(
            Line::classify(b"http://b\t{\"k\":\"a\tb\"}\n", 1023),
            fetch("http://b", Some("{\"k\":\"a\tb\"}"))
        );
        assert_eq!(Line::classify(b"http://b\t\n", 1023), fetch("http://b", Some("")));
    }

    #[test]
    fn test_classify_literal() {
        assert_eq!(Line::classify(b"note\n", 1023), literal("note"));
        assert_eq!(Line::classify(b"HTTP://upper\n", 1023), literal("HTTP://upper"));
        assert_eq!(Line::classify(b"htt\n", 1023), literal("htt"));
        assert_eq!(Line::classify(b"\n", 1023), literal(""));
        // Only the trailing newline is stripped.
        assert_eq!(Line::classify(b"  spaced \r\n", 1023), literal("  spaced \r"));
    }

    #[test]
    fn test_overlong_fetch_line_passes_through() {
        let mut raw = b"http://".to_vec();
        raw.extend(std::iter::repeat(b'a').take(20));
        assert_eq!(
            Line::classify(&raw, 10),
            Line::Literal(Bytes::copy_from_slice(&raw))
        );
    }

    #[test]
    fn test_invalid_utf8_url_passes_through() {
        let raw = b"http://\xff\xfe\n";
        assert_eq!(
            Line::classify(raw, 1023),
            Line::Literal(Bytes::copy_from_slice(b"http://\xff\xfe"))
        );
    }
}
