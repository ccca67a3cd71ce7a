//! Line producer feeding the ingestion reader.
//!
//! A pump task reads `\n`-terminated lines from any [`AsyncRead`] into a bounded
//! channel and signals input readiness after each one. The reactor side drains
//! the channel without blocking.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, error};

use crate::ingest::{LineRead, LineSource};
use crate::mux::ReadySignal;

pub struct LineChannel {
    lines: mpsc::Receiver<Vec<u8>>,
}

impl LineChannel {
    /// Start pumping `reader` on `runtime`. At most `capacity` lines are
    /// buffered; the pump waits while the channel is full.
    pub fn spawn<R>(runtime: &Handle, reader: R, signal: Arc<ReadySignal>, capacity: usize) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let (tx, lines) = mpsc::channel(capacity.max(1));
        runtime.spawn(pump(reader, tx, signal));
        Self { lines }
    }
}

async fn pump<R>(reader: R, tx: mpsc::Sender<Vec<u8>>, signal: Arc<ReadySignal>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => {
                debug!("input closed");
                break;
            }
            Ok(_) => {
                if tx.send(line).await.is_err() {
                    // Receiver gone; nobody is reading any more.
                    return;
                }
                signal.notify_readable();
            }
            Err(e) => {
                error!("input read failed: {}", e);
                break;
            }
        }
    }
    drop(tx);
    signal.notify_readable();
}

impl LineSource for LineChannel {
    fn next_line(&mut self) -> io::Result<LineRead> {
        match self.lines.try_recv() {
            Ok(line) => Ok(LineRead::Line(line)),
            Err(TryRecvError::Empty) => Ok(LineRead::Pending),
            Err(TryRecvError::Disconnected) => Ok(LineRead::Eof),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn drain(channel: &mut LineChannel, signal: &ReadySignal) -> Vec<Vec<u8>> {
        let mut lines = Vec::new();
        loop {
            match channel.next_line().unwrap() {
                LineRead::Line(line) => lines.push(line),
                LineRead::Pending => signal.readable().await,
                LineRead::Eof => return lines,
            }
        }
    }

    #[tokio::test]
    async fn test_pumps_lines_then_eof() {
        let signal = ReadySignal::new();
        let input = Cursor::new(b"http://a\nnote\nlast".to_vec());
        let mut channel = LineChannel::spawn(&Handle::current(), input, signal.clone(), 8);

        let lines = drain(&mut channel, &signal).await;
        assert_eq!(
            lines,
            vec![b"http://a\n".to_vec(), b"note\n".to_vec(), b"last".to_vec()]
        );
        assert_eq!(channel.next_line().unwrap(), LineRead::Eof);
    }

    #[tokio::test]
    async fn test_small_capacity_still_delivers_everything() {
        let signal = ReadySignal::new();
        let text: String = (0..20).map(|i| format!("line {i}\n")).collect();
        let mut channel =
            LineChannel::spawn(&Handle::current(), Cursor::new(text.into_bytes()), signal.clone(), 1);

        let lines = drain(&mut channel, &signal).await;
        assert_eq!(lines.len(), 20);
        assert_eq!(lines[19], b"line 19\n".to_vec());
    }

    #[tokio::test]
    async fn test_empty_input_is_eof() {
        let signal = ReadySignal::new();
        let mut channel =
            LineChannel::spawn(&Handle::current(), Cursor::new(Vec::new()), signal.clone(), 4);
        assert!(drain(&mut channel, &signal).await.is_empty());
    }
}
