//! Scripted in-memory port for session tests.
//!
//! Replies are queued and released one per `flush()`, so a reply only
//! becomes readable after the session has finished sending the command it
//! answers. Reads with nothing buffered fail with `TimedOut`, like a real
//! serial port whose deadline elapsed, unless a stream was started.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

#[derive(Debug, Default)]
pub(crate) struct MockPort {
    rx: VecDeque<u8>,
    replies: VecDeque<Vec<u8>>,
    stale_after_reset: VecDeque<Vec<u8>>,
    /// Every byte written, in order.
    pub written: Vec<u8>,
    /// Number of `reset_to_bootloader` calls.
    pub resets: usize,
    /// Number of `flush` calls.
    pub flushes: usize,
    /// Every timeout passed to `set_timeout`, in order.
    pub timeouts_set: Vec<Duration>,
    timeout: Duration,
    fail_writes: bool,
    stream: Option<u8>,
    streaming: bool,
}

impl MockPort {
    pub(crate) fn new() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    /// Queue a reply released by the next unanswered flush.
    pub(crate) fn reply(&mut self, bytes: &[u8]) -> &mut Self {
        self.replies.push_back(bytes.to_vec());
        self
    }

    /// Queue a flush that is answered with silence.
    pub(crate) fn silence(&mut self) -> &mut Self {
        self.reply(&[])
    }

    /// Once the queued replies are used up, make the next flush start an
    /// endless stream of `byte`.
    pub(crate) fn stream(&mut self, byte: u8) -> &mut Self {
        self.stream = Some(byte);
        self
    }

    /// Queue garbage that shows up in the receive buffer after the next reset.
    pub(crate) fn stale_after_reset(&mut self, bytes: &[u8]) -> &mut Self {
        self.stale_after_reset.push_back(bytes.to_vec());
        self
    }

    /// Make every subsequent write fail with `BrokenPipe`.
    pub(crate) fn fail_writes(&mut self) -> &mut Self {
        self.fail_writes = true;
        self
    }

    /// Bytes still waiting in the receive buffer.
    pub(crate) fn pending_rx(&self) -> usize {
        self.rx.len()
    }

    /// Replies not yet released.
    pub(crate) fn pending_replies(&self) -> usize {
        self.replies.len()
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeouts_set.push(timeout);
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn reset_to_bootloader(&mut self) -> Result<()> {
        self.resets += 1;
        self.rx.clear();
        if let Some(stale) = self.stale_after_reset.pop_front() {
            self.rx.extend(stale);
        }
        Ok(())
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return match self.stream {
                Some(byte) if self.streaming => {
                    buf.fill(byte);
                    Ok(buf.len())
                },
                _ => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            };
        }
        let n = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port gone"));
        }
        self.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "port gone"));
        }
        self.flushes += 1;
        match self.replies.pop_front() {
            Some(reply) => self.rx.extend(reply),
            None => self.streaming |= self.stream.is_some(),
        }
        Ok(())
    }
}
