//! Asynchronous output reader.
//!
//! A background task drains the helper's standard output line by line into an unbounded
//! FIFO so nothing is lost to pipe buffering while the caller is busy. The caller side of
//! the FIFO is the [`OutputBuffer`].
//!
//! Cancellation is cooperative: [`OutputReader::stop`] raises a flag and joins the task.
//! Every read is bounded by the poll interval, so the flag is observed promptly even when
//! the helper is silent. Reads use `read_until`, which keeps partially received bytes in
//! the pending buffer when the timeout fires, so no output is dropped between polls.

use super::HelperOutput;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Consumer end of the helper's output FIFO.
#[derive(Debug)]
pub struct OutputBuffer {
    rx: mpsc::UnboundedReceiver<String>,
    producer_gone: bool,
}

impl OutputBuffer {
    /// Take the oldest buffered line, if any.
    pub fn try_pop(&mut self) -> Option<String> {
        match self.rx.try_recv() {
            Ok(line) => Some(line),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.producer_gone = true;
                None
            }
        }
    }

    /// Discard everything currently buffered. Returns the number of lines dropped.
    pub fn clear(&mut self) -> usize {
        let mut dropped = 0;
        while let Some(line) = self.try_pop() {
            trace!(line = %line, "Discarding stale helper output");
            dropped += 1;
        }
        dropped
    }

    /// Whether the reader has stopped and every line it produced has been consumed.
    pub fn is_exhausted(&self) -> bool {
        self.producer_gone
    }
}

/// Handle on the background task feeding an [`OutputBuffer`].
#[derive(Debug)]
pub struct OutputReader {
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl OutputReader {
    /// Start draining `stdout` into a new buffer.
    pub fn spawn(stdout: HelperOutput, poll_interval: Duration) -> (Self, OutputBuffer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(read_lines(stdout, tx, Arc::clone(&cancel), poll_interval));

        (
            Self {
                cancel,
                handle: Some(handle),
            },
            OutputBuffer {
                rx,
                producer_gone: false,
            },
        )
    }

    /// Whether the task has exited (cancelled, EOF or read error).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Ask the task to stop and wait up to `bound` for it to exit.
    ///
    /// Returns `false` if the task had to be aborted.
    pub async fn stop(mut self, bound: Duration) -> bool {
        self.cancel.store(true, Ordering::Release);
        let Some(mut handle) = self.handle.take() else {
            return true;
        };

        match tokio::time::timeout(bound, &mut handle).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "Output reader task failed");
                true
            }
            Err(_) => {
                warn!(?bound, "Output reader did not stop in time, aborting it");
                handle.abort();
                false
            }
        }
    }
}

impl Drop for OutputReader {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Release);
    }
}

async fn read_lines(
    stdout: HelperOutput,
    tx: mpsc::UnboundedSender<String>,
    cancel: Arc<AtomicBool>,
    poll_interval: Duration,
) {
    let mut reader = BufReader::new(stdout);
    let mut pending: Vec<u8> = Vec::new();

    loop {
        if cancel.load(Ordering::Acquire) {
            debug!("Output reader cancelled");
            break;
        }

        match tokio::time::timeout(poll_interval, reader.read_until(b'\n', &mut pending)).await {
            // No complete line yet; the timeout itself was the pause
            Err(_) => continue,
            Ok(Ok(0)) => {
                if !pending.is_empty() {
                    forward(&tx, &mut pending);
                }
                debug!("Helper closed its output stream");
                break;
            }
            Ok(Ok(_)) => {
                if pending.ends_with(b"\n") && !forward(&tx, &mut pending) {
                    break;
                }
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to read helper output");
                break;
            }
        }
    }
}

/// Push the pending bytes as one line. Returns `false` once nobody is listening.
fn forward(tx: &mpsc::UnboundedSender<String>, pending: &mut Vec<u8>) -> bool {
    let line = String::from_utf8_lossy(pending)
        .trim_end_matches(['\r', '\n'])
        .to_string();
    pending.clear();

    if line.is_empty() {
        return true;
    }
    trace!(line = %line, "Helper output");
    tx.send(line).is_ok()
}
