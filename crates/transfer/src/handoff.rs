//! New-data streaming between the interpreter and the unpack thread.
//!
//! The interpreter sends a [`BlockWriter`] over a single-slot channel; the
//! unpack thread fills it from the package stream and reports back on a
//! second single-slot channel. Only one writer is ever in flight. Dropping
//! the writer sender tells the unpack thread to stop.

use std::io::{self, Read};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded};
use tracing::{debug, error, info, warn};
use updatekit_blockset::{BlockError, BlockWriter};

/// Bytes pulled from the package stream per read.
const FEED_CHUNK: usize = 64 * 1024;

/// Why a streamed write did not complete.
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    #[error("new data ended after {written} of {expected} bytes")]
    Starved { written: u64, expected: u64 },

    #[error("new-data writer failed: {0}")]
    Block(#[from] BlockError),

    #[error("reading new data failed: {0}")]
    Source(io::Error),

    #[error("unpack thread is gone")]
    Disconnected,
}

impl HandoffError {
    pub fn is_eio(&self) -> bool {
        match self {
            Self::Block(e) => e.is_eio(),
            Self::Source(e) => e.raw_os_error() == Some(libc::EIO),
            _ => false,
        }
    }
}

type Completion = Result<u64, HandoffError>;

/// Handle to the background unpack thread.
#[derive(Debug)]
pub struct NewDataProducer {
    writers: Option<Sender<BlockWriter>>,
    done: Receiver<Completion>,
    thread: Option<JoinHandle<io::Result<u64>>>,
}

impl NewDataProducer {
    /// Starts the unpack thread over `source`.
    pub fn spawn(source: Box<dyn Read + Send>) -> io::Result<Self> {
        let (writer_tx, writer_rx) = bounded::<BlockWriter>(1);
        let (done_tx, done_rx) = bounded::<Completion>(1);

        let thread = thread::Builder::new()
            .name("new-data-unpack".into())
            .spawn(move || feed(source, writer_rx, done_tx))?;

        Ok(Self {
            writers: Some(writer_tx),
            done: done_rx,
            thread: Some(thread),
        })
    }

    /// Hands `writer` to the unpack thread and waits until it is filled.
    ///
    /// Returns the number of bytes written.
    pub fn write(&self, writer: BlockWriter) -> Result<u64, HandoffError> {
        let expected = writer.expected_len();
        let sender = self.writers.as_ref().ok_or(HandoffError::Disconnected)?;
        sender.send(writer).map_err(|_| HandoffError::Disconnected)?;

        let written = self.done.recv().map_err(|_| HandoffError::Disconnected)??;
        debug!(written, expected, "new data written");
        Ok(written)
    }

    /// Stops the unpack thread and returns the bytes it consumed.
    pub fn finish(mut self) -> io::Result<u64> {
        self.stop()
    }

    fn stop(&mut self) -> io::Result<u64> {
        drop(self.writers.take());
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| io::Error::other("unpack thread panicked"))?,
            None => Ok(0),
        }
    }
}

impl Drop for NewDataProducer {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "unpack thread ended with an error");
        }
    }
}

/// Unpack loop: waits for a writer, fills it, reports, repeats.
///
/// Unconsumed stream bytes carry over to the next writer.
fn feed(
    mut source: Box<dyn Read + Send>,
    writers: Receiver<BlockWriter>,
    done: Sender<Completion>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; FEED_CHUNK];
    let (mut start, mut end) = (0usize, 0usize);
    let mut consumed = 0u64;
    let mut exhausted = false;

    while let Ok(mut writer) = writers.recv() {
        let result = loop {
            if writer.is_done() {
                break writer.finish().map_err(HandoffError::from);
            }
            if start == end {
                if exhausted {
                    break Err(HandoffError::Starved {
                        written: writer.total_written(),
                        expected: writer.expected_len(),
                    });
                }
                match source.read(&mut buf) {
                    Ok(0) => exhausted = true,
                    Ok(n) => {
                        start = 0;
                        end = n;
                        consumed += n as u64;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        error!(error = %e, "reading new data failed");
                        break Err(HandoffError::Source(e));
                    }
                }
                continue;
            }
            match writer.write(&buf[start..end]) {
                Ok(n) => start += n,
                Err(e) => break Err(HandoffError::Block(BlockError::Io(e))),
            }
        };

        if let Err(e) = &result {
            warn!(error = %e, "new data write incomplete");
        }
        if done.send(result).is_err() {
            break;
        }
    }

    let leftover = (end - start) as u64;
    info!(consumed, leftover, "unpack thread stopped");
    Ok(consumed)
}
