//! Per-subscriber IU queues: the FIFO plumbing between one producer and one
//! consumer module.
//!
//! Built on `crossbeam_channel` rather than `std::sync::mpsc`:
//! `recv_timeout` gives the module worker loop's "~10 ms timeout pop"
//! directly, and `bounded(n)` gives the backpressure model's "producers
//! block on put" directly, with `unbounded()` as the default.

use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{Result, RuntimeError};
use crate::ids::ModuleId;
use crate::iu::IuRef;

/// The pop timeout a general module's worker loop uses on each left buffer.
pub const QUEUE_TIMEOUT: Duration = Duration::from_millis(10);

/// A producer's handle onto one downstream subscriber's queue. Lives in the
/// producer's right-buffer list.
pub struct OutputBuffer {
    pub consumer: ModuleId,
    tx: Sender<IuRef>,
    drain_rx: Receiver<IuRef>,
}

impl OutputBuffer {
    /// Enqueues `iu`. Blocks if the queue is bounded and full, which is the
    /// runtime's sole backpressure mechanism.
    pub fn publish(&self, iu: IuRef) -> Result<()> {
        self.tx.send(iu).map_err(|_| RuntimeError::QueueClosed)
    }

    /// Non-blocking drain used by the "clear on stop" policy: empties
    /// whatever the consumer hasn't read yet so a later run doesn't deliver
    /// stale IUs.
    pub fn drain(&self) {
        while self.drain_rx.try_recv().is_ok() {}
    }
}

/// A consumer's handle onto one upstream producer's queue. Lives in the
/// consumer's left-buffer list.
pub struct InputBuffer {
    pub producer: ModuleId,
    rx: Receiver<IuRef>,
}

impl InputBuffer {
    /// Pops with a bounded timeout. `Ok(None)` means the timeout elapsed with
    /// nothing available; `Err(QueueClosed)` means every sender has gone
    /// away, which the worker loop treats as end-of-stream for this buffer.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<IuRef>> {
        match self.rx.recv_timeout(timeout) {
            Ok(iu) => Ok(Some(iu)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RuntimeError::QueueClosed),
        }
    }

    pub fn try_pop(&self) -> Result<Option<IuRef>> {
        match self.rx.try_recv() {
            Ok(iu) => Ok(Some(iu)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(RuntimeError::QueueClosed),
        }
    }
}

/// Creates a new queue between `producer` and `consumer`. `maxsize` of `None`
/// or `Some(0)` is unbounded.
pub fn make_queue(
    producer: ModuleId,
    consumer: ModuleId,
    maxsize: Option<usize>,
) -> (OutputBuffer, InputBuffer) {
    let (tx, rx) = match maxsize {
        Some(n) if n > 0 => bounded(n),
        _ => unbounded(),
    };
    let out = OutputBuffer {
        consumer,
        tx,
        drain_rx: rx.clone(),
    };
    let inp = InputBuffer { producer, rx };
    (out, inp)
}
