use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::trace;
use parking_lot::Mutex;

use crate::cpu::SharedBuffer;

/// How often the drain wakes up to empty the buffer.
const DRAIN_INTERVAL: Duration = Duration::from_millis(50);

/// The output side channel: a locked byte buffer filled by OUT and emptied
/// on its own cadence by a background drain thread.
///
/// The drain swaps the buffer contents out under the lock and hands them to
/// the sink, so the producer never observes a partially consumed buffer.
/// Dropping the port signals the thread, drains one final time, and joins it
/// before the buffer can go away.
pub struct OutputPort {
    buffer: SharedBuffer,
    kill: Sender<()>,
    worker: Option<JoinHandle<()>>,
}

impl OutputPort {
    /// Spawns the drain thread. Every batch of produced bytes is passed to
    /// `sink`; the machine core never learns where they go.
    pub fn spawn<F>(mut sink: F) -> Self
    where
        F: FnMut(Vec<u8>) + Send + 'static,
    {
        let buffer: SharedBuffer = Arc::new(Mutex::new(Vec::new()));
        let (kill, kill_rx) = bounded::<()>(0);

        let worker_buffer = Arc::clone(&buffer);
        let worker = thread::spawn(move || {
            let mut drain = |sink: &mut F| {
                let drained = std::mem::take(&mut *worker_buffer.lock());
                if !drained.is_empty() {
                    trace!("drained {} output bytes", drained.len());
                    sink(drained);
                }
            };
            loop {
                match kill_rx.recv_timeout(DRAIN_INTERVAL) {
                    Err(RecvTimeoutError::Timeout) => drain(&mut sink),
                    _ => break,
                }
            }
            drain(&mut sink);
        });

        Self {
            buffer,
            kill,
            worker: Some(worker),
        }
    }

    /// Handle to the shared buffer, for wiring into a [`crate::cpu::Cpu`].
    pub fn buffer(&self) -> SharedBuffer {
        Arc::clone(&self.buffer)
    }
}

impl Drop for OutputPort {
    fn drop(&mut self) {
        let _ = self.kill.send(());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
