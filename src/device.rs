//! Opaque accelerator handle.
//!
//! Operations are submitted to an ordered command stream and complete
//! asynchronously; the host observes completion by polling a flag word the
//! stream raises when the operation finishes. Waiting is a bounded spin with
//! a periodic tick, never a blocking primitive, and a lapsed timeout is fatal
//! to the calling operation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Sender};

use crate::error::{Error, Result};

/// Raised to [`FLAG_DONE`] by the stream when the submitted op has executed.
pub type CompletionFlag = Arc<AtomicU32>;

const FLAG_PENDING: u32 = 0;
const FLAG_DONE: u32 = 1;

/// How often the spin loop yields back to the scheduler.
const SPIN_TICK: u32 = 1024;

/// Default completion timeout.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_secs(50);

struct StreamOp {
    run: Box<dyn FnOnce() + Send>,
    flag: CompletionFlag,
}

/// RAII handle to one device command stream.
///
/// Dropping the handle closes the stream and joins its worker.
pub struct DeviceHandle {
    device_id: u32,
    timeout: Duration,
    ops: Option<Sender<StreamOp>>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceHandle {
    pub fn new(device_id: u32) -> Self {
        Self::with_timeout(device_id, COMPLETION_TIMEOUT)
    }

    pub fn with_timeout(device_id: u32, timeout: Duration) -> Self {
        let (tx, rx) = unbounded::<StreamOp>();
        let worker = thread::Builder::new()
            .name(format!("device-stream-{device_id}"))
            .spawn(move || {
                // Ordered execution: one op at a time, no preemption.
                while let Ok(op) = rx.recv() {
                    (op.run)();
                    op.flag.store(FLAG_DONE, Ordering::Release);
                }
            })
            .unwrap_or_else(|e| panic!("failed to spawn device stream {device_id}: {e}"));
        DeviceHandle {
            device_id,
            timeout,
            ops: Some(tx),
            worker: Some(worker),
        }
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Enqueue `op` on the stream and return its completion flag.
    pub fn submit<F>(&self, op: F) -> Result<CompletionFlag>
    where
        F: FnOnce() + Send + 'static,
    {
        let flag: CompletionFlag = Arc::new(AtomicU32::new(FLAG_PENDING));
        let stream_op = StreamOp {
            run: Box::new(op),
            flag: Arc::clone(&flag),
        };
        self.ops
            .as_ref()
            .ok_or(Error::DeviceClosed)?
            .send(stream_op)
            .map_err(|_| Error::DeviceClosed)?;
        Ok(flag)
    }

    /// Spin on `flag` until it is raised or the timeout lapses.
    pub fn wait(&self, flag: &CompletionFlag) -> Result<()> {
        let start = Instant::now();
        let mut spins: u32 = 0;
        loop {
            if flag.load(Ordering::Acquire) == FLAG_DONE {
                return Ok(());
            }
            spins = spins.wrapping_add(1);
            if spins % SPIN_TICK == 0 {
                if start.elapsed() > self.timeout {
                    return Err(Error::DeviceTimeout {
                        device_id: self.device_id,
                        timeout: self.timeout,
                    });
                }
                thread::yield_now();
            }
        }
    }

    /// Submit and wait in one call.
    pub fn dispatch<F>(&self, op: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let flag = self.submit(op)?;
        self.wait(&flag)
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        drop(self.ops.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("device_id", &self.device_id)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_dispatch_runs_op() {
        let device = DeviceHandle::new(0);
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        device
            .dispatch(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ops_execute_in_submission_order() {
        let device = DeviceHandle::new(0);
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut flags = Vec::new();
        for i in 0..8 {
            let order = Arc::clone(&order);
            flags.push(
                device
                    .submit(move || order.lock().unwrap().push(i))
                    .unwrap(),
            );
        }
        for flag in &flags {
            device.wait(flag).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_wait_times_out() {
        let device = DeviceHandle::with_timeout(3, Duration::from_millis(20));
        let flag = device
            .submit(|| thread::sleep(Duration::from_millis(400)))
            .unwrap();
        match device.wait(&flag) {
            Err(Error::DeviceTimeout { device_id, .. }) => assert_eq!(device_id, 3),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
