//! Per-device I/O request serialization.
//!
//! All guest I/O (PIO and MMIO) funnels through one interface: a device
//! exposes [`IoOperations`] for each of its declared address ranges, and an
//! [`IoHandler`] owns those operations together with a single-consumer
//! request queue and a dedicated serializer thread. Exactly one request is
//! in flight per handler at any time, so device read/write implementations
//! never need their own locking — and a device [`pause`](crate::pause)
//! observes a well-defined boundary between operations.
//!
//! The serializer takes the device's shared access
//! ([`Device::acquire`](crate::devices::Device::acquire)) around each
//! operation. A vCPU in the middle of an I/O exit is not considered paused
//! until the operation completes, so the usual sequence is to pause all
//! vCPUs first and all devices second.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::warn;
use thiserror::Error;
use vm_memory::{Address, GuestAddress};

use crate::devices::Device;

/// Errors surfaced by device I/O operations or the dispatch plumbing.
#[derive(Error, Debug)]
pub enum IoError {
    /// The handler's serializer thread is gone.
    #[error("I/O handler queue is closed")]
    ChannelClosed,

    /// The device does not implement this access.
    #[error("unsupported access at offset {offset:#x} (size {size})")]
    Unsupported {
        /// Offset within the handler's range.
        offset: u64,
        /// Access width in bytes.
        size: u8,
    },

    /// Device-specific failure.
    #[error("device error: {0}")]
    Device(String),

    /// Creating the eventfd for fast-path promotion failed.
    #[error("failed to create eventfd: {0}")]
    EventFd(#[source] std::io::Error),

    /// The kernel rejected the ioeventfd binding.
    #[error("failed to bind I/O event: {0}")]
    BindEvent(#[source] kvm_ioctls::Error),
}

/// Result of a device write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was fully handled.
    Handled,
    /// The write was handled, and repeats with the same address and value
    /// may bypass dispatch entirely (fast-path promotion, see
    /// [`crate::cache`]).
    Defer,
}

/// Read/write capability implemented by a device for one address range.
///
/// Methods take `&mut self`: the serializer thread is the sole caller, so
/// device state needs no internal synchronization.
pub trait IoOperations: Send {
    /// Read `size` bytes at `offset` within the range.
    fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError>;

    /// Write `value` (`size` bytes wide) at `offset` within the range.
    fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError>;
}

/// One guest I/O access, addressed relative to a handler's base.
#[derive(Debug, Clone, Copy)]
pub enum IoAccess {
    /// Read of `size` bytes.
    Read {
        /// Access width in bytes (1, 2, 4 or 8).
        size: u8,
    },
    /// Write of `value`, `size` bytes wide.
    Write {
        /// Access width in bytes (1, 2, 4 or 8).
        size: u8,
        /// Value to store; bits above the access width are ignored.
        value: u64,
    },
}

/// Completed I/O operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoCompletion {
    /// Read result, normalized to the access width.
    Read(u64),
    /// Write outcome.
    Write(WriteOutcome),
}

struct IoRequest {
    access: IoAccess,
    offset: u64,
    reply: mpsc::Sender<Result<IoCompletion, IoError>>,
}

/// Mask `value` to the low `size` bytes.
pub fn normalize(value: u64, size: u8) -> u64 {
    match size {
        1 => value & 0xff,
        2 => value & 0xffff,
        4 => value & 0xffff_ffff,
        _ => value,
    }
}

/// Value returned for reads from unassigned address space: all bits set
/// for the requested width, like a floating bus.
pub fn open_bus_value(size: u8) -> u64 {
    normalize(u64::MAX, size)
}

/// A device instance bound to one of its address ranges, with the range's
/// operations and the serializer queue. The unit of I/O concurrency.
pub struct IoHandler {
    device: Arc<dyn Device>,
    base: GuestAddress,
    queue: mpsc::Sender<IoRequest>,
}

impl IoHandler {
    /// Create a handler and start its serializer thread.
    ///
    /// The thread exits when the handler (and every pending promotion
    /// waiter holding a clone of its queue) is dropped.
    pub fn new(
        device: Arc<dyn Device>,
        base: GuestAddress,
        mut operations: Box<dyn IoOperations>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<IoRequest>();
        let serializer = Arc::clone(&device);
        let name = format!("io-{}-{:x}", device.name(), base.raw_value());
        let spawned = thread::Builder::new().name(name).spawn(move || {
            while let Ok(req) = rx.recv() {
                // From the device's perspective nothing about this event
                // has touched it yet, so shared access starts here.
                serializer.acquire();
                let result = match req.access {
                    IoAccess::Read { size } => operations
                        .read(req.offset, size)
                        .map(|v| IoCompletion::Read(normalize(v, size))),
                    IoAccess::Write { size, value } => {
                        let value = normalize(value, size);
                        serializer.debug(format_args!(
                            "write {:#x} @ {:#x} [size: {}]",
                            value,
                            base.raw_value() + req.offset,
                            size,
                        ));
                        operations
                            .write(req.offset, size, value)
                            .map(IoCompletion::Write)
                    }
                };
                serializer.release();
                let _ = req.reply.send(result);
            }
        });
        if let Err(e) = spawned {
            // Thread creation only fails under resource exhaustion; the
            // handler still works as an always-closed queue.
            warn!("failed to spawn I/O serializer for {}: {}", device.name(), e);
        }

        Arc::new(Self { device, base, queue: tx })
    }

    /// First guest address of the handled range.
    pub fn base(&self) -> GuestAddress {
        self.base
    }

    /// The owning device.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Read `size` bytes at `offset`, serialized through the queue.
    pub fn read(&self, offset: u64, size: u8) -> Result<u64, IoError> {
        match self.submit(IoAccess::Read { size }, offset)? {
            IoCompletion::Read(value) => Ok(value),
            IoCompletion::Write(_) => Err(IoError::Device("mismatched completion".into())),
        }
    }

    /// Write `value` at `offset`, serialized through the queue.
    pub fn write(&self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError> {
        match self.submit(IoAccess::Write { size, value }, offset)? {
            IoCompletion::Write(outcome) => Ok(outcome),
            IoCompletion::Read(_) => Err(IoError::Device("mismatched completion".into())),
        }
    }

    /// Submit one access and block until the serializer replies.
    pub fn submit(&self, access: IoAccess, offset: u64) -> Result<IoCompletion, IoError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = IoRequest {
            access,
            offset,
            reply: reply_tx,
        };
        self.queue
            .send(request)
            .map_err(|_| IoError::ChannelClosed)?;
        reply_rx.recv().map_err(|_| IoError::ChannelClosed)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::scratch_device;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Byte-addressed scratch register block.
    struct ScratchOps {
        bytes: Vec<u8>,
        concurrent: Arc<AtomicUsize>,
        max_concurrent: Arc<AtomicUsize>,
    }

    impl ScratchOps {
        fn new(len: usize) -> Self {
            Self {
                bytes: vec![0; len],
                concurrent: Arc::new(AtomicUsize::new(0)),
                max_concurrent: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl IoOperations for ScratchOps {
        fn read(&mut self, offset: u64, size: u8) -> Result<u64, IoError> {
            let offset = offset as usize;
            if offset + size as usize > self.bytes.len() {
                return Err(IoError::Unsupported { offset: offset as u64, size });
            }
            let mut value = 0u64;
            for i in (0..size as usize).rev() {
                value = (value << 8) | u64::from(self.bytes[offset + i]);
            }
            Ok(value)
        }

        fn write(&mut self, offset: u64, size: u8, value: u64) -> Result<WriteOutcome, IoError> {
            let entered = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(entered, Ordering::SeqCst);
            std::thread::sleep(Duration::from_micros(200));

            let offset = offset as usize;
            if offset + size as usize > self.bytes.len() {
                self.concurrent.fetch_sub(1, Ordering::SeqCst);
                return Err(IoError::Unsupported { offset: offset as u64, size });
            }
            for i in 0..size as usize {
                self.bytes[offset + i] = (value >> (8 * i)) as u8;
            }
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(WriteOutcome::Handled)
        }
    }

    #[test]
    fn normalize_masks_to_width() {
        assert_eq!(normalize(0x1234_5678_9abc_def0, 1), 0xf0);
        assert_eq!(normalize(0x1234_5678_9abc_def0, 2), 0xdef0);
        assert_eq!(normalize(0x1234_5678_9abc_def0, 4), 0x9abc_def0);
        assert_eq!(normalize(0x1234_5678_9abc_def0, 8), 0x1234_5678_9abc_def0);
    }

    #[test]
    fn open_bus_values_per_width() {
        assert_eq!(open_bus_value(1), 0xff);
        assert_eq!(open_bus_value(2), 0xffff);
        assert_eq!(open_bus_value(4), 0xffff_ffff);
        assert_eq!(open_bus_value(8), u64::MAX);
    }

    #[test]
    fn write_then_read_round_trips() {
        let device = scratch_device("scratch");
        let handler = IoHandler::new(device, GuestAddress(0x1000), Box::new(ScratchOps::new(8)));

        let done = handler
            .submit(IoAccess::Write { size: 4, value: 0xdead_beef }, 0)
            .unwrap();
        assert_eq!(done, IoCompletion::Write(WriteOutcome::Handled));

        let read = handler.submit(IoAccess::Read { size: 4 }, 0).unwrap();
        assert_eq!(read, IoCompletion::Read(0xdead_beef));

        // Narrow read of the same register.
        let read = handler.submit(IoAccess::Read { size: 1 }, 3).unwrap();
        assert_eq!(read, IoCompletion::Read(0xde));
    }

    #[test]
    fn write_value_is_normalized_before_the_device_sees_it() {
        let device = scratch_device("scratch");
        let handler = IoHandler::new(device, GuestAddress(0), Box::new(ScratchOps::new(8)));

        // High bits beyond the 2-byte width must be dropped.
        handler
            .submit(IoAccess::Write { size: 2, value: 0xffff_0000_abcd }, 0)
            .unwrap();
        let read = handler.submit(IoAccess::Read { size: 8 }, 0).unwrap();
        assert_eq!(read, IoCompletion::Read(0xabcd));
    }

    #[test]
    fn requests_are_single_flight() {
        let device = scratch_device("scratch");
        let ops = ScratchOps::new(8);
        let max = Arc::clone(&ops.max_concurrent);
        let handler = IoHandler::new(device, GuestAddress(0), Box::new(ops));

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        handler
                            .submit(IoAccess::Write { size: 1, value: i }, 0)
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(max.load(Ordering::SeqCst), 1, "handler must serialize");
    }

    #[test]
    fn device_errors_propagate() {
        let device = scratch_device("scratch");
        let handler = IoHandler::new(device, GuestAddress(0), Box::new(ScratchOps::new(4)));

        let err = handler.submit(IoAccess::Read { size: 8 }, 0).unwrap_err();
        assert!(matches!(err, IoError::Unsupported { .. }));
    }

    #[test]
    fn paused_device_defers_io_until_unpause() {
        let device = scratch_device("scratch");
        let handler = IoHandler::new(
            Arc::clone(&device),
            GuestAddress(0),
            Box::new(ScratchOps::new(8)),
        );

        device.pause(true).unwrap();
        let submitter = {
            let handler = Arc::clone(&handler);
            std::thread::spawn(move || handler.submit(IoAccess::Write { size: 1, value: 7 }, 0))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!submitter.is_finished(), "I/O must wait for unpause");

        device.unpause(true).unwrap();
        submitter.join().unwrap().unwrap();
    }
}
