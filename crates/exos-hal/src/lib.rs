//! Collaborator boundary for Exos
//!
//! This crate defines the [`Hal`] trait through which the kernel state
//! machine reaches everything outside itself: the debug console, the block
//! device, and the network device. The kernel never performs I/O except
//! through its `Hal`, which keeps the state machine deterministic and
//! testable.
//!
//! # Device contracts
//!
//! - **Block device**: asynchronous, at most one transfer outstanding at a
//!   time. `disk_submit` issues the hardware command; completion is
//!   signaled later by the disk interrupt, at which point the kernel calls
//!   `disk_complete` to collect the result. Cancellation is not supported.
//! - **Network device**: synchronous best-effort. `net_transmit` returns
//!   the number of bytes accepted, 0 meaning "retry later";
//!   `net_receive` returns 0 when nothing is ready and an error when the
//!   caller's buffer is too small for the waiting packet.
//!
//! [`TestHal`] is the in-memory implementation (RAM disk, loopback NIC,
//! captured log) used by the kernel and user-library test suites.

#![no_std]

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

/// Size of one disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// HAL operation errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// A disk transfer is already in flight.
    DeviceBusy,
    /// Receive buffer smaller than the waiting packet.
    BufferTooSmall,
    /// Request outside the device's capacity.
    OutOfRange,
}

/// One block-device transfer request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiskOp {
    /// Read `sectors` sectors starting at `sector`.
    Read { sector: u64, sectors: usize },
    /// Write `data` (a whole number of sectors) starting at `sector`.
    Write { sector: u64, data: Vec<u8> },
}

/// Result of a completed disk transfer, collected on the disk interrupt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiskCompletion {
    /// Data read from the device; `None` for writes.
    pub data: Option<Vec<u8>>,
}

/// The collaborator boundary.
///
/// Implementations provide platform-specific behavior for debug output and
/// the block/network devices; the kernel supplies everything else.
pub trait Hal {
    // === Debug ===

    /// Write a debug message to the platform's console/log.
    fn debug_write(&mut self, msg: &str);

    // === Block device ===

    /// Issue a disk transfer. At most one transfer may be outstanding;
    /// a second submit before the completion interrupt is an error.
    fn disk_submit(&mut self, op: DiskOp) -> Result<(), HalError>;

    /// Collect the completed transfer, if any. Called by the kernel when
    /// the disk interrupt fires; returns `None` for a spurious interrupt.
    fn disk_complete(&mut self) -> Option<DiskCompletion>;

    // === Network device ===

    /// Transmit a packet. Returns the number of bytes the device accepted;
    /// 0 means the transmit ring is full and the caller should retry later.
    fn net_transmit(&mut self, frame: &[u8]) -> usize;

    /// Poll for a received packet into `buf`. Returns the packet length,
    /// 0 when nothing is ready, or `BufferTooSmall` when the waiting
    /// packet does not fit.
    fn net_receive(&mut self, buf: &mut [u8]) -> Result<usize, HalError>;
}

// ============================================================================
// Test implementation
// ============================================================================

/// In-memory HAL: RAM disk, loopback network, captured debug log.
pub struct TestHal {
    log: Vec<String>,
    sectors: Vec<u8>,
    pending: Option<DiskOp>,
    tx_frames: Vec<Vec<u8>>,
    rx_frames: VecDeque<Vec<u8>>,
    /// Per-transmit byte budget; `None` accepts whole frames.
    tx_budget: Option<usize>,
}

impl TestHal {
    /// A HAL with a RAM disk of `nsectors` sectors.
    pub fn new(nsectors: usize) -> Self {
        Self {
            log: Vec::new(),
            sectors: vec![0u8; nsectors * SECTOR_SIZE],
            pending: None,
            tx_frames: Vec::new(),
            rx_frames: VecDeque::new(),
            tx_budget: None,
        }
    }

    /// Captured debug log.
    pub fn log(&self) -> &[String] {
        &self.log
    }

    /// Fill a disk sector directly (test setup).
    pub fn write_sector(&mut self, sector: u64, data: &[u8]) {
        let start = sector as usize * SECTOR_SIZE;
        self.sectors[start..start + data.len()].copy_from_slice(data);
    }

    /// Read a disk sector directly (test assertions).
    pub fn read_sector(&self, sector: u64) -> &[u8] {
        let start = sector as usize * SECTOR_SIZE;
        &self.sectors[start..start + SECTOR_SIZE]
    }

    /// Whether a disk transfer is in flight.
    pub fn disk_busy(&self) -> bool {
        self.pending.is_some()
    }

    /// Frames the device has transmitted.
    pub fn transmitted(&self) -> &[Vec<u8>] {
        &self.tx_frames
    }

    /// Queue a frame for `net_receive` to return.
    pub fn queue_rx(&mut self, frame: Vec<u8>) {
        self.rx_frames.push_back(frame);
    }

    /// Cap the bytes accepted per `net_transmit` call (0 models a full
    /// transmit ring).
    pub fn set_tx_budget(&mut self, budget: Option<usize>) {
        self.tx_budget = budget;
    }
}

impl Hal for TestHal {
    fn debug_write(&mut self, msg: &str) {
        self.log.push(msg.to_string());
    }

    fn disk_submit(&mut self, op: DiskOp) -> Result<(), HalError> {
        if self.pending.is_some() {
            return Err(HalError::DeviceBusy);
        }
        let end = match &op {
            DiskOp::Read { sector, sectors } => (*sector as usize + sectors) * SECTOR_SIZE,
            DiskOp::Write { sector, data } => *sector as usize * SECTOR_SIZE + data.len(),
        };
        if end > self.sectors.len() {
            return Err(HalError::OutOfRange);
        }
        self.pending = Some(op);
        Ok(())
    }

    fn disk_complete(&mut self) -> Option<DiskCompletion> {
        match self.pending.take()? {
            DiskOp::Read { sector, sectors } => {
                let start = sector as usize * SECTOR_SIZE;
                let data = self.sectors[start..start + sectors * SECTOR_SIZE].to_vec();
                Some(DiskCompletion { data: Some(data) })
            }
            DiskOp::Write { sector, data } => {
                let start = sector as usize * SECTOR_SIZE;
                self.sectors[start..start + data.len()].copy_from_slice(&data);
                Some(DiskCompletion { data: None })
            }
        }
    }

    fn net_transmit(&mut self, frame: &[u8]) -> usize {
        let take = match self.tx_budget {
            Some(budget) => frame.len().min(budget),
            None => frame.len(),
        };
        if take > 0 {
            self.tx_frames.push(frame[..take].to_vec());
        }
        take
    }

    fn net_receive(&mut self, buf: &mut [u8]) -> Result<usize, HalError> {
        match self.rx_frames.front() {
            None => Ok(0),
            Some(frame) if frame.len() > buf.len() => Err(HalError::BufferTooSmall),
            Some(_) => {
                let frame = self.rx_frames.pop_front().unwrap_or_default();
                buf[..frame.len()].copy_from_slice(&frame);
                Ok(frame.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_single_outstanding() {
        let mut hal = TestHal::new(8);
        hal.disk_submit(DiskOp::Read { sector: 0, sectors: 1 }).unwrap();
        assert_eq!(
            hal.disk_submit(DiskOp::Read { sector: 1, sectors: 1 }),
            Err(HalError::DeviceBusy)
        );
        assert!(hal.disk_complete().is_some());
        // Completed; a new transfer may be issued.
        hal.disk_submit(DiskOp::Read { sector: 1, sectors: 1 }).unwrap();
    }

    #[test]
    fn test_disk_write_then_read_roundtrip() {
        let mut hal = TestHal::new(8);
        let payload = vec![0xAB; SECTOR_SIZE];
        hal.disk_submit(DiskOp::Write { sector: 3, data: payload.clone() }).unwrap();
        assert_eq!(hal.disk_complete(), Some(DiskCompletion { data: None }));
        hal.disk_submit(DiskOp::Read { sector: 3, sectors: 1 }).unwrap();
        assert_eq!(hal.disk_complete().unwrap().data.unwrap(), payload);
    }

    #[test]
    fn test_disk_out_of_range_rejected() {
        let mut hal = TestHal::new(2);
        assert_eq!(
            hal.disk_submit(DiskOp::Read { sector: 2, sectors: 1 }),
            Err(HalError::OutOfRange)
        );
    }

    #[test]
    fn test_spurious_disk_complete() {
        let mut hal = TestHal::new(2);
        assert_eq!(hal.disk_complete(), None);
    }

    #[test]
    fn test_net_transmit_budget() {
        let mut hal = TestHal::new(1);
        hal.set_tx_budget(Some(0));
        assert_eq!(hal.net_transmit(b"hello"), 0);
        assert!(hal.transmitted().is_empty());

        hal.set_tx_budget(Some(3));
        assert_eq!(hal.net_transmit(b"hello"), 3);
        assert_eq!(hal.transmitted(), &[b"hel".to_vec()]);
    }

    #[test]
    fn test_net_receive_empty_and_too_small() {
        let mut hal = TestHal::new(1);
        let mut buf = [0u8; 4];
        assert_eq!(hal.net_receive(&mut buf), Ok(0));

        hal.queue_rx(vec![1, 2, 3, 4, 5]);
        assert_eq!(hal.net_receive(&mut buf), Err(HalError::BufferTooSmall));
        // The packet stays queued for a retry with a bigger buffer.
        let mut big = [0u8; 8];
        assert_eq!(hal.net_receive(&mut big), Ok(5));
        assert_eq!(&big[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_debug_log_captured() {
        let mut hal = TestHal::new(1);
        hal.debug_write("boot");
        hal.debug_write("trap");
        assert_eq!(hal.log(), &["boot".to_string(), "trap".to_string()]);
    }
}
