//! Core kernel state types

use exos_abi::{EnvId, PagePerm, Trapframe};
use serde::{Deserialize, Serialize};

/// Identifies one CPU; an index into the kernel's CPU array.
pub type CpuId = usize;

/// Life-cycle status of an environment slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvStatus {
    /// Slot is unused and on the free list.
    Free,
    /// Marked for destruction while running on a CPU; reclaimed at the
    /// next kernel entry on that CPU.
    Dying,
    /// Eligible for selection by the scheduler.
    Runnable,
    /// Currently executing on some CPU.
    Running,
    /// Not eligible to run (fresh forks, IPC receivers).
    NotRunnable,
    /// Blocked on a disk transfer; woken by the disk interrupt.
    WaitingOnDevice,
}

/// What kind of environment a slot holds. The file server is trusted
/// with cross-environment page operations that ordinary environments
/// may only perform on themselves and their children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvType {
    User,
    FileServer,
}

/// What the CPU should do after a kernel entry completes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resume {
    /// Resume `env` in user mode with the given register state.
    Run { env: EnvId, tf: Trapframe },
    /// No runnable environment: idle with interrupts enabled until the
    /// next one arrives.
    Halt,
}

/// Hardware-reported detail accompanying a page-fault exception.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultInfo {
    /// The faulting address.
    pub va: usize,
    /// Whether the access was a write.
    pub write: bool,
}

/// Rendezvous state of one environment.
///
/// `receiving` is the commitment point: a sender may complete a transfer
/// exactly while it is set. The remaining fields hold either the pending
/// receive's destination or the last delivered message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IpcState {
    /// Blocked in receive, ready to accept a transfer.
    pub receiving: bool,
    /// Where a sent page should be mapped; `None` when the receiver
    /// opted out of page transfer.
    pub dst_va: Option<usize>,
    /// Sender of the last delivered message.
    pub from: EnvId,
    /// Payload word of the last delivered message.
    pub value: u64,
    /// Permissions of the page received, or `PagePerm::default()` when
    /// no page came with the message.
    pub perm: PagePerm,
}

/// Parameters of a disk transfer an environment sleeps on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiskWait {
    /// User buffer to fill when a read completes.
    pub buf_va: usize,
    /// Length of the transfer in bytes.
    pub len: usize,
    /// Whether this is a write (no data copied back on completion).
    pub is_write: bool,
}
