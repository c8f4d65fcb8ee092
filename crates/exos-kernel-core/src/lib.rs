//! Exos Kernel Core - Pure State Machine
//!
//! This crate is the whole of the Exos kernel, written as a pure state
//! machine: every kernel entry is one call to [`Kernel::trap`], which runs
//! to completion under the big kernel lock and returns a [`Resume`] telling
//! the CPU what to execute next. The only way out of the machine is the
//! [`exos_hal::Hal`] collaborator boundary (debug console, disk, network).
//!
//! # Design Principles
//!
//! 1. **Everything is a trap**: syscalls, faults, and interrupts all enter
//!    through the same dispatcher and the same vector table
//! 2. **Deterministic**: state plus inputs fully determine the next state;
//!    the scheduler scan order is part of the contract
//! 3. **Observable memory**: frames hold real page bytes, so sharing and
//!    copy-on-write behavior is checkable from tests, not inferred
//! 4. **Checkable structure**: the lock, the vector table, and the frame
//!    reference counts are explicit state the invariant suite can audit
//!
//! # Module Organization
//!
//! - `types` - core state types (EnvStatus, Resume, IpcState, ...)
//! - `mem` - frame table and per-environment address spaces
//! - `env` - the environment table with generation-counted ids
//! - `cpu` - per-CPU records and the big kernel lock
//! - `kernel` - the `Kernel` struct, boot, dispatch, destruction
//! - `trap` - vector table, trap entry, page-fault upcalls, IRQs
//! - `syscall` - the syscall gateway
//! - `sched` - round-robin scheduling
//! - `invariants` - whole-state structural checks

#![no_std]
extern crate alloc;

pub mod cpu;
pub mod env;
pub mod invariants;
pub mod kernel;
pub mod mem;
pub mod sched;
pub mod syscall;
pub mod trap;
pub mod types;

// Re-export the surface the user library and harnesses need
pub use cpu::{Cpu, CpuStatus, KernelLock};
pub use env::{Env, EnvTable};
pub use invariants::{check, InvariantViolation};
pub use kernel::Kernel;
pub use mem::{AddressSpace, FrameId, FrameTable, Mapping};
pub use syscall::ETH_MAX_FRAME;
pub use trap::{
    Exception, Vector, VectorEntry, VectorTable, IRQ_IDE, IRQ_KBD, IRQ_NET, IRQ_OFFSET,
    IRQ_SERIAL, IRQ_SPURIOUS, IRQ_TIMER, TICK_MS, T_SYSCALL,
};
pub use types::{
    CpuId, DiskWait, EnvStatus, EnvType, FaultInfo, IpcState, Resume,
};
