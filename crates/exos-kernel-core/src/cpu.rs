//! CPU records and the big kernel lock
//!
//! The whole kernel runs under one lock: a CPU acquires it on every entry
//! from user mode and releases it when it dispatches an environment or
//! halts. The lock is modeled as an explicit token so that holding it is
//! visible in the state (and checkable by the invariant suite) rather
//! than implied by control flow.

use exos_abi::EnvId;

use crate::types::CpuId;

/// What a CPU is doing, as far as the scheduler cares.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuStatus {
    /// Executing (kernel or user).
    Started,
    /// Idle in the halt loop with interrupts enabled; the next interrupt
    /// re-enters the kernel.
    Halted,
}

/// Per-CPU state.
pub struct Cpu {
    pub status: CpuStatus,
    /// Environment this CPU is running, if any.
    pub current: Option<EnvId>,
}

impl Cpu {
    pub fn new() -> Self {
        Self {
            status: CpuStatus::Started,
            current: None,
        }
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

/// The big kernel lock.
///
/// Single-holder, not reentrant. In the model every kernel entry runs to
/// completion, so `lock` never contends; the explicit holder field exists
/// to make lock discipline violations panics instead of silent bugs.
pub struct KernelLock {
    holder: Option<CpuId>,
}

impl KernelLock {
    pub fn new() -> Self {
        Self { holder: None }
    }

    /// Acquire on kernel entry.
    ///
    /// # Panics
    ///
    /// Panics if already held; that is a missed unlock on some earlier
    /// exit path.
    pub fn lock(&mut self, cpu: CpuId) {
        if let Some(holder) = self.holder {
            panic!("kernel lock: cpu {} locking while held by cpu {}", cpu, holder);
        }
        self.holder = Some(cpu);
    }

    /// Release before returning to user mode or halting.
    ///
    /// # Panics
    ///
    /// Panics unless `cpu` is the holder.
    pub fn unlock(&mut self, cpu: CpuId) {
        if self.holder != Some(cpu) {
            panic!("kernel lock: cpu {} unlocking without holding", cpu);
        }
        self.holder = None;
    }

    /// CPU currently holding the lock, if any.
    pub fn holder(&self) -> Option<CpuId> {
        self.holder
    }

    pub fn is_held_by(&self, cpu: CpuId) -> bool {
        self.holder == Some(cpu)
    }
}

impl Default for KernelLock {
    fn default() -> Self {
        Self::new()
    }
}
