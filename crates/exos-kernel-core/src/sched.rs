//! Round-robin scheduler
//!
//! One circular scan over the environment table, starting just after the
//! slot of the environment that last ran on this CPU, so no runnable
//! environment can be starved by its neighbors.

use exos_abi::NENV;
use exos_hal::Hal;

use crate::cpu::CpuStatus;
use crate::kernel::Kernel;
use crate::types::{CpuId, EnvStatus, Resume};

impl<H: Hal> Kernel<H> {
    /// Pick the next environment for `cpu` and dispatch it, or halt the
    /// CPU when nothing is runnable.
    ///
    /// Requires the lock held by `cpu`; it is released on either exit
    /// path. The current environment, if still `Running`, is the
    /// fallback of last resort - it loses its slot only to a different
    /// runnable environment.
    pub(crate) fn sched_yield(&mut self, cpu: CpuId) -> Resume {
        self.reclaim_dying_current(cpu);

        let start = match self.current_index(cpu) {
            Some(index) => index + 1,
            None => 0,
        };
        for offset in 0..NENV {
            let index = (start + offset) % NENV;
            if self.envs.get(index).status == EnvStatus::Runnable {
                return self.env_run(cpu, index);
            }
        }
        if let Some(index) = self.current_index(cpu) {
            if self.envs.get(index).status == EnvStatus::Running {
                return self.env_run(cpu, index);
            }
        }
        // Nothing to run: idle until an interrupt delivers work.
        self.cpus[cpu].current = None;
        self.cpus[cpu].status = CpuStatus::Halted;
        self.lock.unlock(cpu);
        Resume::Halt
    }
}
