//! The kernel state machine
//!
//! [`Kernel`] owns every piece of kernel state: the frame table, the
//! environment table, the per-CPU records, the big kernel lock, and the
//! interrupt vector table. It has no concurrency and performs no I/O of
//! its own; each kernel entry is one call to [`Kernel::trap`] (or the
//! boot-time constructors), which runs to completion and hands back a
//! [`Resume`] telling the CPU what to do next.
//!
//! The read accessors at the bottom stand in for the read-only windows a
//! real kernel maps into user space (the page-table and environment-table
//! views the user library pages through).

use alloc::string::String;
use alloc::vec::Vec;

use exos_abi::{
    EnvId, KernelError, PagePerm, Trapframe, PAGE_SIZE, USER_STACK_TOP,
};
use exos_hal::Hal;

use crate::cpu::{Cpu, CpuStatus, KernelLock};
use crate::env::{Env, EnvTable};
use crate::mem::{FrameId, FrameTable};
use crate::trap::VectorTable;
use crate::types::{CpuId, EnvStatus, EnvType, Resume};

/// The complete kernel state.
pub struct Kernel<H: Hal> {
    pub(crate) hal: H,
    pub(crate) frames: FrameTable,
    pub(crate) envs: EnvTable,
    pub(crate) cpus: Vec<Cpu>,
    pub(crate) lock: KernelLock,
    pub(crate) vectors: VectorTable,
    pub(crate) time_ms: u64,
}

impl<H: Hal> Kernel<H> {
    /// A booted kernel with `ncpus` CPUs and `nframes` allocatable frames.
    /// All CPUs start halted with nothing to run; create environments,
    /// then bring each CPU up with [`Kernel::boot_cpu`].
    pub fn new(hal: H, ncpus: usize, nframes: usize) -> Self {
        let mut cpus = Vec::with_capacity(ncpus);
        for _ in 0..ncpus {
            let mut cpu = Cpu::new();
            cpu.status = CpuStatus::Halted;
            cpus.push(cpu);
        }
        Self {
            hal,
            frames: FrameTable::new(nframes),
            envs: EnvTable::new(),
            cpus,
            lock: KernelLock::new(),
            vectors: VectorTable::new(),
            time_ms: 0,
        }
    }

    /// Create a boot-time environment entering at `entry_ip`, with one
    /// stack page mapped just below [`USER_STACK_TOP`].
    pub fn create_env(&mut self, ty: EnvType, entry_ip: usize) -> Result<EnvId, KernelError> {
        let index = self.envs.alloc(EnvId::NULL, ty)?;
        let Some(stack) = self.frames.alloc(true) else {
            self.envs.free(index, &mut self.frames);
            return Err(KernelError::NoMem);
        };
        let env = self.envs.get_mut(index);
        env.tf = Trapframe::user(entry_ip, USER_STACK_TOP);
        env.space
            .insert(&mut self.frames, stack, USER_STACK_TOP - PAGE_SIZE, PagePerm::rw())?;
        env.status = EnvStatus::Runnable;
        let id = env.id;
        self.log(format_args!("[{:08x}] new env", id.0));
        Ok(id)
    }

    /// Bring a CPU out of reset: take the lock and pick something to run.
    pub fn boot_cpu(&mut self, cpu: CpuId) -> Resume {
        self.lock.lock(cpu);
        self.cpus[cpu].status = CpuStatus::Started;
        self.sched_yield(cpu)
    }

    /// Dispatch the environment in slot `index` on `cpu`: release the lock
    /// and hand its saved frame back to the hardware.
    ///
    /// Requires the lock held by `cpu`.
    pub(crate) fn env_run(&mut self, cpu: CpuId, index: usize) -> Resume {
        if let Some(prev) = self.cpus[cpu].current {
            let prev_index = prev.index();
            let prev_env = self.envs.get(prev_index);
            if prev_index != index
                && prev_env.id == prev
                && prev_env.status == EnvStatus::Running
            {
                self.envs.get_mut(prev_index).status = EnvStatus::Runnable;
            }
        }
        let env = self.envs.get_mut(index);
        env.status = EnvStatus::Running;
        env.runs += 1;
        let id = env.id;
        let tf = env.tf;
        self.cpus[cpu].current = Some(id);
        self.cpus[cpu].status = CpuStatus::Started;
        self.lock.unlock(cpu);
        Resume::Run { env: id, tf }
    }

    /// Destroy the environment in slot `index`.
    ///
    /// An environment running on a different CPU is only marked `Dying`;
    /// that CPU reclaims it at its next kernel entry. Everything else,
    /// including the caller itself, is reclaimed on the spot. Returns
    /// whether the destroyed environment was `cpu`'s current one (in which
    /// case the caller must reschedule instead of returning to it).
    pub(crate) fn destroy(&mut self, cpu: CpuId, index: usize) -> bool {
        let id = self.envs.get(index).id;
        if self.envs.get(index).status == EnvStatus::Running
            && self.cpus[cpu].current != Some(id)
        {
            self.envs.get_mut(index).status = EnvStatus::Dying;
            return false;
        }
        self.log(format_args!("[{:08x}] freeing env", id.0));
        self.envs.free(index, &mut self.frames);
        if self.cpus[cpu].current == Some(id) {
            self.cpus[cpu].current = None;
            true
        } else {
            false
        }
    }

    /// Reclaim `cpu`'s current environment if a destroy from another CPU
    /// marked it `Dying` since it was dispatched.
    pub(crate) fn reclaim_dying_current(&mut self, cpu: CpuId) {
        if let Some(id) = self.cpus[cpu].current {
            let index = id.index();
            if self.envs.get(index).id == id && self.envs.get(index).status == EnvStatus::Dying
            {
                self.log(format_args!("[{:08x}] freeing env", id.0));
                self.envs.free(index, &mut self.frames);
                self.cpus[cpu].current = None;
            }
        }
    }

    pub(crate) fn log(&mut self, args: core::fmt::Arguments<'_>) {
        let mut msg = String::new();
        let _ = core::fmt::write(&mut msg, args);
        self.hal.debug_write(&msg);
    }

    /// Slot index of `cpu`'s current environment.
    pub(crate) fn current_index(&self, cpu: CpuId) -> Option<usize> {
        let id = self.cpus[cpu].current?;
        let index = id.index();
        let env = self.envs.get(index);
        (env.id == id && env.status != EnvStatus::Free).then_some(index)
    }

    // ========================================================================
    // Read-only windows for the user library and tests
    // ========================================================================

    /// The environment with id `id`, if it is live.
    pub fn env(&self, id: EnvId) -> Option<&Env> {
        let env = self.envs.get(id.index());
        (env.id == id && env.status != EnvStatus::Free).then_some(env)
    }

    /// Id of the environment `cpu` is running.
    pub fn current(&self, cpu: CpuId) -> Option<EnvId> {
        self.cpus[cpu].current
    }

    /// Permissions of the mapping covering `va` in `env`'s space.
    pub fn mapping(&self, env: EnvId, va: usize) -> Option<PagePerm> {
        Some(self.env(env)?.space.lookup(va)?.perm)
    }

    /// Frame and permissions of the mapping covering `va`.
    pub fn mapping_frame(&self, env: EnvId, va: usize) -> Option<(FrameId, PagePerm)> {
        let m = self.env(env)?.space.lookup(va)?;
        Some((m.frame, m.perm))
    }

    /// Every mapping of `env`, in address order.
    pub fn mappings(&self, env: EnvId) -> Vec<(usize, PagePerm)> {
        match self.env(env) {
            Some(e) => e.space.iter().map(|(va, m)| (va, m.perm)).collect(),
            None => Vec::new(),
        }
    }

    /// Reference count of a frame.
    pub fn frame_refs(&self, frame: FrameId) -> u32 {
        self.frames.refs(frame)
    }

    /// Read `buf.len()` bytes from `env`'s space at `va` with user
    /// permissions; a failure reports the faulting address.
    pub fn user_load(&self, env: EnvId, va: usize, buf: &mut [u8]) -> Result<(), usize> {
        match self.env(env) {
            Some(e) => e.space.copy_in(&self.frames, va, buf),
            None => Err(va),
        }
    }

    /// Write bytes into `env`'s space at `va` with user permissions; a
    /// failure reports the faulting address and writes nothing.
    pub fn user_store(&mut self, env: EnvId, va: usize, data: &[u8]) -> Result<(), usize> {
        let index = env.index();
        let e = self.envs.get(index);
        if e.id != env || e.status == EnvStatus::Free {
            return Err(va);
        }
        // Borrow dance: the space and frame table live in the same struct.
        let env_ref = self.envs.get(index);
        env_ref.space.user_mem_check(va, data.len(), true)?;
        let pages: Vec<(usize, FrameId)> = env_ref
            .space
            .iter()
            .map(|(page, m)| (page, m.frame))
            .collect();
        let mut off = 0;
        while off < data.len() {
            let cur = va + off;
            let page = exos_abi::page_align_down(cur);
            let in_page = cur - page;
            let chunk = (PAGE_SIZE - in_page).min(data.len() - off);
            let frame = pages
                .iter()
                .find(|(p, _)| *p == page)
                .map(|(_, f)| *f)
                .ok_or(cur)?;
            self.frames.data_mut(frame)[in_page..in_page + chunk]
                .copy_from_slice(&data[off..off + chunk]);
            off += chunk;
        }
        Ok(())
    }

    /// Milliseconds of timer time elapsed since boot.
    pub fn time_ms(&self) -> u64 {
        self.time_ms
    }

    /// The platform behind this kernel.
    pub fn hal(&self) -> &H {
        &self.hal
    }

    /// Mutable platform access (test setup: queueing packets, seeding the
    /// disk).
    pub fn hal_mut(&mut self) -> &mut H {
        &mut self.hal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exos_hal::TestHal;

    fn kernel() -> Kernel<TestHal> {
        Kernel::new(TestHal::new(8), 1, 32)
    }

    #[test]
    fn test_create_env_maps_stack() {
        let mut k = kernel();
        let id = k.create_env(EnvType::User, 0x1000).unwrap();
        let env = k.env(id).unwrap();
        assert_eq!(env.status, EnvStatus::Runnable);
        assert_eq!(env.tf.ip, 0x1000);
        assert_eq!(env.tf.sp, USER_STACK_TOP);
        let perm = k.mapping(id, USER_STACK_TOP - PAGE_SIZE).unwrap();
        assert!(perm.present && perm.user && perm.write);
        assert!(k.mapping(id, USER_STACK_TOP).is_none());
    }

    #[test]
    fn test_boot_cpu_runs_first_env() {
        let mut k = kernel();
        let id = k.create_env(EnvType::User, 0x1000).unwrap();
        match k.boot_cpu(0) {
            Resume::Run { env, tf } => {
                assert_eq!(env, id);
                assert_eq!(tf.ip, 0x1000);
            }
            Resume::Halt => panic!("expected a runnable env"),
        }
        assert_eq!(k.current(0), Some(id));
        assert_eq!(k.env(id).unwrap().status, EnvStatus::Running);
        // Lock released on dispatch.
        assert_eq!(k.lock.holder(), None);
    }

    #[test]
    fn test_boot_cpu_halts_when_nothing_runnable() {
        let mut k = kernel();
        assert_eq!(k.boot_cpu(0), Resume::Halt);
        assert_eq!(k.current(0), None);
        assert_eq!(k.lock.holder(), None);
    }

    #[test]
    fn test_user_store_and_load_roundtrip() {
        let mut k = kernel();
        let id = k.create_env(EnvType::User, 0x1000).unwrap();
        let va = USER_STACK_TOP - 64;
        k.user_store(id, va, b"hello").unwrap();
        let mut buf = [0u8; 5];
        k.user_load(id, va, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_user_store_faults_on_unmapped() {
        let mut k = kernel();
        let id = k.create_env(EnvType::User, 0x1000).unwrap();
        assert_eq!(k.user_store(id, exos_abi::UTEMP, b"x"), Err(exos_abi::UTEMP));
    }
}
