//! The environment table
//!
//! Fixed array of [`NENV`] slots. Ids carry a generation in their upper
//! bits, bumped every time a slot is reallocated, so a stale id held by
//! another environment never resolves to the slot's new occupant.

use alloc::vec::Vec;

use exos_abi::{EnvId, KernelError, Trapframe, NENV};

use crate::mem::{AddressSpace, FrameTable};
use crate::types::{DiskWait, EnvStatus, EnvType, IpcState};

/// One environment.
pub struct Env {
    /// Current id of this slot (generation | index).
    pub id: EnvId,
    /// Id of the creator, or `EnvId::NULL` for boot-time environments.
    pub parent: EnvId,
    /// User environment or trusted file server.
    pub ty: EnvType,
    /// Life-cycle status.
    pub status: EnvStatus,
    /// Saved register state; authoritative whenever the environment is
    /// not executing on a CPU.
    pub tf: Trapframe,
    /// Mappings below the user/kernel split.
    pub space: AddressSpace,
    /// Entry point of the user-mode page-fault handler, if registered.
    pub fault_upcall: Option<usize>,
    /// Rendezvous state.
    pub ipc: IpcState,
    /// Disk transfer this environment sleeps on, if any.
    pub disk_wait: Option<DiskWait>,
    /// Number of times this environment has been dispatched.
    pub runs: u64,
}

/// The table plus its free list. Lower-numbered free slots are preferred,
/// matching the order boot-time environments land in.
pub struct EnvTable {
    slots: Vec<Env>,
    free: Vec<usize>,
}

impl EnvTable {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(NENV);
        for index in 0..NENV {
            slots.push(Env {
                id: EnvId(index as u32),
                parent: EnvId::NULL,
                ty: EnvType::User,
                status: EnvStatus::Free,
                tf: Trapframe::default(),
                space: AddressSpace::new(),
                fault_upcall: None,
                ipc: IpcState::default(),
                disk_wait: None,
                runs: 0,
            });
        }
        // Pushed in reverse so index 0 is allocated first.
        let free = (0..NENV).rev().collect();
        Self { slots, free }
    }

    /// Claim a free slot. The new environment starts `NotRunnable` with an
    /// empty address space and a fresh-generation id.
    pub fn alloc(&mut self, parent: EnvId, ty: EnvType) -> Result<usize, KernelError> {
        let index = self.free.pop().ok_or(KernelError::NoFreeEnv)?;
        let env = &mut self.slots[index];
        debug_assert_eq!(env.status, EnvStatus::Free);
        env.id = env.id.next_generation();
        env.parent = parent;
        env.ty = ty;
        env.status = EnvStatus::NotRunnable;
        env.tf = Trapframe::default();
        env.fault_upcall = None;
        env.ipc = IpcState::default();
        env.disk_wait = None;
        env.runs = 0;
        Ok(index)
    }

    /// Release a slot: drop every mapping, mark it free. The id stays in
    /// place so the next allocation bumps its generation.
    pub fn free(&mut self, index: usize, frames: &mut FrameTable) {
        let env = &mut self.slots[index];
        debug_assert_ne!(env.status, EnvStatus::Free);
        env.space.clear(frames);
        env.status = EnvStatus::Free;
        env.fault_upcall = None;
        env.ipc = IpcState::default();
        env.disk_wait = None;
        self.free.push(index);
    }

    /// Resolve an id to a table index.
    ///
    /// `EnvId::NULL` names the caller. With `checkperm` set, the caller may
    /// only act on itself, its immediate children, or anything at all when
    /// it is the file server.
    pub fn resolve(
        &self,
        id: EnvId,
        caller: usize,
        checkperm: bool,
    ) -> Result<usize, KernelError> {
        if id.is_null() {
            return Ok(caller);
        }
        let index = id.index();
        let env = &self.slots[index];
        if env.status == EnvStatus::Free || env.id != id {
            return Err(KernelError::BadEnv);
        }
        if checkperm && index != caller {
            let caller_env = &self.slots[caller];
            if env.parent != caller_env.id && caller_env.ty != EnvType::FileServer {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(index)
    }

    pub fn get(&self, index: usize) -> &Env {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Env {
        &mut self.slots[index]
    }

    /// Split borrow of two distinct slots (IPC transfer touches both).
    pub fn get_pair_mut(&mut self, a: usize, b: usize) -> (&mut Env, &mut Env) {
        debug_assert_ne!(a, b);
        if a < b {
            let (lo, hi) = self.slots.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.slots.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// Indices of non-free slots.
    pub fn iter_live(&self) -> impl Iterator<Item = usize> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, e)| e.status != EnvStatus::Free)
            .map(|(i, _)| i)
    }
}

impl Default for EnvTable {
    fn default() -> Self {
        Self::new()
    }
}
