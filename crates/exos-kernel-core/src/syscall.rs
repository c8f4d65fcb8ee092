//! The syscall gateway
//!
//! Arguments arrive in the saved register frame (`rax` the number;
//! `rdx`, `rcx`, `rbx`, `rdi`, `rsi` up to five arguments) and the
//! result leaves in `rax` as a signed word, negative for errors.
//!
//! Every user-supplied pointer is validated against the caller's own
//! mappings before it is dereferenced; a caller that hands the kernel a
//! bad pointer is destroyed, not faulted.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use exos_abi::{
    is_page_aligned, result_to_word, status, syscall, EnvId, KernelError, PagePerm, Trapframe,
    FLAG_IF, FLAG_IOPL_MASK, TRAPFRAME_SIZE, USER_TOP,
};
use exos_hal::{DiskOp, Hal, SECTOR_SIZE};

use crate::kernel::Kernel;
use crate::types::{CpuId, DiskWait, EnvStatus, EnvType, Resume};

/// Largest network frame a send or receive may name.
pub const ETH_MAX_FRAME: usize = 1518;

/// How a syscall hands control back.
pub(crate) enum SyscallControl {
    /// Write this word into the caller's `rax` and resume it.
    Return(i64),
    /// The caller blocked, died, or yielded; resume something else.
    Terminal(Resume),
}

fn ret(r: Result<i64, KernelError>) -> SyscallControl {
    SyscallControl::Return(result_to_word(r))
}

impl<H: Hal> Kernel<H> {
    /// Syscall trap entry: pull the number and arguments out of the
    /// caller's saved frame and dispatch. `Some` is a terminal resume;
    /// `None` means the caller's `rax` holds the result and it may
    /// continue.
    pub(crate) fn syscall_entry(&mut self, cpu: CpuId) -> Option<Resume> {
        let index = self.current_index(cpu)?;
        let regs = self.envs.get(index).tf.regs;
        let control = self.syscall_dispatch(
            cpu, index, regs.rax, regs.rdx, regs.rcx, regs.rbx, regs.rdi, regs.rsi,
        );
        match control {
            SyscallControl::Return(word) => {
                if let Some(index) = self.current_index(cpu) {
                    self.envs.get_mut(index).tf.regs.rax = word as u64;
                }
                None
            }
            SyscallControl::Terminal(resume) => Some(resume),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn syscall_dispatch(
        &mut self,
        cpu: CpuId,
        index: usize,
        no: u64,
        a1: u64,
        a2: u64,
        a3: u64,
        a4: u64,
        a5: u64,
    ) -> SyscallControl {
        match no {
            syscall::SYS_PUTS => self.sys_puts(cpu, index, a1 as usize, a2 as usize),
            syscall::SYS_GETENVID => ret(Ok(self.envs.get(index).id.0 as i64)),
            syscall::SYS_YIELD => SyscallControl::Terminal(self.sched_yield(cpu)),
            syscall::SYS_DESTROY => self.sys_destroy(cpu, index, EnvId(a1 as u32)),
            syscall::SYS_EXOFORK => ret(self.sys_exofork(index)),
            syscall::SYS_SET_STATUS => ret(self.sys_set_status(index, EnvId(a1 as u32), a2)),
            syscall::SYS_SET_TRAPFRAME => {
                self.sys_set_trapframe(cpu, index, EnvId(a1 as u32), a2 as usize)
            }
            syscall::SYS_SET_FAULT_UPCALL => {
                ret(self.sys_set_fault_upcall(index, EnvId(a1 as u32), a2 as usize))
            }
            syscall::SYS_PAGE_ALLOC => {
                ret(self.sys_page_alloc(index, EnvId(a1 as u32), a2 as usize, a3))
            }
            syscall::SYS_PAGE_MAP => ret(self.sys_page_map(
                index,
                EnvId(a1 as u32),
                a2 as usize,
                EnvId(a3 as u32),
                a4 as usize,
                a5,
            )),
            syscall::SYS_PAGE_UNMAP => {
                ret(self.sys_page_unmap(index, EnvId(a1 as u32), a2 as usize))
            }
            syscall::SYS_IPC_TRY_SEND => {
                ret(self.sys_ipc_try_send(index, EnvId(a1 as u32), a2, a3 as usize, a4))
            }
            syscall::SYS_IPC_RECV => self.sys_ipc_recv(cpu, index, a1 as usize),
            syscall::SYS_TIME_MSEC => ret(Ok(self.time_ms as i64)),
            syscall::SYS_DISK_SLEEP => {
                self.sys_disk_sleep(cpu, index, a1 as usize, a2, a3 as usize, a4 != 0)
            }
            syscall::SYS_NET_SEND => self.sys_net_send(cpu, index, a1 as usize, a2 as usize),
            syscall::SYS_NET_RECV => self.sys_net_recv(cpu, index, a1 as usize, a2 as usize),
            _ => ret(Err(KernelError::Invalid)),
        }
    }

    // ========================================================================
    // User memory helpers
    // ========================================================================

    /// Copy a user buffer in, destroying the caller on a bad pointer.
    fn copy_from_user(
        &mut self,
        cpu: CpuId,
        index: usize,
        va: usize,
        len: usize,
    ) -> Result<Vec<u8>, Resume> {
        let mut buf = vec![0u8; len];
        match self.envs.get(index).space.copy_in(&self.frames, va, &mut buf) {
            Ok(()) => Ok(buf),
            Err(fault_va) => Err(self.destroy_bad_pointer(cpu, index, fault_va)),
        }
    }

    /// Copy into a user buffer, destroying the caller on a bad pointer.
    fn copy_to_user(
        &mut self,
        cpu: CpuId,
        index: usize,
        va: usize,
        data: &[u8],
    ) -> Result<(), Resume> {
        let env = self.envs.get_mut(index);
        match env.space.copy_out(&mut self.frames, va, data) {
            Ok(()) => Ok(()),
            Err(fault_va) => Err(self.destroy_bad_pointer(cpu, index, fault_va)),
        }
    }

    /// Validate a user range without copying, destroying on failure.
    fn user_mem_assert(
        &mut self,
        cpu: CpuId,
        index: usize,
        va: usize,
        len: usize,
        write: bool,
    ) -> Result<(), Resume> {
        match self.envs.get(index).space.user_mem_check(va, len, write) {
            Ok(()) => Ok(()),
            Err(fault_va) => Err(self.destroy_bad_pointer(cpu, index, fault_va)),
        }
    }

    fn destroy_bad_pointer(&mut self, cpu: CpuId, index: usize, fault_va: usize) -> Resume {
        let id = self.envs.get(index).id;
        self.log(format_args!(
            "[{:08x}] memory assertion failure for va {:08x}",
            id.0, fault_va
        ));
        self.destroy(cpu, index);
        self.sched_yield(cpu)
    }

    /// Validate a page argument: aligned and below the split.
    fn page_arg(va: usize) -> Result<usize, KernelError> {
        if va >= USER_TOP || !is_page_aligned(va) {
            return Err(KernelError::Invalid);
        }
        Ok(va)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    fn sys_puts(&mut self, cpu: CpuId, index: usize, va: usize, len: usize) -> SyscallControl {
        match self.copy_from_user(cpu, index, va, len) {
            Ok(buf) => {
                let text = String::from_utf8_lossy(&buf).into_owned();
                self.hal.debug_write(&text);
                ret(Ok(0))
            }
            Err(resume) => SyscallControl::Terminal(resume),
        }
    }

    fn sys_destroy(&mut self, cpu: CpuId, index: usize, id: EnvId) -> SyscallControl {
        let target = match self.envs.resolve(id, index, true) {
            Ok(t) => t,
            Err(e) => return ret(Err(e)),
        };
        let caller_id = self.envs.get(index).id;
        if target == index {
            self.log(format_args!("[{:08x}] exiting gracefully", caller_id.0));
        } else {
            let target_id = self.envs.get(target).id;
            self.log(format_args!(
                "[{:08x}] destroying {:08x}",
                caller_id.0, target_id.0
            ));
        }
        if self.destroy(cpu, target) {
            SyscallControl::Terminal(self.sched_yield(cpu))
        } else {
            ret(Ok(0))
        }
    }

    /// Fork without the address space: the child is a register-state
    /// clone, not runnable, seeing 0 where the parent sees the child's id.
    fn sys_exofork(&mut self, index: usize) -> Result<i64, KernelError> {
        let parent_id = self.envs.get(index).id;
        let parent_tf = self.envs.get(index).tf;
        let child = self.envs.alloc(parent_id, EnvType::User)?;
        let env = self.envs.get_mut(child);
        env.tf = parent_tf;
        env.tf.regs.rax = 0;
        debug_assert_eq!(env.status, EnvStatus::NotRunnable);
        Ok(env.id.0 as i64)
    }

    fn sys_set_status(&mut self, index: usize, id: EnvId, st: u64) -> Result<i64, KernelError> {
        let target = self.envs.resolve(id, index, true)?;
        let new = match st {
            status::RUNNABLE => EnvStatus::Runnable,
            status::NOT_RUNNABLE => EnvStatus::NotRunnable,
            _ => return Err(KernelError::Invalid),
        };
        let env = self.envs.get_mut(target);
        // A receiver parked in ipc-recv is completed by a sender, never
        // by a status write; waking it here would leave it receiving
        // while schedulable.
        if env.ipc.receiving && new == EnvStatus::Runnable {
            return Err(KernelError::Invalid);
        }
        // Only the two schedulable states may be toggled from outside;
        // running and device-blocked environments are off limits.
        match env.status {
            EnvStatus::Runnable | EnvStatus::NotRunnable => {
                env.status = new;
                Ok(0)
            }
            _ => Err(KernelError::Invalid),
        }
    }

    fn sys_set_trapframe(
        &mut self,
        cpu: CpuId,
        index: usize,
        id: EnvId,
        va: usize,
    ) -> SyscallControl {
        let target = match self.envs.resolve(id, index, true) {
            Ok(t) => t,
            Err(e) => return ret(Err(e)),
        };
        let bytes = match self.copy_from_user(cpu, index, va, TRAPFRAME_SIZE) {
            Ok(b) => b,
            Err(resume) => return SyscallControl::Terminal(resume),
        };
        let Some(mut tf) = Trapframe::decode(&bytes) else {
            return ret(Err(KernelError::Invalid));
        };
        // User privilege with interrupts on and no I/O access, whatever
        // the caller wrote.
        tf.flags |= FLAG_IF;
        tf.flags &= !FLAG_IOPL_MASK;
        self.envs.get_mut(target).tf = tf;
        ret(Ok(0))
    }

    fn sys_set_fault_upcall(
        &mut self,
        index: usize,
        id: EnvId,
        va: usize,
    ) -> Result<i64, KernelError> {
        let target = self.envs.resolve(id, index, true)?;
        self.envs.get_mut(target).fault_upcall = Some(va);
        Ok(0)
    }

    fn sys_page_alloc(
        &mut self,
        index: usize,
        id: EnvId,
        va: usize,
        perm_bits: u64,
    ) -> Result<i64, KernelError> {
        let target = self.envs.resolve(id, index, true)?;
        let va = Self::page_arg(va)?;
        let perm = PagePerm::from_syscall_bits(perm_bits).ok_or(KernelError::Invalid)?;
        let frame = self.frames.alloc(true).ok_or(KernelError::NoMem)?;
        self.envs
            .get_mut(target)
            .space
            .insert(&mut self.frames, frame, va, perm)?;
        Ok(0)
    }

    fn sys_page_map(
        &mut self,
        index: usize,
        src_id: EnvId,
        src_va: usize,
        dst_id: EnvId,
        dst_va: usize,
        perm_bits: u64,
    ) -> Result<i64, KernelError> {
        let src = self.envs.resolve(src_id, index, true)?;
        let dst = self.envs.resolve(dst_id, index, true)?;
        let src_va = Self::page_arg(src_va)?;
        let dst_va = Self::page_arg(dst_va)?;
        let perm = PagePerm::from_syscall_bits(perm_bits).ok_or(KernelError::Invalid)?;
        let mapping = self
            .envs
            .get(src)
            .space
            .lookup(src_va)
            .ok_or(KernelError::Invalid)?;
        // No write grant through a read-only source mapping.
        if perm.write && !mapping.perm.write {
            return Err(KernelError::Invalid);
        }
        self.envs
            .get_mut(dst)
            .space
            .insert(&mut self.frames, mapping.frame, dst_va, perm)?;
        Ok(0)
    }

    fn sys_page_unmap(&mut self, index: usize, id: EnvId, va: usize) -> Result<i64, KernelError> {
        let target = self.envs.resolve(id, index, true)?;
        let va = Self::page_arg(va)?;
        self.envs.get_mut(target).space.remove(&mut self.frames, va);
        Ok(0)
    }

    /// Non-blocking half of the rendezvous. No permission check on the
    /// target: anyone may send to anyone who is willing to receive.
    fn sys_ipc_try_send(
        &mut self,
        index: usize,
        id: EnvId,
        value: u64,
        src_va: usize,
        perm_bits: u64,
    ) -> Result<i64, KernelError> {
        let target = self.envs.resolve(id, index, false)?;
        if !self.envs.get(target).ipc.receiving {
            return Err(KernelError::IpcNotRecv);
        }
        // A page offer is validated even when the receiver declined one.
        let mut sent_perm = None;
        if src_va < USER_TOP {
            if !is_page_aligned(src_va) {
                return Err(KernelError::Invalid);
            }
            let perm = PagePerm::from_syscall_bits(perm_bits).ok_or(KernelError::Invalid)?;
            let mapping = self
                .envs
                .get(index)
                .space
                .lookup(src_va)
                .ok_or(KernelError::Invalid)?;
            if perm.write && !mapping.perm.write {
                return Err(KernelError::Invalid);
            }
            if let Some(dst_va) = self.envs.get(target).ipc.dst_va {
                self.envs
                    .get_mut(target)
                    .space
                    .insert(&mut self.frames, mapping.frame, dst_va, perm)?;
                sent_perm = Some(perm);
            }
        }
        let caller_id = self.envs.get(index).id;
        let env = self.envs.get_mut(target);
        env.ipc.receiving = false;
        env.ipc.dst_va = None;
        env.ipc.from = caller_id;
        env.ipc.value = value;
        env.ipc.perm = sent_perm.unwrap_or_default();
        env.status = EnvStatus::Runnable;
        // The receiver's blocked recv completes with 0.
        env.tf.regs.rax = 0;
        Ok(0)
    }

    /// Blocking half of the rendezvous. The caller stops being runnable
    /// until a sender finds it; its result register is written by the
    /// sender's side of the transfer.
    fn sys_ipc_recv(&mut self, cpu: CpuId, index: usize, dst_va: usize) -> SyscallControl {
        if dst_va < USER_TOP && !is_page_aligned(dst_va) {
            return ret(Err(KernelError::Invalid));
        }
        let env = self.envs.get_mut(index);
        env.ipc.receiving = true;
        env.ipc.dst_va = (dst_va < USER_TOP).then_some(dst_va);
        env.status = EnvStatus::NotRunnable;
        SyscallControl::Terminal(self.sched_yield(cpu))
    }

    /// Block until a disk transfer finishes. Single-outstanding: the
    /// submission fails while another transfer is in flight.
    fn sys_disk_sleep(
        &mut self,
        cpu: CpuId,
        index: usize,
        buf_va: usize,
        sector: u64,
        nsectors: usize,
        is_write: bool,
    ) -> SyscallControl {
        let Some(len) = nsectors
            .checked_mul(SECTOR_SIZE)
            .filter(|&l| l > 0 && l <= USER_TOP)
        else {
            return ret(Err(KernelError::Invalid));
        };
        let op = if is_write {
            let data = match self.copy_from_user(cpu, index, buf_va, len) {
                Ok(d) => d,
                Err(resume) => return SyscallControl::Terminal(resume),
            };
            DiskOp::Write { sector, data }
        } else {
            if let Err(resume) = self.user_mem_assert(cpu, index, buf_va, len, true) {
                return SyscallControl::Terminal(resume);
            }
            DiskOp::Read {
                sector,
                sectors: nsectors,
            }
        };
        if self.hal.disk_submit(op).is_err() {
            return ret(Err(KernelError::Invalid));
        }
        let env = self.envs.get_mut(index);
        env.disk_wait = Some(DiskWait {
            buf_va,
            len,
            is_write,
        });
        env.status = EnvStatus::WaitingOnDevice;
        SyscallControl::Terminal(self.sched_yield(cpu))
    }

    /// Hand one frame to the network device. Returns the bytes accepted;
    /// 0 means the transmit ring is full and the caller should back off
    /// and retry.
    fn sys_net_send(&mut self, cpu: CpuId, index: usize, va: usize, len: usize) -> SyscallControl {
        if len == 0 || len > ETH_MAX_FRAME {
            return ret(Err(KernelError::Invalid));
        }
        match self.copy_from_user(cpu, index, va, len) {
            Ok(frame) => {
                let accepted = self.hal.net_transmit(&frame);
                ret(Ok(accepted as i64))
            }
            Err(resume) => SyscallControl::Terminal(resume),
        }
    }

    /// Poll the network device for one frame. Returns its length, or 0
    /// when nothing is waiting.
    fn sys_net_recv(&mut self, cpu: CpuId, index: usize, va: usize, len: usize) -> SyscallControl {
        if len == 0 || len > ETH_MAX_FRAME {
            return ret(Err(KernelError::Invalid));
        }
        if let Err(resume) = self.user_mem_assert(cpu, index, va, len, true) {
            return SyscallControl::Terminal(resume);
        }
        let mut buf = vec![0u8; len];
        match self.hal.net_receive(&mut buf) {
            Ok(0) => ret(Ok(0)),
            Ok(n) => match self.copy_to_user(cpu, index, va, &buf[..n]) {
                Ok(()) => ret(Ok(n as i64)),
                Err(resume) => SyscallControl::Terminal(resume),
            },
            Err(_) => ret(Err(KernelError::Invalid)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::{IRQ_IDE, IRQ_OFFSET, T_SYSCALL};
    use crate::types::{EnvType, FaultInfo, Resume};
    use exos_abi::{
        perm_bits, EnvId, PAGE_SIZE, USER_STACK_TOP, UTEMP,
    };
    use exos_hal::TestHal;

    fn kernel_with(n: usize) -> (Kernel<TestHal>, Vec<EnvId>) {
        let mut k = Kernel::new(TestHal::new(16), 1, 128);
        let ids = (0..n)
            .map(|i| k.create_env(EnvType::User, 0x1000 + i * 0x100).unwrap())
            .collect();
        (k, ids)
    }

    /// Boot the CPU and drive it until `id` is the running env.
    fn run_until(k: &mut Kernel<TestHal>, id: EnvId) {
        if k.current(0) == Some(id) {
            return;
        }
        let mut tf = match k.boot_cpu(0) {
            Resume::Run { env, tf } => {
                if env == id {
                    return;
                }
                tf
            }
            Resume::Halt => panic!("nothing runnable"),
        };
        for _ in 0..exos_abi::NENV {
            match k.trap(0, tf, IRQ_OFFSET, None) {
                Resume::Run { env, tf: next } => {
                    if env == id {
                        return;
                    }
                    tf = next;
                }
                Resume::Halt => panic!("nothing runnable"),
            }
        }
        panic!("env never scheduled");
    }

    fn do_syscall(k: &mut Kernel<TestHal>, id: EnvId, no: u64, args: [u64; 5]) -> Resume {
        run_until(k, id);
        let mut tf = k.env(id).unwrap().tf;
        tf.regs.rax = no;
        tf.regs.rdx = args[0];
        tf.regs.rcx = args[1];
        tf.regs.rbx = args[2];
        tf.regs.rdi = args[3];
        tf.regs.rsi = args[4];
        k.trap(0, tf, T_SYSCALL, None)
    }

    fn rax(k: &Kernel<TestHal>, id: EnvId) -> i64 {
        k.env(id).unwrap().tf.regs.rax as i64
    }

    #[test]
    fn test_getenvid() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_GETENVID, [0; 5]);
        assert_eq!(rax(&k, ids[0]), ids[0].0 as i64);
    }

    #[test]
    fn test_unknown_syscall_is_invalid() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], 0xFF, [0; 5]);
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
    }

    #[test]
    fn test_puts_reaches_console() {
        let (mut k, ids) = kernel_with(1);
        run_until(&mut k, ids[0]);
        let va = USER_STACK_TOP - 64;
        k.user_store(ids[0], va, b"hello, kernel").unwrap();
        do_syscall(&mut k, ids[0], syscall::SYS_PUTS, [va as u64, 13, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 0);
        assert!(k.hal().log().iter().any(|l| l == "hello, kernel"));
    }

    #[test]
    fn test_puts_bad_pointer_destroys_caller() {
        let (mut k, ids) = kernel_with(1);
        let resume = do_syscall(&mut k, ids[0], syscall::SYS_PUTS, [UTEMP as u64, 8, 0, 0, 0]);
        assert_eq!(resume, Resume::Halt);
        assert!(k.env(ids[0]).is_none());
        assert!(k
            .hal()
            .log()
            .iter()
            .any(|l| l.contains("memory assertion failure")));
    }

    #[test]
    fn test_yield_round_robins() {
        let (mut k, ids) = kernel_with(2);
        let resume = do_syscall(&mut k, ids[0], syscall::SYS_YIELD, [0; 5]);
        match resume {
            Resume::Run { env, .. } => assert_eq!(env, ids[1]),
            Resume::Halt => panic!("second env must run"),
        }
        assert_eq!(k.env(ids[0]).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn test_destroy_self_schedules_away() {
        let (mut k, ids) = kernel_with(2);
        let resume = do_syscall(&mut k, ids[0], syscall::SYS_DESTROY, [0; 5]);
        match resume {
            Resume::Run { env, .. } => assert_eq!(env, ids[1]),
            Resume::Halt => panic!("survivor must run"),
        }
        assert!(k.env(ids[0]).is_none());
        assert!(k.hal().log().iter().any(|l| l.contains("exiting gracefully")));
    }

    #[test]
    fn test_destroy_requires_permission() {
        let (mut k, ids) = kernel_with(2);
        // ids[1] is not a child of ids[0].
        do_syscall(&mut k, ids[0], syscall::SYS_DESTROY, [ids[1].0 as u64, 0, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), KernelError::BadEnv.code());
        assert!(k.env(ids[1]).is_some());
    }

    #[test]
    fn test_exofork_child_state() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_EXOFORK, [0; 5]);
        let child_word = rax(&k, ids[0]);
        assert!(child_word > 0);
        let child = EnvId(child_word as u32);
        let env = k.env(child).unwrap();
        assert_eq!(env.status, EnvStatus::NotRunnable);
        assert_eq!(env.parent, ids[0]);
        // The child's saved frame answers 0 to the same syscall.
        assert_eq!(env.tf.regs.rax, 0);
        assert_eq!(env.tf.ip, k.env(ids[0]).unwrap().tf.ip);
        // And it owns no pages yet.
        assert!(k.mappings(child).is_empty());
    }

    #[test]
    fn test_set_status_parent_runs_child() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_EXOFORK, [0; 5]);
        let child = EnvId(rax(&k, ids[0]) as u32);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_STATUS,
            [child.0 as u64, status::RUNNABLE, 0, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        assert_eq!(k.env(child).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn test_set_status_rejects_bad_value_and_running_target() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_SET_STATUS, [0, 7, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        // The caller itself is Running; toggling it is rejected too.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_STATUS,
            [0, status::NOT_RUNNABLE, 0, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
    }

    #[test]
    fn test_set_status_cannot_wake_ipc_receiver() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_EXOFORK, [0; 5]);
        let child = EnvId(rax(&k, ids[0]) as u32);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_STATUS,
            [child.0 as u64, status::RUNNABLE, 0, 0, 0],
        );
        // The child parks itself in receive.
        do_syscall(&mut k, child, syscall::SYS_IPC_RECV, [USER_TOP as u64, 0, 0, 0, 0]);
        assert!(k.env(child).unwrap().ipc.receiving);

        // Only a sender may complete it; a status write is refused.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_STATUS,
            [child.0 as u64, status::RUNNABLE, 0, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        assert_eq!(k.env(child).unwrap().status, EnvStatus::NotRunnable);
        assert!(k.env(child).unwrap().ipc.receiving);
        crate::invariants::check(&k).unwrap();
    }

    #[test]
    fn test_page_alloc_and_unmap() {
        let (mut k, ids) = kernel_with(1);
        let perm = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_ALLOC,
            [0, UTEMP as u64, perm, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        let got = k.mapping(ids[0], UTEMP).unwrap();
        assert!(got.present && got.user && got.write);

        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_UNMAP, [0, UTEMP as u64, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 0);
        assert!(k.mapping(ids[0], UTEMP).is_none());
    }

    #[test]
    fn test_page_alloc_rejects_bad_args() {
        let (mut k, ids) = kernel_with(1);
        let perm = perm_bits::PRESENT | perm_bits::USER;
        // Misaligned.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_ALLOC,
            [0, (UTEMP + 8) as u64, perm, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        // Above the split.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_ALLOC,
            [0, USER_TOP as u64, perm, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        // Missing the user bit.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_ALLOC,
            [0, UTEMP as u64, perm_bits::PRESENT, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        // A bit outside the allowed mask.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_ALLOC,
            [0, UTEMP as u64, perm | 0x8000, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
    }

    #[test]
    fn test_page_alloc_replaces_existing_mapping() {
        let (mut k, ids) = kernel_with(1);
        let perm = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, perm, 0, 0]);
        run_until(&mut k, ids[0]);
        k.user_store(ids[0], UTEMP, b"old page").unwrap();
        let (old_frame, _) = k.mapping_frame(ids[0], UTEMP).unwrap();

        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, perm, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 0);
        let (new_frame, _) = k.mapping_frame(ids[0], UTEMP).unwrap();
        assert_ne!(old_frame, new_frame);
        // Fresh page is zeroed; the old frame was freed.
        let mut buf = [0u8; 8];
        k.user_load(ids[0], UTEMP, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn test_page_map_shares_frame_with_child() {
        let (mut k, ids) = kernel_with(1);
        let perm = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, perm, 0, 0]);
        do_syscall(&mut k, ids[0], syscall::SYS_EXOFORK, [0; 5]);
        let child = EnvId(rax(&k, ids[0]) as u32);

        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_MAP,
            [0, UTEMP as u64, child.0 as u64, UTEMP as u64, perm],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        let (pf, _) = k.mapping_frame(ids[0], UTEMP).unwrap();
        let (cf, _) = k.mapping_frame(child, UTEMP).unwrap();
        assert_eq!(pf, cf);
        assert_eq!(k.frame_refs(pf), 2);

        // Writes through one mapping are visible through the other.
        run_until(&mut k, ids[0]);
        k.user_store(ids[0], UTEMP, b"shared").unwrap();
        let mut buf = [0u8; 6];
        k.user_load(child, UTEMP, &mut buf).unwrap();
        assert_eq!(&buf, b"shared");
    }

    #[test]
    fn test_page_map_refuses_write_upgrade() {
        let (mut k, ids) = kernel_with(1);
        let ro = perm_bits::PRESENT | perm_bits::USER;
        let rw = ro | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, ro, 0, 0]);
        // Remapping the read-only page writable elsewhere must fail.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_MAP,
            [0, UTEMP as u64, 0, (UTEMP + PAGE_SIZE) as u64, rw],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        assert!(k.mapping(ids[0], UTEMP + PAGE_SIZE).is_none());
    }

    #[test]
    fn test_page_map_unmapped_source_is_invalid() {
        let (mut k, ids) = kernel_with(1);
        let perm = perm_bits::PRESENT | perm_bits::USER;
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_MAP,
            [0, UTEMP as u64, 0, (UTEMP + PAGE_SIZE) as u64, perm],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
    }

    #[test]
    fn test_ipc_send_to_non_receiver_fails_fast() {
        let (mut k, ids) = kernel_with(2);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_IPC_TRY_SEND,
            [ids[1].0 as u64, 42, USER_TOP as u64, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::IpcNotRecv.code());
        // Nothing about the target changed.
        assert_eq!(k.env(ids[1]).unwrap().status, EnvStatus::Runnable);
        assert_eq!(k.env(ids[1]).unwrap().ipc.value, 0);
    }

    #[test]
    fn test_ipc_rendezvous_value_only() {
        let (mut k, ids) = kernel_with(2);
        // ids[1] blocks in receive, opting out of page transfer.
        let resume = do_syscall(&mut k, ids[1], syscall::SYS_IPC_RECV, [USER_TOP as u64, 0, 0, 0, 0]);
        match resume {
            Resume::Run { env, .. } => assert_eq!(env, ids[0]),
            Resume::Halt => panic!("sender must still run"),
        }
        assert_eq!(k.env(ids[1]).unwrap().status, EnvStatus::NotRunnable);
        assert!(k.env(ids[1]).unwrap().ipc.receiving);

        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_IPC_TRY_SEND,
            [ids[1].0 as u64, 0xCAFE, USER_TOP as u64, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        let receiver = k.env(ids[1]).unwrap();
        assert_eq!(receiver.status, EnvStatus::Runnable);
        assert!(!receiver.ipc.receiving);
        assert_eq!(receiver.ipc.value, 0xCAFE);
        assert_eq!(receiver.ipc.from, ids[0]);
        assert_eq!(receiver.ipc.perm, PagePerm::default());
        // The blocked recv completes with 0.
        assert_eq!(receiver.tf.regs.rax, 0);
    }

    #[test]
    fn test_ipc_rendezvous_with_page_transfer() {
        let (mut k, ids) = kernel_with(2);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        run_until(&mut k, ids[0]);
        k.user_store(ids[0], UTEMP, b"payload").unwrap();

        let dst = UTEMP + 4 * PAGE_SIZE;
        do_syscall(&mut k, ids[1], syscall::SYS_IPC_RECV, [dst as u64, 0, 0, 0, 0]);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_IPC_TRY_SEND,
            [ids[1].0 as u64, 7, UTEMP as u64, rw, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);

        let receiver = k.env(ids[1]).unwrap();
        assert_eq!(receiver.ipc.value, 7);
        assert_eq!(receiver.ipc.perm, PagePerm::rw());
        // Same frame in both spaces; contents visible to the receiver.
        let (sf, _) = k.mapping_frame(ids[0], UTEMP).unwrap();
        let (rf, _) = k.mapping_frame(ids[1], dst).unwrap();
        assert_eq!(sf, rf);
        assert_eq!(k.frame_refs(sf), 2);
        let mut buf = [0u8; 7];
        k.user_load(ids[1], dst, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_ipc_send_page_to_receiver_that_declined() {
        let (mut k, ids) = kernel_with(2);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        do_syscall(&mut k, ids[1], syscall::SYS_IPC_RECV, [USER_TOP as u64, 0, 0, 0, 0]);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_IPC_TRY_SEND,
            [ids[1].0 as u64, 9, UTEMP as u64, rw, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        // Message delivered, no page mapped.
        let receiver = k.env(ids[1]).unwrap();
        assert_eq!(receiver.ipc.value, 9);
        assert_eq!(receiver.ipc.perm, PagePerm::default());
        assert_eq!(k.mappings(ids[1]).len(), 1); // just its stack
    }

    #[test]
    fn test_ipc_recv_rejects_misaligned_destination() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_IPC_RECV, [(UTEMP + 3) as u64, 0, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        assert!(!k.env(ids[0]).unwrap().ipc.receiving);
        assert_eq!(k.env(ids[0]).unwrap().status, EnvStatus::Running);
    }

    #[test]
    fn test_ipc_send_bad_source_mapping() {
        let (mut k, ids) = kernel_with(2);
        do_syscall(&mut k, ids[1], syscall::SYS_IPC_RECV, [UTEMP as u64, 0, 0, 0, 0]);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        // Source page not mapped in the sender.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_IPC_TRY_SEND,
            [ids[1].0 as u64, 1, UTEMP as u64, rw, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
        // Receiver still blocked; the failed send consumed nothing.
        assert!(k.env(ids[1]).unwrap().ipc.receiving);
    }

    #[test]
    fn test_time_msec_tracks_timer() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_TIME_MSEC, [0; 5]);
        assert_eq!(rax(&k, ids[0]), 0);
        run_until(&mut k, ids[0]);
        let tf = k.env(ids[0]).unwrap().tf;
        k.trap(0, tf, IRQ_OFFSET, None);
        do_syscall(&mut k, ids[0], syscall::SYS_TIME_MSEC, [0; 5]);
        assert_eq!(rax(&k, ids[0]), crate::trap::TICK_MS as i64);
    }

    #[test]
    fn test_disk_read_sleeps_then_wakes_with_data() {
        let (mut k, ids) = kernel_with(2);
        k.hal_mut().write_sector(3, &[0x77; SECTOR_SIZE]);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);

        let resume = do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_DISK_SLEEP,
            [UTEMP as u64, 3, 1, 0, 0],
        );
        match resume {
            Resume::Run { env, .. } => assert_eq!(env, ids[1]),
            Resume::Halt => panic!("other env must run while sleeping"),
        }
        assert_eq!(k.env(ids[0]).unwrap().status, EnvStatus::WaitingOnDevice);
        assert!(k.hal().disk_busy());

        // Disk interrupt arrives while ids[1] runs.
        let tf = k.env(ids[1]).unwrap().tf;
        k.trap(0, tf, IRQ_OFFSET + IRQ_IDE, None);
        let sleeper = k.env(ids[0]).unwrap();
        assert_eq!(sleeper.status, EnvStatus::Runnable);
        assert_eq!(sleeper.tf.regs.rax, 0);
        let mut buf = [0u8; 4];
        k.user_load(ids[0], UTEMP, &mut buf).unwrap();
        assert_eq!(buf, [0x77; 4]);
    }

    #[test]
    fn test_disk_write_persists() {
        let (mut k, ids) = kernel_with(2);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        run_until(&mut k, ids[0]);
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..5].copy_from_slice(b"disk!");
        k.user_store(ids[0], UTEMP, &sector).unwrap();

        do_syscall(&mut k, ids[0], syscall::SYS_DISK_SLEEP, [UTEMP as u64, 5, 1, 1, 0]);
        let tf = k.env(ids[1]).unwrap().tf;
        k.trap(0, tf, IRQ_OFFSET + IRQ_IDE, None);
        assert_eq!(k.env(ids[0]).unwrap().status, EnvStatus::Runnable);
        assert_eq!(&k.hal().read_sector(5)[..5], b"disk!");
    }

    #[test]
    fn test_disk_completion_for_destroyed_sleeper_is_discarded() {
        let (mut k, ids) = kernel_with(2);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        do_syscall(&mut k, ids[0], syscall::SYS_DISK_SLEEP, [UTEMP as u64, 0, 1, 0, 0]);

        // The sleeper is destroyed before the transfer completes.
        k.lock.lock(0);
        assert!(!k.destroy(0, ids[0].index()));
        k.lock.unlock(0);
        assert!(k.env(ids[0]).is_none());

        let tf = k.env(ids[1]).unwrap().tf;
        k.trap(0, tf, IRQ_OFFSET + IRQ_IDE, None);
        assert!(k
            .hal()
            .log()
            .iter()
            .any(|l| l.contains("no sleeper")));
    }

    #[test]
    fn test_disk_sleep_rejects_zero_and_busy() {
        let (mut k, ids) = kernel_with(2);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        do_syscall(&mut k, ids[1], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        do_syscall(&mut k, ids[0], syscall::SYS_DISK_SLEEP, [UTEMP as u64, 0, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());

        do_syscall(&mut k, ids[0], syscall::SYS_DISK_SLEEP, [UTEMP as u64, 0, 1, 0, 0]);
        // Second sleeper while the disk is busy is refused.
        do_syscall(&mut k, ids[1], syscall::SYS_DISK_SLEEP, [UTEMP as u64, 1, 1, 0, 0]);
        assert_eq!(rax(&k, ids[1]), KernelError::Invalid.code());
        assert_eq!(k.env(ids[1]).unwrap().status, EnvStatus::Running);
    }

    #[test]
    fn test_net_send_and_full_ring() {
        let (mut k, ids) = kernel_with(1);
        run_until(&mut k, ids[0]);
        let va = USER_STACK_TOP - 128;
        k.user_store(ids[0], va, b"frame-one").unwrap();
        do_syscall(&mut k, ids[0], syscall::SYS_NET_SEND, [va as u64, 9, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 9);
        assert_eq!(k.hal().transmitted(), &[b"frame-one".to_vec()]);

        // Full transmit ring: accepted 0, caller retries later.
        k.hal_mut().set_tx_budget(Some(0));
        do_syscall(&mut k, ids[0], syscall::SYS_NET_SEND, [va as u64, 9, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 0);
    }

    #[test]
    fn test_net_recv_poll_and_deliver() {
        let (mut k, ids) = kernel_with(1);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        do_syscall(&mut k, ids[0], syscall::SYS_PAGE_ALLOC, [0, UTEMP as u64, rw, 0, 0]);
        do_syscall(&mut k, ids[0], syscall::SYS_NET_RECV, [UTEMP as u64, 256, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 0);

        k.hal_mut().queue_rx(b"incoming".to_vec());
        do_syscall(&mut k, ids[0], syscall::SYS_NET_RECV, [UTEMP as u64, 256, 0, 0, 0]);
        assert_eq!(rax(&k, ids[0]), 8);
        let mut buf = [0u8; 8];
        k.user_load(ids[0], UTEMP, &mut buf).unwrap();
        assert_eq!(&buf, b"incoming");
    }

    #[test]
    fn test_net_send_oversized_frame_rejected() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_NET_SEND,
            [UTEMP as u64, (ETH_MAX_FRAME + 1) as u64, 0, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), KernelError::Invalid.code());
    }

    #[test]
    fn test_set_trapframe_sanitizes_flags() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(&mut k, ids[0], syscall::SYS_EXOFORK, [0; 5]);
        let child = EnvId(rax(&k, ids[0]) as u32);

        let mut tf = Trapframe::user(0x7000, USER_STACK_TOP);
        tf.flags = FLAG_IOPL_MASK; // try to grab I/O privilege, drop IF
        let va = USER_STACK_TOP - 256;
        run_until(&mut k, ids[0]);
        k.user_store(ids[0], va, &tf.encode()).unwrap();
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_TRAPFRAME,
            [child.0 as u64, va as u64, 0, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        let got = k.env(child).unwrap().tf;
        assert_eq!(got.ip, 0x7000);
        assert_eq!(got.flags & FLAG_IF, FLAG_IF);
        assert_eq!(got.flags & FLAG_IOPL_MASK, 0);
    }

    #[test]
    fn test_set_fault_upcall() {
        let (mut k, ids) = kernel_with(1);
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_FAULT_UPCALL,
            [0, 0x9000, 0, 0, 0],
        );
        assert_eq!(rax(&k, ids[0]), 0);
        assert_eq!(k.env(ids[0]).unwrap().fault_upcall, Some(0x9000));
    }

    #[test]
    fn test_fault_after_upcall_registration_gets_record() {
        let (mut k, ids) = kernel_with(1);
        let rw = perm_bits::PRESENT | perm_bits::USER | perm_bits::WRITE;
        // Exception stack + handler via syscalls only.
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_PAGE_ALLOC,
            [0, (exos_abi::UXSTACK_TOP - PAGE_SIZE) as u64, rw, 0, 0],
        );
        do_syscall(
            &mut k,
            ids[0],
            syscall::SYS_SET_FAULT_UPCALL,
            [0, 0x9000, 0, 0, 0],
        );
        run_until(&mut k, ids[0]);
        let tf = k.env(ids[0]).unwrap().tf;
        let resume = k.trap(0, tf, 14, Some(FaultInfo { va: 0x00500000, write: true }));
        match resume {
            Resume::Run { env, tf } => {
                assert_eq!(env, ids[0]);
                assert_eq!(tf.ip, 0x9000);
            }
            Resume::Halt => panic!("upcall must be delivered"),
        }
    }
}
