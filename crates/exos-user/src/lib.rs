//! User-level library for Exos
//!
//! Everything an Exos program does beyond raw syscalls lives here: the
//! copy-on-write [`fork`](fork::fork), the IPC convenience layer, the
//! page-fault handler plumbing, and the disk/network helpers.
//!
//! Because the kernel is a pure state machine, user programs run under a
//! [`UserHost`]: it plays the part of the hardware, holding each
//! environment's live register file between kernel entries, turning memory
//! accesses into loads and stores against the kernel's frame contents, and
//! delivering the fault upcalls the kernel schedules back into registered
//! Rust handlers. The library functions themselves mirror what the
//! syscall stubs and runtime of a real Exos binary would do.

#![no_std]
extern crate alloc;

pub mod dev;
pub mod fork;
pub mod ipc;

use alloc::collections::BTreeMap;
use alloc::vec;

use exos_abi::{
    page_align_down, word_to_result, syscall, EnvId, FaultRecord, KernelError, PagePerm,
    Privilege, Trapframe, FAULT_RECORD_SIZE, NENV, PAGE_SIZE, TRAPFRAME_SIZE, USER_STACK_TOP,
    USER_TOP, UXSTACK_TOP,
};
use exos_hal::Hal;
use exos_kernel_core::{
    EnvType, FaultInfo, Kernel, Resume, IRQ_OFFSET, IRQ_TIMER, T_SYSCALL,
};

/// Where the fault upcall enters. The address is symbolic: the host
/// recognizes it on dispatch and runs the registered Rust handler
/// instead of fetching instructions.
pub const UPCALL_ENTRY_IP: usize = 0xE000_0000;

/// Deepest nesting of faults the host will mediate before giving up.
const MAX_FAULT_DEPTH: usize = 32;

/// A registered page-fault handler.
pub type FaultHandler<H> = fn(&mut UserHost<H>, EnvId, &FaultRecord);

/// Errors surfaced to user-library callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UserError {
    /// The environment was destroyed during the operation.
    Destroyed,
    /// The environment is blocked (or the result is not ready yet).
    Blocked,
    /// The kernel refused the operation.
    Kernel(KernelError),
}

impl From<KernelError> for UserError {
    fn from(e: KernelError) -> Self {
        UserError::Kernel(e)
    }
}

impl core::fmt::Display for UserError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            UserError::Destroyed => f.write_str("environment destroyed"),
            UserError::Blocked => f.write_str("environment blocked"),
            UserError::Kernel(e) => write!(f, "kernel error: {}", e),
        }
    }
}

pub type Result<T> = core::result::Result<T, UserError>;

const CPU: usize = 0;

/// The hardware's half of the machine: live register files, fault
/// mediation, and the clock.
pub struct UserHost<H: Hal> {
    kernel: Kernel<H>,
    /// Register state of each environment while it is outside the kernel.
    live: BTreeMap<EnvId, Trapframe>,
    handlers: BTreeMap<EnvId, FaultHandler<H>>,
}

impl<H: Hal> UserHost<H> {
    /// A host over a single-CPU kernel with `nframes` frames of memory.
    pub fn new(hal: H, nframes: usize) -> Self {
        Self {
            kernel: Kernel::new(hal, 1, nframes),
            live: BTreeMap::new(),
            handlers: BTreeMap::new(),
        }
    }

    /// The kernel state, read-only.
    pub fn kernel(&self) -> &Kernel<H> {
        &self.kernel
    }

    /// The platform, for test setup and assertions.
    pub fn hal_mut(&mut self) -> &mut H {
        self.kernel.hal_mut()
    }

    /// Create a boot-time environment entering at `entry_ip`.
    pub fn spawn(&mut self, entry_ip: usize) -> Result<EnvId> {
        let id = self.kernel.create_env(EnvType::User, entry_ip)?;
        let tf = self.kernel.env(id).map(|e| e.tf).ok_or(UserError::Destroyed)?;
        self.live.insert(id, tf);
        Ok(id)
    }

    /// Bring the CPU up and dispatch the first environment.
    pub fn boot(&mut self) -> Option<EnvId> {
        let resume = self.kernel.boot_cpu(CPU);
        self.apply(resume)
    }

    /// The environment currently executing, if any.
    pub fn running(&self) -> Option<EnvId> {
        self.kernel.current(CPU)
    }

    /// Deliver one timer tick: the running environment is preempted and
    /// the scheduler picks the next one.
    pub fn tick(&mut self) -> Option<EnvId> {
        let resume = match self.kernel.current(CPU) {
            Some(cur) => match self.live.get(&cur) {
                Some(&tf) => self.kernel.trap(CPU, tf, IRQ_OFFSET + IRQ_TIMER, None),
                None => self.kernel.interrupt_halted(CPU, IRQ_OFFSET + IRQ_TIMER),
            },
            None => self.kernel.interrupt_halted(CPU, IRQ_OFFSET + IRQ_TIMER),
        };
        self.apply(resume)
    }

    /// Deliver an external interrupt on `irq` (the disk completion line,
    /// usually), interrupting whoever is running or waking the idle CPU.
    pub fn interrupt(&mut self, irq: u8) -> Option<EnvId> {
        let resume = match self.kernel.current(CPU).and_then(|cur| self.live.get(&cur)) {
            Some(&tf) => self.kernel.trap(CPU, tf, IRQ_OFFSET + irq, None),
            None => self.kernel.interrupt_halted(CPU, IRQ_OFFSET + irq),
        };
        self.apply(resume)
    }

    fn apply(&mut self, resume: Resume) -> Option<EnvId> {
        match resume {
            Resume::Run { env, tf } => {
                self.live.insert(env, tf);
                Some(env)
            }
            Resume::Halt => None,
        }
    }

    /// Tick the clock until `env` is the one executing.
    fn require_current(&mut self, env: EnvId) -> Result<()> {
        for _ in 0..=NENV {
            if self.kernel.env(env).is_none() {
                return Err(UserError::Destroyed);
            }
            if self.kernel.current(CPU) == Some(env) {
                return Ok(());
            }
            self.tick();
        }
        // Never picked in a full scheduler rotation: it is not runnable.
        Err(UserError::Blocked)
    }

    // ========================================================================
    // Syscall stubs
    // ========================================================================

    /// Issue a syscall as `env`. On real hardware the four-argument forms
    /// take the fast sysenter path and only the five-argument page-map
    /// stub pays for a full trap gate; the register convention is the
    /// same either way.
    pub fn raw_syscall(&mut self, env: EnvId, no: u64, args: [u64; 5]) -> Result<i64> {
        self.require_current(env)?;
        let mut tf = *self.live.get(&env).ok_or(UserError::Destroyed)?;
        tf.regs.rax = no;
        tf.regs.rdx = args[0];
        tf.regs.rcx = args[1];
        tf.regs.rbx = args[2];
        tf.regs.rdi = args[3];
        tf.regs.rsi = args[4];
        let resume = self.kernel.trap(CPU, tf, T_SYSCALL, None);
        self.apply(resume);
        if self.kernel.current(CPU) == Some(env) {
            if let Some(tf) = self.live.get(&env) {
                return Ok(tf.regs.rax as i64);
            }
        }
        // The caller blocked or yielded; its saved frame holds whatever
        // the kernel will complete it with.
        match self.kernel.env(env) {
            Some(e) => Ok(e.tf.regs.rax as i64),
            None => Err(UserError::Destroyed),
        }
    }

    fn checked_syscall(&mut self, env: EnvId, no: u64, args: [u64; 5]) -> Result<i64> {
        let word = self.raw_syscall(env, no, args)?;
        word_to_result(word).map_err(UserError::from)
    }

    pub fn sys_getenvid(&mut self, env: EnvId) -> Result<EnvId> {
        let word = self.checked_syscall(env, syscall::SYS_GETENVID, [0; 5])?;
        Ok(EnvId(word as u32))
    }

    /// Print through the kernel console. The text is staged at the base
    /// of the caller's stack page.
    pub fn sys_puts(&mut self, env: EnvId, text: &str) -> Result<()> {
        let va = USER_STACK_TOP - PAGE_SIZE;
        self.store(env, va, text.as_bytes())?;
        self.checked_syscall(
            env,
            syscall::SYS_PUTS,
            [va as u64, text.len() as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn sys_yield(&mut self, env: EnvId) -> Result<()> {
        self.raw_syscall(env, syscall::SYS_YIELD, [0; 5])?;
        Ok(())
    }

    pub fn sys_destroy(&mut self, env: EnvId, target: EnvId) -> Result<()> {
        self.checked_syscall(env, syscall::SYS_DESTROY, [target.0 as u64, 0, 0, 0, 0])
            .map(|_| ())
            .or_else(|e| {
                // Destroying yourself reports success by disappearing.
                if target.is_null() || target == env {
                    if let UserError::Destroyed = e {
                        return Ok(());
                    }
                }
                Err(e)
            })
    }

    pub fn sys_exofork(&mut self, env: EnvId) -> Result<EnvId> {
        let word = self.checked_syscall(env, syscall::SYS_EXOFORK, [0; 5])?;
        Ok(EnvId(word as u32))
    }

    pub fn sys_set_status(&mut self, env: EnvId, target: EnvId, runnable: bool) -> Result<()> {
        let st = if runnable {
            exos_abi::status::RUNNABLE
        } else {
            exos_abi::status::NOT_RUNNABLE
        };
        self.checked_syscall(env, syscall::SYS_SET_STATUS, [target.0 as u64, st, 0, 0, 0])?;
        Ok(())
    }

    /// Install a register frame into `target`, staged through the
    /// caller's stack page.
    pub fn sys_set_trapframe(&mut self, env: EnvId, target: EnvId, tf: &Trapframe) -> Result<()> {
        let va = USER_STACK_TOP - PAGE_SIZE;
        self.store(env, va, &tf.encode())?;
        debug_assert!(TRAPFRAME_SIZE <= PAGE_SIZE);
        self.checked_syscall(
            env,
            syscall::SYS_SET_TRAPFRAME,
            [target.0 as u64, va as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn sys_set_fault_upcall(&mut self, env: EnvId, target: EnvId, ip: usize) -> Result<()> {
        self.checked_syscall(
            env,
            syscall::SYS_SET_FAULT_UPCALL,
            [target.0 as u64, ip as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn sys_page_alloc(
        &mut self,
        env: EnvId,
        target: EnvId,
        va: usize,
        perm: PagePerm,
    ) -> Result<()> {
        self.checked_syscall(
            env,
            syscall::SYS_PAGE_ALLOC,
            [target.0 as u64, va as u64, perm.to_bits(), 0, 0],
        )?;
        Ok(())
    }

    pub fn sys_page_map(
        &mut self,
        env: EnvId,
        src_env: EnvId,
        src_va: usize,
        dst_env: EnvId,
        dst_va: usize,
        perm: PagePerm,
    ) -> Result<()> {
        self.checked_syscall(
            env,
            syscall::SYS_PAGE_MAP,
            [
                src_env.0 as u64,
                src_va as u64,
                dst_env.0 as u64,
                dst_va as u64,
                perm.to_bits(),
            ],
        )?;
        Ok(())
    }

    pub fn sys_page_unmap(&mut self, env: EnvId, target: EnvId, va: usize) -> Result<()> {
        self.checked_syscall(
            env,
            syscall::SYS_PAGE_UNMAP,
            [target.0 as u64, va as u64, 0, 0, 0],
        )?;
        Ok(())
    }

    pub fn sys_ipc_try_send(
        &mut self,
        env: EnvId,
        to: EnvId,
        value: u64,
        src_va: usize,
        perm_bits: u64,
    ) -> Result<()> {
        self.checked_syscall(
            env,
            syscall::SYS_IPC_TRY_SEND,
            [to.0 as u64, value, src_va as u64, perm_bits, 0],
        )?;
        Ok(())
    }

    /// Block in receive. `dst` is where a sent page should land; `None`
    /// declines page transfer.
    pub fn sys_ipc_recv(&mut self, env: EnvId, dst: Option<usize>) -> Result<()> {
        let va = dst.unwrap_or(USER_TOP);
        self.checked_syscall(env, syscall::SYS_IPC_RECV, [va as u64, 0, 0, 0, 0])?;
        Ok(())
    }

    pub fn sys_time_msec(&mut self, env: EnvId) -> Result<u64> {
        let word = self.checked_syscall(env, syscall::SYS_TIME_MSEC, [0; 5])?;
        Ok(word as u64)
    }

    // ========================================================================
    // Memory access with fault mediation
    // ========================================================================

    /// Store as `env` would with ordinary mov instructions: a protection
    /// failure raises a page fault, which either reaches the registered
    /// handler (copy-on-write, etc.) and retries, or destroys `env`.
    pub fn store(&mut self, env: EnvId, va: usize, data: &[u8]) -> Result<()> {
        self.require_current(env)?;
        for _ in 0..MAX_FAULT_DEPTH {
            match self.kernel.user_store(env, va, data) {
                Ok(()) => return Ok(()),
                Err(fault_va) => {
                    self.raise_fault(env, FaultInfo { va: fault_va, write: true })?
                }
            }
        }
        Err(UserError::Blocked)
    }

    /// Load as `env`: faults on unmapped pages exactly like [`store`].
    ///
    /// [`store`]: UserHost::store
    pub fn load(&mut self, env: EnvId, va: usize, buf: &mut [u8]) -> Result<()> {
        self.require_current(env)?;
        for _ in 0..MAX_FAULT_DEPTH {
            match self.kernel.user_load(env, va, buf) {
                Ok(()) => return Ok(()),
                Err(fault_va) => {
                    self.raise_fault(env, FaultInfo { va: fault_va, write: false })?
                }
            }
        }
        Err(UserError::Blocked)
    }

    /// Deliver a page fault to the kernel and, if it schedules the
    /// upcall, run the registered handler and return from it.
    fn raise_fault(&mut self, env: EnvId, fault: FaultInfo) -> Result<()> {
        let tf = *self.live.get(&env).ok_or(UserError::Destroyed)?;
        let resume = self.kernel.trap(CPU, tf, 14, Some(fault));
        match resume {
            Resume::Run { env: e, tf } if e == env && tf.ip == UPCALL_ENTRY_IP => {
                self.live.insert(env, tf);
                self.dispatch_upcall(env)
            }
            other => {
                // The kernel destroyed the faulter and moved on.
                self.apply(other);
                Err(UserError::Destroyed)
            }
        }
    }

    /// The upcall entry stub: decode the fault record the kernel pushed,
    /// run the handler, then restore the interrupted frame.
    fn dispatch_upcall(&mut self, env: EnvId) -> Result<()> {
        let sp = self.live.get(&env).ok_or(UserError::Destroyed)?.sp;
        let mut bytes = [0u8; FAULT_RECORD_SIZE];
        self.kernel
            .user_load(env, sp, &mut bytes)
            .map_err(|_| UserError::Destroyed)?;
        let record = FaultRecord::decode(&bytes).ok_or(UserError::Destroyed)?;
        let handler = *self.handlers.get(&env).ok_or(UserError::Destroyed)?;
        handler(self, env, &record);
        if self.kernel.env(env).is_none() {
            return Err(UserError::Destroyed);
        }
        // Return from the upcall: the interrupted access will be retried.
        let restored = Trapframe {
            regs: record.regs,
            ip: record.ip,
            sp: record.sp,
            flags: record.flags,
            privilege: Privilege::User,
        };
        self.live.insert(env, restored);
        Ok(())
    }

    // ========================================================================
    // Fault handler registration
    // ========================================================================

    /// Register `handler` as `env`'s page-fault handler. The first
    /// registration allocates the exception stack and installs the
    /// upcall; later calls only swap the handler function.
    pub fn set_fault_handler(&mut self, env: EnvId, handler: FaultHandler<H>) -> Result<()> {
        if !self.handlers.contains_key(&env) {
            self.sys_page_alloc(env, EnvId::NULL, UXSTACK_TOP - PAGE_SIZE, PagePerm::rw())?;
            self.sys_set_fault_upcall(env, EnvId::NULL, UPCALL_ENTRY_IP)?;
        }
        self.handlers.insert(env, handler);
        Ok(())
    }

    /// Propagate the parent's handler registration to a fresh child
    /// (whose exception stack and upcall the parent has already set up)
    /// and start tracking its registers.
    pub(crate) fn adopt_child(&mut self, parent: EnvId, child: EnvId) -> Result<()> {
        if let Some(&handler) = self.handlers.get(&parent) {
            self.handlers.insert(child, handler);
        }
        let tf = self
            .kernel
            .env(child)
            .map(|e| e.tf)
            .ok_or(UserError::Destroyed)?;
        self.live.insert(child, tf);
        Ok(())
    }

    /// Convenience: read one machine word.
    pub fn load_word(&mut self, env: EnvId, va: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.load(env, va, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Convenience: write one machine word.
    pub fn store_word(&mut self, env: EnvId, va: usize, word: u64) -> Result<()> {
        self.store(env, va, &word.to_le_bytes())
    }

    /// Fill a whole page, faulting in copy-on-write pages as needed.
    pub fn fill_page(&mut self, env: EnvId, va: usize, byte: u8) -> Result<()> {
        let page = page_align_down(va);
        let buf = vec![byte; PAGE_SIZE];
        self.store(env, page, &buf)
    }
}
