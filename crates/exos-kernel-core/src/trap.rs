//! Trap and interrupt dispatch
//!
//! Every kernel entry arrives here: [`Kernel::trap`] takes the big
//! kernel lock, snapshots the interrupted environment's registers, and
//! dispatches on a static 256-entry vector table. The table is data, not
//! control flow, so "which vectors exist and who may raise them" is
//! checkable state.
//!
//! Page faults from user code are reflected back into the faulting
//! environment as an upcall on its exception stack; faults with kernel
//! privilege are kernel bugs and panic.

use exos_abi::{
    FaultCode, FaultRecord, Privilege, Trapframe, FAULT_RECORD_SIZE, PAGE_SIZE, UXSTACK_TOP,
    WORD_SIZE,
};
use exos_hal::Hal;

use crate::kernel::Kernel;
use crate::types::{CpuId, EnvStatus, FaultInfo, Resume};

/// Milliseconds that pass per timer tick.
pub const TICK_MS: u64 = 10;

/// Vector of the syscall gate.
pub const T_SYSCALL: u8 = 48;
/// First external-interrupt vector; IRQ `n` arrives on vector
/// `IRQ_OFFSET + n`.
pub const IRQ_OFFSET: u8 = 32;

/// Timer IRQ line.
pub const IRQ_TIMER: u8 = 0;
/// Keyboard IRQ line.
pub const IRQ_KBD: u8 = 1;
/// Serial-port IRQ line.
pub const IRQ_SERIAL: u8 = 4;
/// Spurious-interrupt line.
pub const IRQ_SPURIOUS: u8 = 7;
/// Network device IRQ line.
pub const IRQ_NET: u8 = 11;
/// Disk controller IRQ line.
pub const IRQ_IDE: u8 = 14;

/// Processor exceptions (vectors 0-31).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    Divide,
    Debug,
    NonMaskable,
    Breakpoint,
    Overflow,
    BoundCheck,
    IllegalOpcode,
    DeviceNotAvailable,
    DoubleFault,
    InvalidTss,
    SegmentNotPresent,
    StackFault,
    GeneralProtection,
    PageFault,
    FpuError,
    Alignment,
    MachineCheck,
    SimdError,
    /// Architecturally reserved vector.
    Reserved,
}

/// What a vector means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Vector {
    Exception(Exception),
    Syscall,
    /// External interrupt on the given IRQ line.
    Irq(u8),
}

/// One vector table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VectorEntry {
    pub kind: Vector,
    /// Whether user code may raise this vector with a software interrupt.
    /// Raising any other vector from user mode turns into a general
    /// protection fault instead.
    pub user_invocable: bool,
}

/// The static 256-entry vector table.
pub struct VectorTable {
    entries: [VectorEntry; 256],
}

impl VectorTable {
    pub fn new() -> Self {
        use Exception::*;
        let mut entries = [VectorEntry {
            kind: Vector::Exception(Reserved),
            user_invocable: false,
        }; 256];
        let exceptions = [
            Divide,
            Debug,
            NonMaskable,
            Breakpoint,
            Overflow,
            BoundCheck,
            IllegalOpcode,
            DeviceNotAvailable,
            DoubleFault,
            Reserved,
            InvalidTss,
            SegmentNotPresent,
            StackFault,
            GeneralProtection,
            PageFault,
            Reserved,
            FpuError,
            Alignment,
            MachineCheck,
            SimdError,
        ];
        for (vector, &exception) in exceptions.iter().enumerate() {
            entries[vector].kind = Vector::Exception(exception);
        }
        entries[3].user_invocable = true; // breakpoint
        for vector in IRQ_OFFSET..=255 {
            entries[vector as usize].kind = Vector::Irq(vector - IRQ_OFFSET);
        }
        entries[T_SYSCALL as usize] = VectorEntry {
            kind: Vector::Syscall,
            user_invocable: true,
        };
        Self { entries }
    }

    pub fn entry(&self, vector: u8) -> VectorEntry {
        self.entries[vector as usize]
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: Hal> Kernel<H> {
    /// One kernel entry on `cpu`: the hardware delivered `vector` while
    /// executing with the state in `tf`. `fault` carries the faulting
    /// address for page faults and is ignored otherwise.
    ///
    /// Runs to completion under the big kernel lock and returns what the
    /// CPU should do next.
    pub fn trap(
        &mut self,
        cpu: CpuId,
        tf: Trapframe,
        vector: u8,
        fault: Option<FaultInfo>,
    ) -> Resume {
        self.lock.lock(cpu);
        self.cpus[cpu].status = crate::cpu::CpuStatus::Started;

        // A destroy from another CPU may have marked our current env
        // while it was executing.
        self.reclaim_dying_current(cpu);

        // Entries from user mode snapshot the register state; the env's
        // saved frame is authoritative from here on.
        if tf.privilege == Privilege::User {
            if let Some(index) = self.current_index(cpu) {
                self.envs.get_mut(index).tf = tf;
            }
        }

        match self.vectors.entry(vector).kind {
            Vector::Exception(Exception::PageFault) => {
                let fault = fault.unwrap_or(FaultInfo { va: 0, write: false });
                return self.page_fault(cpu, &tf, fault);
            }
            Vector::Exception(Exception::Breakpoint) | Vector::Exception(Exception::Debug) => {
                if tf.privilege == Privilege::Kernel {
                    panic!("breakpoint in kernel at ip {:08x}", tf.ip);
                }
                if let Some(id) = self.cpus[cpu].current {
                    self.log(format_args!(
                        "[{:08x}] breakpoint at ip {:08x}",
                        id.0, tf.ip
                    ));
                }
            }
            Vector::Exception(exception) => {
                if tf.privilege == Privilege::Kernel {
                    panic!("unhandled trap {:?} in kernel at ip {:08x}", exception, tf.ip);
                }
                if let Some(index) = self.current_index(cpu) {
                    let id = self.envs.get(index).id;
                    self.log(format_args!(
                        "[{:08x}] unhandled trap {:?} at ip {:08x}",
                        id.0, exception, tf.ip
                    ));
                    self.destroy(cpu, index);
                }
                return self.sched_yield(cpu);
            }
            Vector::Syscall => {
                if tf.privilege == Privilege::Kernel {
                    panic!("syscall from kernel privilege");
                }
                if let Some(resume) = self.syscall_entry(cpu) {
                    return resume;
                }
            }
            Vector::Irq(IRQ_TIMER) => {
                self.time_ms += TICK_MS;
                return self.sched_yield(cpu);
            }
            Vector::Irq(IRQ_IDE) => {
                self.disk_irq(cpu);
            }
            Vector::Irq(IRQ_SPURIOUS) => {
                self.log(format_args!("spurious interrupt on irq {}", IRQ_SPURIOUS));
            }
            Vector::Irq(IRQ_KBD) | Vector::Irq(IRQ_SERIAL) | Vector::Irq(IRQ_NET) => {
                // Console input and receive DMA are the platform's
                // business; the interrupt only needs acknowledging.
            }
            Vector::Irq(irq) => {
                self.log(format_args!("unexpected interrupt on irq {}", irq));
            }
        }

        self.finish_trap(cpu)
    }

    /// A software interrupt (`int n`) executed by user code. Vectors not
    /// open to user mode are delivered as a general protection fault
    /// instead, exactly as the hardware gate check would.
    pub fn user_interrupt(&mut self, cpu: CpuId, tf: Trapframe, vector: u8) -> Resume {
        if self.vectors.entry(vector).user_invocable {
            self.trap(cpu, tf, vector, None)
        } else {
            self.trap(cpu, tf, 13, None) // general protection fault
        }
    }

    /// Resume the current environment, or schedule if it blocked or died
    /// during this entry.
    pub(crate) fn finish_trap(&mut self, cpu: CpuId) -> Resume {
        if let Some(index) = self.current_index(cpu) {
            if self.envs.get(index).status == EnvStatus::Running {
                return self.env_run(cpu, index);
            }
        }
        self.sched_yield(cpu)
    }

    // ========================================================================
    // Page faults
    // ========================================================================

    fn page_fault(&mut self, cpu: CpuId, tf: &Trapframe, fault: FaultInfo) -> Resume {
        if tf.privilege == Privilege::Kernel {
            panic!("kernel fault va {:08x} ip {:08x}", fault.va, tf.ip);
        }
        let Some(index) = self.current_index(cpu) else {
            return self.sched_yield(cpu);
        };
        if let Some(resume) = self.fault_upcall(cpu, index, fault) {
            return resume;
        }
        // No handler, or its exception stack is unusable: the environment
        // cannot recover.
        let env = self.envs.get(index);
        let (id, ip) = (env.id, env.tf.ip);
        self.log(format_args!(
            "[{:08x}] user fault va {:08x} ip {:08x}",
            id.0, fault.va, ip
        ));
        self.destroy(cpu, index);
        self.sched_yield(cpu)
    }

    /// Reflect a fault into the environment's registered handler by
    /// pushing a fault record on its exception stack. `None` means the
    /// upcall cannot be delivered and the caller should destroy.
    fn fault_upcall(&mut self, cpu: CpuId, index: usize, fault: FaultInfo) -> Option<Resume> {
        let env = self.envs.get(index);
        let upcall = env.fault_upcall?;

        let present = env
            .space
            .lookup(fault.va)
            .map(|m| m.perm.present)
            .unwrap_or(false);
        let record = FaultRecord {
            fault_va: fault.va,
            code: FaultCode {
                write: fault.write,
                present,
            },
            regs: env.tf.regs,
            ip: env.tf.ip,
            flags: env.tf.flags,
            sp: env.tf.sp,
        };

        // Faulting while already on the exception stack nests: the new
        // record goes below the old frame, with one scratch word between
        // for the handler's return sequence.
        let sp = env.tf.sp;
        let recursive = sp >= UXSTACK_TOP - PAGE_SIZE && sp < UXSTACK_TOP;
        let top = if recursive { sp - WORD_SIZE } else { UXSTACK_TOP };
        let record_va = top.checked_sub(FAULT_RECORD_SIZE)?;

        let mut bytes = [0u8; FAULT_RECORD_SIZE + WORD_SIZE];
        bytes[..FAULT_RECORD_SIZE].copy_from_slice(&record.encode());
        let len = if recursive {
            FAULT_RECORD_SIZE + WORD_SIZE
        } else {
            FAULT_RECORD_SIZE
        };

        // The exception stack must be mapped and writable before
        // anything is pushed onto it.
        env.space.user_mem_check(record_va, len, true).ok()?;
        let env = self.envs.get_mut(index);
        env.space
            .copy_out(&mut self.frames, record_va, &bytes[..len])
            .ok()?;
        env.tf.sp = record_va;
        env.tf.ip = upcall;
        Some(self.env_run(cpu, index))
    }

    // ========================================================================
    // Disk interrupt
    // ========================================================================

    /// Collect a finished disk transfer and wake the (at most one)
    /// environment sleeping on it. A completion with no sleeper means the
    /// sleeper was destroyed mid-transfer; the data is discarded.
    fn disk_irq(&mut self, cpu: CpuId) {
        let Some(completion) = self.hal.disk_complete() else {
            self.log(format_args!("spurious disk interrupt"));
            return;
        };
        let waiter = self
            .envs
            .iter_live()
            .find(|&i| self.envs.get(i).status == EnvStatus::WaitingOnDevice);
        let Some(index) = waiter else {
            self.log(format_args!("disk completion with no sleeper, discarding"));
            return;
        };
        let id = self.envs.get(index).id;
        let Some(wait) = self.envs.get_mut(index).disk_wait.take() else {
            return;
        };
        if let Some(data) = completion.data {
            let n = data.len().min(wait.len);
            let env = self.envs.get_mut(index);
            if env
                .space
                .copy_out(&mut self.frames, wait.buf_va, &data[..n])
                .is_err()
            {
                // Its buffer vanished while it slept (unmapped by a
                // parent); nowhere to deliver.
                self.log(format_args!(
                    "[{:08x}] disk buffer unmapped at {:08x}",
                    id.0, wait.buf_va
                ));
                self.destroy(cpu, index);
                return;
            }
        }
        let env = self.envs.get_mut(index);
        env.tf.regs.rax = 0;
        env.status = EnvStatus::Runnable;
    }

    /// Wake a halted CPU for an interrupt: synthesizes the kernel-mode
    /// frame the idle loop would have been parked in.
    pub fn interrupt_halted(&mut self, cpu: CpuId, vector: u8) -> Resume {
        let mut tf = Trapframe::default();
        tf.privilege = Privilege::Kernel;
        self.trap(cpu, tf, vector, None)
    }
}
