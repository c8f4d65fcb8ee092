//! Kernel/user ABI for Exos
//!
//! This crate is the **single source of truth** for the contract between the
//! kernel state machine (`exos-kernel-core`) and the process-side library
//! (`exos-user`):
//!
//! - Syscall numbers
//! - Error sentinels (negative machine words)
//! - Virtual-memory layout constants
//! - Page permission encoding
//! - Register file and trap frame
//! - Page-fault record and its stable byte encoding
//!
//! # Syscall Number Ranges
//!
//! | Range     | Category                                  |
//! |-----------|-------------------------------------------|
//! | 0x01-0x0F | Environment (id, destroy, fork, status)   |
//! | 0x10-0x17 | Memory (page alloc/map/unmap)             |
//! | 0x18-0x1F | IPC (try-send, recv)                      |
//! | 0x20-0x27 | Time                                      |
//! | 0x28-0x2F | Devices (disk sleep, net send/recv)       |
//!
//! Unknown numbers are rejected by the gateway with `KernelError::Invalid`.

#![no_std]
extern crate alloc;

use serde::{Deserialize, Serialize};

// ============================================================================
// Virtual-memory layout
// ============================================================================

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Machine word size in bytes.
pub const WORD_SIZE: usize = 8;

/// The split point: mappings below are private to an environment, mappings
/// at or above are kernel-owned and identical across every environment.
pub const USER_TOP: usize = 0xEE40_0000;

/// Top of the dedicated exception stack. The exception stack is the single
/// page `[UXSTACK_TOP - PAGE_SIZE, UXSTACK_TOP)` and is never shared or
/// marked copy-on-write.
pub const UXSTACK_TOP: usize = USER_TOP;

/// Top of the normal user stack; one unmapped guard page separates it from
/// the exception stack.
pub const USER_STACK_TOP: usize = USER_TOP - 2 * PAGE_SIZE;

/// Scratch address for temporary user page mappings.
pub const UTEMP: usize = 0x0040_0000;

/// Staging address the page-fault handler uses for copy-on-write
/// duplication. Deliberately outside the `UTEMP` region so a fault at
/// `UTEMP` itself can be resolved.
pub const PFTEMP: usize = UTEMP + 0x0040_0000 - PAGE_SIZE;

/// Round an address down to its page boundary.
pub const fn page_align_down(va: usize) -> usize {
    va & !(PAGE_SIZE - 1)
}

/// Round an address up to the next page boundary.
pub const fn page_align_up(va: usize) -> usize {
    (va + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Whether an address lies on a page boundary.
pub const fn is_page_aligned(va: usize) -> bool {
    va % PAGE_SIZE == 0
}

// ============================================================================
// Environment ids
// ============================================================================

/// Number of slots in the environment table.
pub const NENV: usize = 64;

/// `log2(NENV)` - the low bits of an id carry the table index.
pub const LOG2_NENV: u32 = 6;

/// Each allocation of a slot bumps the id's generation by `1 << GEN_SHIFT`,
/// so a stale id never resolves to the slot's new occupant.
pub const GEN_SHIFT: u32 = 12;

/// Environment identifier: generation (upper bits) concatenated with the
/// table index (low [`LOG2_NENV`] bits).
///
/// `EnvId::NULL` passed to a syscall means "the calling environment".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvId(pub u32);

impl EnvId {
    /// The "current environment" sentinel.
    pub const NULL: EnvId = EnvId(0);

    /// Table index encoded in this id.
    pub fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    /// Generation bits of this id.
    pub fn generation(self) -> u32 {
        self.0 & !((NENV - 1) as u32)
    }

    /// Whether this is the "current environment" sentinel.
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Successor id for a slot being reallocated: same index, next
    /// generation. Skips generation zero so reallocated ids are never null.
    pub fn next_generation(self) -> EnvId {
        let index = self.0 & (NENV - 1) as u32;
        let mut generation = self.0.wrapping_add(1 << GEN_SHIFT) & !((NENV - 1) as u32);
        if generation == 0 {
            generation = 1 << GEN_SHIFT;
        }
        EnvId(generation | index)
    }
}

// ============================================================================
// Error sentinels
// ============================================================================

/// Kernel error taxonomy. `code()` gives the negative machine word the
/// syscall ABI reports; non-negative results are success payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KernelError {
    /// Environment doesn't exist, or the caller may not act on it.
    BadEnv,
    /// Bad argument: misaligned or out-of-range address, bad permission
    /// bits, bad status value, unknown syscall number.
    Invalid,
    /// No free physical frame.
    NoMem,
    /// No free environment slot.
    NoFreeEnv,
    /// IPC target is not waiting in receive.
    IpcNotRecv,
}

impl KernelError {
    /// The negative sentinel carried over the syscall ABI.
    pub fn code(self) -> i64 {
        match self {
            KernelError::BadEnv => -2,
            KernelError::Invalid => -3,
            KernelError::NoMem => -4,
            KernelError::NoFreeEnv => -5,
            KernelError::IpcNotRecv => -6,
        }
    }

    /// Decode a negative ABI word back into an error.
    pub fn from_code(code: i64) -> Option<KernelError> {
        match code {
            -2 => Some(KernelError::BadEnv),
            -3 => Some(KernelError::Invalid),
            -4 => Some(KernelError::NoMem),
            -5 => Some(KernelError::NoFreeEnv),
            -6 => Some(KernelError::IpcNotRecv),
            _ => None,
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            KernelError::BadEnv => "bad environment",
            KernelError::Invalid => "invalid argument",
            KernelError::NoMem => "out of memory",
            KernelError::NoFreeEnv => "no free environment",
            KernelError::IpcNotRecv => "target not receiving",
        };
        f.write_str(name)
    }
}

/// Fold a syscall result into the single signed ABI word.
pub fn result_to_word(r: Result<i64, KernelError>) -> i64 {
    match r {
        Ok(v) => v,
        Err(e) => e.code(),
    }
}

/// Split a signed ABI word back into a result.
pub fn word_to_result(word: i64) -> Result<i64, KernelError> {
    if word >= 0 {
        Ok(word)
    } else {
        Err(KernelError::from_code(word).unwrap_or(KernelError::Invalid))
    }
}

// ============================================================================
// Page permissions
// ============================================================================

/// Bit encoding of [`PagePerm`].
pub mod perm_bits {
    /// Mapping present.
    pub const PRESENT: u64 = 0x001;
    /// Mapping writable.
    pub const WRITE: u64 = 0x002;
    /// Mapping accessible from user privilege.
    pub const USER: u64 = 0x004;
    /// Shift of the software-available field (two bits, opaque to the
    /// kernel; the user library claims bit 0 for COW and bit 1 for SHARED).
    pub const AVAIL_SHIFT: u32 = 9;
    /// Mask of the software-available field.
    pub const AVAIL_MASK: u64 = 0b11 << AVAIL_SHIFT;
    /// Every bit a syscall may pass; anything else is rejected.
    pub const SYSCALL_MASK: u64 = PRESENT | WRITE | USER | AVAIL_MASK;
}

/// Permissions of one page mapping.
///
/// The `avail` field (two bits) is stored and transferred by the kernel but
/// never interpreted by it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagePerm {
    /// Mapping present.
    pub present: bool,
    /// Mapping accessible from user privilege.
    pub user: bool,
    /// Mapping writable.
    pub write: bool,
    /// Software-available bits (0..=3), opaque to the kernel.
    pub avail: u8,
}

impl PagePerm {
    /// Present + user, read-only.
    pub fn ro() -> Self {
        Self { present: true, user: true, write: false, avail: 0 }
    }

    /// Present + user + writable.
    pub fn rw() -> Self {
        Self { present: true, user: true, write: true, avail: 0 }
    }

    /// Convert to the bit representation.
    pub fn to_bits(self) -> u64 {
        let mut bits = 0;
        if self.present {
            bits |= perm_bits::PRESENT;
        }
        if self.write {
            bits |= perm_bits::WRITE;
        }
        if self.user {
            bits |= perm_bits::USER;
        }
        bits |= ((self.avail & 0b11) as u64) << perm_bits::AVAIL_SHIFT;
        bits
    }

    /// Build from the bit representation, ignoring bits outside the
    /// encoding.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            present: bits & perm_bits::PRESENT != 0,
            write: bits & perm_bits::WRITE != 0,
            user: bits & perm_bits::USER != 0,
            avail: ((bits & perm_bits::AVAIL_MASK) >> perm_bits::AVAIL_SHIFT) as u8,
        }
    }

    /// Validate raw syscall permission bits: present and user must be set,
    /// and no bit outside [`perm_bits::SYSCALL_MASK`] may be set.
    pub fn from_syscall_bits(bits: u64) -> Option<Self> {
        if bits & perm_bits::PRESENT == 0 || bits & perm_bits::USER == 0 {
            return None;
        }
        if bits & !perm_bits::SYSCALL_MASK != 0 {
            return None;
        }
        Some(Self::from_bits(bits))
    }
}

// ============================================================================
// Register file & trap frame
// ============================================================================

/// Interrupt-enable flag bit.
pub const FLAG_IF: u64 = 0x200;

/// I/O privilege level field mask.
pub const FLAG_IOPL_MASK: u64 = 0x3000;

/// Privilege level a trap frame resumes at.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Privilege {
    /// User privilege (ring 3).
    #[default]
    User,
    /// Kernel privilege (ring 0).
    Kernel,
}

/// General-purpose register snapshot.
///
/// `rax` carries the syscall number in and the result out; `rdx`, `rcx`,
/// `rbx`, `rdi`, `rsi` carry the up-to-five syscall arguments.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registers {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
}

/// Full snapshot of an environment's execution state, captured at every
/// kernel entry. This is the only valid copy of register state while the
/// environment is not running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trapframe {
    /// General registers.
    pub regs: Registers,
    /// Instruction pointer.
    pub ip: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Flags word; see [`FLAG_IF`] and [`FLAG_IOPL_MASK`].
    pub flags: u64,
    /// Privilege the frame resumes at.
    pub privilege: Privilege,
}

/// Number of machine words in an encoded trap frame: seven general
/// registers, ip, sp, flags. Privilege is not part of the encoding; the
/// kernel forces user privilege on every frame it accepts over the ABI.
pub const TRAPFRAME_WORDS: usize = 10;

/// Encoded size of a trap frame in bytes.
pub const TRAPFRAME_SIZE: usize = TRAPFRAME_WORDS * WORD_SIZE;

impl Trapframe {
    /// Frame for fresh user code: user privilege, interrupts enabled.
    pub fn user(ip: usize, sp: usize) -> Self {
        Self {
            regs: Registers::default(),
            ip,
            sp,
            flags: FLAG_IF,
            privilege: Privilege::User,
        }
    }

    /// Encode into the stable byte layout used by the set-trapframe
    /// syscall (little-endian words: `rax`..`rbp`, ip, sp, flags).
    pub fn encode(&self) -> [u8; TRAPFRAME_SIZE] {
        let words: [u64; TRAPFRAME_WORDS] = [
            self.regs.rax,
            self.regs.rbx,
            self.regs.rcx,
            self.regs.rdx,
            self.regs.rsi,
            self.regs.rdi,
            self.regs.rbp,
            self.ip as u64,
            self.sp as u64,
            self.flags,
        ];
        let mut bytes = [0u8; TRAPFRAME_SIZE];
        for (i, w) in words.iter().enumerate() {
            bytes[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    /// Decode from the byte layout. The decoded frame is user privilege;
    /// the kernel additionally forces interrupts on and I/O privilege off.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < TRAPFRAME_SIZE {
            return None;
        }
        let mut words = [0u64; TRAPFRAME_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let mut buf = [0u8; WORD_SIZE];
            buf.copy_from_slice(&bytes[i * WORD_SIZE..(i + 1) * WORD_SIZE]);
            *w = u64::from_le_bytes(buf);
        }
        Some(Self {
            regs: Registers {
                rax: words[0],
                rbx: words[1],
                rcx: words[2],
                rdx: words[3],
                rsi: words[4],
                rdi: words[5],
                rbp: words[6],
            },
            ip: words[7] as usize,
            sp: words[8] as usize,
            flags: words[9],
            privilege: Privilege::User,
        })
    }
}

// ============================================================================
// Page-fault record
// ============================================================================

/// Decoded page-fault error code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultCode {
    /// The faulting access was a write.
    pub write: bool,
    /// The fault was a protection violation on a present mapping (as
    /// opposed to a not-present fault).
    pub present: bool,
}

impl FaultCode {
    /// Convert to the bit representation.
    pub fn to_bits(self) -> u64 {
        (self.present as u64) | ((self.write as u64) << 1)
    }

    /// Build from the bit representation.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            present: bits & 0x1 != 0,
            write: bits & 0x2 != 0,
        }
    }
}

/// Number of machine words in an encoded fault record: fault address,
/// error code, seven general registers, ip, flags, sp.
pub const FAULT_RECORD_WORDS: usize = 12;

/// Encoded size of a fault record in bytes.
pub const FAULT_RECORD_SIZE: usize = FAULT_RECORD_WORDS * WORD_SIZE;

/// The record the kernel pushes onto the exception stack before
/// transferring control to the fault upcall.
///
/// The encoding is stable and self-describing: twelve little-endian words
/// in the order fault address, error code, `rax`..`rbp`, ip, flags, sp.
/// The upcall's return convention restores the recorded registers, stack,
/// flags and instruction pointer atomically.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FaultRecord {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Access type that faulted.
    pub code: FaultCode,
    /// General registers at fault time.
    pub regs: Registers,
    /// Faulting instruction pointer.
    pub ip: usize,
    /// Flags at fault time.
    pub flags: u64,
    /// Stack pointer at fault time.
    pub sp: usize,
}

impl FaultRecord {
    /// Encode into the stable on-stack byte layout.
    pub fn encode(&self) -> [u8; FAULT_RECORD_SIZE] {
        let words: [u64; FAULT_RECORD_WORDS] = [
            self.fault_va as u64,
            self.code.to_bits(),
            self.regs.rax,
            self.regs.rbx,
            self.regs.rcx,
            self.regs.rdx,
            self.regs.rsi,
            self.regs.rdi,
            self.regs.rbp,
            self.ip as u64,
            self.flags,
            self.sp as u64,
        ];
        let mut bytes = [0u8; FAULT_RECORD_SIZE];
        for (i, w) in words.iter().enumerate() {
            bytes[i * WORD_SIZE..(i + 1) * WORD_SIZE].copy_from_slice(&w.to_le_bytes());
        }
        bytes
    }

    /// Decode from the on-stack byte layout. Returns `None` when the slice
    /// is shorter than a record.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FAULT_RECORD_SIZE {
            return None;
        }
        let mut words = [0u64; FAULT_RECORD_WORDS];
        for (i, w) in words.iter_mut().enumerate() {
            let mut buf = [0u8; WORD_SIZE];
            buf.copy_from_slice(&bytes[i * WORD_SIZE..(i + 1) * WORD_SIZE]);
            *w = u64::from_le_bytes(buf);
        }
        Some(Self {
            fault_va: words[0] as usize,
            code: FaultCode::from_bits(words[1]),
            regs: Registers {
                rax: words[2],
                rbx: words[3],
                rcx: words[4],
                rdx: words[5],
                rsi: words[6],
                rdi: words[7],
                rbp: words[8],
            },
            ip: words[9] as usize,
            flags: words[10],
            sp: words[11] as usize,
        })
    }
}

// ============================================================================
// Syscall numbers
// ============================================================================

/// Syscall number constants. The gateway decodes these into typed
/// operations; unknown numbers return `KernelError::Invalid`.
pub mod syscall {
    // === Environment (0x01 - 0x0F) ===
    /// Print a caller-supplied string to the console.
    pub const SYS_PUTS: u64 = 0x01;
    /// Return the calling environment's id.
    pub const SYS_GETENVID: u64 = 0x02;
    /// Relinquish the CPU to the scheduler.
    pub const SYS_YIELD: u64 = 0x03;
    /// Mark an environment dying.
    pub const SYS_DESTROY: u64 = 0x04;
    /// Allocate a blank child environment (the fork point).
    pub const SYS_EXOFORK: u64 = 0x05;
    /// Set an environment runnable or not-runnable.
    pub const SYS_SET_STATUS: u64 = 0x06;
    /// Overwrite an environment's saved trap frame.
    pub const SYS_SET_TRAPFRAME: u64 = 0x07;
    /// Install an environment's page-fault upcall.
    pub const SYS_SET_FAULT_UPCALL: u64 = 0x08;

    // === Memory (0x10 - 0x17) ===
    /// Allocate a zeroed frame and map it.
    pub const SYS_PAGE_ALLOC: u64 = 0x10;
    /// Share a frame between two address spaces.
    pub const SYS_PAGE_MAP: u64 = 0x11;
    /// Remove a mapping.
    pub const SYS_PAGE_UNMAP: u64 = 0x12;

    // === IPC (0x18 - 0x1F) ===
    /// Non-blocking rendezvous send.
    pub const SYS_IPC_TRY_SEND: u64 = 0x18;
    /// Blocking rendezvous receive.
    pub const SYS_IPC_RECV: u64 = 0x19;

    // === Time (0x20 - 0x27) ===
    /// Monotonic millisecond counter.
    pub const SYS_TIME_MSEC: u64 = 0x20;

    // === Devices (0x28 - 0x2F) ===
    /// Issue a disk transfer and sleep until its completion interrupt.
    pub const SYS_DISK_SLEEP: u64 = 0x28;
    /// Transmit a packet through the network device.
    pub const SYS_NET_SEND: u64 = 0x29;
    /// Poll the network device for a received packet.
    pub const SYS_NET_RECV: u64 = 0x2A;
}

/// Environment status values as carried over the set-status syscall.
pub mod status {
    /// Runnable.
    pub const RUNNABLE: u64 = 1;
    /// Not runnable.
    pub const NOT_RUNNABLE: u64 = 2;
}
