//! Whole-state invariant checks
//!
//! Between kernel entries the state must satisfy the structural
//! invariants below; the test suites call [`check`] after every step of
//! a scenario. Violations carry a message naming the broken invariant
//! and the offending object.

use alloc::collections::BTreeMap;
use alloc::format;
use alloc::string::String;

use exos_abi::{is_page_aligned, USER_TOP};
use exos_hal::Hal;

use crate::kernel::Kernel;
use crate::mem::FrameId;
use crate::types::EnvStatus;

/// A broken invariant, with a human-readable description.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvariantViolation(pub String);

impl core::fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

fn fail(msg: String) -> Result<(), InvariantViolation> {
    Err(InvariantViolation(msg))
}

/// Check every structural invariant of the kernel state.
pub fn check<H: Hal>(k: &Kernel<H>) -> Result<(), InvariantViolation> {
    check_lock(k)?;
    check_env_table(k)?;
    check_frames(k)?;
    check_running(k)?;
    check_device_wait(k)?;
    Ok(())
}

/// The big kernel lock is free whenever no entry is in progress.
fn check_lock<H: Hal>(k: &Kernel<H>) -> Result<(), InvariantViolation> {
    if let Some(holder) = k.lock.holder() {
        return fail(format!("kernel lock held by cpu {} between steps", holder));
    }
    Ok(())
}

/// Every live slot's id points back at its own index, its mappings are
/// aligned user addresses, and IPC receivers are not runnable.
fn check_env_table<H: Hal>(k: &Kernel<H>) -> Result<(), InvariantViolation> {
    for index in k.envs.iter_live() {
        let env = k.envs.get(index);
        if env.id.index() != index {
            return fail(format!(
                "env {:08x} stored in slot {}",
                env.id.0, index
            ));
        }
        for (va, _) in env.space.iter() {
            if !is_page_aligned(va) || va >= USER_TOP {
                return fail(format!(
                    "env {:08x} maps bad address {:08x}",
                    env.id.0, va
                ));
            }
        }
        if env.ipc.receiving && env.status != EnvStatus::NotRunnable {
            return fail(format!(
                "env {:08x} receiving while {:?}",
                env.id.0, env.status
            ));
        }
    }
    Ok(())
}

/// Each frame's reference count equals the number of mappings that point
/// at it, and no mapping points at a freed frame.
fn check_frames<H: Hal>(k: &Kernel<H>) -> Result<(), InvariantViolation> {
    let mut counted: BTreeMap<FrameId, u32> = BTreeMap::new();
    for index in k.envs.iter_live() {
        for (va, mapping) in k.envs.get(index).space.iter() {
            if !k.frames.is_live(mapping.frame) {
                return fail(format!(
                    "env {:08x} va {:08x} maps freed frame {:?}",
                    k.envs.get(index).id.0,
                    va,
                    mapping.frame
                ));
            }
            *counted.entry(mapping.frame).or_insert(0) += 1;
        }
    }
    for (frame, refs) in k.frames.iter_live() {
        let expected = counted.get(&frame).copied().unwrap_or(0);
        if refs != expected {
            return fail(format!(
                "frame {:?} refcount {} but {} mappings",
                frame, refs, expected
            ));
        }
    }
    Ok(())
}

/// `Running` and `Dying` correspond exactly to CPU `current` pointers.
fn check_running<H: Hal>(k: &Kernel<H>) -> Result<(), InvariantViolation> {
    for (cpu, record) in k.cpus.iter().enumerate() {
        if let Some(id) = record.current {
            let env = k.envs.get(id.index());
            if env.id != id || env.status == EnvStatus::Free {
                return fail(format!("cpu {} current {:08x} is dead", cpu, id.0));
            }
            if env.status != EnvStatus::Running && env.status != EnvStatus::Dying {
                return fail(format!(
                    "cpu {} current {:08x} is {:?}",
                    cpu, id.0, env.status
                ));
            }
        }
    }
    for index in k.envs.iter_live() {
        let env = k.envs.get(index);
        let on_cpus = k
            .cpus
            .iter()
            .filter(|c| c.current == Some(env.id))
            .count();
        match env.status {
            EnvStatus::Running | EnvStatus::Dying => {
                if on_cpus != 1 {
                    return fail(format!(
                        "env {:08x} is {:?} on {} cpus",
                        env.id.0, env.status, on_cpus
                    ));
                }
            }
            _ => {
                if on_cpus != 0 {
                    return fail(format!(
                        "env {:08x} is {:?} but current on a cpu",
                        env.id.0, env.status
                    ));
                }
            }
        }
    }
    Ok(())
}

/// At most one environment sleeps on the (single-outstanding) disk, and
/// sleep state matches the status.
fn check_device_wait<H: Hal>(k: &Kernel<H>) -> Result<(), InvariantViolation> {
    let mut sleepers = 0;
    for index in k.envs.iter_live() {
        let env = k.envs.get(index);
        let waiting = env.status == EnvStatus::WaitingOnDevice;
        if waiting != env.disk_wait.is_some() {
            return fail(format!(
                "env {:08x} status {:?} but disk_wait {:?}",
                env.id.0, env.status, env.disk_wait
            ));
        }
        if waiting {
            sleepers += 1;
        }
    }
    if sleepers > 1 {
        return fail(format!("{} envs waiting on the disk", sleepers));
    }
    Ok(())
}
