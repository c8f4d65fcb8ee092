//! User-level copy-on-write fork
//!
//! `fork` clones the calling environment without copying its memory up
//! front: parent and child share every page read-only, each side marked
//! copy-on-write, and the first write by either side faults into
//! [`cow_handler`], which copies just that page. Pages marked shared keep
//! their permissions and stay shared; the exception stack is never shared
//! and the child always gets a fresh one.

use exos_abi::{
    page_align_down, EnvId, FaultRecord, PagePerm, PAGE_SIZE, PFTEMP, UXSTACK_TOP,
};
use exos_hal::Hal;

use crate::{Result, UserHost, UPCALL_ENTRY_IP};

/// Software-available bit marking a copy-on-write mapping.
pub const PERM_COW: u8 = 0b01;
/// Software-available bit marking a mapping shared across fork.
pub const PERM_SHARED: u8 = 0b10;

/// Fork `parent`. Returns the child's id; the child starts runnable with
/// the parent's register state except that its pending `exofork` answers
/// zero.
pub fn fork<H: Hal>(host: &mut UserHost<H>, parent: EnvId) -> Result<EnvId> {
    // The parent needs the handler in place before any page goes
    // copy-on-write under its feet.
    host.set_fault_handler(parent, cow_handler)?;

    let child = host.sys_exofork(parent)?;

    let uxstack = UXSTACK_TOP - PAGE_SIZE;
    for (va, perm) in host.kernel().mappings(parent) {
        if va == uxstack {
            continue;
        }
        duppage(host, parent, child, va, perm)?;
    }

    // Fresh exception stack and the same upcall entry; the handler
    // registration follows the parent's.
    host.sys_page_alloc(parent, child, uxstack, PagePerm::rw())?;
    host.sys_set_fault_upcall(parent, child, UPCALL_ENTRY_IP)?;
    host.adopt_child(parent, child)?;

    host.sys_set_status(parent, child, true)?;
    Ok(child)
}

/// Map one of the parent's pages into the child.
///
/// Writable and copy-on-write pages are mapped copy-on-write in the
/// child AND remapped copy-on-write in the parent - the parent's
/// remapping must not be skipped, or a parent write after fork would be
/// visible to the child.
fn duppage<H: Hal>(
    host: &mut UserHost<H>,
    parent: EnvId,
    child: EnvId,
    va: usize,
    perm: PagePerm,
) -> Result<()> {
    if perm.avail & PERM_SHARED != 0 {
        // Explicitly shared: same frame, same permissions, both sides.
        host.sys_page_map(parent, EnvId::NULL, va, child, va, perm)?;
    } else if perm.write || perm.avail & PERM_COW != 0 {
        let cow = PagePerm {
            present: true,
            user: true,
            write: false,
            avail: PERM_COW,
        };
        host.sys_page_map(parent, EnvId::NULL, va, child, va, cow)?;
        host.sys_page_map(parent, EnvId::NULL, va, EnvId::NULL, va, cow)?;
    } else {
        // Genuinely read-only: share as is.
        host.sys_page_map(parent, EnvId::NULL, va, child, va, perm)?;
    }
    Ok(())
}

/// The copy-on-write page-fault handler.
///
/// # Panics
///
/// Panics when the fault is not a write to a copy-on-write page; such a
/// fault in a forked environment is a bug, not something to paper over.
pub fn cow_handler<H: Hal>(host: &mut UserHost<H>, env: EnvId, record: &FaultRecord) {
    let perm = host.kernel().mapping(env, record.fault_va);
    let is_cow = perm.map(|p| p.avail & PERM_COW != 0).unwrap_or(false);
    if !record.code.write || !is_cow {
        panic!(
            "cow handler: not a copy-on-write write at va {:08x} (code {:?})",
            record.fault_va, record.code
        );
    }

    let page = page_align_down(record.fault_va);

    // Copy the shared page through the staging address, then swing the
    // mapping over to the private copy. Staging at PFTEMP, never at the
    // faulting page itself, so a fault anywhere in ordinary user memory
    // can be resolved.
    if let Err(e) = host.sys_page_alloc(env, EnvId::NULL, PFTEMP, PagePerm::rw()) {
        panic!("cow handler: page_alloc: {:?}", e);
    }
    let mut buf = alloc::vec![0u8; PAGE_SIZE];
    if let Err(e) = host.load(env, page, &mut buf) {
        panic!("cow handler: read shared page: {:?}", e);
    }
    if let Err(e) = host.store(env, PFTEMP, &buf) {
        panic!("cow handler: fill copy: {:?}", e);
    }
    if let Err(e) = host.sys_page_map(env, EnvId::NULL, PFTEMP, EnvId::NULL, page, PagePerm::rw()) {
        panic!("cow handler: remap: {:?}", e);
    }
    if let Err(e) = host.sys_page_unmap(env, EnvId::NULL, PFTEMP) {
        panic!("cow handler: unmap staging: {:?}", e);
    }
}
