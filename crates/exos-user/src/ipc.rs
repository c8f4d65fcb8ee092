//! IPC convenience layer
//!
//! The kernel's rendezvous is deliberately minimal: the receive side
//! blocks, the send side doesn't. This layer adds what every program
//! wants on top - a send that politely retries while the peer isn't
//! ready yet, and a typed view of a delivered message.

use exos_abi::{EnvId, KernelError, PagePerm};
use exos_hal::Hal;

use crate::{Result, UserError, UserHost};

/// How many times `send` retries before reporting the peer unreachable.
/// Each retry yields first, giving the receiver a chance to block in
/// receive.
pub const SEND_RETRIES: usize = 64;

/// A delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message {
    /// The payload word.
    pub value: u64,
    /// Who sent it.
    pub from: EnvId,
    /// Permissions of the transferred page, or the empty permission when
    /// no page came along.
    pub perm: PagePerm,
}

/// Send `value` (and optionally the page at `page`) to `to`, yielding
/// and retrying while `to` is not yet receiving.
pub fn send<H: Hal>(
    host: &mut UserHost<H>,
    env: EnvId,
    to: EnvId,
    value: u64,
    page: Option<(usize, PagePerm)>,
) -> Result<()> {
    let (src_va, perm_bits) = match page {
        Some((va, perm)) => (va, perm.to_bits()),
        None => (exos_abi::USER_TOP, 0),
    };
    for _ in 0..SEND_RETRIES {
        match host.sys_ipc_try_send(env, to, value, src_va, perm_bits) {
            Ok(()) => return Ok(()),
            Err(UserError::Kernel(KernelError::IpcNotRecv)) => {
                host.sys_yield(env)?;
            }
            Err(e) => return Err(e),
        }
    }
    Err(UserError::Kernel(KernelError::IpcNotRecv))
}

/// Block `env` in receive. `dst` is where a transferred page should be
/// mapped; `None` declines page transfer.
pub fn recv_start<H: Hal>(host: &mut UserHost<H>, env: EnvId, dst: Option<usize>) -> Result<()> {
    host.sys_ipc_recv(env, dst)
}

/// The message delivered to `env`'s last completed receive, or
/// [`UserError::Blocked`] while it is still waiting for one.
pub fn recv_result<H: Hal>(host: &UserHost<H>, env: EnvId) -> Result<Message> {
    let e = host.kernel().env(env).ok_or(UserError::Destroyed)?;
    if e.ipc.receiving {
        return Err(UserError::Blocked);
    }
    Ok(Message {
        value: e.ipc.value,
        from: e.ipc.from,
        perm: e.ipc.perm,
    })
}
