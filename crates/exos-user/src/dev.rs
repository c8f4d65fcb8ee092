//! Disk and network helpers
//!
//! The disk helpers wrap the sleep syscall and the completion interrupt
//! into the blocking read/write a file server would use: submit, sleep,
//! wake on the disk IRQ. The network helpers add the bounded retry loop
//! a transmit path needs when the device's ring is full.

use exos_abi::{syscall, word_to_result, EnvId, KernelError};
use exos_hal::Hal;
use exos_kernel_core::{EnvStatus, ETH_MAX_FRAME, IRQ_IDE};

use crate::{Result, UserError, UserHost};

/// Transmit retries before the device is declared wedged. Each retry
/// yields, letting whoever drains the ring make progress.
pub const TX_RETRIES: usize = 16;

fn disk_sleep<H: Hal>(
    host: &mut UserHost<H>,
    env: EnvId,
    buf_va: usize,
    sector: u64,
    nsectors: usize,
    is_write: bool,
) -> Result<()> {
    let word = host.raw_syscall(
        env,
        syscall::SYS_DISK_SLEEP,
        [
            buf_va as u64,
            sector,
            nsectors as u64,
            is_write as u64,
            0,
        ],
    )?;
    if host.running() == Some(env) {
        // The submission was refused; the error is already in rax.
        word_to_result(word).map_err(UserError::from)?;
    }
    Ok(())
}

/// Read `nsectors` sectors into `buf_va`, sleeping until the transfer
/// completes. Returns once `env` is runnable again with the data in
/// place.
pub fn disk_read<H: Hal>(
    host: &mut UserHost<H>,
    env: EnvId,
    buf_va: usize,
    sector: u64,
    nsectors: usize,
) -> Result<()> {
    disk_sleep(host, env, buf_va, sector, nsectors, false)?;
    wait_complete(host, env)
}

/// Write `nsectors` sectors from `buf_va`, sleeping until the device has
/// taken the data.
pub fn disk_write<H: Hal>(
    host: &mut UserHost<H>,
    env: EnvId,
    buf_va: usize,
    sector: u64,
    nsectors: usize,
) -> Result<()> {
    disk_sleep(host, env, buf_va, sector, nsectors, true)?;
    wait_complete(host, env)
}

/// Deliver the completion interrupt and confirm the sleeper woke.
fn wait_complete<H: Hal>(host: &mut UserHost<H>, env: EnvId) -> Result<()> {
    host.interrupt(IRQ_IDE);
    match host.kernel().env(env) {
        Some(e) if e.status != EnvStatus::WaitingOnDevice => Ok(()),
        Some(_) => Err(UserError::Blocked),
        None => Err(UserError::Destroyed),
    }
}

/// Transmit the frame at `va`, yielding and retrying while the device's
/// ring is full. Returns the bytes the device accepted.
pub fn net_send<H: Hal>(
    host: &mut UserHost<H>,
    env: EnvId,
    va: usize,
    len: usize,
) -> Result<usize> {
    if len == 0 || len > ETH_MAX_FRAME {
        return Err(UserError::Kernel(KernelError::Invalid));
    }
    for _ in 0..TX_RETRIES {
        let word = host.raw_syscall(env, syscall::SYS_NET_SEND, [va as u64, len as u64, 0, 0, 0])?;
        let accepted = word_to_result(word).map_err(UserError::from)?;
        if accepted > 0 {
            return Ok(accepted as usize);
        }
        host.sys_yield(env)?;
    }
    Err(UserError::Kernel(KernelError::Invalid))
}

/// Poll for one received frame into `va`. Returns its length, 0 when
/// nothing is waiting.
pub fn net_recv<H: Hal>(
    host: &mut UserHost<H>,
    env: EnvId,
    va: usize,
    len: usize,
) -> Result<usize> {
    let word = host.raw_syscall(env, syscall::SYS_NET_RECV, [va as u64, len as u64, 0, 0, 0])?;
    let n = word_to_result(word).map_err(UserError::from)?;
    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use exos_abi::{PagePerm, UTEMP};
    use exos_hal::{TestHal, SECTOR_SIZE};

    fn host_with(n: usize) -> (UserHost<TestHal>, alloc::vec::Vec<EnvId>) {
        let mut host = UserHost::new(TestHal::new(32), 128);
        let ids = (0..n).map(|i| host.spawn(0x1000 + i * 0x100).unwrap()).collect();
        host.boot();
        (host, ids)
    }

    #[test]
    fn test_disk_write_then_read_roundtrip() {
        let (mut host, ids) = host_with(1);
        host.sys_page_alloc(ids[0], EnvId::NULL, UTEMP, PagePerm::rw())
            .unwrap();
        let mut sector = [0u8; SECTOR_SIZE];
        sector[..9].copy_from_slice(b"block 7!!");
        host.store(ids[0], UTEMP, &sector).unwrap();

        disk_write(&mut host, ids[0], UTEMP, 7, 1).unwrap();
        assert_eq!(&host.kernel().hal().read_sector(7)[..9], b"block 7!!");

        // Scribble over the buffer and read it back.
        host.store(ids[0], UTEMP, &[0u8; SECTOR_SIZE]).unwrap();
        disk_read(&mut host, ids[0], UTEMP, 7, 1).unwrap();
        let mut buf = [0u8; 9];
        host.load(ids[0], UTEMP, &mut buf).unwrap();
        assert_eq!(&buf, b"block 7!!");
    }

    #[test]
    fn test_disk_sleep_blocks_until_interrupt() {
        let (mut host, ids) = host_with(2);
        host.sys_page_alloc(ids[0], EnvId::NULL, UTEMP, PagePerm::rw())
            .unwrap();
        // Issue the sleep by hand so we can observe the blocked window.
        disk_sleep(&mut host, ids[0], UTEMP, 0, 1, false).unwrap();
        assert_eq!(
            host.kernel().env(ids[0]).unwrap().status,
            EnvStatus::WaitingOnDevice
        );
        // The other env runs meanwhile.
        assert_eq!(host.running(), Some(ids[1]));
        host.interrupt(IRQ_IDE);
        assert_eq!(host.kernel().env(ids[0]).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn test_disk_rejects_busy_device() {
        let (mut host, ids) = host_with(2);
        host.sys_page_alloc(ids[0], EnvId::NULL, UTEMP, PagePerm::rw())
            .unwrap();
        host.sys_page_alloc(ids[1], EnvId::NULL, UTEMP, PagePerm::rw())
            .unwrap();
        disk_sleep(&mut host, ids[0], UTEMP, 0, 1, false).unwrap();
        // Second transfer while the first is in flight.
        let err = disk_sleep(&mut host, ids[1], UTEMP, 1, 1, false).unwrap_err();
        assert_eq!(err, UserError::Kernel(KernelError::Invalid));
    }

    #[test]
    fn test_net_send_with_full_ring_retries() {
        let (mut host, ids) = host_with(2);
        host.sys_page_alloc(ids[0], EnvId::NULL, UTEMP, PagePerm::rw())
            .unwrap();
        host.store(ids[0], UTEMP, b"ping").unwrap();

        // Ring permanently full: the retry budget runs out.
        host.hal_mut().set_tx_budget(Some(0));
        let err = net_send(&mut host, ids[0], UTEMP, 4).unwrap_err();
        assert_eq!(err, UserError::Kernel(KernelError::Invalid));

        // Ring drains: the retry succeeds.
        host.hal_mut().set_tx_budget(None);
        assert_eq!(net_send(&mut host, ids[0], UTEMP, 4).unwrap(), 4);
        assert_eq!(host.kernel().hal().transmitted().last().unwrap(), b"ping");
    }

    #[test]
    fn test_net_recv_empty_then_frame() {
        let (mut host, ids) = host_with(1);
        host.sys_page_alloc(ids[0], EnvId::NULL, UTEMP, PagePerm::rw())
            .unwrap();
        assert_eq!(net_recv(&mut host, ids[0], UTEMP, 64).unwrap(), 0);

        host.hal_mut().queue_rx(b"hello net".to_vec());
        assert_eq!(net_recv(&mut host, ids[0], UTEMP, 64).unwrap(), 9);
        let mut buf = [0u8; 9];
        host.load(ids[0], UTEMP, &mut buf).unwrap();
        assert_eq!(&buf, b"hello net");
    }

    #[test]
    fn test_net_send_rejects_oversized() {
        let (mut host, ids) = host_with(1);
        let err = net_send(&mut host, ids[0], UTEMP, ETH_MAX_FRAME + 1).unwrap_err();
        assert_eq!(err, UserError::Kernel(KernelError::Invalid));
    }
}
