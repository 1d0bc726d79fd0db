//! Boot volume resolution.
//!
//! The boot volume is named by partition UUID on the command line, but its
//! disk may not have been probed yet when the agent starts. The resolver
//! rescans and retries on every kernel uevent until the device shows up; the
//! process deadline is the only bound on the wait.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};

use async_trait::async_trait;
use mbinit_shared::constants::fs::BIND_ALLOW_LIST;
use mbinit_shared::errors::{MbError, MbResult};
use nix::sys::socket::{
    bind, recv, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;

use crate::block::{BlockCatalog, BlockFeed, DevKey, NodeBuilder, PartUuidProbe, UeventBlockDevice};
use crate::storage::SystemOps;
use crate::watchdog::Deadline;

const UEVENT_BUFFER_SIZE: usize = 512;

/// Source of device-arrival notifications.
#[async_trait]
pub trait UeventSource: Send {
    /// Wait for the next event. The payload is irrelevant; every event
    /// triggers a rescan.
    async fn next_event(&mut self) -> MbResult<()>;
}

/// Kernel uevent multicast socket (`NETLINK_KOBJECT_UEVENT`).
pub struct NetlinkUevents {
    fd: AsyncFd<OwnedFd>,
    buf: [u8; UEVENT_BUFFER_SIZE],
}

impl NetlinkUevents {
    pub fn open() -> MbResult<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )
        .map_err(|e| MbError::Resolution(format!("Can't create uevent socket: {}", e)))?;

        // pid 0: the kernel assigns the port id
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, u32::MAX))
            .map_err(|e| MbError::Resolution(format!("Can't bind uevent socket: {}", e)))?;

        let fd = AsyncFd::new(fd)?;
        Ok(Self {
            fd,
            buf: [0u8; UEVENT_BUFFER_SIZE],
        })
    }
}

#[async_trait]
impl UeventSource for NetlinkUevents {
    async fn next_event(&mut self) -> MbResult<()> {
        loop {
            let mut guard = self.fd.readable().await?;
            let buf = &mut self.buf;
            match guard.try_io(|inner| {
                recv(inner.as_raw_fd(), buf, MsgFlags::MSG_DONTWAIT).map_err(io::Error::from)
            }) {
                Ok(Ok(len)) => {
                    let header = buf[..len].split(|b| *b == 0).next().unwrap_or_default();
                    tracing::trace!("uevent: {}", String::from_utf8_lossy(header));
                    return Ok(());
                }
                Ok(Err(e)) => {
                    return Err(MbError::Resolution(format!("uevent recv error: {}", e)))
                }
                Err(_would_block) => continue,
            }
        }
    }
}

pub struct BootDeviceResolver<'a> {
    guid: &'a str,
    feed: &'a dyn BlockFeed,
    nodes: &'a dyn NodeBuilder,
    probe: &'a dyn PartUuidProbe,
}

impl<'a> BootDeviceResolver<'a> {
    pub fn new(
        guid: &'a str,
        feed: &'a dyn BlockFeed,
        nodes: &'a dyn NodeBuilder,
        probe: &'a dyn PartUuidProbe,
    ) -> Self {
        Self {
            guid,
            feed,
            nodes,
            probe,
        }
    }

    fn search(&self, catalog: &mut BlockCatalog) -> MbResult<Option<UeventBlockDevice>> {
        catalog.rescan(self.feed, self.nodes)?;
        Ok(catalog.lookup_by_guid(self.probe, self.guid)?.cloned())
    }

    /// Find the boot volume, waiting for device events as long as needed.
    ///
    /// `open_events` is only called when the first search fails. The event
    /// source is opened before the second search so a device appearing
    /// in between cannot be missed.
    pub async fn resolve<S, F>(
        &self,
        catalog: &mut BlockCatalog,
        open_events: F,
        deadline: &Deadline,
    ) -> MbResult<UeventBlockDevice>
    where
        S: UeventSource,
        F: FnOnce() -> MbResult<S>,
    {
        tracing::debug!(guid = self.guid, "Searching for boot device");
        if let Some(device) = self.search(catalog)? {
            return Ok(device);
        }
        tracing::warn!("Boot device not found, waiting for changes");

        let mut events = open_events()?;
        if let Some(device) = self.search(catalog)? {
            return Ok(device);
        }

        loop {
            deadline
                .run("waiting for the boot device", events.next_event())
                .await?;

            if let Some(device) = self.search(catalog)? {
                return Ok(device);
            }
            tracing::warn!("Boot device still not found, continue waiting");
        }
    }
}

/// Whether the mounted boot volume's filesystem can host BIND partitions.
pub fn supports_bind(ops: &dyn SystemOps, key: DevKey) -> MbResult<bool> {
    let fstype = ops
        .mounted_fstype(key)?
        .ok_or_else(|| MbError::DeviceSetup(format!("boot device {} is not mounted", key)))?;
    let supported = BIND_ALLOW_LIST.contains(&fstype.as_str());
    tracing::debug!(fstype = %fstype, supported, "Checked boot device bind support");
    Ok(supported)
}
