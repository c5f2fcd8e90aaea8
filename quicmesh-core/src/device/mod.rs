//! Virtual network device port.
//!
//! The device hands whole IP packets to user space and accepts whole IP
//! packets back. A single task reads; any number of tasks may write, and each
//! `send` delivers exactly one packet.

use async_trait::async_trait;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;

mod tun;

pub use self::tun::TunDevice;

pub const DEFAULT_MTU: u16 = 1500;
pub const DEFAULT_PREFIX_LEN: u8 = 24;

#[async_trait]
pub trait VirtualDevice: Send + Sync {
    /// Read one packet into `buf`, returning its length.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
    /// Write one packet.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;
}

pub type DeviceRef = Arc<dyn VirtualDevice>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceConfig {
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
}

impl DeviceConfig {
    pub fn new(address: Ipv4Addr) -> Self {
        Self {
            address,
            prefix_len: DEFAULT_PREFIX_LEN,
            mtu: DEFAULT_MTU,
        }
    }
    pub fn set_prefix_len(mut self, prefix_len: u8) -> Self {
        self.prefix_len = prefix_len;
        self
    }
    pub fn set_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }
}
