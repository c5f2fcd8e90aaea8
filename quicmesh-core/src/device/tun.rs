use crate::device::{DeviceConfig, VirtualDevice};
use async_trait::async_trait;
use std::io;
use tun_rs::AsyncDevice;

/// TUN interface backed by `tun-rs`.
///
/// Creation assigns the address, sets the MTU and brings the link up, so the
/// device is active as soon as `create` returns. Dropping it removes the
/// interface.
pub struct TunDevice {
    device: AsyncDevice,
    config: DeviceConfig,
}

impl TunDevice {
    pub fn create(config: DeviceConfig) -> io::Result<Self> {
        if config.prefix_len > 32 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid prefix length {}", config.prefix_len),
            ));
        }
        let device = tun_rs::create_as_async(
            tun_rs::Configuration::default()
                .address_with_prefix(config.address, config.prefix_len)
                .platform_config(|_v| {
                    #[cfg(target_os = "linux")]
                    _v.tx_queue_len(1000);
                })
                .mtu(config.mtu)
                .up(),
        )
        .map_err(|e| io::Error::other(format!("failed to create tun interface: {e}")))?;
        #[cfg(target_os = "macos")]
        {
            use tun_rs::AbstractDevice;
            device.set_ignore_packet_info(true);
        }
        log::info!(
            "tun interface up: {}/{} mtu {}",
            config.address,
            config.prefix_len,
            config.mtu
        );
        Ok(Self { device, config })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }
}

#[async_trait]
impl VirtualDevice for TunDevice {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        self.device.send(buf).await
    }
}
