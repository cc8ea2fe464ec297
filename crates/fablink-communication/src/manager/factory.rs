//! Channel construction per protocol

use super::ConnectionTarget;
use crate::channel::sacp::{SacpChannel, SacpTarget};
use crate::channel::sstp::SstpChannel;
use crate::channel::text_serial::{TextSerialChannel, TextTarget};
use crate::channel::Channel;
use crate::transport::udp::UdpEndpoint;
use async_trait::async_trait;
use fablink_core::{ConnectionError, Protocol, Result};
use fablink_settings::Config;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Builds the channel for a resolved protocol
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// A closed channel speaking `protocol` to `target`
    async fn create(&self, protocol: Protocol, target: &ConnectionTarget)
        -> Result<Arc<dyn Channel>>;
}

/// Factory for real sockets, HTTP and serial ports
///
/// UDP channels share one local endpoint bound on first use and kept for
/// the factory's lifetime.
pub struct DefaultChannelFactory {
    config: Config,
    udp: OnceCell<Arc<UdpEndpoint>>,
}

impl DefaultChannelFactory {
    /// Factory using `config` for every channel
    pub fn new(config: Config) -> Self {
        Self {
            config,
            udp: OnceCell::new(),
        }
    }

    async fn udp_endpoint(&self) -> Result<Arc<UdpEndpoint>> {
        self.udp
            .get_or_try_init(UdpEndpoint::bind)
            .await
            .cloned()
    }
}

#[async_trait]
impl ChannelFactory for DefaultChannelFactory {
    async fn create(
        &self,
        protocol: Protocol,
        target: &ConnectionTarget,
    ) -> Result<Arc<dyn Channel>> {
        let settings = &self.config.connection;
        let channel: Arc<dyn Channel> = match (protocol, target) {
            (Protocol::SacpTcp, ConnectionTarget::Network { host }) => Arc::new(SacpChannel::new(
                SacpTarget::Tcp {
                    host: host.clone(),
                    port: settings.sacp_tcp_port,
                },
                self.config.clone(),
            )),
            (Protocol::SacpUdp, ConnectionTarget::Network { host }) => Arc::new(SacpChannel::new(
                SacpTarget::Udp {
                    host: host.clone(),
                    port: settings.sacp_udp_port,
                    endpoint: self.udp_endpoint().await?,
                },
                self.config.clone(),
            )),
            (Protocol::Sstp, ConnectionTarget::Network { host }) => {
                Arc::new(SstpChannel::new(host, self.config.clone()))
            }
            (Protocol::SacpSerial, ConnectionTarget::Serial { port, baud_rate }) => {
                Arc::new(SacpChannel::new(
                    SacpTarget::Serial {
                        port: port.clone(),
                        baud_rate: baud_rate.unwrap_or(settings.baud_rate),
                    },
                    self.config.clone(),
                ))
            }
            (Protocol::Text, ConnectionTarget::Serial { port, baud_rate }) => {
                Arc::new(TextSerialChannel::new(
                    TextTarget::Serial {
                        port: port.clone(),
                        baud_rate: baud_rate.unwrap_or(settings.baud_rate),
                    },
                    self.config.clone(),
                ))
            }
            (protocol, target) => {
                return Err(ConnectionError::InvalidParameters {
                    reason: format!("{} cannot reach {}", protocol, target.describe()),
                }
                .into())
            }
        };
        tracing::debug!("Created {} channel for {}", protocol, target.describe());
        Ok(channel)
    }
}
