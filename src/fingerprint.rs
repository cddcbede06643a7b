//! The server fingerprinting side channel is named in spec §1 as an external collaborator,
//! out of scope for this core. This trait gives `--show-servers` something to call without
//! pulling in a version.bind/CHAOS-TXT prober; [`NoopFingerprint`] always reports unknown.

use std::net::IpAddr;

#[async_trait::async_trait]
pub trait ServerFingerprint: std::fmt::Debug {
    async fn identify(&self, server_ip: IpAddr) -> Option<String>;
}

#[derive(Debug, Default)]
pub struct NoopFingerprint;

#[async_trait::async_trait]
impl ServerFingerprint for NoopFingerprint {
    async fn identify(&self, _server_ip: IpAddr) -> Option<String> {
        None
    }
}
