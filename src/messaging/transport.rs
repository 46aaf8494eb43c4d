use std::fmt::Debug;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::messaging::mad::Gid;


/// global routing header fields for a datagram leaving the local subnet
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GlobalRoute {
    pub dest_gid: Gid,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub source_gid_index: u8,
}

/// Addressing of a management datagram: the local port it leaves from (or arrived on) and the
///  remote port's address vector
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MadAddress {
    pub port_guid: u64,
    pub remote_lid: u16,
    pub service_level: u8,
    pub path_bits: u8,
    pub static_rate: u8,
    pub pkey_index: u16,
    pub global_route: Option<GlobalRoute>,
}
impl MadAddress {
    pub fn remote_gid(&self) -> Option<Gid> {
        self.global_route.map(|g| g.dest_gid)
    }
}


/// Sending side of the general services interface. Receiving is push based: the owner of the
///  transport hands inbound datagrams to [crate::cm::connection_manager::ConnectionManager::receive].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MadTransport: Debug + Send + Sync + 'static {
    async fn send(&self, to: MadAddress, mad: &[u8]) -> anyhow::Result<()>;
}
