#[cfg(test)] use mockall::automock;

use crate::messaging::mad::Gid;


/// A local port as found by address
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ResolvedPort {
    pub ca_guid: u64,
    pub port_guid: u64,
    pub gid_index: u8,
    /// LID mask control of the port, determines the path bits of a LID
    pub lmc: u8,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CaAttributes {
    pub max_qp_initiator_depth: u8,
    pub max_qp_responder_resources: u8,
    pub max_eec_initiator_depth: u8,
    pub max_eec_responder_resources: u8,
    pub local_ack_delay: u8,
    pub path_migration_supported: bool,
}

/// Lookups against the local channel adapters' port tables. These are called with the CM's
///  state locked, so they should not block.
#[cfg_attr(test, automock)]
pub trait PortResolver: Send + Sync + 'static {
    fn resolve_gid(&self, gid: Gid) -> anyhow::Result<ResolvedPort>;
    fn resolve_lid(&self, lid: u16) -> anyhow::Result<ResolvedPort>;
    /// index of a partition key in the port's pkey table
    fn resolve_pkey(&self, port_guid: u64, pkey: u16) -> anyhow::Result<u16>;
    fn ca_attributes(&self, ca_guid: u64) -> anyhow::Result<CaAttributes>;
}

/// resolves by GID where one is given, by LID otherwise
pub fn resolve_port(resolver: &dyn PortResolver, gid: Gid, lid: u16) -> anyhow::Result<ResolvedPort> {
    if gid.is_zero() {
        resolver.resolve_lid(lid)
    }
    else {
        resolver.resolve_gid(gid)
    }
}

pub fn lid_to_path_bits(lid: u16, lmc: u8) -> u8 {
    let mask = (1u32 << lmc.min(7)) - 1;
    (lid as u32 & mask) as u8
}
