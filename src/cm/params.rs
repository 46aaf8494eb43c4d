//! Parameter types of the connection manager's API

use std::sync::Arc;

use crate::cm::notification::CmEventHandler;
use crate::messaging::codes::{AprStatus, FailoverReply, RejectReason, SidrStatus};
use crate::messaging::mad::Gid;


/// A path between two ports as resolved by a subnet administrator query. `local` is this side.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PathInfo {
    pub local_lid: u16,
    pub remote_lid: u16,
    pub local_gid: Gid,
    pub remote_gid: Gid,
    pub flow_label: u32,
    pub hop_limit: u8,
    pub traffic_class: u8,
    pub sl: u8,
    pub static_rate: u8,
    pub pkey: u16,
    pub mtu: u8,
    pub pkt_life_time: u8,
    pub subnet_local: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ConnectRequest {
    pub service_id: u64,
    pub qpn: u32,
    pub eecn: u32,
    pub qkey: u32,
    pub starting_psn: u32,
    pub offered_initiator_depth: u8,
    pub offered_responder_resources: u8,
    pub retry_count: u8,
    pub rnr_retry_count: u8,
    pub end_to_end_flow_control: bool,
    /// ack timeout exponent for the primary path
    pub ack_timeout: u8,
    pub primary: PathInfo,
    pub alternate: Option<PathInfo>,
    pub alternate_ack_timeout: u8,
    pub private_data: Vec<u8>,
}

/// Listen address. `None` fields match every inbound value.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ListenInfo {
    pub service_id: u64,
    /// the CA whose removal cancels the listen, 0 for none in particular
    pub ca_guid: u64,
    pub local_gid: Option<Gid>,
    pub local_lid: Option<u16>,
    pub remote_gid: Option<Gid>,
    pub remote_lid: Option<u16>,
}

/// The content of a REP, see [crate::cm::connection_manager::ConnectionManager::process_request]
///  for a proposal derived from the request
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ReplyInfo {
    pub qpn: u32,
    pub eecn: u32,
    pub qkey: u32,
    pub starting_psn: u32,
    pub arb_initiator_depth: u8,
    pub arb_responder_resources: u8,
    pub target_ack_delay: u8,
    pub failover_accepted: FailoverReply,
    pub end_to_end_flow_control: bool,
    pub rnr_retry_count: u8,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectInfo {
    pub reason: RejectReason,
    pub reject_info: Vec<u8>,
    pub private_data: Vec<u8>,
}
impl RejectInfo {
    pub fn new(reason: RejectReason) -> RejectInfo {
        RejectInfo {
            reason,
            reject_info: Vec::new(),
            private_data: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct AltPathRequest {
    pub alternate: PathInfo,
    /// 0 means: derive from the path's packet lifetime and the local CA's ack delay
    pub ack_timeout: u8,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AltPathReply {
    pub status: AprStatus,
    pub add_info: Vec<u8>,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SidrRegisterInfo {
    pub service_id: u64,
    pub qpn: u32,
    pub qkey: u32,
}

#[derive(Clone, Debug, Default)]
pub struct SidrQuery {
    pub service_id: u64,
    pub path: PathInfo,
    /// 0 means: use the path's partition key
    pub partition_key: u16,
    pub private_data: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidrResponse {
    pub status: SidrStatus,
    pub qpn: u32,
    pub qkey: u32,
    pub private_data: Vec<u8>,
}

/// Per-CEP options, see [crate::cm::connection_manager::ConnectionManager::modify_cep]
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CepOption {
    ListenDiscriminator { data: Vec<u8>, offset: usize },
    NoListenDiscriminator,
    ListenBacklog(u32),
    SidrRegisterNotify(bool),
    AsyncAccept(bool),
    TimewaitCallback(bool),
    /// the CEP's own turnaround estimate in microseconds, used instead of the adaptive one
    TurnaroundTime(u64),
    Apm(bool),
}

/// How a disconnect is initiated or answered
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Disconnect {
    Request { private_data: Vec<u8> },
    Reply { private_data: Vec<u8> },
}

/// What `accept` sends: a REP answering an inbound request (passive side), or an RTU answering
///  a reply (active side)
#[derive(Clone)]
pub enum AcceptInfo {
    Reply {
        reply: ReplyInfo,
        /// receives the events of the accepted connection
        handler: Option<Arc<dyn CmEventHandler>>,
    },
    Rtu {
        private_data: Vec<u8>,
    },
}
