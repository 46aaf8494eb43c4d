use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use bitflags::bitflags;
use tokio::time::Instant;

use crate::cm::cep_arena::CepId;
use crate::cm::notification::CmEventHandler;
use crate::cm::params::PathInfo;
use crate::messaging::cm_messages::{CmMad, CmMessage, WirePath};
use crate::messaging::codes::CepType;
use crate::messaging::mad::Gid;
use crate::messaging::transport::{GlobalRoute, MadAddress};


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CepState {
    Idle,
    Listen,
    Registered,
    ReqSent,
    RepWait,
    ReqRcvd,
    MraReqSent,
    RepRcvd,
    MraRepSent,
    RepSent,
    MraRepRcvd,
    Established,
    LapSent,
    MraLapRcvd,
    LapRcvd,
    MraLapSent,
    DreqSent,
    DreqRcvd,
    SimDreqRcvd,
    Timewait,
    SidrReqSent,
    SidrReqRcvd,
}
impl CepState {
    /// between sending or receiving a REQ and the connection being established
    pub fn is_connecting(&self) -> bool {
        use CepState::*;
        matches!(self, ReqSent | RepWait | ReqRcvd | MraReqSent | RepRcvd | MraRepSent | RepSent | MraRepRcvd)
    }

    /// established, possibly while loading an alternate path
    pub fn is_connected(&self) -> bool {
        use CepState::*;
        matches!(self, Established | LapSent | MraLapRcvd | LapRcvd | MraLapSent)
    }

    pub fn is_disconnecting(&self) -> bool {
        use CepState::*;
        matches!(self, DreqSent | DreqRcvd | SimDreqRcvd | Timewait)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CepMode {
    None,
    Active,
    Passive,
}


/// Identifies one end of a connection: a QP (or EEC) of a channel adapter
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Endpoint {
    pub qpn: u32,
    pub eecn: u32,
    pub ca_guid: u64,
}
impl Endpoint {
    pub fn new(ca_guid: u64, qpn: u32, eecn: u32) -> Endpoint {
        Endpoint { qpn, eecn, ca_guid }
    }

    /// the remote endpoint of a CEP is known once the remote CA GUID is
    pub fn is_bound(&self) -> bool {
        self.ca_guid != 0
    }
}


/// A path as stored in a CEP, always from the local perspective
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CepPath {
    pub local_lid: u16,
    pub remote_lid: u16,
    pub local_gid: Gid,
    pub remote_gid: Gid,
    pub flow_label: u32,
    pub static_rate: u8,
    pub traffic_class: u8,
    pub sl: u8,
    pub subnet_local: bool,
    pub hop_limit: u8,
    /// ack timeout exponent of the path itself
    pub ack_timeout: u8,
    /// ack timeout exponent to program into the local QP
    pub local_ack_timeout: u8,
    pub local_gid_index: u8,
    pub local_path_bits: u8,
    pub pkey_index: u16,
    pub local_port_guid: u64,
}

impl CepPath {
    pub fn from_path_info(path: &PathInfo, ack_timeout: u8) -> CepPath {
        CepPath {
            local_lid: path.local_lid,
            remote_lid: path.remote_lid,
            local_gid: path.local_gid,
            remote_gid: path.remote_gid,
            flow_label: path.flow_label,
            static_rate: path.static_rate,
            traffic_class: path.traffic_class,
            sl: path.sl,
            subnet_local: path.subnet_local,
            hop_limit: path.hop_limit,
            ack_timeout,
            // the target ack delay is factored in once the REP arrives
            local_ack_timeout: path.pkt_life_time,
            ..Default::default()
        }
    }

    /// A path received in a REQ or LAP. The sender's 'local' is our 'remote'.
    pub fn from_remote_wire_path(path: &WirePath) -> CepPath {
        CepPath {
            local_lid: path.remote_lid,
            remote_lid: path.local_lid,
            local_gid: path.remote_gid,
            remote_gid: path.local_gid,
            flow_label: path.flow_label,
            static_rate: path.packet_rate,
            traffic_class: path.traffic_class,
            sl: path.sl,
            subnet_local: path.subnet_local,
            hop_limit: path.hop_limit,
            ack_timeout: path.local_ack_timeout,
            local_ack_timeout: path.local_ack_timeout,
            ..Default::default()
        }
    }

    /// A path as we send it in a REQ or LAP
    pub fn to_wire_path(&self, local_ack_timeout: u8) -> WirePath {
        WirePath {
            local_lid: self.local_lid,
            remote_lid: self.remote_lid,
            local_gid: self.local_gid,
            remote_gid: self.remote_gid,
            flow_label: self.flow_label,
            packet_rate: self.static_rate,
            traffic_class: self.traffic_class,
            hop_limit: self.hop_limit,
            sl: self.sl,
            subnet_local: self.subnet_local,
            local_ack_timeout,
        }
    }

    pub fn to_path_info(&self, pkey: u16, mtu: u8) -> PathInfo {
        PathInfo {
            local_lid: self.local_lid,
            remote_lid: self.remote_lid,
            local_gid: self.local_gid,
            remote_gid: self.remote_gid,
            flow_label: self.flow_label,
            hop_limit: self.hop_limit,
            traffic_class: self.traffic_class,
            sl: self.sl,
            static_rate: self.static_rate,
            pkey,
            mtu,
            pkt_life_time: self.ack_timeout.saturating_sub(1),
            subnet_local: self.subnet_local,
        }
    }

    /// same addressing (LIDs, GIDs, routing scope), ignoring all other attributes
    pub fn same_route(&self, other: &CepPath) -> bool {
        self.local_lid == other.local_lid
            && self.remote_lid == other.remote_lid
            && self.local_gid == other.local_gid
            && self.remote_gid == other.remote_gid
            && self.subnet_local == other.subnet_local
    }

    pub fn mad_address(&self) -> MadAddress {
        MadAddress {
            port_guid: self.local_port_guid,
            remote_lid: self.remote_lid,
            service_level: self.sl,
            path_bits: self.local_path_bits,
            static_rate: self.static_rate,
            pkey_index: self.pkey_index,
            global_route: if self.subnet_local {
                None
            }
            else {
                Some(GlobalRoute {
                    dest_gid: self.remote_gid,
                    flow_label: self.flow_label,
                    hop_limit: self.hop_limit,
                    traffic_class: self.traffic_class,
                    source_gid_index: self.local_gid_index,
                })
            },
        }
    }
}


bitflags! {
    /// Causes awaiting notification
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash)]
    pub struct CepEvents: u32 {
        const RCVD_REP = 0x0000_0001;
        const RCVD_REQ = 0x0000_0002;
        const RCVD_MRA = 0x0000_0004;
        const RCVD_REJ = 0x0000_0008;
        const RCVD_RTU = 0x0000_0010;
        const RCVD_DREQ = 0x0000_0040;
        const RCVD_DREP = 0x0000_0080;
        const RCVD_LAP = 0x0000_0100;
        const RCVD_APR = 0x0000_0200;
        const RCVD_SIDR_REQ = 0x0000_0400;
        const RCVD_SIDR_RESP = 0x0000_0800;

        const TIMEOUT_REQ = 0x0000_1000;
        const TIMEOUT_REP = 0x0000_2000;
        const TIMEOUT_LAP = 0x0000_4000;
        const TIMEOUT_DREQ = 0x0000_8000;
        const TIMEOUT_TIMEWAIT = 0x0001_0000;
        const TIMEOUT_SIDR_REQ = 0x0002_0000;
        const SIM_RCVD_DREQ = 0x0004_0000;

        const USER_CONNECT = 0x0020_0000;
        const USER_DESTROY = 0x0100_0000;
        const USER_CANCEL = 0x0200_0000;
        const SYSTEM_DISCONNECT = 0x0400_0000;
    }
}


/// A byte pattern that an inbound REQ's or SIDR_REQ's private data must contain at `offset`
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Discriminator {
    pub data: Vec<u8>,
    pub offset: usize,
}
impl Discriminator {
    /// compare against the bytes at our offset in an inbound message's private data
    pub fn cmp_private_data(&self, private_data: &[u8]) -> Ordering {
        let end = (self.offset + self.data.len()).min(private_data.len());
        let start = self.offset.min(end);
        self.data.as_slice().cmp(&private_data[start..end])
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CepTimer {
    pub generation: u64,
    pub duration_ms: u64,
}

/// local addressing of an alternate path proposed in a LAP, kept until the path is loaded
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PendingAltPath {
    pub local_port_guid: u64,
    pub local_gid_index: u8,
    pub local_path_bits: u8,
    pub pkey_index: u16,
    pub local_ack_timeout: u8,
}

/// the last MAD sent for the current protocol phase, kept for retransmission
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Outbound {
    pub to: MadAddress,
    pub mad: CmMad,
}


/// Connection End Point: the protocol state of one connection attempt, listener or SIDR
///  registration / query
pub struct Cep {
    pub cep_type: CepType,
    pub mode: CepMode,
    pub state: CepState,
    pub handler: Option<Arc<dyn CmEventHandler>>,

    pub local_comm_id: u32,
    pub remote_comm_id: u32,
    pub transaction_id: u64,
    pub service_id: u64,
    pub local_endpoint: Endpoint,
    pub remote_endpoint: Endpoint,
    /// where datagrams for this connection are sent
    pub address: Option<MadAddress>,

    pub primary_path: CepPath,
    pub alternate_path: Option<CepPath>,
    pub pending_alt_path: Option<PendingAltPath>,

    pub local_initiator_depth: u8,
    pub local_responder_resources: u8,
    pub local_retry_count: u8,
    pub local_rnr_retry_count: u8,
    pub local_send_psn: u32,
    pub local_recv_psn: u32,
    pub mtu: u8,
    pub pkey: u16,
    pub qkey: u32,
    pub target_ack_delay: u8,
    pub pkt_life_time: u8,
    pub timewait: u8,
    pub local_cm_timeout: u8,
    pub remote_cm_timeout: u8,
    pub max_cm_retries: u8,
    pub retries: u8,

    pub parent: Option<CepId>,
    pub pending: VecDeque<CepId>,
    /// 0 means: use the configured maximum
    pub listen_backlog: u32,
    pub discriminator: Option<Discriminator>,

    pub events: CepEvents,
    pub callback_refs: u32,
    pub pending_destroy: bool,
    pub timer: Option<CepTimer>,
    /// start of the current timer or elapsed-time measurement
    pub timestamp: Instant,

    pub async_accept: bool,
    pub timewait_callback: bool,
    pub sidr_notify: bool,
    pub failover_supported: bool,
    pub peer: bool,
    pub lap_sent: bool,
    pub send_in_flight: bool,
    /// declared turnaround time in µs, 0 for the adaptive estimate
    pub turnaround_us: u64,

    pub received: Option<CmMessage>,
    pub outbound: Option<Outbound>,
}

impl Cep {
    pub fn new(cep_type: CepType, handler: Option<Arc<dyn CmEventHandler>>) -> Cep {
        Cep {
            cep_type,
            mode: CepMode::None,
            state: CepState::Idle,
            handler,
            local_comm_id: 0,
            remote_comm_id: 0,
            transaction_id: 0,
            service_id: 0,
            local_endpoint: Default::default(),
            remote_endpoint: Default::default(),
            address: None,
            primary_path: Default::default(),
            alternate_path: None,
            pending_alt_path: None,
            local_initiator_depth: 0,
            local_responder_resources: 0,
            local_retry_count: 0,
            local_rnr_retry_count: 0,
            local_send_psn: 0,
            local_recv_psn: 0,
            mtu: 0,
            pkey: 0,
            qkey: 0,
            target_ack_delay: 0,
            pkt_life_time: 0,
            timewait: 0,
            local_cm_timeout: 0,
            remote_cm_timeout: 0,
            max_cm_retries: 0,
            retries: 0,
            parent: None,
            pending: VecDeque::new(),
            listen_backlog: 0,
            discriminator: None,
            events: CepEvents::empty(),
            callback_refs: 0,
            pending_destroy: false,
            timer: None,
            timestamp: Instant::now(),
            async_accept: false,
            timewait_callback: false,
            sidr_notify: false,
            failover_supported: false,
            peer: false,
            lap_sent: false,
            send_in_flight: false,
            turnaround_us: 0,
            received: None,
            outbound: None,
        }
    }

    pub fn stop_timer(&mut self) {
        self.timer = None;
    }

    pub fn start_elapsed(&mut self) {
        self.timestamp = Instant::now();
    }

    pub fn elapsed_us(&self) -> u64 {
        self.timestamp.elapsed().as_micros() as u64
    }

    pub fn has_alternate(&self) -> bool {
        self.alternate_path.is_some()
    }
}

impl Debug for Cep {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cep")
            .field("type", &self.cep_type)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("lcid", &self.local_comm_id)
            .field("rcid", &self.remote_comm_id)
            .field("sid", &self.service_id)
            .field("events", &self.events)
            .finish()
    }
}
