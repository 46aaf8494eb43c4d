//! An in-memory subnet of numbered nodes: node `n` has CA GUID `0x100 + n`, port GUID
//!  `0x200 + n` and base LID `n`, and each [CmContext] is driven by hand, one hop at a time.

use std::sync::{Arc, Mutex};
use anyhow::bail;
use async_trait::async_trait;

use crate::cm::cep_arena::CepId;
use crate::cm::conn_info::ConnInfo;
use crate::cm::connection_manager::ConnectionManager;
use crate::cm::context::{CmContext, Effect};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::notification::CmEventHandler;
use crate::cm::params::{ConnectRequest, PathInfo};
use crate::cm::port_resolver::{CaAttributes, PortResolver, ResolvedPort};
use crate::messaging::cm_messages::{CmMad, CmMessage, ReqMessage, RtuMessage, WirePath};
use crate::messaging::codes::CepType;
use crate::messaging::mad::{FixedData, Gid};
use crate::messaging::transport::MadAddress;


pub const SUBNET_PREFIX: u64 = 0xfe80_0000_0000_0000;

pub fn gid(node: u8) -> Gid {
    Gid::new(SUBNET_PREFIX, node as u64)
}

/// The port table of a node with a single CA and a single port. The port answers to its base
///  LID and to `0x100 | node`, so there is a second path for alternate path tests.
#[derive(Debug, Clone)]
pub struct StaticPortResolver {
    pub ca_guid: u64,
    pub port_guid: u64,
    pub gid: Gid,
    pub lid: u16,
}

pub fn static_resolver(node: u8) -> StaticPortResolver {
    StaticPortResolver {
        ca_guid: 0x100 + node as u64,
        port_guid: 0x200 + node as u64,
        gid: gid(node),
        lid: node as u16,
    }
}

impl StaticPortResolver {
    fn port(&self) -> ResolvedPort {
        ResolvedPort {
            ca_guid: self.ca_guid,
            port_guid: self.port_guid,
            gid_index: 0,
            lmc: 0,
        }
    }
}

impl PortResolver for StaticPortResolver {
    fn resolve_gid(&self, gid: Gid) -> anyhow::Result<ResolvedPort> {
        if gid != self.gid {
            bail!("no local port with GID {:?}", gid);
        }
        Ok(self.port())
    }

    fn resolve_lid(&self, lid: u16) -> anyhow::Result<ResolvedPort> {
        if lid != self.lid && lid != (self.lid | 0x100) {
            bail!("no local port with LID {}", lid);
        }
        Ok(self.port())
    }

    fn resolve_pkey(&self, port_guid: u64, pkey: u16) -> anyhow::Result<u16> {
        if port_guid != self.port_guid {
            bail!("unknown port 0x{:x}", port_guid);
        }
        match pkey {
            0xffff => Ok(0),
            0x8001 => Ok(1),
            _ => bail!("pkey 0x{:x} is not in the table", pkey),
        }
    }

    fn ca_attributes(&self, ca_guid: u64) -> anyhow::Result<CaAttributes> {
        if ca_guid != self.ca_guid {
            bail!("unknown CA 0x{:x}", ca_guid);
        }
        Ok(CaAttributes {
            max_qp_initiator_depth: 4,
            max_qp_responder_resources: 4,
            max_eec_initiator_depth: 4,
            max_eec_responder_resources: 4,
            local_ack_delay: 15,
            path_migration_supported: true,
        })
    }
}

/// how a datagram sent to `node`'s port arrives, coming from `remote_lid`
pub fn mad_address(node: u8, remote_lid: u16) -> MadAddress {
    MadAddress {
        port_guid: 0x200 + node as u64,
        remote_lid,
        service_level: 0,
        path_bits: 0,
        static_rate: 0,
        pkey_index: 0,
        global_route: None,
    }
}

pub fn path(local: u8, remote: u8) -> PathInfo {
    PathInfo {
        local_lid: local as u16,
        remote_lid: remote as u16,
        local_gid: gid(local),
        remote_gid: gid(remote),
        flow_label: 0,
        hop_limit: 0,
        traffic_class: 0,
        sl: 0,
        static_rate: 0,
        pkey: 0xffff,
        mtu: 4,
        pkt_life_time: 16,
        subnet_local: true,
    }
}

pub fn connect_request(local: u8, remote: u8, service_id: u64) -> ConnectRequest {
    ConnectRequest {
        service_id,
        qpn: 0x40 + local as u32,
        eecn: 0,
        qkey: 0,
        starting_psn: 0x1000 + local as u32,
        offered_initiator_depth: 4,
        offered_responder_resources: 4,
        retry_count: 7,
        rnr_retry_count: 7,
        end_to_end_flow_control: true,
        ack_timeout: 18,
        primary: path(local, remote),
        alternate: None,
        alternate_ack_timeout: 0,
        private_data: Vec::new(),
    }
}

/// a REQ as node 1 sends it to node 2
pub fn req_message(local_comm_id: u32, service_id: u64) -> ReqMessage {
    ReqMessage {
        local_comm_id,
        service_id,
        local_ca_guid: 0x101,
        local_qkey: 0,
        local_qpn: 0x41,
        offered_responder_resources: 4,
        local_eecn: 0,
        offered_initiator_depth: 4,
        remote_eecn: 0,
        remote_cm_timeout: 20,
        transport_service_type: CepType::ReliableConnection,
        end_to_end_flow_control: true,
        starting_psn: 0x1001,
        local_cm_timeout: 20,
        retry_count: 7,
        partition_key: 0xffff,
        path_mtu: 4,
        rdc_exists: false,
        rnr_retry_count: 7,
        max_cm_retries: 8,
        primary: WirePath {
            local_lid: 1,
            remote_lid: 2,
            local_gid: gid(1),
            remote_gid: gid(2),
            flow_label: 0,
            packet_rate: 0,
            traffic_class: 0,
            hop_limit: 0,
            sl: 0,
            subnet_local: true,
            local_ack_timeout: 18,
        },
        alternate: None,
        private_data: FixedData::default(),
    }
}

pub fn rtu_mad(local_comm_id: u32, remote_comm_id: u32) -> CmMad {
    CmMad::send(0, CmMessage::Rtu(RtuMessage {
        local_comm_id,
        remote_comm_id,
        private_data: FixedData::default(),
    }))
}


/// Event handler that remembers everything it was called with
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<(CepId, ConnInfo)>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<RecordingHandler> {
        Arc::new(RecordingHandler::default())
    }

    pub fn events(&self) -> Vec<(CepId, ConnInfo)> {
        self.events.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl CmEventHandler for RecordingHandler {
    async fn on_event(&self, _cm: &ConnectionManager, cep: CepId, info: ConnInfo) {
        self.events.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((cep, info));
    }
}


/// Two contexts, node 1 (`a`) and node 2 (`b`), connected back to back. Datagrams move only
///  when a test says so, timers expire only when a test says so, and handlers never run.
pub struct Fabric {
    pub a: CmContext,
    pub b: CmContext,
}

impl Fabric {
    pub fn new(a: CmContext, b: CmContext) -> Fabric {
        Fabric { a, b }
    }

    /// everything a context sent so far, marking its sends as completed
    fn sent(ctx: &mut CmContext) -> Vec<CmMad> {
        let mut result = Vec::new();
        for effect in ctx.take_effects() {
            if let Effect::Send { mad, cep, .. } = effect {
                if let Some(id) = cep {
                    ctx.on_send_done(id);
                }
                result.push(mad);
            }
        }
        result
    }

    fn forward(from: &mut CmContext, to: &mut CmContext, to_node: u8, from_node: u8) -> Vec<DispatchOutcome> {
        Self::sent(from).into_iter()
            .map(|mad| to.receive(&mad.to_bytes(), mad_address(to_node, from_node as u16)))
            .collect()
    }

    pub fn a_to_b(&mut self) -> Vec<DispatchOutcome> {
        Self::forward(&mut self.a, &mut self.b, 2, 1)
    }

    pub fn b_to_a(&mut self) -> Vec<DispatchOutcome> {
        Self::forward(&mut self.b, &mut self.a, 1, 2)
    }

    /// lose everything a sent so far
    pub fn drop_a(&mut self) {
        Self::sent(&mut self.a);
    }

    pub fn drop_b(&mut self) {
        Self::sent(&mut self.b);
    }

    pub fn expire_a(&mut self, id: CepId) {
        Self::expire(&mut self.a, id);
    }

    pub fn expire_b(&mut self, id: CepId) {
        Self::expire(&mut self.b, id);
    }

    fn expire(ctx: &mut CmContext, id: CepId) {
        ctx.on_send_done(id);
        let Some(timer) = ctx.ceps.get(id).ok().and_then(|cep| cep.timer) else {
            panic!("{} has no timer running", id);
        };
        ctx.on_timer(id, timer.generation);
    }

    pub fn sent_names_b(&mut self) -> Vec<&'static str> {
        Self::sent(&mut self.b).iter()
            .map(|mad| mad.message.name())
            .collect()
    }
}
