//! The server side: listening, handling inbound REQs and answering them

use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::cm::cep::{Cep, CepEvents, CepMode, CepPath, CepState, Endpoint};
use crate::cm::cep_arena::CepId;
use crate::cm::cm_error::CmError;
use crate::cm::context::{cep_to_idle, event_set, set_notification, CmContext};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::formats;
use crate::cm::identity_maps::ListenKey;
use crate::cm::notification::CmEventHandler;
use crate::cm::params::{ListenInfo, RejectInfo, ReplyInfo};
use crate::cm::port_resolver::{lid_to_path_bits, resolve_port, PortResolver};
use crate::messaging::cm_messages::{CmMad, CmMessage, DreqMessage, RepMessage, ReqMessage, RtuMessage};
use crate::messaging::codes::{CepType, FailoverReply, MraedMessage, RejectReason, RejectedMessage};
use crate::messaging::mad::FixedData;
use crate::messaging::transport::MadAddress;
use crate::util::time::{pkt_life_from_ack_timeout, timeout_mult_to_ms, timeout_mult_to_us, timeout_us_to_mult};


/// Take over the connection parameters of an inbound REQ, resolving our side of its paths
///  against the local ports. Nothing is changed if the request has to be rejected. Returns the
///  GUID of the local CA the request arrived at.
pub(crate) fn save_req(resolver: &dyn PortResolver, cep: &mut Cep, req: &ReqMessage, from: &MadAddress, max_rep_retry: u8) -> Result<u64, RejectReason> {
    // the sender's remote address is ours
    let port = resolve_port(resolver, req.primary.remote_gid, req.primary.remote_lid)
        .map_err(|e| {
            debug!("REQ for a primary path that is not local: {}", e);
            RejectReason::PrimaryDgidRej
        })?;
    if port.port_guid != from.port_guid {
        debug!("REQ arrived on port 0x{:x}, but its primary path is for port 0x{:x}", from.port_guid, port.port_guid);
        return Err(RejectReason::PrimaryDgidRej);
    }
    let pkey_index = resolver.resolve_pkey(port.port_guid, req.partition_key)
        .map_err(|_| RejectReason::UnsupportedReq)?;

    let mut primary = CepPath::from_remote_wire_path(&req.primary);
    primary.local_port_guid = port.port_guid;
    primary.local_gid_index = port.gid_index;
    primary.local_path_bits = lid_to_path_bits(primary.local_lid, port.lmc);
    primary.pkey_index = pkey_index;

    let alternate = match &req.alternate {
        Some(wire) => {
            let alt_port = resolve_port(resolver, wire.remote_gid, wire.remote_lid)
                .map_err(|_| RejectReason::AlternateDgid)?;
            let alt_pkey_index = resolver.resolve_pkey(alt_port.port_guid, req.partition_key)
                .map_err(|_| RejectReason::UnsupportedReq)?;
            let mut path = CepPath::from_remote_wire_path(wire);
            path.local_port_guid = alt_port.port_guid;
            path.local_gid_index = alt_port.gid_index;
            path.local_path_bits = lid_to_path_bits(path.local_lid, alt_port.lmc);
            path.pkey_index = alt_pkey_index;
            Some(path)
        }
        None => None,
    };

    let ca = resolver.ca_attributes(port.ca_guid)
        .map_err(|_| RejectReason::NoResources)?;

    // our initiator depth is bounded by what the remote side offers as responder, and vice versa
    let (initiator_depth, responder_resources) = match req.transport_service_type {
        CepType::ReliableConnection => (
            req.offered_responder_resources.min(ca.max_qp_initiator_depth),
            req.offered_initiator_depth.min(ca.max_qp_responder_resources),
        ),
        CepType::ReliableDatagram => (
            req.offered_responder_resources.min(ca.max_eec_initiator_depth),
            req.offered_initiator_depth.min(ca.max_eec_responder_resources),
        ),
        _ => (0, 0),
    };

    cep.primary_path = primary;
    cep.alternate_path = alternate;
    cep.local_initiator_depth = initiator_depth;
    cep.local_responder_resources = responder_resources;
    cep.pkt_life_time = pkt_life_from_ack_timeout(req.primary.local_ack_timeout);
    cep.target_ack_delay = ca.local_ack_delay;
    cep.local_rnr_retry_count = req.rnr_retry_count;
    cep.local_retry_count = req.retry_count;
    cep.local_recv_psn = req.starting_psn;
    cep.timewait = req.primary.local_ack_timeout;
    cep.remote_cm_timeout = req.remote_cm_timeout;
    cep.local_cm_timeout = req.local_cm_timeout;
    cep.max_cm_retries = req.max_cm_retries.min(max_rep_retry);
    cep.mtu = req.path_mtu;
    cep.pkey = req.partition_key;
    Ok(port.ca_guid)
}

fn reject_req(reason: RejectReason, tid: u64, req: &ReqMessage) -> CmMad {
    CmMad::send(tid, formats::rej(RejectedMessage::Request, reason, 0, req.local_comm_id))
}

impl CmContext {
    pub(crate) fn on_req(&mut self, req: ReqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        if !req.transport_service_type.is_connected() {
            debug!(rcid = req.local_comm_id, "REQ for transport type {:?}", req.transport_service_type);
            self.out.send(from, reject_req(RejectReason::InvalidTsType, tid, &req));
            return Ok(DispatchOutcome::Rejected);
        }

        let sender = Endpoint::new(req.local_ca_guid, req.local_qpn, req.local_eecn);
        if let Some(id) = self.maps.by_remote_endpoint(&sender) {
            trace!(cep = %id, "REQ for a known remote endpoint");
            return if self.ceps.get(id)?.peer {
                self.req_peer(id, None, req, tid, from)
            }
            else {
                self.req_passive(id, req, tid, from)
            };
        }

        let matches: Vec<CepId> = self.maps.listen_matches_req(&req)
            .map(|(_, id)| id)
            .collect();
        let Some(&first) = matches.first() else {
            debug!(sid = req.service_id, "no listener for REQ");
            self.out.send(from, reject_req(RejectReason::InvalidSid, tid, &req));
            return Ok(DispatchOutcome::Rejected);
        };
        if !self.ceps.get(first)?.peer {
            return self.req_passive(first, req, tid, from);
        }

        // Competing peer connects for the same address: the one waiting longest gets the REQ. A
        //  REQ sent by one of our own peer CEPs must not be delivered back to it.
        let mut own_sender = None;
        let mut best: Option<(CepId, u64)> = None;
        for id in matches {
            let cep = self.ceps.get(id)?;
            if !cep.peer {
                continue;
            }
            if cep.local_endpoint == sender {
                own_sender = Some(id);
                continue;
            }
            let elapsed = cep.elapsed_us();
            if best.map(|(_, e)| elapsed > e).unwrap_or(true) {
                best = Some((id, elapsed));
            }
        }
        match best {
            Some((id, _)) => self.req_peer(id, own_sender, req, tid, from),
            None => {
                trace!("REQ only matches the peer CEP that sent it");
                Ok(DispatchOutcome::NoMatch)
            }
        }
    }

    fn req_passive(&mut self, id: CepId, req: ReqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let listener = self.ceps.get(id)?;
        match listener.state {
            CepState::Listen => {}
            s if s.is_connecting() || s.is_connected() || s.is_disconnecting() => {
                return if listener.remote_comm_id == req.local_comm_id {
                    self.req_dup(id, &req, from)
                }
                else {
                    self.req_stale(id, &req, tid, from)
                };
            }
            CepState::Registered | CepState::SidrReqSent | CepState::SidrReqRcvd => {
                debug!(cep = %id, "REQ for a SIDR CEP");
                self.out.send(from, reject_req(RejectReason::InvalidSid, tid, &req));
                return Ok(DispatchOutcome::Rejected);
            }
            s => {
                warn!(cep = %id, state = ?s, "REQ matched a CEP that does not accept requests");
                return Ok(DispatchOutcome::Discarded);
            }
        }

        let backlog = if listener.listen_backlog != 0 { listener.listen_backlog } else { self.config.max_backlog };
        if listener.pending.len() >= backlog as usize {
            debug!(cep = %id, backlog, "listen backlog is full");
            self.out.send(from, reject_req(RejectReason::NoResources, tid, &req));
            return Ok(DispatchOutcome::Rejected);
        }
        let turnaround_us = listener.turnaround_us;

        let mut child = Cep::new(req.transport_service_type, None);
        let ca_guid = match save_req(self.resolver.as_ref(), &mut child, &req, &from, self.config.max_rep_retry) {
            Ok(ca_guid) => ca_guid,
            Err(reason) => {
                self.out.send(from, reject_req(reason, tid, &req));
                return Ok(DispatchOutcome::Rejected);
            }
        };
        child.mode = CepMode::Passive;
        child.state = CepState::ReqRcvd;
        child.parent = Some(id);
        child.transaction_id = tid;
        child.remote_comm_id = req.local_comm_id;
        child.service_id = req.service_id;
        child.local_endpoint = Endpoint::new(ca_guid, 0, req.remote_eecn);
        child.remote_endpoint = Endpoint::new(req.local_ca_guid, req.local_qpn, req.local_eecn);
        child.turnaround_us = turnaround_us;
        child.address = Some(from);
        let remote_endpoint = child.remote_endpoint;
        let remote_cm_timeout = req.remote_cm_timeout;
        child.received = Some(CmMessage::Req(req));

        let child_id = self.ceps.insert(child);
        if let Err(e) = self.maps.try_insert_remote_endpoint(remote_endpoint, child_id) {
            self.ceps.remove(child_id);
            return Err(e.into());
        }
        let lcid = self.assign_comm_id(child_id)?;
        debug!(cep = %child_id, listener = %id, lcid, "REQ received");

        let child = self.ceps.get_mut(child_id)?;
        let wst = self.turnaround.worst_service_time_mult(child);
        if remote_cm_timeout < wst {
            let mra = formats::mra(MraedMessage::Request, wst, child.local_comm_id, child.remote_comm_id);
            self.out.send(from, CmMad::send(child.transaction_id, mra));
            child.state = CepState::MraReqSent;
        }
        child.start_elapsed();

        let listener = self.ceps.get_mut(id)?;
        listener.pending.push_back(child_id);
        if listener.pending.len() == 1 {
            set_notification(&mut self.out, id, listener, CepEvents::RCVD_REQ);
        }
        Ok(DispatchOutcome::Processed)
    }

    /// A REQ for a peer CEP that sent a REQ of its own: the CEP with the lower (CA GUID, QPN)
    ///  becomes the passive side.
    fn req_peer(&mut self, id: CepId, own_sender: Option<CepId>, req: ReqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let cep = self.ceps.get(id)?;
        if cep.state != CepState::ReqSent {
            return if cep.remote_comm_id == req.local_comm_id {
                self.req_dup(id, &req, from)
            }
            else {
                self.req_stale(id, &req, tid, from)
            };
        }
        if !cep.pending.is_empty() {
            warn!(cep = %id, "peer CEP already has a pending request");
            return Ok(DispatchOutcome::Discarded);
        }

        let passive = match (cep.local_endpoint.ca_guid, cep.local_endpoint.qpn).cmp(&(req.local_ca_guid, req.local_qpn)) {
            Ordering::Less => true,
            Ordering::Greater => false,
            Ordering::Equal => {
                warn!(cep = %id, "peer REQ from our own endpoint");
                return Ok(DispatchOutcome::Discarded);
            }
        };
        let local_endpoint = cep.local_endpoint;
        let service_id = cep.service_id;

        if passive {
            let max_rep_retry = self.config.max_rep_retry;
            let cep = self.ceps.get_mut(id)?;
            if let Err(reason) = save_req(self.resolver.as_ref(), cep, &req, &from, max_rep_retry) {
                let rej = formats::rej(RejectedMessage::Request, reason, cep.local_comm_id, req.local_comm_id);
                self.out.send(from, CmMad::send(tid, rej));
                return Ok(DispatchOutcome::Rejected);
            }
        }

        // loopback: our own peer CEP sent the REQ, so both ends are known now
        if let Some(other) = own_sender {
            let other_cep = self.ceps.get_mut(other)?;
            if !other_cep.remote_endpoint.is_bound() {
                self.maps.remove_listen(other_cep.service_id, other);
                other_cep.remote_endpoint = local_endpoint;
                self.maps.try_insert_remote_endpoint(local_endpoint, other)?;
            }
        }

        let cep = self.ceps.get_mut(id)?;
        if !cep.remote_endpoint.is_bound() {
            self.maps.remove_listen(service_id, id);
            cep.remote_endpoint = Endpoint::new(req.local_ca_guid, req.local_qpn, req.local_eecn);
            self.maps.try_insert_remote_endpoint(cep.remote_endpoint, id)?;
        }

        if !passive {
            trace!(cep = %id, "peer arbitration: staying active");
            self.out.resend(id, cep);
            cep.state = CepState::ReqSent;
            let lcm = timeout_mult_to_ms(cep.local_cm_timeout);
            self.out.start_timer(id, cep, lcm);
            return Ok(DispatchOutcome::Processed);
        }

        debug!(cep = %id, "peer arbitration: becoming passive");
        cep.mode = CepMode::Passive;
        cep.transaction_id = tid;
        cep.stop_timer();
        cep.pending.push_back(id);
        cep.parent = Some(id);
        cep.state = CepState::ReqRcvd;
        cep.remote_comm_id = req.local_comm_id;
        cep.address = Some(from);
        let remote_cm_timeout = req.remote_cm_timeout;
        cep.received = Some(CmMessage::Req(req));

        let wst = self.turnaround.worst_service_time_mult(cep);
        if remote_cm_timeout < wst {
            let mra = formats::mra(MraedMessage::Request, wst, cep.local_comm_id, cep.remote_comm_id);
            self.out.send(from, CmMad::send(cep.transaction_id, mra));
            cep.state = CepState::MraReqSent;
        }
        cep.start_elapsed();
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_REQ);
        Ok(DispatchOutcome::Processed)
    }

    /// the remote side retransmitted its REQ, we were too slow
    fn req_dup(&mut self, id: CepId, req: &ReqMessage, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let cep = self.ceps.get_mut(id)?;
        trace!(cep = %id, state = ?cep.state, "duplicate REQ");
        match cep.state {
            CepState::RepSent => {
                self.out.resend(id, cep);
                let lcm = timeout_mult_to_ms(cep.local_cm_timeout);
                self.out.start_timer(id, cep, lcm);
            }
            CepState::MraReqSent => {
                self.turnaround.update_for_duplicate(cep.elapsed_us());
                let service_timeout = self.turnaround.worst_service_time_mult(cep).max(req.remote_cm_timeout);
                let mra = formats::mra(MraedMessage::Request, service_timeout, cep.local_comm_id, cep.remote_comm_id);
                self.out.send(from, CmMad::send(cep.transaction_id, mra));
            }
            CepState::ReqRcvd => {
                self.turnaround.update_for_duplicate(cep.elapsed_us());
                let wst = self.turnaround.worst_service_time_mult(cep);
                if req.remote_cm_timeout < wst {
                    let mra = formats::mra(MraedMessage::Request, wst, cep.local_comm_id, cep.remote_comm_id);
                    self.out.send(from, CmMad::send(cep.transaction_id, mra));
                    cep.state = CepState::MraReqSent;
                }
            }
            _ => {}
        }
        Ok(DispatchOutcome::Duplicate)
    }

    /// A new REQ from a remote endpoint we still have a connection with: the remote side lost
    ///  that connection, so ours is torn down as well.
    fn req_stale(&mut self, id: CepId, req: &ReqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let cep = self.ceps.get(id)?;
        let state = cep.state;
        if !(state.is_connecting() || state.is_connected()) {
            trace!(cep = %id, state = ?state, "stale REQ while disconnecting");
            return Ok(DispatchOutcome::Discarded);
        }
        debug!(cep = %id, state = ?state, rcid = req.local_comm_id, "stale REQ");
        self.out.send(from, reject_req(RejectReason::StaleConn, tid, req));

        if state.is_connected() {
            let dreq = formats::dreq(cep.local_comm_id, cep.remote_comm_id, cep.remote_endpoint.qpn, &[])?;
            self.out.send(from, CmMad::send(tid, dreq));
            let synthesized = DreqMessage {
                local_comm_id: cep.remote_comm_id,
                remote_comm_id: cep.local_comm_id,
                remote_qpn_or_eecn: cep.local_endpoint.qpn,
                private_data: FixedData::default(),
            };
            self.dreq_cep(id, synthesized, tid, from)?;
        }
        Ok(DispatchOutcome::Rejected)
    }

    pub(crate) fn on_rtu(&mut self, rtu: RtuMessage) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(rtu.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let state = self.ceps.get(id)?.state;
        match state {
            CepState::RepSent | CepState::MraRepRcvd => {
                self.rtu_passive(id, Some(CmMessage::Rtu(rtu)))?;
                Ok(DispatchOutcome::Processed)
            }
            s if s.is_connecting() || s.is_connected() || s.is_disconnecting() => Ok(DispatchOutcome::Discarded),
            _ => Ok(DispatchOutcome::NoMatch),
        }
    }

    /// The connection is established on the passive side. `received` is `None` for a LAP
    ///  acting as an implicit RTU.
    pub(crate) fn rtu_passive(&mut self, id: CepId, received: Option<CmMessage>) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        cep.stop_timer();
        if let Some(msg) = received {
            cep.received = Some(msg);
        }
        cep.state = CepState::Established;
        debug!(cep = %id, lcid = cep.local_comm_id, rcid = cep.remote_comm_id, "established (passive)");
        if cep.async_accept {
            set_notification(&mut self.out, id, cep, CepEvents::RCVD_RTU);
        }
        else {
            event_set(&mut self.out, cep, CepEvents::RCVD_RTU);
        }
        Ok(())
    }

    pub fn listen(&mut self, id: CepId, info: &ListenInfo) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        if cep.state != CepState::Idle {
            return Err(CmError::InvalidState(cep.state));
        }
        if !cep.cep_type.is_connected() {
            return Err(CmError::invalid_parameter("datagram CEPs register for SIDR instead of listening"));
        }
        if info.service_id == 0 {
            return Err(CmError::invalid_parameter("service id must not be zero"));
        }

        let key = ListenKey {
            service_id: info.service_id,
            local_gid: info.local_gid,
            local_lid: info.local_lid,
            remote_gid: info.remote_gid,
            remote_lid: info.remote_lid,
            discriminator: cep.discriminator.clone(),
            peer: None,
        };
        self.maps.try_insert_listen(key, id)?;

        cep.service_id = info.service_id;
        cep.local_endpoint = Endpoint::new(info.ca_guid, 0, 0);
        cep.remote_endpoint = Endpoint::default();
        cep.primary_path = CepPath {
            local_gid: info.local_gid.unwrap_or_default(),
            local_lid: info.local_lid.unwrap_or_default(),
            remote_gid: info.remote_gid.unwrap_or_default(),
            remote_lid: info.remote_lid.unwrap_or_default(),
            ..Default::default()
        };
        cep.transaction_id = 0;
        cep.mode = CepMode::Passive;
        cep.local_cm_timeout = 0;
        cep.remote_cm_timeout = 0;
        cep.max_cm_retries = 0;
        cep.events = CepEvents::empty();
        cep.retries = 0;
        cep.state = CepState::Listen;
        let lcid = self.assign_comm_id(id)?;
        debug!(cep = %id, lcid, sid = info.service_id, "listening");
        Ok(())
    }

    /// The first pending child of a listener (or the peer CEP itself) in one of `states`
    pub(crate) fn first_pending(&self, id: CepId, states: &[CepState]) -> Result<CepId, CmError> {
        let cep = self.ceps.get(id)?;
        match cep.pending.front() {
            Some(&child_id) => {
                let state = self.ceps.get(child_id)?.state;
                if states.contains(&state) {
                    Ok(child_id)
                }
                else {
                    Err(CmError::InvalidState(state))
                }
            }
            None if cep.state == CepState::Idle && cep.events.contains(CepEvents::USER_CANCEL) => Err(CmError::Cancelled),
            None => Err(CmError::NotFound),
        }
    }

    /// take a child off its parent's pending list
    pub(crate) fn leave_pending(&mut self, child_id: CepId) {
        let Some(parent_id) = self.ceps.get_mut(child_id).ok().and_then(|c| c.parent.take()) else {
            return;
        };
        if let Ok(parent) = self.ceps.get_mut(parent_id) {
            parent.pending.retain(|c| *c != child_id);
        }
    }

    /// re-arm the notification of a listener that still has requests waiting
    fn notify_more_pending(&mut self, id: CepId) {
        if let Ok(listener) = self.ceps.get_mut(id) {
            if !listener.pending.is_empty() {
                set_notification(&mut self.out, id, listener, CepEvents::RCVD_REQ);
            }
        }
    }

    /// A proposed reply for the first pending request, based on what was negotiated so far and
    ///  on the local CA's capabilities
    pub fn process_request(&mut self, id: CepId, failover: FailoverReply) -> Result<ReplyInfo, CmError> {
        let child_id = self.first_pending(id, &[CepState::ReqRcvd, CepState::MraReqSent])?;
        let failover_supported = self.ceps.get(id)?.failover_supported;

        let child = self.ceps.get_mut(child_id)?;
        if !matches!(child.received, Some(CmMessage::Req(_))) {
            return Err(CmError::InvalidState(child.state));
        }
        // no end-to-end credits or RNR retries for UC
        let end_to_end_flow_control = child.cep_type != CepType::UnreliableConnection;
        let ca = self.resolver.ca_attributes(child.local_endpoint.ca_guid)
            .map_err(|_| CmError::InsufficientResources)?;

        child.failover_supported = failover_supported;
        if child.cep_type != CepType::UnreliableConnection {
            child.local_responder_resources = child.local_responder_resources.min(ca.max_qp_responder_resources);
            child.local_initiator_depth = child.local_initiator_depth.min(ca.max_qp_initiator_depth);
        }
        let failover_accepted = if ca.path_migration_supported && child.failover_supported {
            failover
        }
        else {
            FailoverReply::NotSupported
        };
        let starting_psn = self.ids.psn();
        child.local_send_psn = starting_psn;

        Ok(ReplyInfo {
            qpn: child.local_endpoint.qpn,
            eecn: child.local_endpoint.eecn,
            qkey: 0,
            starting_psn,
            arb_initiator_depth: child.local_initiator_depth,
            arb_responder_resources: child.local_responder_resources,
            target_ack_delay: ca.local_ack_delay,
            failover_accepted,
            end_to_end_flow_control,
            rnr_retry_count: if end_to_end_flow_control { child.local_rnr_retry_count } else { 0 },
            private_data: Vec::new(),
        })
    }

    /// Send a REP for the first pending request. Returns the CEP that now represents the
    ///  connection: the child, or the peer CEP itself.
    pub fn accept_p(&mut self, id: CepId, reply: &ReplyInfo, handler: Option<Arc<dyn CmEventHandler>>) -> Result<CepId, CmError> {
        if reply.qpn == 0 && reply.eecn == 0 {
            return Err(CmError::invalid_parameter("reply needs a QPN or EECN"));
        }
        let child_id = self.first_pending(id, &[CepState::ReqRcvd, CepState::MraReqSent])?;
        let parent = self.ceps.get(id)?;
        let inherited = (parent.async_accept, parent.timewait_callback, parent.failover_supported, parent.turnaround_us);

        let child = self.ceps.get_mut(child_id)?;
        if reply.arb_initiator_depth > child.local_initiator_depth || reply.arb_responder_resources > child.local_responder_resources {
            return Err(CmError::invalid_parameter("arbitrated RDMA read resources exceed the offer"));
        }
        if child.peer && (child.local_endpoint.qpn != reply.qpn || child.local_endpoint.eecn != reply.eecn) {
            return Err(CmError::invalid_parameter("a peer connection must be accepted with the endpoint it connected with"));
        }
        let rep = RepMessage {
            local_comm_id: child.local_comm_id,
            remote_comm_id: child.remote_comm_id,
            local_qkey: reply.qkey,
            local_qpn: reply.qpn,
            local_eecn: reply.eecn,
            starting_psn: reply.starting_psn,
            arb_responder_resources: reply.arb_responder_resources,
            arb_initiator_depth: reply.arb_initiator_depth,
            target_ack_delay: reply.target_ack_delay,
            failover_accepted: reply.failover_accepted,
            end_to_end_flow_control: reply.end_to_end_flow_control,
            rnr_retry_count: reply.rnr_retry_count,
            local_ca_guid: child.local_endpoint.ca_guid,
            private_data: FixedData::from_slice(&reply.private_data)
                .map_err(|e| CmError::invalid_parameter(e.to_string()))?,
        };

        if !child.peer {
            let endpoint = Endpoint::new(child.local_endpoint.ca_guid, reply.qpn, reply.eecn);
            self.maps.try_insert_local_endpoint(endpoint, child_id)?;
            child.local_endpoint = endpoint;
            child.handler = handler;
            (child.async_accept, child.timewait_callback, child.failover_supported, child.turnaround_us) = inherited;
        }

        self.turnaround.update(child.elapsed_us());

        if child.alternate_path.is_some() {
            if reply.failover_accepted != FailoverReply::Accepted {
                child.alternate_path = None;
            }
            child.failover_supported &= reply.failover_accepted.is_failover_supported();
        }
        child.local_initiator_depth = reply.arb_initiator_depth;
        child.local_responder_resources = reply.arb_responder_resources;
        child.target_ack_delay = child.target_ack_delay.max(reply.target_ack_delay);
        child.local_send_psn = reply.starting_psn;
        child.qkey = reply.qkey;

        let timewait = timeout_us_to_mult(2 * timeout_mult_to_us(child.pkt_life_time) + timeout_mult_to_us(child.target_ack_delay));
        child.timewait = child.timewait.max(timewait);

        let mad = CmMad::send(child.transaction_id, CmMessage::Rep(rep));
        self.out.send_for(child_id, child, mad);
        child.state = CepState::RepSent;
        child.retries = 0;
        let lcm = timeout_mult_to_ms(child.local_cm_timeout);
        self.out.start_timer(child_id, child, lcm);
        debug!(cep = %child_id, lcid = child.local_comm_id, "REP sent");

        self.leave_pending(child_id);
        self.notify_more_pending(id);
        Ok(child_id)
    }

    pub fn reject_p(&mut self, id: CepId, info: &RejectInfo) -> Result<(), CmError> {
        let child_id = self.first_pending(id, &[CepState::ReqRcvd, CepState::MraReqSent])?;
        let child = self.ceps.get_mut(child_id)?;
        let rej = formats::rej_with_info(RejectedMessage::Request, info, child.local_comm_id, child.remote_comm_id)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;
        if let Some(to) = child.address {
            self.out.send(to, CmMad::send(child.transaction_id, rej));
        }
        let peer = child.peer;
        debug!(cep = %child_id, reason = %info.reason, "rejecting REQ");

        self.leave_pending(child_id);
        let child = self.ceps.get_mut(child_id)?;
        cep_to_idle(&mut self.maps, child_id, child);
        if !peer {
            self.remove_cep(child_id);
        }
        self.notify_more_pending(id);
        Ok(())
    }

    pub(crate) fn cancel_p(&mut self, id: CepId) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        let state = cep.state;
        match state {
            CepState::Listen => {
                let children: Vec<CepId> = cep.pending.iter().copied().collect();
                let service_id = cep.service_id;
                for child_id in children {
                    self.leave_pending(child_id);
                    if let Ok(child) = self.ceps.get_mut(child_id) {
                        cep_to_idle(&mut self.maps, child_id, child);
                    }
                    self.destroy_cep(child_id)?;
                }
                self.maps.remove_listen(service_id, id);
                let cep = self.ceps.get_mut(id)?;
                cep_to_idle(&mut self.maps, id, cep);
                debug!(cep = %id, sid = service_id, "listen cancelled");
                set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
            }
            CepState::ReqRcvd | CepState::MraReqSent => {
                self.leave_pending(id);
                let cep = self.ceps.get_mut(id)?;
                cep_to_idle(&mut self.maps, id, cep);
                set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
            }
            CepState::RepSent | CepState::MraRepRcvd => {
                let cep = self.ceps.get_mut(id)?;
                cep_to_idle(&mut self.maps, id, cep);
                if cep.async_accept {
                    set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
                }
                else {
                    event_set(&mut self.out, cep, CepEvents::USER_CANCEL);
                }
            }
            CepState::SidrReqRcvd => {
                self.leave_pending(id);
                let cep = self.ceps.get_mut(id)?;
                cep_to_idle(&mut self.maps, id, cep);
                event_set(&mut self.out, cep, CepEvents::USER_CANCEL);
            }
            s => return Err(CmError::InvalidState(s)),
        }
        Ok(())
    }
}
