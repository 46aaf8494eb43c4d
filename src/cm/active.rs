//! The client side: connecting, and handling the replies to our REQ

use tracing::{debug, trace};

use crate::cm::cep::{Cep, CepEvents, CepMode, CepPath, CepState, Endpoint};
use crate::cm::cep_arena::CepId;
use crate::cm::cm_error::CmError;
use crate::cm::context::{cep_to_idle, event_set, set_notification, to_timewait, CmContext};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::formats;
use crate::cm::identity_maps::ListenKey;
use crate::cm::params::{ConnectRequest, RejectInfo};
use crate::cm::port_resolver::{lid_to_path_bits, resolve_port};
use crate::messaging::cm_messages::{CmMad, CmMessage, DreqMessage, MraMessage, RejMessage, RepMessage, ReqMessage};
use crate::messaging::codes::{CepType, FailoverReply, MraedMessage, RejectReason, RejectedMessage};
use crate::messaging::mad::FixedData;
use crate::messaging::transport::MadAddress;
use crate::util::time::{compute_ack_timeout, timeout_mult_to_ms, timeout_mult_to_us, timeout_us_to_mult, MAX_TIMEOUT_MULT};


/// the error for an API call on an Idle CEP, depending on whether it was just cancelled
pub(crate) fn idle_error(cep: &Cep) -> CmError {
    if cep.events.contains(CepEvents::USER_CANCEL) {
        CmError::Cancelled
    }
    else {
        CmError::InvalidState(cep.state)
    }
}

/// extend an exponent-encoded timeout by `delta_us`
fn extend_timeout(mult: u8, delta_us: u64) -> u8 {
    timeout_us_to_mult(timeout_mult_to_us(mult) + delta_us)
}

impl CmContext {
    /// Send a REQ. The outcome is reported through the CEP's events.
    pub fn connect(&mut self, id: CepId, request: &ConnectRequest) -> Result<(), CmError> {
        self.connect_as(id, request, false)
    }

    /// Connect to a peer that connects to us at the same time. The peer CEP is also bound to the
    ///  listen map, and whichever side loses the arbitration answers the other's REQ.
    pub fn connect_peer(&mut self, id: CepId, request: &ConnectRequest) -> Result<(), CmError> {
        self.connect_as(id, request, true)
    }

    fn connect_as(&mut self, id: CepId, request: &ConnectRequest, peer: bool) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        if cep.state != CepState::Idle {
            return Err(CmError::InvalidState(cep.state));
        }
        let cep_type = cep.cep_type;
        if !cep_type.is_connected() {
            return Err(CmError::invalid_parameter("datagram CEPs use SIDR queries instead of connecting"));
        }
        if request.qpn == 0 && request.eecn == 0 {
            return Err(CmError::invalid_parameter("connect needs a QPN or EECN"));
        }
        if request.service_id == 0 {
            return Err(CmError::invalid_parameter("service id must not be zero"));
        }

        let primary_info = &request.primary;
        let port = resolve_port(self.resolver.as_ref(), primary_info.local_gid, primary_info.local_lid)
            .map_err(|e| CmError::invalid_parameter(format!("primary path is not local: {}", e)))?;
        let ca = self.resolver.ca_attributes(port.ca_guid)
            .map_err(|e| CmError::invalid_parameter(format!("no attributes for CA 0x{:x}: {}", port.ca_guid, e)))?;
        let (initiator_depth, responder_resources) = match cep_type {
            CepType::ReliableConnection => (
                request.offered_initiator_depth.min(ca.max_qp_initiator_depth),
                request.offered_responder_resources.min(ca.max_qp_responder_resources),
            ),
            CepType::ReliableDatagram => (
                request.offered_initiator_depth.min(ca.max_eec_initiator_depth),
                request.offered_responder_resources.min(ca.max_eec_responder_resources),
            ),
            _ => (0, 0),
        };
        let pkey_index = self.resolver.resolve_pkey(port.port_guid, primary_info.pkey)
            .map_err(|_| CmError::invalid_parameter(format!("pkey 0x{:x} is not in the port's table", primary_info.pkey)))?;

        let mut primary = CepPath::from_path_info(primary_info, request.ack_timeout);
        primary.local_port_guid = port.port_guid;
        primary.local_gid_index = port.gid_index;
        primary.local_path_bits = lid_to_path_bits(primary_info.local_lid, port.lmc);
        primary.pkey_index = pkey_index;

        let alternate = match &request.alternate {
            Some(alt) => {
                if alt.pkey != primary_info.pkey {
                    return Err(CmError::invalid_parameter("primary and alternate path must use the same pkey"));
                }
                let alt_port = resolve_port(self.resolver.as_ref(), alt.local_gid, alt.local_lid)
                    .map_err(|e| CmError::invalid_parameter(format!("alternate path is not local: {}", e)))?;
                let alt_pkey_index = self.resolver.resolve_pkey(alt_port.port_guid, alt.pkey)
                    .map_err(|_| CmError::invalid_parameter("alternate pkey is not in the port's table"))?;
                let mut path = CepPath::from_path_info(alt, request.alternate_ack_timeout);
                path.local_port_guid = alt_port.port_guid;
                path.local_gid_index = alt_port.gid_index;
                path.local_path_bits = lid_to_path_bits(alt.local_lid, alt_port.lmc);
                path.pkey_index = alt_pkey_index;
                Some(path)
            }
            None => None,
        };
        let private_data = FixedData::from_slice(&request.private_data)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;

        let local_endpoint = Endpoint::new(port.ca_guid, request.qpn, request.eecn);
        self.maps.try_insert_local_endpoint(local_endpoint, id)?;
        let cep = self.ceps.get_mut(id)?;
        cep.service_id = request.service_id;
        cep.local_endpoint = local_endpoint;
        cep.remote_endpoint = Endpoint::default();
        cep.primary_path = primary;
        cep.alternate_path = alternate;
        if peer {
            if let Err(e) = self.maps.try_insert_listen(ListenKey::for_peer(cep), id) {
                self.maps.remove_endpoints(id, cep);
                cep.local_endpoint = Endpoint::default();
                return Err(e);
            }
        }
        let lcid = self.assign_comm_id(id)?;

        let cep = self.ceps.get_mut(id)?;
        cep.events = CepEvents::empty();
        cep.retries = 0;
        cep.mode = CepMode::Active;
        cep.failover_supported = true;
        cep.peer = peer;
        cep.local_initiator_depth = initiator_depth;
        cep.local_responder_resources = responder_resources;
        cep.mtu = primary_info.mtu;
        cep.pkey = primary_info.pkey;
        cep.target_ack_delay = ca.local_ack_delay;
        cep.local_retry_count = request.retry_count;
        cep.local_rnr_retry_count = request.rnr_retry_count;
        cep.local_send_psn = request.starting_psn;
        cep.qkey = request.qkey;
        cep.transaction_id = (lcid as u64) << 8;
        cep.remote_comm_id = 0;
        cep.received = None;

        let pkt_life_time = primary_info.pkt_life_time.min(MAX_TIMEOUT_MULT);
        cep.pkt_life_time = pkt_life_time;
        cep.timewait = request.ack_timeout.max(pkt_life_time + 1);
        let turnaround_us = self.turnaround.for_cep(cep);
        cep.remote_cm_timeout = timeout_us_to_mult(turnaround_us);
        cep.local_cm_timeout = timeout_us_to_mult(turnaround_us + 2 * timeout_mult_to_us(pkt_life_time));
        cep.max_cm_retries = self.config.max_req_retry;

        let req = ReqMessage {
            local_comm_id: lcid,
            service_id: request.service_id,
            local_ca_guid: port.ca_guid,
            local_qkey: request.qkey,
            local_qpn: request.qpn,
            offered_responder_resources: responder_resources,
            local_eecn: request.eecn,
            offered_initiator_depth: initiator_depth,
            remote_eecn: 0,
            remote_cm_timeout: cep.remote_cm_timeout,
            transport_service_type: cep_type,
            end_to_end_flow_control: request.end_to_end_flow_control,
            starting_psn: request.starting_psn,
            local_cm_timeout: cep.local_cm_timeout,
            retry_count: request.retry_count,
            partition_key: primary_info.pkey,
            path_mtu: primary_info.mtu,
            rdc_exists: false,
            rnr_retry_count: request.rnr_retry_count,
            max_cm_retries: cep.max_cm_retries,
            primary: primary.to_wire_path(request.ack_timeout),
            alternate: alternate.map(|p| p.to_wire_path(request.alternate_ack_timeout)),
            private_data,
        };
        cep.address = Some(primary.mad_address());
        let mad = CmMad::send(cep.transaction_id, CmMessage::Req(req));
        self.out.send_for(id, cep, mad);
        cep.state = CepState::ReqSent;
        let lcm = timeout_mult_to_ms(cep.local_cm_timeout);
        self.out.start_timer(id, cep, lcm);
        debug!(cep = %id, lcid, sid = request.service_id, peer, "REQ sent");
        Ok(())
    }

    pub(crate) fn on_rep(&mut self, rep: RepMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(rep.remote_comm_id) else {
            debug!(rcid = rep.local_comm_id, "REP for an unknown comm id");
            let rej = formats::rej(RejectedMessage::Reply, RejectReason::InvalidCommId, 0, rep.local_comm_id);
            self.out.send(from, CmMad::send(tid, rej));
            return Ok(DispatchOutcome::Rejected);
        };
        let cep = self.ceps.get_mut(id)?;
        let state = cep.state;
        match state {
            CepState::ReqSent | CepState::RepWait => {}
            CepState::ReqRcvd | CepState::MraReqSent | CepState::RepSent | CepState::MraRepRcvd => {
                return Ok(DispatchOutcome::Discarded);
            }
            CepState::RepRcvd | CepState::MraRepSent => {
                self.turnaround.update_for_duplicate(cep.elapsed_us());
                let service_timeout = self.turnaround.worst_service_time_mult(cep).max(cep.remote_cm_timeout);
                let mra = formats::mra(MraedMessage::Reply, service_timeout, cep.local_comm_id, cep.remote_comm_id);
                self.out.send(from, CmMad::send(cep.transaction_id, mra));
                cep.state = CepState::MraRepSent;
                return Ok(DispatchOutcome::Duplicate);
            }
            CepState::Established | CepState::LapSent | CepState::MraLapRcvd => {
                // our RTU got lost
                if cep.lap_sent {
                    let rtu = formats::rtu(cep.local_comm_id, cep.remote_comm_id, &[])?;
                    self.out.send(from, CmMad::send(cep.transaction_id, rtu));
                }
                else {
                    self.out.resend(id, cep);
                }
                return Ok(DispatchOutcome::Duplicate);
            }
            CepState::LapRcvd | CepState::MraLapSent | CepState::DreqSent | CepState::DreqRcvd => {
                return Ok(DispatchOutcome::Discarded);
            }
            _ => {
                let rej = formats::rej(RejectedMessage::Reply, RejectReason::InvalidCommId, 0, rep.local_comm_id);
                self.out.send(from, CmMad::send(tid, rej));
                return Ok(DispatchOutcome::Rejected);
            }
        }

        let remote = Endpoint::new(rep.local_ca_guid, rep.local_qpn, rep.local_eecn);
        let stale = if !cep.remote_endpoint.is_bound() {
            match self.maps.try_insert_remote_endpoint(remote, id) {
                Ok(()) => {
                    cep.remote_endpoint = remote;
                    if cep.peer {
                        self.maps.remove_listen(cep.service_id, id);
                    }
                    false
                }
                Err(_) => true,
            }
        }
        else {
            cep.remote_endpoint != remote
        };
        if stale {
            debug!(cep = %id, "REP from a remote endpoint that belongs to another connection");
            let rej = formats::rej(RejectedMessage::Reply, RejectReason::StaleConn, cep.local_comm_id, rep.local_comm_id);
            self.out.send(from, CmMad::send(tid, rej));
            return Ok(DispatchOutcome::Rejected);
        }

        cep.stop_timer();
        cep.remote_comm_id = rep.local_comm_id;
        if cep.alternate_path.is_some() {
            if rep.failover_accepted != FailoverReply::Accepted {
                cep.alternate_path = None;
            }
            cep.failover_supported &= rep.failover_accepted.is_failover_supported();
        }
        cep.local_responder_resources = cep.local_responder_resources.min(rep.arb_initiator_depth);
        cep.local_initiator_depth = cep.local_initiator_depth.min(rep.arb_responder_resources);
        if rep.target_ack_delay > cep.target_ack_delay {
            let delta_us = timeout_mult_to_us(rep.target_ack_delay) - timeout_mult_to_us(cep.target_ack_delay);
            cep.local_cm_timeout = extend_timeout(cep.local_cm_timeout, delta_us);
            cep.remote_cm_timeout = extend_timeout(cep.remote_cm_timeout, delta_us);
            cep.timewait = extend_timeout(cep.timewait, delta_us);
            cep.target_ack_delay = rep.target_ack_delay;
        }
        cep.local_recv_psn = rep.starting_psn;
        cep.local_rnr_retry_count = rep.rnr_retry_count;
        cep.primary_path.local_ack_timeout = compute_ack_timeout(cep.primary_path.local_ack_timeout, cep.target_ack_delay);
        if let Some(alternate) = cep.alternate_path.as_mut() {
            alternate.local_ack_timeout = compute_ack_timeout(alternate.local_ack_timeout, cep.target_ack_delay);
        }

        debug!(cep = %id, lcid = cep.local_comm_id, rcid = cep.remote_comm_id, "REP received");
        cep.received = Some(CmMessage::Rep(rep));
        cep.address = Some(from);
        cep.state = CepState::RepRcvd;
        cep.start_elapsed();
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_REP);
        Ok(DispatchOutcome::Processed)
    }

    /// Answer a REP with an RTU, completing the connection on the active side
    pub fn accept_a(&mut self, id: CepId, private_data: &[u8]) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        match cep.state {
            CepState::RepRcvd | CepState::MraRepSent => {}
            CepState::Idle => return Err(idle_error(cep)),
            s => return Err(CmError::InvalidState(s)),
        }
        let rtu = formats::rtu(cep.local_comm_id, cep.remote_comm_id, private_data)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;
        // how long the application took to answer the REP
        self.turnaround.update(cep.elapsed_us());
        let mad = CmMad::send(cep.transaction_id, rtu);
        self.out.send_for(id, cep, mad);
        cep.lap_sent = false;
        cep.state = CepState::Established;
        debug!(cep = %id, lcid = cep.local_comm_id, rcid = cep.remote_comm_id, "established (active)");
        Ok(())
    }

    /// Reject a REP
    pub fn reject_a(&mut self, id: CepId, info: &RejectInfo) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        match cep.state {
            CepState::RepRcvd | CepState::MraRepSent => {}
            CepState::Idle => return Err(idle_error(cep)),
            s => return Err(CmError::InvalidState(s)),
        }
        let rej = formats::rej_with_info(RejectedMessage::Reply, info, cep.local_comm_id, cep.remote_comm_id)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;
        if let Some(to) = cep.address {
            self.out.send(to, CmMad::send(cep.transaction_id, rej));
        }
        debug!(cep = %id, reason = %info.reason, "rejecting REP");
        cep_to_idle(&mut self.maps, id, cep);
        Ok(())
    }

    pub(crate) fn cancel_a(&mut self, id: CepId) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        let state = cep.state;
        match state {
            CepState::ReqSent | CepState::RepWait => {
                cep.stop_timer();
                if cep.peer && !cep.remote_endpoint.is_bound() {
                    self.maps.remove_listen(cep.service_id, id);
                }
                cep_to_idle(&mut self.maps, id, cep);
                set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
            }
            CepState::RepRcvd | CepState::MraRepSent => {
                self.reject_a(id, &RejectInfo::new(RejectReason::UserRej))?;
                let cep = self.ceps.get_mut(id)?;
                set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
            }
            CepState::SidrReqSent => {
                cep.stop_timer();
                self.maps.remove_query(cep.local_comm_id);
                cep_to_idle(&mut self.maps, id, cep);
                set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
            }
            s => return Err(CmError::InvalidState(s)),
        }
        debug!(cep = %id, "cancelled");
        Ok(())
    }

    /// Cancel a pending connect, listen, accept or SIDR query
    pub fn cancel(&mut self, id: CepId) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        match cep.state {
            CepState::ReqSent | CepState::RepWait | CepState::RepRcvd | CepState::MraRepSent | CepState::SidrReqSent => self.cancel_a(id),
            CepState::Idle => Err(idle_error(cep)),
            _ => self.cancel_p(id),
        }
    }

    /// Reject an inbound REQ (on the listener) or REP (on the connecting CEP)
    pub fn reject(&mut self, id: CepId, info: &RejectInfo) -> Result<(), CmError> {
        match self.ceps.get(id)?.state {
            CepState::RepRcvd | CepState::MraRepSent => self.reject_a(id, info),
            _ => self.reject_p(id, info),
        }
    }

    /// The remote side needs more time for its answer
    pub(crate) fn on_mra(&mut self, mra: MraMessage) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(mra.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let cep = self.ceps.get_mut(id)?;
        let next = match (mra.msg_mraed, cep.state) {
            (MraedMessage::Request, CepState::ReqSent) => {
                cep.remote_comm_id = mra.local_comm_id;
                CepState::RepWait
            }
            (MraedMessage::Reply, CepState::RepSent) => CepState::MraRepRcvd,
            (MraedMessage::Lap, CepState::LapSent) => CepState::MraLapRcvd,
            (kind, state) => {
                trace!(cep = %id, ?kind, ?state, "MRA does not apply");
                return Ok(DispatchOutcome::Discarded);
            }
        };
        cep.stop_timer();
        self.turnaround.update(timeout_mult_to_us(mra.service_timeout));
        let duration_ms = timeout_mult_to_ms(mra.service_timeout) + timeout_mult_to_ms(cep.pkt_life_time);
        self.out.start_timer(id, cep, duration_ms);
        trace!(cep = %id, ?next, duration_ms, "MRA received");
        cep.state = next;
        Ok(DispatchOutcome::Processed)
    }

    /// a REJ of a REQ we sent, or a REJ replacing a DREQ for an established connection
    pub(crate) fn on_rej_req(&mut self, rej: RejMessage, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(rej.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let cep = self.ceps.get_mut(id)?;
        match cep.state {
            CepState::ReqSent | CepState::RepWait => {
                if cep.peer && rej.reason == RejectReason::InvalidSid {
                    // the other side has not called connect_peer yet
                    trace!(cep = %id, "ignoring InvalidSid for a peer connect");
                    return Ok(DispatchOutcome::Discarded);
                }
                debug!(cep = %id, reason = %rej.reason, "REQ rejected");
                cep.stop_timer();
                let stale = rej.reason == RejectReason::StaleConn;
                cep.received = Some(CmMessage::Rej(rej));
                cep.address = Some(from);
                if cep.peer && !cep.remote_endpoint.is_bound() {
                    self.maps.remove_listen(cep.service_id, id);
                }
                if stale {
                    to_timewait(&mut self.out, id, cep);
                }
                else {
                    cep_to_idle(&mut self.maps, id, cep);
                }
                set_notification(&mut self.out, id, cep, CepEvents::RCVD_REJ);
                Ok(DispatchOutcome::Processed)
            }
            CepState::LapSent | CepState::MraLapRcvd | CepState::Established | CepState::LapRcvd | CepState::MraLapSent => {
                debug!(cep = %id, reason = %rej.reason, "REJ for an established connection");
                cep.stop_timer();
                cep.received = Some(CmMessage::Dreq(DreqMessage {
                    local_comm_id: cep.remote_comm_id,
                    remote_comm_id: cep.local_comm_id,
                    remote_qpn_or_eecn: cep.local_endpoint.qpn,
                    private_data: FixedData::default(),
                }));
                cep.state = CepState::SimDreqRcvd;
                cep.start_elapsed();
                set_notification(&mut self.out, id, cep, CepEvents::SIM_RCVD_DREQ);
                Ok(DispatchOutcome::Processed)
            }
            _ => Ok(DispatchOutcome::Discarded),
        }
    }

    /// a REJ of a REP we sent
    pub(crate) fn on_rej_rep(&mut self, rej: RejMessage, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(rej.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let cep = self.ceps.get_mut(id)?;
        match cep.state {
            CepState::RepSent | CepState::MraRepRcvd => {
                debug!(cep = %id, reason = %rej.reason, "REP rejected");
                cep.stop_timer();
                let stale = rej.reason == RejectReason::StaleConn;
                cep.received = Some(CmMessage::Rej(rej));
                cep.address = Some(from);
                if stale {
                    to_timewait(&mut self.out, id, cep);
                }
                else {
                    cep_to_idle(&mut self.maps, id, cep);
                }
                if cep.async_accept {
                    set_notification(&mut self.out, id, cep, CepEvents::RCVD_REJ);
                }
                else {
                    event_set(&mut self.out, cep, CepEvents::RCVD_REJ);
                }
                Ok(DispatchOutcome::Processed)
            }
            _ => Ok(DispatchOutcome::Discarded),
        }
    }
}
