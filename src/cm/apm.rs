//! Automatic path migration: loading an alternate path into an established connection with
//!  LAP / APR, and switching over to it

use tracing::{debug, trace};

use crate::cm::cep::{CepMode, CepPath, CepState, PendingAltPath};
use crate::cm::cep::CepEvents;
use crate::cm::cep_arena::CepId;
use crate::cm::cm_error::CmError;
use crate::cm::context::{set_notification, CmContext};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::formats;
use crate::cm::params::{AltPathReply, AltPathRequest, PathInfo};
use crate::cm::port_resolver::{lid_to_path_bits, resolve_port};
use crate::messaging::cm_messages::{AprMessage, CmMad, CmMessage, LapMessage, WirePath};
use crate::messaging::codes::{AprStatus, MraedMessage};
use crate::messaging::mad::FixedData;
use crate::messaging::transport::MadAddress;
use crate::util::time::{compute_ack_timeout, pkt_life_from_ack_timeout, timeout_mult_to_ms, timeout_mult_to_us, timeout_us_to_mult};


/// The paths after a migration, for reprogramming the QP and for proposing the old primary as
///  the next alternate
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MigratedPaths {
    pub primary: PathInfo,
    pub primary_ack_timeout: u8,
    pub reload: AltPathRequest,
}

/// a path from a LAP we sent ourselves, i.e. already from our perspective
fn path_from_sent(path: &WirePath) -> CepPath {
    CepPath {
        local_lid: path.local_lid,
        remote_lid: path.remote_lid,
        local_gid: path.local_gid,
        remote_gid: path.remote_gid,
        flow_label: path.flow_label,
        static_rate: path.packet_rate,
        traffic_class: path.traffic_class,
        sl: path.sl,
        subnet_local: path.subnet_local,
        hop_limit: path.hop_limit,
        ack_timeout: path.local_ack_timeout,
        ..Default::default()
    }
}

fn with_local_addressing(mut path: CepPath, pending: &PendingAltPath) -> CepPath {
    path.local_port_guid = pending.local_port_guid;
    path.local_gid_index = pending.local_gid_index;
    path.local_path_bits = pending.local_path_bits;
    path.pkey_index = pending.pkey_index;
    path.local_ack_timeout = pending.local_ack_timeout;
    path
}

impl CmContext {
    /// Propose a new alternate path to the remote side of an established connection
    pub fn altpath_request(&mut self, id: CepId, request: &AltPathRequest) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        if cep.state != CepState::Established {
            return Err(CmError::InvalidState(cep.state));
        }
        if !cep.failover_supported || cep.has_alternate() {
            return Err(CmError::InvalidState(cep.state));
        }
        let alt = &request.alternate;
        let proposed = CepPath::from_path_info(alt, request.ack_timeout);
        if proposed.same_route(&cep.primary_path) {
            return Err(CmError::invalid_parameter("the alternate path must differ from the primary path"));
        }
        let (pkey, target_ack_delay, ca_guid) = (cep.pkey, cep.target_ack_delay, cep.local_endpoint.ca_guid);

        let port = resolve_port(self.resolver.as_ref(), alt.local_gid, alt.local_lid)
            .map_err(|e| CmError::invalid_parameter(format!("alternate path is not local: {}", e)))?;
        let pkey_index = self.resolver.resolve_pkey(port.port_guid, pkey)
            .map_err(|_| CmError::invalid_parameter(format!("pkey 0x{:x} is not in the alternate port's table", pkey)))?;
        let ack_timeout = if request.ack_timeout != 0 {
            request.ack_timeout
        }
        else {
            let ca = self.resolver.ca_attributes(ca_guid)
                .map_err(|_| CmError::InsufficientResources)?;
            compute_ack_timeout(alt.pkt_life_time, ca.local_ack_delay)
        };
        let private_data = FixedData::from_slice(&request.private_data)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;

        let cep = self.ceps.get_mut(id)?;
        cep.pending_alt_path = Some(PendingAltPath {
            local_port_guid: port.port_guid,
            local_gid_index: port.gid_index,
            local_path_bits: lid_to_path_bits(alt.local_lid, port.lmc),
            pkey_index,
            local_ack_timeout: compute_ack_timeout(alt.pkt_life_time, target_ack_delay),
        });
        let lap = LapMessage {
            local_comm_id: cep.local_comm_id,
            remote_comm_id: cep.remote_comm_id,
            remote_qpn_or_eecn: cep.remote_endpoint.qpn,
            remote_cm_timeout: cep.remote_cm_timeout,
            alternate: proposed.to_wire_path(ack_timeout),
            private_data,
        };
        cep.lap_sent = true;
        let mad = CmMad::send(cep.transaction_id, CmMessage::Lap(lap));
        self.out.send_for(id, cep, mad);
        cep.state = CepState::LapSent;
        cep.retries = 0;
        let lcm = timeout_mult_to_ms(cep.local_cm_timeout);
        self.out.start_timer(id, cep, lcm);
        debug!(cep = %id, lcid = cep.local_comm_id, "LAP sent");
        Ok(())
    }

    pub(crate) fn on_lap(&mut self, lap: LapMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(lap.remote_comm_id) else {
            let apr = formats::apr_status(AprStatus::InvalidCommId, lap.remote_comm_id, lap.local_comm_id);
            self.out.send(from, CmMad::send(tid, apr));
            return Ok(DispatchOutcome::Rejected);
        };

        let state = self.ceps.get(id)?.state;
        match state {
            CepState::RepSent | CepState::MraRepRcvd => {
                // the RTU got lost, the LAP implies it
                self.rtu_passive(id, None)?;
                self.lap_established(id, lap, tid, from)
            }
            CepState::Established => self.lap_established(id, lap, tid, from),
            CepState::LapRcvd | CepState::MraLapSent => self.lap_again(id, lap, tid, from),
            _ => Ok(DispatchOutcome::Discarded),
        }
    }

    fn lap_established(&mut self, id: CepId, lap: LapMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let cep = self.ceps.get(id)?;
        if cep.mode != CepMode::Passive {
            trace!(cep = %id, "LAP for the active side");
            return Ok(DispatchOutcome::Discarded);
        }
        let (lcid, rcid) = (cep.local_comm_id, cep.remote_comm_id);
        let proposed = CepPath::from_remote_wire_path(&lap.alternate);

        let refusal = if !cep.failover_supported {
            Some(AprStatus::UnsupportedReq)
        }
        else if proposed.same_route(&cep.primary_path) {
            Some(AprStatus::DuplicatePath)
        }
        else if let Some(alternate) = &cep.alternate_path {
            if proposed.same_route(alternate) {
                // our APR got lost
                Some(AprStatus::PathLoaded)
            }
            else {
                // no reload before migrating
                Some(AprStatus::Rejected)
            }
        }
        else {
            None
        };
        if let Some(status) = refusal {
            debug!(cep = %id, ?status, "answering LAP");
            self.out.send(from, CmMad::send(tid, formats::apr_status(status, lcid, rcid)));
            return Ok(DispatchOutcome::Rejected);
        }

        let pending = resolve_port(self.resolver.as_ref(), proposed.local_gid, proposed.local_lid).ok()
            .filter(|port| port.ca_guid == cep.local_endpoint.ca_guid)
            .and_then(|port| {
                let pkey_index = self.resolver.resolve_pkey(port.port_guid, cep.pkey).ok()?;
                Some(PendingAltPath {
                    local_port_guid: port.port_guid,
                    local_gid_index: port.gid_index,
                    local_path_bits: lid_to_path_bits(proposed.local_lid, port.lmc),
                    pkey_index,
                    local_ack_timeout: compute_ack_timeout(pkt_life_from_ack_timeout(lap.alternate.local_ack_timeout), cep.target_ack_delay),
                })
            });
        let Some(pending) = pending else {
            debug!(cep = %id, "LAP for a path that is not on our CA");
            self.out.send(from, CmMad::send(tid, formats::apr_status(AprStatus::RejectDgid, lcid, rcid)));
            return Ok(DispatchOutcome::Rejected);
        };

        let cep = self.ceps.get_mut(id)?;
        let worst = self.turnaround.worst_service_time_mult(cep);
        let remote_cm_timeout = lap.remote_cm_timeout;
        cep.pending_alt_path = Some(pending);
        cep.received = Some(CmMessage::Lap(lap));
        cep.address = Some(from);
        cep.state = CepState::LapRcvd;
        cep.start_elapsed();
        if remote_cm_timeout < worst {
            let mra = formats::mra(MraedMessage::Lap, worst, lcid, rcid);
            self.out.send(from, CmMad::send(cep.transaction_id, mra));
            cep.state = CepState::MraLapSent;
        }
        debug!(cep = %id, lcid, "LAP received");
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_LAP);
        Ok(DispatchOutcome::Processed)
    }

    /// a LAP while the previous one is still waiting for the application's answer
    fn lap_again(&mut self, id: CepId, lap: LapMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let cep = self.ceps.get_mut(id)?;
        let (lcid, rcid) = (cep.local_comm_id, cep.remote_comm_id);
        let proposed = CepPath::from_remote_wire_path(&lap.alternate);
        if proposed.same_route(&cep.primary_path) {
            self.out.send(from, CmMad::send(tid, formats::apr_status(AprStatus::DuplicatePath, lcid, rcid)));
            return Ok(DispatchOutcome::Rejected);
        }
        if !matches!(&cep.received, Some(CmMessage::Lap(stored)) if *stored == lap) {
            // a new LAP before we answered the old one
            self.out.send(from, CmMad::send(tid, formats::apr_status(AprStatus::Rejected, lcid, rcid)));
            return Ok(DispatchOutcome::Rejected);
        }

        self.turnaround.update_for_duplicate(cep.elapsed_us());
        let worst = self.turnaround.worst_service_time_mult(cep);
        if cep.state == CepState::MraLapSent || lap.remote_cm_timeout < worst {
            let mra = formats::mra(MraedMessage::Lap, worst, lcid, rcid);
            self.out.send(from, CmMad::send(cep.transaction_id, mra));
            cep.state = CepState::MraLapSent;
        }
        Ok(DispatchOutcome::Duplicate)
    }

    pub(crate) fn on_apr(&mut self, apr: AprMessage) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(apr.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let cep = self.ceps.get_mut(id)?;
        if !matches!(cep.state, CepState::LapSent | CepState::MraLapRcvd) {
            return Ok(DispatchOutcome::Discarded);
        }
        if apr.status == AprStatus::PathLoaded {
            let sent = cep.outbound.as_ref().and_then(|o| match &o.mad.message {
                CmMessage::Lap(lap) => Some(path_from_sent(&lap.alternate)),
                _ => None,
            });
            if let (Some(path), Some(pending)) = (sent, cep.pending_alt_path.take()) {
                cep.alternate_path = Some(with_local_addressing(path, &pending));
            }
        }
        debug!(cep = %id, status = ?apr.status, "APR received");
        cep.stop_timer();
        cep.received = Some(CmMessage::Apr(apr));
        cep.state = CepState::Established;
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_APR);
        Ok(DispatchOutcome::Processed)
    }

    /// Answer the remote side's LAP. With `PathLoaded`, the proposed path becomes the alternate.
    pub fn altpath_reply(&mut self, id: CepId, reply: &AltPathReply) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        if !matches!(cep.state, CepState::LapRcvd | CepState::MraLapSent) {
            return Err(CmError::InvalidState(cep.state));
        }
        let apr = formats::apr(reply.status, cep.local_comm_id, cep.remote_comm_id, &reply.add_info, &reply.private_data)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;

        match reply.status {
            AprStatus::PathLoaded => {
                let Some(CmMessage::Lap(lap)) = &cep.received else {
                    return Err(CmError::InvalidState(cep.state));
                };
                let path = CepPath::from_remote_wire_path(&lap.alternate);
                if let Some(pending) = cep.pending_alt_path.take() {
                    cep.alternate_path = Some(with_local_addressing(path, &pending));
                }
            }
            AprStatus::UnsupportedReq => {
                cep.failover_supported = false;
            }
            _ => {}
        }
        if let Some(to) = cep.address {
            self.out.send(to, CmMad::send(cep.transaction_id, apr));
        }
        cep.pending_alt_path = None;
        cep.state = CepState::Established;
        debug!(cep = %id, status = ?reply.status, "APR sent");
        Ok(())
    }

    /// The QP migrated to the alternate path: it is the primary path from now on
    pub fn migrated(&mut self, id: CepId) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        if cep.state != CepState::Established {
            return Err(CmError::InvalidState(cep.state));
        }
        let Some(alternate) = cep.alternate_path.take() else {
            return Err(CmError::InvalidState(cep.state));
        };
        let lcm_us = (timeout_mult_to_us(cep.local_cm_timeout) + timeout_mult_to_us(alternate.ack_timeout))
            .saturating_sub(timeout_mult_to_us(cep.primary_path.ack_timeout));
        cep.local_cm_timeout = timeout_us_to_mult(lcm_us);
        cep.timewait = alternate.local_ack_timeout;
        cep.pkt_life_time = pkt_life_from_ack_timeout(alternate.ack_timeout);
        cep.primary_path = alternate;
        cep.address = Some(alternate.mad_address());
        debug!(cep = %id, lcm = cep.local_cm_timeout, "migrated to the alternate path");
        Ok(())
    }

    /// Migrate, and return the old primary path as a proposal for the next alternate
    pub fn migrated_reload(&mut self, id: CepId) -> Result<MigratedPaths, CmError> {
        let cep = self.ceps.get(id)?;
        let Some(alternate) = cep.alternate_path else {
            return Err(CmError::InvalidState(cep.state));
        };
        let old_primary = cep.primary_path;
        let paths = MigratedPaths {
            primary: alternate.to_path_info(cep.pkey, cep.mtu),
            primary_ack_timeout: alternate.local_ack_timeout,
            reload: AltPathRequest {
                alternate: old_primary.to_path_info(cep.pkey, cep.mtu),
                ack_timeout: old_primary.local_ack_timeout,
                private_data: Vec::new(),
            },
        };
        self.migrated(id)?;
        Ok(paths)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::cm::cep::{Cep, Endpoint};
    use crate::cm::cm_config::CmConfig;
    use crate::cm::context::Effect;
    use crate::cm::params::Disconnect;
    use crate::messaging::codes::CepType;
    use crate::test_util::fabric::{mad_address, path, static_resolver, RecordingHandler};

    fn context(node: u8) -> CmContext {
        CmContext::new(Arc::new(CmConfig::default()), Arc::new(static_resolver(node)))
    }

    /// an established connection from node 1 to node 2 over the 1-2 path
    fn established(ctx: &mut CmContext, node: u8, mode: CepMode) -> CepId {
        let remote = if node == 1 { 2 } else { 1 };
        let id = ctx.ceps.insert(Cep::new(CepType::ReliableConnection, Some(RecordingHandler::new())));
        let lcid = ctx.assign_comm_id(id).unwrap();
        let resolver = static_resolver(node);
        let cep = ctx.ceps.get_mut(id).unwrap();
        cep.state = CepState::Established;
        cep.mode = mode;
        cep.failover_supported = true;
        cep.remote_comm_id = lcid ^ 0x5555;
        cep.local_endpoint = Endpoint::new(resolver.ca_guid, 7, 0);
        cep.remote_endpoint = Endpoint::new(static_resolver(remote).ca_guid, 9, 0);
        cep.primary_path = CepPath::from_path_info(&path(node, remote), 16);
        cep.pkey = 0xffff;
        cep.mtu = 4;
        cep.local_cm_timeout = 16;
        cep.address = Some(mad_address(node, remote as u16));
        id
    }

    fn sent(ctx: &mut CmContext) -> Vec<CmMessage> {
        ctx.take_effects().into_iter()
            .filter_map(|e| match e {
                Effect::Send { mad, .. } => Some(mad.message),
                _ => None,
            })
            .collect()
    }

    fn alt_request(node: u8) -> AltPathRequest {
        let remote = if node == 1 { 2 } else { 1 };
        let mut alternate = path(node, remote);
        alternate.local_lid += 0x100;
        alternate.remote_lid += 0x100;
        AltPathRequest { alternate, ack_timeout: 0, private_data: vec![3] }
    }

    #[test]
    fn test_lap_apr_loads_alternate_on_both_sides() {
        let mut active = context(1);
        let mut passive = context(2);
        let a = established(&mut active, 1, CepMode::Active);
        let p = established(&mut passive, 2, CepMode::Passive);
        let (a_lcid, p_lcid) = (active.ceps.get(a).unwrap().local_comm_id, passive.ceps.get(p).unwrap().local_comm_id);
        active.ceps.get_mut(a).unwrap().remote_comm_id = p_lcid;
        passive.ceps.get_mut(p).unwrap().remote_comm_id = a_lcid;

        active.altpath_request(a, &alt_request(1)).unwrap();
        assert_eq!(active.ceps.get(a).unwrap().state, CepState::LapSent);
        let Some(CmMessage::Lap(lap)) = sent(&mut active).pop() else { panic!("no LAP") };

        assert_eq!(passive.on_lap(lap, 77, mad_address(2, 1)).unwrap(), DispatchOutcome::Processed);
        assert!(matches!(passive.ceps.get(p).unwrap().state, CepState::LapRcvd | CepState::MraLapSent));
        sent(&mut passive);

        passive.altpath_reply(p, &AltPathReply { status: AprStatus::PathLoaded, add_info: vec![], private_data: vec![] }).unwrap();
        let cep = passive.ceps.get(p).unwrap();
        assert_eq!(cep.state, CepState::Established);
        assert_eq!(cep.alternate_path.unwrap().local_lid, 0x102);
        let Some(CmMessage::Apr(apr)) = sent(&mut passive).pop() else { panic!("no APR") };

        assert_eq!(active.on_apr(apr).unwrap(), DispatchOutcome::Processed);
        let cep = active.ceps.get(a).unwrap();
        assert_eq!(cep.state, CepState::Established);
        let alternate = cep.alternate_path.unwrap();
        assert_eq!(alternate.local_lid, 0x101);
        assert_eq!(alternate.remote_lid, 0x102);
        assert!(cep.events.contains(CepEvents::RCVD_APR));
    }

    #[test]
    fn test_disconnect_after_migration_uses_new_primary() {
        let mut active = context(1);
        let mut passive = context(2);
        let a = established(&mut active, 1, CepMode::Active);
        let p = established(&mut passive, 2, CepMode::Passive);
        let (a_lcid, p_lcid) = (active.ceps.get(a).unwrap().local_comm_id, passive.ceps.get(p).unwrap().local_comm_id);
        active.ceps.get_mut(a).unwrap().remote_comm_id = p_lcid;
        passive.ceps.get_mut(p).unwrap().remote_comm_id = a_lcid;

        active.altpath_request(a, &alt_request(1)).unwrap();
        let Some(CmMessage::Lap(lap)) = sent(&mut active).pop() else { panic!("no LAP") };
        passive.on_lap(lap, 77, mad_address(2, 1)).unwrap();
        sent(&mut passive);
        passive.altpath_reply(p, &AltPathReply { status: AprStatus::PathLoaded, add_info: vec![], private_data: vec![] }).unwrap();
        let Some(CmMessage::Apr(apr)) = sent(&mut passive).pop() else { panic!("no APR") };
        active.on_apr(apr).unwrap();
        sent(&mut active);

        active.migrated(a).unwrap();
        let cep = active.ceps.get(a).unwrap();
        assert_eq!(cep.primary_path.remote_lid, 0x102);
        assert!(cep.alternate_path.is_none());

        active.disconnect(a, &Disconnect::Request { private_data: vec![] }).unwrap();
        let dreq_to = active.take_effects().into_iter()
            .find_map(|e| match e {
                Effect::Send { to, mad, .. } if matches!(mad.message, CmMessage::Dreq(_)) => Some(to),
                _ => None,
            })
            .expect("no DREQ sent");
        assert_eq!(dreq_to.remote_lid, 0x102);
        assert_eq!(active.ceps.get(a).unwrap().state, CepState::DreqSent);
    }

    #[test]
    fn test_altpath_request_checks() {
        let mut ctx = context(1);
        let id = established(&mut ctx, 1, CepMode::Active);

        let same = AltPathRequest { alternate: path(1, 2), ack_timeout: 0, private_data: vec![] };
        assert!(matches!(ctx.altpath_request(id, &same), Err(CmError::InvalidParameter(_))));

        ctx.ceps.get_mut(id).unwrap().failover_supported = false;
        assert!(matches!(ctx.altpath_request(id, &alt_request(1)), Err(CmError::InvalidState(CepState::Established))));
    }

    #[test]
    fn test_lap_refusals() {
        let mut ctx = context(2);
        let id = established(&mut ctx, 2, CepMode::Passive);
        let lcid = ctx.ceps.get(id).unwrap().local_comm_id;
        let lap = |alternate: PathInfo| LapMessage {
            local_comm_id: 1,
            remote_comm_id: lcid,
            remote_qpn_or_eecn: 7,
            remote_cm_timeout: 31,
            alternate: CepPath::from_path_info(&alternate, 16).to_wire_path(16),
            private_data: FixedData::default(),
        };
        let status = |ctx: &mut CmContext| match sent(ctx).pop() {
            Some(CmMessage::Apr(apr)) => apr.status,
            other => panic!("expected an APR, got {:?}", other),
        };

        ctx.on_lap(lap(path(1, 2)), 1, mad_address(2, 1)).unwrap();
        assert_eq!(status(&mut ctx), AprStatus::DuplicatePath);

        ctx.ceps.get_mut(id).unwrap().failover_supported = false;
        ctx.on_lap(lap(alt_request(1).alternate), 1, mad_address(2, 1)).unwrap();
        assert_eq!(status(&mut ctx), AprStatus::UnsupportedReq);

        let mut unknown = lap(path(1, 2));
        unknown.remote_comm_id = lcid.wrapping_add(1);
        assert_eq!(ctx.on_lap(unknown, 1, mad_address(2, 1)).unwrap(), DispatchOutcome::Rejected);
        assert_eq!(status(&mut ctx), AprStatus::InvalidCommId);
    }

    #[test]
    fn test_migration_swaps_paths() {
        let mut ctx = context(1);
        let id = established(&mut ctx, 1, CepMode::Active);
        let mut alternate = CepPath::from_path_info(&alt_request(1).alternate, 18);
        alternate.local_ack_timeout = 17;
        ctx.ceps.get_mut(id).unwrap().alternate_path = Some(alternate);

        let paths = ctx.migrated_reload(id).unwrap();
        assert_eq!(paths.primary.local_lid, 0x101);
        assert_eq!(paths.primary_ack_timeout, 17);
        assert_eq!(paths.reload.alternate.local_lid, 1);

        let cep = ctx.ceps.get(id).unwrap();
        assert_eq!(cep.primary_path.local_lid, 0x101);
        assert!(cep.alternate_path.is_none());
        assert_eq!(cep.timewait, 17);
        assert_eq!(cep.pkt_life_time, 17);
        assert!(cep.local_cm_timeout >= 16);

        assert!(matches!(ctx.migrated(id), Err(CmError::InvalidState(CepState::Established))));
    }
}
