//! Service ID resolution: datagram services register under a service id, clients query the
//!  QPN and QKey behind it

use tracing::{debug, trace};

use crate::cm::cep::{Cep, CepEvents, CepMode, CepPath, CepState, Endpoint};
use crate::cm::cep_arena::CepId;
use crate::cm::cm_config::CmConfig;
use crate::cm::cm_error::CmError;
use crate::cm::context::{cep_to_idle, set_notification, CmContext};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::formats;
use crate::cm::identity_maps::ListenKey;
use crate::cm::params::{SidrQuery, SidrRegisterInfo, SidrResponse};
use crate::cm::port_resolver::{lid_to_path_bits, resolve_port};
use crate::messaging::cm_messages::{CmMad, CmMessage, SidrReqMessage, SidrRespMessage};
use crate::messaging::codes::{CepType, SidrStatus};
use crate::messaging::mad::FixedData;
use crate::messaging::transport::MadAddress;
use crate::util::time::{timeout_mult_to_ms, MAX_TIMEOUT_MULT};


/// how long to wait for a SIDR_RESP before retrying
pub fn sidr_timeout_ms(config: &CmConfig, pkt_life_time: u8) -> u64 {
    if pkt_life_time >= MAX_TIMEOUT_MULT {
        timeout_mult_to_ms(MAX_TIMEOUT_MULT)
    }
    else {
        config.sidr_req_timeout.as_millis() as u64 + 2 * timeout_mult_to_ms(pkt_life_time)
    }
}

impl CmContext {
    pub fn sidr_register(&mut self, id: CepId, info: &SidrRegisterInfo) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        if cep.state != CepState::Idle {
            return Err(CmError::InvalidState(cep.state));
        }
        if cep.cep_type != CepType::UnreliableDatagram {
            return Err(CmError::invalid_parameter("only datagram CEPs register for SIDR"));
        }
        if info.service_id == 0 {
            return Err(CmError::invalid_parameter("service id must not be zero"));
        }
        let key = ListenKey {
            service_id: info.service_id,
            discriminator: cep.discriminator.clone(),
            ..Default::default()
        };
        self.maps.try_insert_listen(key, id)?;

        // registrations are not in the endpoint map: several services may answer with the same QPN
        cep.local_endpoint = Endpoint::new(0, info.qpn, 0);
        cep.remote_endpoint = Endpoint::default();
        cep.primary_path = CepPath::default();
        cep.service_id = info.service_id;
        cep.qkey = info.qkey;
        cep.transaction_id = 0;
        cep.mode = CepMode::Passive;
        cep.events = CepEvents::empty();
        cep.state = CepState::Registered;
        let lcid = self.assign_comm_id(id)?;
        debug!(cep = %id, lcid, sid = info.service_id, qpn = info.qpn, "SIDR registered");
        Ok(())
    }

    pub fn sidr_deregister(&mut self, id: CepId) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        if cep.state != CepState::Registered {
            return Err(CmError::InvalidState(cep.state));
        }
        let children: Vec<CepId> = cep.pending.iter().copied().collect();
        let service_id = cep.service_id;
        for child_id in children {
            self.leave_pending(child_id);
            self.remove_cep(child_id);
        }
        self.maps.remove_listen(service_id, id);
        let cep = self.ceps.get_mut(id)?;
        cep.local_endpoint = Endpoint::default();
        cep_to_idle(&mut self.maps, id, cep);
        debug!(cep = %id, sid = service_id, "SIDR deregistered");
        Ok(())
    }

    /// Ask the remote side for the QPN serving `query.service_id`. The answer (or a timeout) is
    ///  reported through the CEP's events.
    pub fn sidr_query(&mut self, id: CepId, query: &SidrQuery) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        // a query that timed out may still have its last send outstanding
        if cep.state != CepState::Idle || cep.send_in_flight {
            return Err(CmError::InvalidState(cep.state));
        }
        let path = &query.path;
        let port = resolve_port(self.resolver.as_ref(), path.local_gid, path.local_lid)
            .map_err(|e| CmError::invalid_parameter(format!("query path is not local: {}", e)))?;
        let partition_key = if query.partition_key != 0 { query.partition_key } else { path.pkey };
        let pkey_index = self.resolver.resolve_pkey(port.port_guid, partition_key)
            .map_err(|_| CmError::invalid_parameter(format!("pkey 0x{:x} is not in the port's table", partition_key)))?;
        let private_data = FixedData::from_slice(&query.private_data)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;

        let lcid = self.assign_comm_id(id)?;
        let cep = self.ceps.get_mut(id)?;
        let mut primary = CepPath::from_path_info(path, 0);
        primary.local_port_guid = port.port_guid;
        primary.local_gid_index = port.gid_index;
        primary.local_path_bits = lid_to_path_bits(path.local_lid, port.lmc);
        primary.pkey_index = pkey_index;

        cep.mode = CepMode::Active;
        cep.events = CepEvents::empty();
        cep.transaction_id = (lcid as u64) << 8;
        cep.service_id = query.service_id;
        cep.local_endpoint = Endpoint::new(port.ca_guid, 0, 0);
        cep.primary_path = primary;
        cep.address = Some(primary.mad_address());
        cep.pkey = partition_key;
        cep.pkt_life_time = path.pkt_life_time.min(MAX_TIMEOUT_MULT);
        cep.retries = 0;
        cep.max_cm_retries = self.config.max_req_retry;
        cep.received = None;

        let req = SidrReqMessage {
            request_id: lcid,
            partition_key,
            service_id: query.service_id,
            private_data,
        };
        let mad = CmMad::send(cep.transaction_id, CmMessage::SidrReq(req));
        self.out.send_for(id, cep, mad);
        self.maps.insert_query(lcid, id);
        cep.state = CepState::SidrReqSent;
        let timeout = sidr_timeout_ms(&self.config, cep.pkt_life_time);
        self.out.start_timer(id, cep, timeout);
        debug!(cep = %id, request_id = lcid, sid = query.service_id, "SIDR_REQ sent");
        Ok(())
    }

    /// Answer the registration's first pending SIDR_REQ
    pub fn sidr_response(&mut self, id: CepId, response: &SidrResponse) -> Result<(), CmError> {
        let cep = self.ceps.get(id)?;
        if cep.state != CepState::Registered {
            return Err(CmError::InvalidState(cep.state));
        }
        let service_id = cep.service_id;
        let child_id = self.first_pending(id, &[CepState::SidrReqRcvd])?;
        let child = self.ceps.get(child_id)?;
        let resp = formats::sidr_resp(child.remote_comm_id, response.status, service_id, response.qpn, response.qkey, &response.private_data)
            .map_err(|e| CmError::invalid_parameter(e.to_string()))?;
        if let Some(to) = child.address {
            self.out.send(to, CmMad::send(child.transaction_id, resp));
        }
        debug!(cep = %id, request_id = child.remote_comm_id, status = ?response.status, "SIDR_RESP sent");

        self.leave_pending(child_id);
        self.remove_cep(child_id);
        let cep = self.ceps.get_mut(id)?;
        if !cep.pending.is_empty() {
            set_notification(&mut self.out, id, cep, CepEvents::RCVD_SIDR_REQ);
        }
        Ok(())
    }

    pub(crate) fn on_sidr_req(&mut self, req: SidrReqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let registered = self.maps.listen_match_sidr(&req)
            .filter(|id| self.ceps.get(*id).map(|c| c.state == CepState::Registered).unwrap_or(false));
        let Some(id) = registered else {
            debug!(sid = req.service_id, "SIDR_REQ for an unregistered service");
            let resp = formats::sidr_resp(req.request_id, SidrStatus::SidNotSupported, req.service_id, 0, 0, &[])?;
            self.out.send(from, CmMad::send(tid, resp));
            return Ok(DispatchOutcome::Rejected);
        };

        let cep = self.ceps.get(id)?;
        let remote_gid = from.remote_gid();
        let duplicate = cep.pending.iter()
            .filter_map(|c| self.ceps.get(*c).ok())
            .any(|c| c.primary_path.remote_lid == from.remote_lid
                && remote_gid.map(|g| g == c.primary_path.remote_gid).unwrap_or(true)
                && c.remote_comm_id == req.request_id);
        if duplicate {
            trace!(cep = %id, request_id = req.request_id, "duplicate SIDR_REQ");
            return Ok(DispatchOutcome::Duplicate);
        }

        let backlog = if cep.listen_backlog != 0 { cep.listen_backlog } else { self.config.max_backlog };
        if cep.pending.len() >= backlog as usize {
            debug!(cep = %id, pending = cep.pending.len(), "SIDR backlog full");
            let resp = formats::sidr_resp(req.request_id, SidrStatus::ProviderRejected, req.service_id, 0, 0, &[])?;
            self.out.send(from, CmMad::send(tid, resp));
            return Ok(DispatchOutcome::Rejected);
        }

        if !cep.sidr_notify {
            let resp = formats::sidr_resp(req.request_id, SidrStatus::ValidQpn, cep.service_id, cep.local_endpoint.qpn, cep.qkey, &[])?;
            self.out.send(from, CmMad::send(tid, resp));
            return Ok(DispatchOutcome::Processed);
        }

        let mut child = Cep::new(CepType::UnreliableDatagram, None);
        child.mode = CepMode::Passive;
        child.state = CepState::SidrReqRcvd;
        child.parent = Some(id);
        child.remote_comm_id = req.request_id;
        child.transaction_id = tid;
        child.service_id = req.service_id;
        child.primary_path.remote_lid = from.remote_lid;
        child.primary_path.remote_gid = remote_gid.unwrap_or_default();
        child.address = Some(from);
        child.received = Some(CmMessage::SidrReq(req));
        let child_id = self.ceps.insert(child);

        let cep = self.ceps.get_mut(id)?;
        cep.pending.push_back(child_id);
        debug!(cep = %id, child = %child_id, "SIDR_REQ received");
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_SIDR_REQ);
        Ok(DispatchOutcome::Processed)
    }

    pub(crate) fn on_sidr_resp(&mut self, resp: SidrRespMessage, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_query(resp.request_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let cep = self.ceps.get_mut(id)?;
        if cep.state != CepState::SidrReqSent {
            return Ok(DispatchOutcome::Discarded);
        }
        debug!(cep = %id, status = ?resp.status, qpn = resp.qpn, "SIDR_RESP received");
        self.maps.remove_query(resp.request_id);
        cep.stop_timer();
        cep.retries = 0;
        cep.received = Some(CmMessage::SidrResp(resp));
        cep.address = Some(from);
        cep_to_idle(&mut self.maps, id, cep);
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_SIDR_RESP);
        Ok(DispatchOutcome::Processed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use rstest::rstest;
    use crate::cm::context::{is_message, Effect};
    use crate::cm::params::CepOption;
    use crate::test_util::fabric::{mad_address, path, static_resolver, RecordingHandler};

    fn context(node: u8) -> CmContext {
        CmContext::new(Arc::new(CmConfig::default()), Arc::new(static_resolver(node)))
    }

    fn sent(ctx: &mut CmContext) -> Vec<CmMessage> {
        ctx.take_effects().into_iter()
            .filter_map(|e| match e {
                Effect::Send { mad, .. } => Some(mad.message),
                _ => None,
            })
            .collect()
    }

    fn registered(ctx: &mut CmContext, notify: bool) -> CepId {
        let id = ctx.create_cep(CepType::UnreliableDatagram, Some(RecordingHandler::new()));
        ctx.modify_cep(id, CepOption::SidrRegisterNotify(notify)).unwrap();
        ctx.sidr_register(id, &SidrRegisterInfo { service_id: 0x77, qpn: 0x42, qkey: 0x1111 }).unwrap();
        id
    }

    fn query(ctx: &mut CmContext, service_id: u64) -> (CepId, SidrReqMessage) {
        let id = ctx.create_cep(CepType::UnreliableDatagram, Some(RecordingHandler::new()));
        ctx.sidr_query(id, &SidrQuery { service_id, path: path(1, 2), partition_key: 0, private_data: vec![1] }).unwrap();
        match sent(ctx).pop() {
            Some(CmMessage::SidrReq(req)) => (id, req),
            other => panic!("expected a SIDR_REQ, got {:?}", other),
        }
    }

    #[rstest]
    #[case(0, 8 + 2)]
    #[case(16, 8 + 2 * 269)]
    #[case(31, 8796093)]
    fn test_sidr_timeout(#[case] pkt_life_time: u8, #[case] expected: u64) {
        assert_eq!(sidr_timeout_ms(&CmConfig::default(), pkt_life_time), expected);
    }

    #[test]
    fn test_unregistered_service_is_not_supported() {
        let mut client = context(1);
        let mut server = context(2);
        let (id, req) = query(&mut client, 0x99);

        let req_id = req.request_id;
        assert_eq!(server.on_sidr_req(req, 5, mad_address(2, 1)).unwrap(), DispatchOutcome::Rejected);
        assert!(server.ceps.is_empty());
        let Some(CmMessage::SidrResp(resp)) = sent(&mut server).pop() else { panic!("no SIDR_RESP") };
        assert_eq!(resp.status, SidrStatus::SidNotSupported);

        assert_eq!(client.on_sidr_resp(resp, mad_address(1, 2)).unwrap(), DispatchOutcome::Processed);
        let cep = client.ceps.get(id).unwrap();
        assert_eq!(cep.state, CepState::Idle);
        assert!(cep.events.contains(CepEvents::RCVD_SIDR_RESP));
        assert!(is_message(cep, |m| matches!(m, CmMessage::SidrResp(r) if r.status == SidrStatus::SidNotSupported)));
        assert!(client.maps.by_query(req_id).is_none());
    }

    #[test]
    fn test_registration_without_notify_answers_directly() {
        let mut client = context(1);
        let mut server = context(2);
        registered(&mut server, false);
        let (_, req) = query(&mut client, 0x77);

        assert_eq!(server.on_sidr_req(req, 5, mad_address(2, 1)).unwrap(), DispatchOutcome::Processed);
        let Some(CmMessage::SidrResp(resp)) = sent(&mut server).pop() else { panic!("no SIDR_RESP") };
        assert_eq!((resp.status, resp.qpn, resp.qkey), (SidrStatus::ValidQpn, 0x42, 0x1111));
    }

    #[test]
    fn test_notified_registration_queues_and_answers() {
        let mut client = context(1);
        let mut server = context(2);
        let reg = registered(&mut server, true);
        let (_, req) = query(&mut client, 0x77);

        assert_eq!(server.on_sidr_req(req.clone(), 5, mad_address(2, 1)).unwrap(), DispatchOutcome::Processed);
        assert_eq!(server.on_sidr_req(req, 5, mad_address(2, 1)).unwrap(), DispatchOutcome::Duplicate);
        assert_eq!(server.ceps.get(reg).unwrap().pending.len(), 1);
        sent(&mut server);

        server.sidr_response(reg, &SidrResponse { status: SidrStatus::ValidQpn, qpn: 0x43, qkey: 0x2222, private_data: vec![] }).unwrap();
        let Some(CmMessage::SidrResp(resp)) = sent(&mut server).pop() else { panic!("no SIDR_RESP") };
        assert_eq!(resp.qpn, 0x43);
        assert!(server.ceps.get(reg).unwrap().pending.is_empty());
        assert_eq!(server.ceps.len(), 1);

        assert!(matches!(
            server.sidr_response(reg, &SidrResponse { status: SidrStatus::ValidQpn, qpn: 0, qkey: 0, private_data: vec![] }),
            Err(CmError::NotFound)
        ));
    }

    #[test]
    fn test_duplicate_registration() {
        let mut server = context(2);
        registered(&mut server, false);
        let other = server.create_cep(CepType::UnreliableDatagram, None);
        assert!(matches!(
            server.sidr_register(other, &SidrRegisterInfo { service_id: 0x77, qpn: 1, qkey: 1 }),
            Err(CmError::AddrInUse)
        ));
    }

    #[test]
    fn test_deregister_drops_pending_requests() {
        let mut client = context(1);
        let mut server = context(2);
        let reg = registered(&mut server, true);
        let (_, req) = query(&mut client, 0x77);
        server.on_sidr_req(req.clone(), 5, mad_address(2, 1)).unwrap();

        server.sidr_deregister(reg).unwrap();
        assert_eq!(server.ceps.len(), 1);
        assert_eq!(server.ceps.get(reg).unwrap().state, CepState::Idle);
        assert_eq!(server.on_sidr_req(req, 5, mad_address(2, 1)).unwrap(), DispatchOutcome::Rejected);
    }
}
