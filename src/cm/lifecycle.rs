use std::sync::Arc;
use tracing::{debug, trace};

use crate::cm::cep::{Cep, CepEvents, CepMode, CepState, Discriminator};
use crate::cm::cep_arena::CepId;
use crate::cm::cm_error::CmError;
use crate::cm::context::{set_notification, CmContext};
use crate::cm::notification::CmEventHandler;
use crate::cm::params::{CepOption, Disconnect, RejectInfo};
use crate::messaging::codes::{CepType, RejectReason};


impl CmContext {
    pub fn create_cep(&mut self, cep_type: CepType, handler: Option<Arc<dyn CmEventHandler>>) -> CepId {
        let id = self.ceps.insert(Cep::new(cep_type, handler));
        trace!(cep = %id, ?cep_type, "created");
        id
    }

    /// Destroy a CEP, first cancelling, rejecting or disconnecting whatever it is doing. A
    ///  connection that still has to go through Timewait, or a CEP whose handler is running, is
    ///  only marked; it is removed once it is Idle and the handler returned.
    pub fn destroy_cep(&mut self, id: CepId) -> Result<(), CmError> {
        let state = self.ceps.get(id)?.state;
        debug!(cep = %id, ?state, "destroying");
        match state {
            CepState::Idle => {}
            CepState::ReqSent | CepState::RepWait | CepState::SidrReqSent => self.cancel_a(id)?,
            CepState::RepRcvd | CepState::MraRepSent => self.reject_a(id, &RejectInfo::new(RejectReason::UserRej))?,
            CepState::Listen | CepState::ReqRcvd | CepState::MraReqSent |
            CepState::RepSent | CepState::MraRepRcvd | CepState::SidrReqRcvd => self.cancel_p(id)?,
            CepState::Registered => {
                self.sidr_deregister(id)?;
                let cep = self.ceps.get_mut(id)?;
                set_notification(&mut self.out, id, cep, CepEvents::USER_CANCEL);
            }
            CepState::Established | CepState::LapSent | CepState::MraLapRcvd | CepState::LapRcvd | CepState::MraLapSent => {
                self.disconnect(id, &Disconnect::Request { private_data: Vec::new() })?;
                self.ceps.get_mut(id)?.pending_destroy = true;
                return Ok(());
            }
            CepState::DreqRcvd | CepState::SimDreqRcvd => {
                self.disconnect(id, &Disconnect::Reply { private_data: Vec::new() })?;
                self.ceps.get_mut(id)?.pending_destroy = true;
                return Ok(());
            }
            CepState::DreqSent | CepState::Timewait => {
                self.ceps.get_mut(id)?.pending_destroy = true;
                return Ok(());
            }
        }

        let cep = self.ceps.get_mut(id)?;
        if cep.callback_refs > 0 {
            trace!(cep = %id, refs = cep.callback_refs, "handler running, destroy deferred");
            cep.pending_destroy = true;
        }
        else {
            self.remove_cep(id);
        }
        Ok(())
    }

    pub fn modify_cep(&mut self, id: CepId, option: CepOption) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        if let CepOption::Apm(enabled) = &option {
            if cep.mode == CepMode::Active {
                return Err(CmError::InvalidState(cep.state));
            }
            cep.failover_supported = *enabled;
            return Ok(());
        }
        if cep.state != CepState::Idle {
            return Err(CmError::InvalidState(cep.state));
        }
        trace!(cep = %id, ?option, "modify");
        match option {
            CepOption::ListenDiscriminator { data, offset } => {
                if data.is_empty() || data.len() + offset > self.config.max_discriminator_len {
                    return Err(CmError::invalid_parameter(format!(
                        "discriminator of {} bytes at offset {} exceeds {} bytes", data.len(), offset, self.config.max_discriminator_len)));
                }
                cep.discriminator = Some(Discriminator { data, offset });
            }
            CepOption::NoListenDiscriminator => cep.discriminator = None,
            CepOption::ListenBacklog(backlog) => cep.listen_backlog = backlog,
            CepOption::SidrRegisterNotify(notify) => cep.sidr_notify = notify,
            CepOption::AsyncAccept(async_accept) => cep.async_accept = async_accept,
            CepOption::TimewaitCallback(callback) => cep.timewait_callback = callback,
            // slow applications may announce any upper bound
            CepOption::TurnaroundTime(us) => cep.turnaround_us = us.max(self.config.min_turnaround.as_micros() as u64),
            CepOption::Apm(_) => {}
        }
        Ok(())
    }

    /// Drop a CEP and every map entry that still refers to it. Children that are still pending
    ///  go with it.
    pub(crate) fn remove_cep(&mut self, id: CepId) {
        self.leave_pending(id);
        let Some(cep) = self.ceps.remove(id) else {
            return;
        };
        self.maps.remove_endpoints(id, &cep);
        self.maps.remove_comm_id(cep.local_comm_id, id);
        if cep.service_id != 0 {
            self.maps.remove_listen(cep.service_id, id);
        }
        if self.maps.by_query(cep.local_comm_id) == Some(id) {
            self.maps.remove_query(cep.local_comm_id);
        }
        for child_id in cep.pending {
            if let Ok(child) = self.ceps.get_mut(child_id) {
                child.parent = None;
            }
            self.remove_cep(child_id);
        }
        trace!(cep = %id, "removed");
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use crate::cm::cep::Endpoint;
    use crate::cm::cm_config::CmConfig;
    use crate::cm::params::ListenInfo;
    use crate::test_util::fabric::{connect_request, mad_address, static_resolver, RecordingHandler};

    fn context() -> CmContext {
        CmContext::new(Arc::new(CmConfig::default()), Arc::new(static_resolver(1)))
    }

    #[test]
    fn test_destroy_idle_removes() {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, None);
        ctx.destroy_cep(id).unwrap();
        assert!(!ctx.ceps.contains(id));
        assert!(matches!(ctx.destroy_cep(id), Err(CmError::NotFound)));
    }

    #[test]
    fn test_destroy_while_handler_runs_is_deferred() {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, Some(RecordingHandler::new()));
        ctx.connect(id, &connect_request(1, 2, 0x10)).unwrap();
        ctx.destroy_cep(id).unwrap();

        // the cancel queued a delivery
        let cep = ctx.ceps.get(id).unwrap();
        assert_eq!(cep.state, CepState::Idle);
        assert!(cep.pending_destroy);
        ctx.done_callback(id);
        assert!(!ctx.ceps.contains(id));
    }

    #[test]
    fn test_destroy_connected_waits_for_timewait() {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, None);
        let lcid = ctx.assign_comm_id(id).unwrap();
        let cep = ctx.ceps.get_mut(id).unwrap();
        cep.state = CepState::Established;
        cep.mode = CepMode::Active;
        cep.remote_comm_id = lcid.wrapping_add(1);
        cep.remote_endpoint = Endpoint::new(0x102, 5, 0);
        cep.address = Some(mad_address(1, 2));

        ctx.destroy_cep(id).unwrap();
        let cep = ctx.ceps.get(id).unwrap();
        assert_eq!(cep.state, CepState::DreqSent);
        assert!(cep.pending_destroy);
    }

    #[test]
    fn test_destroy_listener_drops_map_entry() {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, None);
        ctx.listen(id, &ListenInfo { service_id: 0x99, ..Default::default() }).unwrap();
        ctx.destroy_cep(id).unwrap();
        assert!(!ctx.maps.is_listening(0x99, id));

        let other = ctx.create_cep(CepType::ReliableConnection, None);
        ctx.listen(other, &ListenInfo { service_id: 0x99, ..Default::default() }).unwrap();
    }

    #[rstest]
    #[case::fits(vec![1, 2, 3], 89, true)]
    #[case::too_long(vec![1, 2, 3], 90, false)]
    #[case::empty(vec![], 0, false)]
    fn test_discriminator_length(#[case] data: Vec<u8>, #[case] offset: usize, #[case] ok: bool) {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, None);
        assert_eq!(ctx.modify_cep(id, CepOption::ListenDiscriminator { data, offset }).is_ok(), ok);
    }

    #[test]
    fn test_modify_requires_idle_except_apm() {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, None);
        ctx.listen(id, &ListenInfo { service_id: 0x99, ..Default::default() }).unwrap();
        assert!(matches!(ctx.modify_cep(id, CepOption::ListenBacklog(4)), Err(CmError::InvalidState(CepState::Listen))));
        ctx.modify_cep(id, CepOption::Apm(true)).unwrap();
        assert!(ctx.ceps.get(id).unwrap().failover_supported);

        let active = ctx.create_cep(CepType::ReliableConnection, None);
        ctx.connect(active, &connect_request(1, 2, 0x10)).unwrap();
        assert!(ctx.modify_cep(active, CepOption::Apm(true)).is_err());
    }

    #[test]
    fn test_turnaround_option_has_lower_bound() {
        let mut ctx = context();
        let id = ctx.create_cep(CepType::ReliableConnection, None);
        ctx.modify_cep(id, CepOption::TurnaroundTime(5)).unwrap();
        assert_eq!(ctx.ceps.get(id).unwrap().turnaround_us, 40_000);
        ctx.modify_cep(id, CepOption::TurnaroundTime(10_000_000)).unwrap();
        assert_eq!(ctx.ceps.get(id).unwrap().turnaround_us, 10_000_000);
    }
}
