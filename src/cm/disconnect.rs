use tracing::{debug, trace, warn};

use crate::cm::active::idle_error;
use crate::cm::cep::{CepEvents, CepMode, CepState};
use crate::cm::cep_arena::CepId;
use crate::cm::cm_error::CmError;
use crate::cm::context::{cep_to_idle, set_notification, to_timewait, CmContext};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::formats;
use crate::cm::params::Disconnect;
use crate::messaging::cm_messages::{CmMad, CmMessage, DrepMessage, DreqMessage};
use crate::messaging::transport::MadAddress;
use crate::util::time::timeout_mult_to_ms;


impl CmContext {
    /// Start a disconnect with a DREQ, or answer the remote side's DREQ with a DREP
    pub fn disconnect(&mut self, id: CepId, how: &Disconnect) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        let state = cep.state;
        match (state, how) {
            (s, Disconnect::Request { private_data }) if s.is_connected() => {
                let dreq = formats::dreq(cep.local_comm_id, cep.remote_comm_id, cep.remote_endpoint.qpn, private_data)
                    .map_err(|e| CmError::invalid_parameter(e.to_string()))?;
                if matches!(s, CepState::LapSent | CepState::MraLapRcvd) {
                    cep.stop_timer();
                }
                let mad = CmMad::send(cep.transaction_id, dreq);
                self.out.send_for(id, cep, mad);
                cep.state = CepState::DreqSent;
                cep.retries = 0;
                let lcm = timeout_mult_to_ms(cep.local_cm_timeout);
                self.out.start_timer(id, cep, lcm);
                debug!(cep = %id, lcid = cep.local_comm_id, "DREQ sent");
                Ok(())
            }
            (CepState::DreqRcvd, Disconnect::Reply { private_data }) => {
                let drep = formats::drep(cep.local_comm_id, cep.remote_comm_id, private_data)
                    .map_err(|e| CmError::invalid_parameter(e.to_string()))?;
                let mad = CmMad::send(cep.transaction_id, drep);
                self.out.send_for(id, cep, mad);
                debug!(cep = %id, lcid = cep.local_comm_id, "DREP sent");
                to_timewait(&mut self.out, id, cep);
                Ok(())
            }
            (CepState::SimDreqRcvd, Disconnect::Reply { .. }) => {
                // the remote side rejected instead of disconnecting, so it expects no DREP
                to_timewait(&mut self.out, id, cep);
                Ok(())
            }
            (CepState::DreqRcvd | CepState::SimDreqRcvd, Disconnect::Request { .. }) => Err(CmError::AlreadyDisconnecting),
            (CepState::Idle, _) => Err(idle_error(cep)),
            (s, _) => Err(CmError::InvalidState(s)),
        }
    }

    pub(crate) fn on_dreq(&mut self, dreq: DreqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(dreq.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let state = self.ceps.get(id)?.state;
        if state.is_connected() || state.is_disconnecting() {
            self.dreq_cep(id, dreq, tid, from)
        }
        else {
            Ok(DispatchOutcome::NoMatch)
        }
    }

    /// Handle a DREQ for a specific CEP, received or synthesized from a stale REQ
    pub(crate) fn dreq_cep(&mut self, id: CepId, dreq: DreqMessage, tid: u64, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let cep = self.ceps.get_mut(id)?;
        let state = cep.state;
        match state {
            CepState::Established | CepState::LapSent | CepState::MraLapRcvd | CepState::LapRcvd | CepState::MraLapSent => {
                cep.stop_timer();
                cep.received = Some(CmMessage::Dreq(dreq));
                cep.address = Some(from);
                cep.state = CepState::DreqRcvd;
                cep.start_elapsed();
                debug!(cep = %id, lcid = cep.local_comm_id, "DREQ received");
                set_notification(&mut self.out, id, cep, CepEvents::RCVD_DREQ);
                Ok(DispatchOutcome::Processed)
            }
            CepState::DreqRcvd => {
                trace!(cep = %id, "duplicate DREQ");
                Ok(DispatchOutcome::Duplicate)
            }
            CepState::DreqSent => {
                // both sides disconnect at the same time
                cep.stop_timer();
                cep.received = Some(CmMessage::Dreq(dreq));
                cep.address = Some(from);
                cep.state = CepState::DreqRcvd;
                debug!(cep = %id, "DREQ crossed ours");
                if !set_notification(&mut self.out, id, cep, CepEvents::RCVD_DREQ) {
                    // nobody is left to answer it
                    self.disconnect(id, &Disconnect::Reply { private_data: Vec::new() })?;
                }
                Ok(DispatchOutcome::Processed)
            }
            CepState::SimDreqRcvd | CepState::Timewait => {
                if cep.send_in_flight {
                    return Ok(DispatchOutcome::Duplicate);
                }
                let drep = formats::drep(cep.local_comm_id, cep.remote_comm_id, &[])?;
                trace!(cep = %id, ?state, "answering DREQ with DREP again");
                self.out.send(from, CmMad::send(tid, drep));
                Ok(DispatchOutcome::Duplicate)
            }
            _ => Ok(DispatchOutcome::Discarded),
        }
    }

    pub(crate) fn on_drep(&mut self, drep: DrepMessage, from: MadAddress) -> anyhow::Result<DispatchOutcome> {
        let Some(id) = self.maps.by_comm_id(drep.remote_comm_id) else {
            return Ok(DispatchOutcome::NoMatch);
        };
        let cep = self.ceps.get_mut(id)?;
        if cep.state != CepState::DreqSent {
            return Ok(DispatchOutcome::Discarded);
        }
        cep.stop_timer();
        cep.received = Some(CmMessage::Drep(drep));
        cep.address = Some(from);
        debug!(cep = %id, lcid = cep.local_comm_id, "DREP received");
        to_timewait(&mut self.out, id, cep);
        set_notification(&mut self.out, id, cep, CepEvents::RCVD_DREP);
        Ok(DispatchOutcome::Processed)
    }

    /// Abandon a disconnecting CEP without waiting for the protocol to complete
    pub(crate) fn shutdown_a(&mut self, id: CepId) -> Result<(), CmError> {
        let cep = self.ceps.get_mut(id)?;
        match cep.state {
            CepState::DreqSent | CepState::DreqRcvd | CepState::SimDreqRcvd => {
                cep_to_idle(&mut self.maps, id, cep);
                set_notification(&mut self.out, id, cep, CepEvents::SYSTEM_DISCONNECT);
            }
            CepState::Timewait => {
                cep_to_idle(&mut self.maps, id, cep);
                if cep.pending_destroy && cep.callback_refs == 0 {
                    self.remove_cep(id);
                }
                else if cep.timewait_callback {
                    set_notification(&mut self.out, id, cep, CepEvents::SYSTEM_DISCONNECT);
                }
            }
            s => return Err(CmError::InvalidState(s)),
        }
        Ok(())
    }

    /// A channel adapter went away: tear down everything bound to it
    pub fn shutdown_ca(&mut self, ca_guid: u64) {
        let affected: Vec<CepId> = self.ceps.ids()
            .into_iter()
            .filter(|id| self.ceps.get(*id)
                .map(|c| c.local_endpoint.ca_guid == ca_guid)
                .unwrap_or(false))
            .collect();
        debug!(ca = format!("0x{:x}", ca_guid), ceps = affected.len(), "CA removed");

        for id in affected {
            let Ok(cep) = self.ceps.get(id) else {
                // a listener's child, already gone with it
                continue;
            };
            let (state, mode) = (cep.state, cep.mode);
            let result = match state {
                CepState::Idle | CepState::Registered => Ok(()),
                CepState::Listen | CepState::SidrReqRcvd => self.cancel_p(id),
                CepState::SidrReqSent => self.cancel_a(id),
                s if s.is_connecting() => {
                    if mode == CepMode::Passive {
                        self.cancel_p(id)
                    }
                    else {
                        self.cancel_a(id)
                    }
                }
                s if s.is_connected() => self.disconnect(id, &Disconnect::Request { private_data: Vec::new() }),
                _ => self.shutdown_a(id),
            };
            if let Err(e) = result {
                warn!(cep = %id, ?state, "ignoring error while shutting down: {}", e);
            }
        }
    }
}
