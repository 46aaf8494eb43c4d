//! Timer expiry: retransmission while retries are left, then the per-state timeout transition

use tracing::{debug, trace, warn};

use crate::cm::cep::{CepEvents, CepState};
use crate::cm::cep_arena::CepId;
use crate::cm::context::{cep_to_idle, event_set, set_notification, to_timewait, CmContext};
use crate::cm::formats;
use crate::cm::sidr::sidr_timeout_ms;
use crate::messaging::cm_messages::CmMad;
use crate::messaging::codes::{RejectReason, RejectedMessage};
use crate::util::time::timeout_mult_to_ms;


impl CmContext {
    /// Handle the expiry of the timer armed with `generation`. Expiries of timers that were
    ///  stopped or re-armed since are ignored.
    pub fn on_timer(&mut self, id: CepId, generation: u64) {
        let Ok(cep) = self.ceps.get_mut(id) else {
            trace!(cep = %id, "timer for a destroyed CEP");
            return;
        };
        if cep.timer.as_ref().map(|t| t.generation) != Some(generation) {
            trace!(cep = %id, generation, "stale timer");
            return;
        }
        cep.timer = None;

        let retry = cep.retries < cep.max_cm_retries;
        let lcm_ms = timeout_mult_to_ms(cep.local_cm_timeout);
        if retry && matches!(cep.state,
            CepState::ReqSent | CepState::RepWait | CepState::RepSent | CepState::MraRepRcvd |
            CepState::LapSent | CepState::MraLapRcvd | CepState::DreqSent) {
            cep.retries += 1;
            debug!(cep = %id, state = ?cep.state, retry = cep.retries, "retransmitting");
            self.out.resend(id, cep);
            cep.state = match cep.state {
                CepState::ReqSent | CepState::RepWait => CepState::ReqSent,
                CepState::RepSent | CepState::MraRepRcvd => CepState::RepSent,
                CepState::LapSent | CepState::MraLapRcvd => CepState::LapSent,
                other => other,
            };
            self.out.start_timer(id, cep, lcm_ms);
            return;
        }

        match cep.state {
            CepState::ReqSent | CepState::RepWait => {
                debug!(cep = %id, "connect timed out");
                if cep.peer && !cep.remote_endpoint.is_bound() {
                    self.maps.remove_listen(cep.service_id, id);
                }
                if let Some(to) = cep.address {
                    let rej = formats::rej(RejectedMessage::Reply, RejectReason::Timeout, cep.local_comm_id, cep.remote_comm_id);
                    self.out.send(to, CmMad::send(cep.transaction_id, rej));
                }
                cep_to_idle(&mut self.maps, id, cep);
                cep.retries = 0;
                set_notification(&mut self.out, id, cep, CepEvents::TIMEOUT_REQ);
            }
            CepState::RepSent | CepState::MraRepRcvd => {
                debug!(cep = %id, "accept timed out");
                if let Some(to) = cep.address {
                    let rej = formats::rej(RejectedMessage::Request, RejectReason::Timeout, cep.local_comm_id, cep.remote_comm_id);
                    self.out.send(to, CmMad::send(cep.transaction_id, rej));
                }
                cep.retries = 0;
                if cep.timewait_callback {
                    // reported once the CEP is through Timewait
                    to_timewait(&mut self.out, id, cep);
                    event_set(&mut self.out, cep, CepEvents::TIMEOUT_REP);
                }
                else {
                    cep_to_idle(&mut self.maps, id, cep);
                    if cep.async_accept {
                        set_notification(&mut self.out, id, cep, CepEvents::TIMEOUT_REP);
                    }
                    else {
                        // wakes the synchronous accept
                        event_set(&mut self.out, cep, CepEvents::TIMEOUT_REP);
                    }
                }
            }
            CepState::LapSent | CepState::MraLapRcvd => {
                debug!(cep = %id, "alternate path request timed out");
                cep.failover_supported = false;
                cep.retries = 0;
                cep.state = CepState::Established;
                set_notification(&mut self.out, id, cep, CepEvents::TIMEOUT_LAP);
            }
            CepState::DreqSent => {
                debug!(cep = %id, "disconnect request timed out");
                to_timewait(&mut self.out, id, cep);
                cep.retries = 0;
                if !cep.timewait_callback {
                    set_notification(&mut self.out, id, cep, CepEvents::TIMEOUT_DREQ);
                }
            }
            CepState::Timewait => {
                trace!(cep = %id, "Timewait over");
                cep_to_idle(&mut self.maps, id, cep);
                cep.local_cm_timeout = 0;
                cep.remote_cm_timeout = 0;
                cep.max_cm_retries = 0;
                cep.retries = 0;
                if cep.pending_destroy && cep.callback_refs == 0 {
                    self.remove_cep(id);
                    return;
                }
                if cep.timewait_callback {
                    set_notification(&mut self.out, id, cep, CepEvents::TIMEOUT_TIMEWAIT);
                }
            }
            CepState::SidrReqSent => {
                if retry {
                    cep.retries += 1;
                    debug!(cep = %id, retry = cep.retries, "retransmitting SIDR_REQ");
                    self.out.resend(id, cep);
                    let timeout = sidr_timeout_ms(&self.config, cep.pkt_life_time);
                    self.out.start_timer(id, cep, timeout);
                    return;
                }
                debug!(cep = %id, "SIDR query timed out");
                self.maps.remove_query(cep.local_comm_id);
                cep_to_idle(&mut self.maps, id, cep);
                cep.retries = 0;
                set_notification(&mut self.out, id, cep, CepEvents::TIMEOUT_SIDR_REQ);
            }
            other => {
                warn!(cep = %id, state = ?other, "timer expired in a state without a timeout");
            }
        }
    }
}
