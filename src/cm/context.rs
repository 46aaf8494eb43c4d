use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};

use crate::cm::cep::{Cep, CepEvents, CepMode, CepState, CepTimer, Endpoint, Outbound};
use crate::cm::cep_arena::{CepArena, CepId};
use crate::cm::cm_config::CmConfig;
use crate::cm::cm_stats::CmStats;
use crate::cm::identity_maps::IdentityMaps;
use crate::cm::port_resolver::PortResolver;
use crate::messaging::cm_messages::{CmMad, CmMessage};
use crate::messaging::mad::MAD_METHOD_GET_RESP;
use crate::messaging::transport::MadAddress;
use crate::util::random::{Random, RngRandom};
use crate::util::time::{timeout_mult_to_ms, timeout_us_to_mult};


/// Side effects of protocol processing. They are collected while the context is locked, and
///  executed by the connection manager after the lock is released.
#[derive(Debug)]
pub enum Effect {
    Send {
        to: MadAddress,
        mad: CmMad,
        /// the CEP whose send-in-flight flag is cleared when the send completes
        cep: Option<CepId>,
    },
    ArmTimer {
        cep: CepId,
        generation: u64,
        duration: Duration,
    },
    /// run the CEP's event handler
    Deliver(CepId),
    /// wake up callers of `wait`
    WakeWaiters,
}

#[derive(Default)]
pub struct Outbox {
    effects: Vec<Effect>,
    timer_generation: u64,
}

impl Outbox {
    /// a datagram that belongs to no CEP, e.g. a rejection of an unmatched request
    pub fn send(&mut self, to: MadAddress, mad: CmMad) {
        self.effects.push(Effect::Send { to, mad, cep: None });
    }

    /// Send a CEP's datagram for the current protocol phase, keeping it for retransmission
    pub fn send_for(&mut self, id: CepId, cep: &mut Cep, mad: CmMad) {
        let Some(to) = cep.address else {
            warn!(cep = %id, "no address to send {} to, dropping it", mad.message.name());
            return;
        };
        cep.outbound = Some(Outbound { to, mad: mad.clone() });
        cep.send_in_flight = true;
        cep.start_elapsed();
        self.effects.push(Effect::Send { to, mad, cep: Some(id) });
    }

    /// Retransmit the current phase's datagram. A send that has not completed yet is not
    ///  duplicated.
    pub fn resend(&mut self, id: CepId, cep: &mut Cep) {
        if cep.send_in_flight {
            trace!(cep = %id, "previous send still in flight, skipping retransmission");
            return;
        }
        let Some(outbound) = &cep.outbound else {
            return;
        };
        let (to, mad) = (outbound.to, outbound.mad.clone());
        cep.send_in_flight = true;
        cep.start_elapsed();
        self.effects.push(Effect::Send { to, mad, cep: Some(id) });
    }

    /// (Re)start a CEP's timer. An expiry of any earlier timer of the same CEP is stale from here on.
    pub fn start_timer(&mut self, id: CepId, cep: &mut Cep, duration_ms: u64) {
        self.timer_generation += 1;
        cep.timer = Some(CepTimer {
            generation: self.timer_generation,
            duration_ms,
        });
        self.effects.push(Effect::ArmTimer {
            cep: id,
            generation: self.timer_generation,
            duration: Duration::from_millis(duration_ms),
        });
    }

    pub fn deliver(&mut self, id: CepId) {
        self.effects.push(Effect::Deliver(id));
    }

    pub fn wake_waiters(&mut self) {
        if !matches!(self.effects.last(), Some(Effect::WakeWaiters)) {
            self.effects.push(Effect::WakeWaiters);
        }
    }

    pub fn take(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    #[cfg(test)]
    pub fn peek(&self) -> &[Effect] {
        &self.effects
    }
}


/// Exponentially smoothed estimate of the remote CM's processing time
#[derive(Debug, Clone, Copy)]
pub struct Turnaround {
    estimate_us: u64,
    min_us: u64,
    max_us: u64,
}

impl Turnaround {
    pub fn new(config: &CmConfig) -> Turnaround {
        Turnaround {
            estimate_us: config.initial_turnaround_us(),
            min_us: config.min_turnaround.as_micros() as u64,
            max_us: config.max_turnaround.as_micros() as u64,
        }
    }

    pub fn estimate_us(&self) -> u64 {
        self.estimate_us
    }

    fn smoothed(&self, elapsed_us: u64) -> u64 {
        ((103 * self.estimate_us + 25 * elapsed_us) / 128)
            .clamp(self.min_us, self.max_us)
    }

    pub fn update(&mut self, elapsed_us: u64) {
        self.estimate_us = self.smoothed(elapsed_us);
    }

    /// A duplicate means the peer did not hear from us in time: count the round trip twice,
    ///  and never let it lower the estimate.
    pub fn update_for_duplicate(&mut self, elapsed_us: u64) {
        let candidate = self.smoothed(elapsed_us.saturating_mul(2));
        if candidate > self.estimate_us {
            self.estimate_us = candidate;
        }
    }

    /// The service time we may need for answering, as a timeout multiplier
    pub fn worst_service_time_mult(&self, cep: &Cep) -> u8 {
        if cep.turnaround_us != 0 {
            timeout_us_to_mult(cep.turnaround_us)
        }
        else {
            timeout_us_to_mult(self.estimate_us.saturating_mul(8))
        }
    }

    /// the CEP's declared turnaround time, or the estimate
    pub fn for_cep(&self, cep: &Cep) -> u64 {
        if cep.turnaround_us != 0 {
            cep.turnaround_us
        }
        else {
            self.estimate_us
        }
    }
}


/// Generators for local communication ids and starting packet sequence numbers
pub struct IdGenerator {
    next_comm_id: u32,
    next_psn: u32,
}

impl IdGenerator {
    pub fn new_with_random<R: Random>() -> IdGenerator {
        IdGenerator {
            next_comm_id: R::next_u32(),
            next_psn: R::next_u32() & 0xff_ffff,
        }
    }

    /// next id that is neither zero nor held by a live CEP
    pub fn comm_id(&mut self, maps: &IdentityMaps) -> u32 {
        loop {
            self.next_comm_id = self.next_comm_id.wrapping_add(1);
            if self.next_comm_id != 0 && !maps.comm_id_in_use(self.next_comm_id) {
                return self.next_comm_id;
            }
        }
    }

    pub fn psn(&mut self) -> u32 {
        self.next_psn = (self.next_psn + 1025) & 0xff_ffff;
        self.next_psn
    }
}


/// All protocol state of one connection manager. Every method runs with the context locked
///  and only records side effects in the outbox.
pub struct CmContext {
    pub(crate) config: Arc<CmConfig>,
    pub(crate) resolver: Arc<dyn PortResolver>,
    pub(crate) ceps: CepArena,
    pub(crate) maps: IdentityMaps,
    pub(crate) out: Outbox,
    pub(crate) stats: CmStats,
    pub(crate) turnaround: Turnaround,
    pub(crate) ids: IdGenerator,
}

impl CmContext {
    pub fn new(config: Arc<CmConfig>, resolver: Arc<dyn PortResolver>) -> CmContext {
        Self::new_with_random::<RngRandom>(config, resolver)
    }

    pub fn new_with_random<R: Random>(config: Arc<CmConfig>, resolver: Arc<dyn PortResolver>) -> CmContext {
        CmContext {
            turnaround: Turnaround::new(&config),
            config,
            resolver,
            ceps: CepArena::default(),
            maps: IdentityMaps::default(),
            out: Outbox::default(),
            stats: CmStats::default(),
            ids: IdGenerator::new_with_random::<R>(),
        }
    }

    /// Hand over the side effects collected so far, counting the outbound datagrams
    pub fn take_effects(&mut self) -> Vec<Effect> {
        let effects = self.out.take();
        for effect in &effects {
            if let Effect::Send { mad, .. } = effect {
                self.stats.sent.count(&mad.message, mad.header.method == MAD_METHOD_GET_RESP);
            }
        }
        effects
    }

    pub fn stats(&self) -> CmStats {
        self.stats
    }

    /// completion of a send that was issued for a CEP
    pub fn on_send_done(&mut self, id: CepId) {
        if let Ok(cep) = self.ceps.get_mut(id) {
            cep.send_in_flight = false;
        }
    }

    /// Give a CEP a fresh local comm id and register it
    pub(crate) fn assign_comm_id(&mut self, id: CepId) -> Result<u32, crate::cm::cm_error::CmError> {
        let lcid = self.ids.comm_id(&self.maps);
        let cep = self.ceps.get_mut(id)?;
        self.maps.remove_comm_id(cep.local_comm_id, id);
        cep.local_comm_id = lcid;
        self.maps.insert_comm_id(lcid, id);
        Ok(lcid)
    }
}


/// Return a CEP to Idle, releasing everything that identifies it. The CEP must not be on any
///  listen or query map any more, and must have no pending children.
pub fn cep_to_idle(maps: &mut IdentityMaps, id: CepId, cep: &mut Cep) {
    debug_assert!(cep.pending.is_empty());
    maps.remove_endpoints(id, cep);
    maps.remove_comm_id(cep.local_comm_id, id);
    cep.local_comm_id = 0;
    cep.local_endpoint = Endpoint::default();
    cep.remote_endpoint = Endpoint::default();
    cep.peer = false;
    cep.lap_sent = false;
    cep.target_ack_delay = 0;
    cep.stop_timer();
    trace!(cep = %id, from = ?cep.state, "to Idle");
    cep.state = CepState::Idle;
}

pub fn to_timewait(out: &mut Outbox, id: CepId, cep: &mut Cep) {
    trace!(cep = %id, from = ?cep.state, timewait = cep.timewait, "to Timewait");
    cep.state = CepState::Timewait;
    out.start_timer(id, cep, timeout_mult_to_ms(cep.timewait));
}

/// Record events without running the handler, only waking `wait` callers
pub fn event_set(out: &mut Outbox, cep: &mut Cep, events: CepEvents) {
    cep.events |= events;
    out.wake_waiters();
}

/// Record events and schedule the CEP's handler. At most one delivery per CEP is queued at a
///  time; further notifications are picked up when the running one is done. Returns false
///  if the CEP is being destroyed.
pub fn set_notification(out: &mut Outbox, id: CepId, cep: &mut Cep, events: CepEvents) -> bool {
    if cep.pending_destroy {
        return false;
    }
    cep.events |= events;
    if cep.handler.is_some() {
        cep.callback_refs += 1;
        if cep.callback_refs == 1 {
            out.deliver(id);
        }
    }
    out.wake_waiters();
    true
}

/// an Idle CEP with nothing left to report forgets which side it was on
pub fn idle_mode_reset(cep: &mut Cep) {
    if cep.state == CepState::Idle && cep.events.is_empty() {
        cep.mode = CepMode::None;
    }
}

pub fn is_message<F: Fn(&CmMessage) -> bool>(cep: &Cep, f: F) -> bool {
    cep.received.as_ref().map(f).unwrap_or(false)
}
