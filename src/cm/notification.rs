use async_trait::async_trait;
use tracing::{debug, trace};

use crate::cm::cep::CepState;
use crate::cm::cep_arena::CepId;
use crate::cm::conn_info::ConnInfo;
use crate::cm::connection_manager::ConnectionManager;
use crate::cm::context::CmContext;


/// Receives the events of a CEP. Calls for the same CEP are serialized, and they happen
///  without the connection manager's state being locked, so an implementation may call back
///  into the connection manager.
#[async_trait]
pub trait CmEventHandler: Send + Sync + 'static {
    async fn on_event(&self, cm: &ConnectionManager, cep: CepId, info: ConnInfo);
}


/// What the notification worker does for a queued CEP
pub enum Delivery {
    /// the CEP is gone or being destroyed, there is nothing left to report
    Skip,
    /// the CEP's events do not map to anything reportable right now
    Nothing,
    Report(ConnInfo),
}

impl CmContext {
    /// Called by the notification worker, before running the CEP's handler
    pub fn begin_delivery(&mut self, id: CepId) -> Delivery {
        let Ok(cep) = self.ceps.get(id) else {
            return Delivery::Skip;
        };
        if cep.pending_destroy {
            trace!(cep = %id, "destroy pending, no callback");
            return Delivery::Skip;
        }
        match self.get_conn_info(id) {
            Some(info) => Delivery::Report(info),
            None => Delivery::Nothing,
        }
    }

    /// Called after the handler returned (or after nothing was reported). Completes a deferred
    ///  destroy, or queues the CEP again for notifications that arrived in the meantime.
    pub fn done_callback(&mut self, id: CepId) {
        let Ok(cep) = self.ceps.get_mut(id) else {
            return;
        };
        cep.callback_refs = cep.callback_refs.saturating_sub(1);

        if cep.pending_destroy {
            cep.callback_refs = 0;
            if cep.state == CepState::Idle {
                debug!(cep = %id, "completing deferred destroy");
                self.remove_cep(id);
            }
        }
        else if cep.callback_refs > 0 {
            self.out.deliver(id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::cm::cep::{Cep, CepEvents};
    use crate::cm::cm_config::CmConfig;
    use crate::cm::context::{set_notification, Effect};
    use crate::messaging::codes::CepType;
    use crate::test_util::fabric::{static_resolver, RecordingHandler};

    fn context() -> CmContext {
        CmContext::new(Arc::new(CmConfig::default()), Arc::new(static_resolver(1)))
    }

    fn deliveries(ctx: &mut CmContext) -> usize {
        ctx.take_effects().iter()
            .filter(|e| matches!(e, Effect::Deliver(_)))
            .count()
    }

    #[test]
    fn test_one_delivery_queued_at_a_time() {
        let mut ctx = context();
        let id = ctx.ceps.insert(Cep::new(CepType::ReliableConnection, Some(RecordingHandler::new())));

        let cep = ctx.ceps.get_mut(id).unwrap();
        set_notification(&mut ctx.out, id, cep, CepEvents::RCVD_REP);
        set_notification(&mut ctx.out, id, cep, CepEvents::RCVD_RTU);
        assert_eq!(deliveries(&mut ctx), 1);
        assert_eq!(ctx.ceps.get(id).unwrap().callback_refs, 2);

        ctx.done_callback(id);
        assert_eq!(deliveries(&mut ctx), 1);
        ctx.done_callback(id);
        assert_eq!(deliveries(&mut ctx), 0);
        assert_eq!(ctx.ceps.get(id).unwrap().callback_refs, 0);
    }

    #[test]
    fn test_deferred_destroy_completes_when_idle() {
        let mut ctx = context();
        let id = ctx.ceps.insert(Cep::new(CepType::ReliableConnection, Some(RecordingHandler::new())));
        let cep = ctx.ceps.get_mut(id).unwrap();
        set_notification(&mut ctx.out, id, cep, CepEvents::USER_CANCEL);
        set_notification(&mut ctx.out, id, cep, CepEvents::USER_CANCEL);
        cep.pending_destroy = true;

        assert!(matches!(ctx.begin_delivery(id), Delivery::Skip));
        ctx.done_callback(id);
        assert!(!ctx.ceps.contains(id));
    }

    #[test]
    fn test_deferred_destroy_waits_for_idle() {
        let mut ctx = context();
        let id = ctx.ceps.insert(Cep::new(CepType::ReliableConnection, Some(RecordingHandler::new())));
        let cep = ctx.ceps.get_mut(id).unwrap();
        cep.state = CepState::Timewait;
        cep.callback_refs = 1;
        cep.pending_destroy = true;

        ctx.done_callback(id);
        let cep = ctx.ceps.get(id).unwrap();
        assert_eq!(cep.callback_refs, 0);
        assert_eq!(cep.state, CepState::Timewait);
    }
}
