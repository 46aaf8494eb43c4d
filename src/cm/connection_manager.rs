use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex as SyncMutex, Weak};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, trace, warn};

use crate::cm::apm::MigratedPaths;
use crate::cm::cep_arena::CepId;
use crate::cm::cm_config::CmConfig;
use crate::cm::cm_error::CmError;
use crate::cm::cm_stats::CmStats;
use crate::cm::conn_info::{CmStatus, ConnInfo};
use crate::cm::context::{CmContext, Effect};
use crate::cm::dispatcher::DispatchOutcome;
use crate::cm::notification::{CmEventHandler, Delivery};
use crate::cm::params::{AcceptInfo, AltPathReply, AltPathRequest, CepOption, ConnectRequest, Disconnect, ListenInfo,
                        RejectInfo, ReplyInfo, SidrQuery, SidrRegisterInfo, SidrResponse};
use crate::cm::port_resolver::PortResolver;
use crate::messaging::codes::{CepType, FailoverReply};
use crate::messaging::transport::{MadAddress, MadTransport};


struct Inner {
    config: Arc<CmConfig>,
    context: Mutex<CmContext>,
    transport: Arc<dyn MadTransport>,
    deliveries: mpsc::Sender<CepId>,
    waiters: Notify,
    /// the most recently armed timer task of each CEP, with its generation
    timers: SyncMutex<FxHashMap<CepId, (u64, JoinHandle<()>)>>,
}

/// The connection manager of one node. Protocol processing happens under a single lock; the
///  datagrams, timers and handler calls it causes are executed after the lock is released.
///  It must be created and used inside a tokio runtime.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl Debug for ConnectionManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionManager{{transport:{:?}}}", self.inner.transport)
    }
}

/// A handle that does not keep the connection manager alive
#[derive(Clone)]
pub struct WeakConnectionManager(Weak<Inner>);
impl WeakConnectionManager {
    pub fn upgrade(&self) -> Option<ConnectionManager> {
        self.0.upgrade().map(|inner| ConnectionManager { inner })
    }
}

impl ConnectionManager {
    pub fn new(config: CmConfig, transport: Arc<dyn MadTransport>, resolver: Arc<dyn PortResolver>) -> anyhow::Result<ConnectionManager> {
        config.validate()?;
        let config = Arc::new(config);
        let (send, recv) = mpsc::channel(config.notification_queue_capacity);

        let cm = ConnectionManager {
            inner: Arc::new(Inner {
                context: Mutex::new(CmContext::new(config.clone(), resolver)),
                config,
                transport,
                deliveries: send,
                waiters: Notify::new(),
                timers: Default::default(),
            }),
        };
        tokio::spawn(run_notification_worker(cm.downgrade(), recv));
        Ok(cm)
    }

    pub fn downgrade(&self) -> WeakConnectionManager {
        WeakConnectionManager(Arc::downgrade(&self.inner))
    }

    /// Run `f` on the locked protocol state, then execute the effects it recorded
    async fn with_context<T>(&self, f: impl FnOnce(&mut CmContext) -> T) -> T {
        let (result, effects) = {
            let mut ctx = self.inner.context.lock().await;
            let result = f(&mut ctx);
            (result, ctx.take_effects())
        };
        self.execute(effects).await;
        result
    }

    async fn execute(&self, effects: Vec<Effect>) {
        let mut completed = Vec::new();
        for effect in effects {
            match effect {
                Effect::Send { to, mad, cep } => {
                    trace!(lid = to.remote_lid, tid = mad.header.transaction_id, "sending {}", mad.message.name());
                    // a lost datagram is recovered by the next retransmission
                    if let Err(e) = self.inner.transport.send(to, &mad.to_bytes()).await {
                        error!("error sending {} to LID {}: {}", mad.message.name(), to.remote_lid, e);
                    }
                    completed.extend(cep);
                }
                Effect::ArmTimer { cep, generation, duration } => {
                    self.arm_timer(cep, generation, duration);
                }
                Effect::Deliver(cep) => {
                    if self.inner.deliveries.send(cep).await.is_err() {
                        warn!(cep = %cep, "notification worker is gone, dropping notification");
                    }
                }
                Effect::WakeWaiters => {
                    self.inner.waiters.notify_waiters();
                }
            }
        }

        if !completed.is_empty() {
            let mut ctx = self.inner.context.lock().await;
            for id in completed {
                ctx.on_send_done(id);
            }
        }
    }

    fn arm_timer(&self, cep: CepId, generation: u64, duration: Duration) {
        let weak = self.downgrade();
        let handle = tokio::spawn(async move {
            time::sleep(duration).await;
            if let Some(cm) = weak.upgrade() {
                cm.on_timer(cep, generation).await;
            }
        });

        // effects run outside the context lock, so a newer arming may have been executed first
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        match timers.get(&cep) {
            Some((armed, _)) if *armed > generation => {
                trace!(cep = %cep, generation, armed, "timer was re-armed in the meantime");
                handle.abort();
            }
            _ => {
                if let Some((_, previous)) = timers.insert(cep, (generation, handle)) {
                    previous.abort();
                }
            }
        }
    }

    async fn on_timer(&self, cep: CepId, generation: u64) {
        {
            let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
            if matches!(timers.get(&cep), Some((g, _)) if *g == generation) {
                timers.remove(&cep);
            }
        }
        self.with_context(|ctx| ctx.on_timer(cep, generation)).await
    }

    fn abort_timer(&self, cep: CepId) {
        let mut timers = self.inner.timers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, handle)) = timers.remove(&cep) {
            handle.abort();
        }
    }

    async fn deliver(&self, id: CepId) {
        let (delivery, handler) = {
            let mut ctx = self.inner.context.lock().await;
            let delivery = ctx.begin_delivery(id);
            let handler = ctx.ceps.get(id).ok().and_then(|cep| cep.handler.clone());
            (delivery, handler)
        };

        match (delivery, handler) {
            (Delivery::Report(info), Some(handler)) => {
                trace!(cep = %id, status = ?info.status, "calling handler");
                handler.on_event(self, id, info).await;
            }
            (Delivery::Skip, _) => {
                trace!(cep = %id, "delivery skipped");
            }
            _ => {}
        }

        self.with_context(|ctx| ctx.done_callback(id)).await;
    }

    /// Entry point for every inbound CM datagram
    pub async fn receive(&self, mad: &[u8], from: MadAddress) -> DispatchOutcome {
        self.with_context(|ctx| ctx.receive(mad, from)).await
    }

    pub async fn stats(&self) -> CmStats {
        self.inner.context.lock().await.stats()
    }

    pub async fn create_cep(&self, cep_type: CepType, handler: Option<Arc<dyn CmEventHandler>>) -> CepId {
        self.with_context(|ctx| ctx.create_cep(cep_type, handler)).await
    }

    pub async fn destroy_cep(&self, id: CepId) -> Result<(), CmError> {
        let gone = self.with_context(|ctx| {
            ctx.destroy_cep(id)?;
            Ok::<_, CmError>(!ctx.ceps.contains(id))
        }).await?;
        if gone {
            self.abort_timer(id);
        }
        Ok(())
    }

    pub async fn modify_cep(&self, id: CepId, option: CepOption) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.modify_cep(id, option)).await
    }

    pub async fn connect(&self, id: CepId, request: &ConnectRequest) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.connect(id, request)).await
    }

    /// Connect to a remote CEP that connects to this one at the same time. The side with the
    ///  higher CA GUID stays active.
    pub async fn connect_peer(&self, id: CepId, request: &ConnectRequest) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.connect_peer(id, request)).await
    }

    pub async fn listen(&self, id: CepId, info: &ListenInfo) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.listen(id, info)).await
    }

    pub async fn process_request(&self, id: CepId, failover: FailoverReply) -> Result<ReplyInfo, CmError> {
        self.with_context(|ctx| ctx.process_request(id, failover)).await
    }

    /// Accept an inbound request with a REP, or a reply with an RTU. Returns the CEP that
    ///  represents the connection.
    ///
    /// Unless the listener has the `AsyncAccept` option, accepting a request returns only
    ///  once the connection is established, failing with [CmError::Timeout] if the client
    ///  never answered and with [CmError::Cancelled] if it rejected or was cancelled.
    pub async fn accept(&self, id: CepId, info: AcceptInfo) -> Result<CepId, CmError> {
        match info {
            AcceptInfo::Rtu { private_data } => {
                self.with_context(|ctx| ctx.accept_a(id, &private_data)).await?;
                Ok(id)
            }
            AcceptInfo::Reply { reply, handler } => {
                let (child, async_accept) = self.with_context(|ctx| {
                    let child = ctx.accept_p(id, &reply, handler)?;
                    Ok::<_, CmError>((child, ctx.ceps.get(child)?.async_accept))
                }).await?;
                if async_accept {
                    return Ok(child);
                }

                debug!(cep = %child, "waiting for the RTU");
                let reported = self.wait(&[child], None).await?;
                match reported.first().map(|(_, info)| info.status) {
                    Some(CmStatus::ConnectEstablished) => Ok(child),
                    Some(CmStatus::ConnectTimeout) => Err(CmError::Timeout),
                    _ => Err(CmError::Cancelled),
                }
            }
        }
    }

    pub async fn reject(&self, id: CepId, info: &RejectInfo) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.reject(id, info)).await
    }

    pub async fn cancel(&self, id: CepId) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.cancel(id)).await
    }

    pub async fn disconnect(&self, id: CepId, how: &Disconnect) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.disconnect(id, how)).await
    }

    pub async fn altpath_request(&self, id: CepId, request: &AltPathRequest) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.altpath_request(id, request)).await
    }

    pub async fn altpath_reply(&self, id: CepId, reply: &AltPathReply) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.altpath_reply(id, reply)).await
    }

    pub async fn migrated(&self, id: CepId) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.migrated(id)).await
    }

    pub async fn migrated_reload(&self, id: CepId) -> Result<MigratedPaths, CmError> {
        self.with_context(|ctx| ctx.migrated_reload(id)).await
    }

    pub async fn sidr_register(&self, id: CepId, info: &SidrRegisterInfo) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.sidr_register(id, info)).await
    }

    pub async fn sidr_deregister(&self, id: CepId) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.sidr_deregister(id)).await
    }

    pub async fn sidr_query(&self, id: CepId, query: &SidrQuery) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.sidr_query(id, query)).await
    }

    pub async fn sidr_response(&self, id: CepId, response: &SidrResponse) -> Result<(), CmError> {
        self.with_context(|ctx| ctx.sidr_response(id, response)).await
    }

    /// A channel adapter went away: every CEP using it is driven to Idle
    pub async fn shutdown_ca(&self, ca_guid: u64) {
        self.with_context(|ctx| ctx.shutdown_ca(ca_guid)).await
    }

    /// Wait until at least one of `ceps` has something to report, returning what each of them
    ///  reports. Events of a CEP with a handler are consumed by whichever of the two gets them
    ///  first, so this is meant for CEPs without one. `None` waits without a deadline.
    pub async fn wait(&self, ceps: &[CepId], timeout: Option<Duration>) -> Result<Vec<(CepId, ConnInfo)>, CmError> {
        if ceps.is_empty() || ceps.len() > self.inner.config.max_ceps_per_wait {
            return Err(CmError::invalid_parameter(format!(
                "can wait for 1 to {} CEPs, got {}", self.inner.config.max_ceps_per_wait, ceps.len())));
        }
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            // registered before looking, so a wake-up in between is not lost
            let notified = self.inner.waiters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reported = {
                let mut ctx = self.inner.context.lock().await;
                let mut reported = Vec::new();
                for &id in ceps {
                    if !ctx.ceps.contains(id) {
                        return Err(CmError::NotFound);
                    }
                    if let Some(info) = ctx.get_conn_info(id) {
                        reported.push((id, info));
                    }
                }
                reported
            };
            if !reported.is_empty() {
                return Ok(reported);
            }

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, notified).await.is_err() {
                        return Err(CmError::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }
}


/// Runs each queued delivery in a task of its own, so a slow handler does not hold up other
///  CEPs. Calls for the same CEP do not overlap since a CEP is queued again only after its
///  running delivery is done.
async fn run_notification_worker(cm: WeakConnectionManager, mut recv: mpsc::Receiver<CepId>) {
    while let Some(id) = recv.recv().await {
        let Some(cm) = cm.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            cm.deliver(id).await;
        });
    }
    debug!("notification worker terminated");
}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use crate::cm::conn_info::ConnDetail;
    use crate::cm::formats;
    use crate::messaging::cm_messages::CmMad;
    use crate::messaging::codes::MraedMessage;
    use crate::messaging::transport::MockMadTransport;
    use crate::test_util::fabric::{connect_request, mad_address, static_resolver, RecordingHandler};
    use crate::test_util::loopback::loopback_pair;

    const SID: u64 = 0x1000_0000_0000_0077;

    /// the handler's events, once there are any
    async fn handled(handler: &RecordingHandler) -> Vec<(CepId, ConnInfo)> {
        for _ in 0..100 {
            let events = handler.events();
            if !events.is_empty() {
                return events;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        panic!("handler was not called");
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_accept_over_loopback() {
        let (a, b) = loopback_pair(CmConfig::default()).unwrap();
        let server = b.cm.create_cep(CepType::ReliableConnection, None).await;
        b.cm.listen(server, &ListenInfo { service_id: SID, ..Default::default() }).await.unwrap();

        let client = a.cm.create_cep(CepType::ReliableConnection, None).await;
        let mut request = connect_request(1, 2, SID);
        request.private_data = vec![0x5a; 92];
        a.cm.connect(client, &request).await.unwrap();

        let reported = b.cm.wait(&[server], Some(Duration::from_secs(5))).await.unwrap();
        let ConnDetail::ConnectRequest(req) = &reported[0].1.detail else {
            panic!("expected a connect request, got {:?}", reported);
        };
        assert_eq!(req.private_data, vec![0x5a; 92]);
        let child = req.child;

        let reply = b.cm.process_request(server, FailoverReply::Accepted).await.unwrap();
        let server_cm = b.cm.clone();
        let accepting = tokio::spawn(async move {
            server_cm.accept(server, AcceptInfo::Reply { reply, handler: None }).await
        });

        let reported = a.cm.wait(&[client], Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(reported[0].1.status, CmStatus::ConnectReply);
        a.cm.accept(client, AcceptInfo::Rtu { private_data: vec![] }).await.unwrap();

        assert_eq!(accepting.await.unwrap().unwrap(), child);
        assert_eq!(a.transport.sent(), vec!["REQ", "RTU"]);
        assert!(b.transport.sent().contains(&"REP"));
        assert_eq!(b.cm.stats().await.received.rtu, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_gets_reject() {
        let (a, _b) = loopback_pair(CmConfig::default()).unwrap();
        let handler = RecordingHandler::new();
        let client = a.cm.create_cep(CepType::ReliableConnection, Some(handler.clone())).await;
        a.cm.connect(client, &connect_request(1, 2, SID)).await.unwrap();

        let events = handled(&handler).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, client);
        assert_eq!(events[0].1.status, CmStatus::ConnectReject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_requests_time_out() {
        let (a, _b) = loopback_pair(CmConfig::default()).unwrap();
        a.transport.set_dropping(true);
        let client = a.cm.create_cep(CepType::ReliableConnection, None).await;
        a.cm.connect(client, &connect_request(1, 2, SID)).await.unwrap();

        let reported = a.cm.wait(&[client], None).await.unwrap();
        assert_eq!(reported[0].1.status, CmStatus::ConnectTimeout);
        // the initial REQ, the retries, and the REJ announcing the timeout
        let sent = a.transport.sent();
        assert_eq!(sent.iter().filter(|&&name| name == "REQ").count(), 9);
        assert_eq!(sent.last(), Some(&"REJ"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_are_retried() {
        let mut transport = MockMadTransport::new();
        transport.expect_send()
            .times(9..)
            .returning(|_, _| Err(anyhow!("link down")));
        let cm = ConnectionManager::new(CmConfig::default(), Arc::new(transport), Arc::new(static_resolver(1))).unwrap();

        let client = cm.create_cep(CepType::ReliableConnection, None).await;
        cm.connect(client, &connect_request(1, 2, SID)).await.unwrap();
        let reported = cm.wait(&[client], None).await.unwrap();
        assert_eq!(reported[0].1.status, CmStatus::ConnectTimeout);
    }

    /// a transport that takes its time for the first datagram
    #[derive(Debug, Default)]
    struct SlowFirstSend {
        sent: SyncMutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl MadTransport for SlowFirstSend {
        async fn send(&self, _to: MadAddress, mad: &[u8]) -> anyhow::Result<()> {
            let first = {
                let mut sent = self.sent.lock().unwrap();
                sent.push(CmMad::deser(mad)?.message.name());
                sent.len() == 1
            };
            if first {
                time::sleep(Duration::from_millis(300)).await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_armed_during_slow_send_survives() {
        let transport = Arc::new(SlowFirstSend::default());
        let cm = ConnectionManager::new(CmConfig::default(), transport.clone(), Arc::new(static_resolver(1))).unwrap();
        let client = cm.create_cep(CepType::ReliableConnection, None).await;

        let connecting = {
            let cm = cm.clone();
            tokio::spawn(async move { cm.connect(client, &connect_request(1, 2, SID)).await })
        };
        time::sleep(Duration::from_millis(50)).await;

        // the MRA arrives while the REQ is still being sent
        let lcid = cm.inner.context.lock().await.ceps.get(client).unwrap().local_comm_id;
        let mra = CmMad::send(0, formats::mra(MraedMessage::Request, 16, 0x777, lcid));
        assert_eq!(cm.receive(&mra.to_bytes(), mad_address(1, 2)).await, DispatchOutcome::Processed);
        connecting.await.unwrap().unwrap();

        time::sleep(Duration::from_secs(5)).await;
        let sent = transport.sent.lock().unwrap().clone();
        assert!(sent.iter().filter(|&&name| name == "REQ").count() > 1, "REQ was not retransmitted: {:?}", sent);

        let ctx = cm.inner.context.lock().await;
        if let Some(timer) = ctx.ceps.get(client).unwrap().timer {
            let timers = cm.inner.timers.lock().unwrap();
            assert_eq!(timers.get(&client).map(|(g, _)| *g), Some(timer.generation));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_times_out() {
        let (a, _b) = loopback_pair(CmConfig::default()).unwrap();
        let id = a.cm.create_cep(CepType::ReliableConnection, None).await;
        assert!(matches!(a.cm.wait(&[id], Some(Duration::from_millis(50))).await, Err(CmError::Timeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_checks_arguments() {
        let mut config = CmConfig::default();
        config.max_ceps_per_wait = 1;
        let (a, _b) = loopback_pair(config).unwrap();
        let x = a.cm.create_cep(CepType::ReliableConnection, None).await;
        let y = a.cm.create_cep(CepType::ReliableConnection, None).await;

        assert!(matches!(a.cm.wait(&[], None).await, Err(CmError::InvalidParameter(_))));
        assert!(matches!(a.cm.wait(&[x, y], None).await, Err(CmError::InvalidParameter(_))));
        a.cm.destroy_cep(y).await.unwrap();
        assert!(matches!(a.cm.wait(&[y], None).await, Err(CmError::NotFound)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_connect_reports_to_handler() {
        let (a, _b) = loopback_pair(CmConfig::default()).unwrap();
        a.transport.set_dropping(true);
        let handler = RecordingHandler::new();
        let client = a.cm.create_cep(CepType::ReliableConnection, Some(handler.clone())).await;
        a.cm.connect(client, &connect_request(1, 2, SID)).await.unwrap();
        a.cm.cancel(client).await.unwrap();

        let statuses: Vec<CmStatus> = handled(&handler).await.into_iter().map(|(_, info)| info.status).collect();
        assert_eq!(statuses, vec![CmStatus::ConnectCancel]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_is_refused() {
        let mut config = CmConfig::default();
        config.max_backlog = 0;
        assert!(ConnectionManager::new(config, Arc::new(MockMadTransport::new()), Arc::new(static_resolver(1))).is_err());
    }
}
