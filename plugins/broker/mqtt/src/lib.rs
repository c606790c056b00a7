//! MQTT broker adapter over rumqttc.
//!
//! One client connection, one event-loop task. Each subscription owns a
//! bounded queue drained by its own task, so a slow handler only backs up
//! its own topic and per-subscription order is kept.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, Publish, QoS, SubAck, SubscribeReasonCode,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use encoder_api::{
    Broker, CollaboratorError, Component, InboundMessage, MessageHandler, SubscriptionHandle, now_ms, topic,
};

/// Pause between reconnect attempts after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// How long `stop` lets the event loop flush the DISCONNECT packet.
const DISCONNECT_WAIT: Duration = Duration::from_millis(500);
/// Request channel capacity between client handles and the event loop.
const REQUEST_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    /// Queue length per subscription; the newest message is dropped when full.
    pub dispatch_buffer: usize,
    pub qos: u8,
    /// How long `start` waits for the broker's CONNACK.
    pub connect_timeout: Duration,
}

pub fn qos_from_level(level: u8) -> Result<QoS, CollaboratorError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(CollaboratorError::rejected(format!("qos {other} out of range 0..=2"))),
    }
}

// ═══════════════════════════════════════════════════════════════
//  Shared state (event loop ↔ client calls)
// ═══════════════════════════════════════════════════════════════

type AckSender = oneshot::Sender<Result<(), CollaboratorError>>;

/// SUBSCRIBE requests waiting for their SUBACK.
///
/// `queued` is in request order and is matched to packet ids as rumqttc
/// reports each SUBSCRIBE going out. `None` marks a resubscribe nobody
/// waits for.
#[derive(Default)]
struct Acks {
    queued: VecDeque<Option<AckSender>>,
    sent: HashMap<u16, Option<AckSender>>,
}

struct Route {
    filter: String,
    queue: mpsc::Sender<InboundMessage>,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<u64, Route>>,
    acks: Mutex<Acks>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(g) => g,
        Err(poisoned) => {
            tracing::warn!(what, "mqtt adapter lock was poisoned, recovering");
            poisoned.into_inner()
        }
    }
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<u64, Route>> {
        lock(&self.routes, "routes")
    }

    fn acks(&self) -> MutexGuard<'_, Acks> {
        lock(&self.acks, "acks")
    }

    /// Queue `publish` for every subscription whose filter matches.
    fn dispatch(&self, publish: &Publish) {
        let arrived_at_ms = now_ms();
        for (id, route) in self.routes().iter() {
            if !topic::matches(&route.filter, &publish.topic) {
                continue;
            }
            let message = InboundMessage {
                subscription: route.filter.clone(),
                topic: publish.topic.clone(),
                payload: publish.payload.to_vec(),
                arrived_at_ms,
            };
            match route.queue.try_send(message) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscription = id, topic = %publish.topic, "dispatch queue full, message dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscription = id, topic = %publish.topic, "subscription closing, message dropped");
                }
            }
        }
    }

    fn subscribe_sent(&self, pkid: u16) {
        let mut acks = self.acks();
        let waiter = acks.queued.pop_front().flatten();
        acks.sent.insert(pkid, waiter);
    }

    fn subscribe_acked(&self, ack: &SubAck) {
        let waiter = self.acks().sent.remove(&ack.pkid).flatten();
        let refused = ack
            .return_codes
            .iter()
            .any(|code| matches!(code, SubscribeReasonCode::Failure));
        let outcome = if refused {
            Err(CollaboratorError::rejected("broker refused the subscription"))
        } else {
            Ok(())
        };
        match waiter {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None if refused => tracing::error!(pkid = ack.pkid, "broker refused a resubscribe"),
            None => {}
        }
    }

    /// Fail SUBSCRIBEs already on the wire; the connection they went out on is gone.
    fn fail_sent(&self, reason: &str) {
        for (_, waiter) in self.acks().sent.drain() {
            if let Some(tx) = waiter {
                let _ = tx.send(Err(CollaboratorError::unavailable(reason.to_string())));
            }
        }
    }

    /// Re-issue every filter after a reconnect (clean session drops them).
    fn resubscribe_all(&self, client: &AsyncClient, qos: QoS) {
        let mut filters: Vec<String> = self.routes().values().map(|r| r.filter.clone()).collect();
        filters.sort();
        filters.dedup();

        let mut acks = self.acks();
        for filter in filters {
            match client.try_subscribe(filter.clone(), qos) {
                Ok(()) => acks.queued.push_back(None),
                Err(e) => tracing::error!(topic = %filter, error = %e, "resubscribe not queued"),
            }
        }
    }
}

/// Route of a subscribe call that has not returned yet.
///
/// Dropped unsettled (error, or the caller gave up), it removes the route.
/// A SUBSCRIBE still waiting for its SUBACK is then followed by an
/// UNSUBSCRIBE, unless another route uses the same filter.
struct PendingRoute<'a> {
    shared: &'a Shared,
    id: u64,
    filter: String,
    awaiting_ack: Option<AsyncClient>,
    settled: bool,
}

impl PendingRoute<'_> {
    fn settle(mut self) {
        self.settled = true;
    }
}

impl Drop for PendingRoute<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let still_used = {
            let mut routes = self.shared.routes();
            routes.remove(&self.id);
            routes.values().any(|r| r.filter == self.filter)
        };
        let Some(client) = self.awaiting_ack.take() else {
            return;
        };
        if still_used {
            return;
        }
        match client.try_unsubscribe(self.filter.clone()) {
            Ok(()) => tracing::debug!(topic = %self.filter, subscription = self.id, "subscribe abandoned, unsubscribing"),
            Err(e) => tracing::warn!(topic = %self.filter, error = %e, "abandoned subscribe left on the broker"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Event loop
// ═══════════════════════════════════════════════════════════════

async fn drive(
    mut eventloop: EventLoop,
    client: AsyncClient,
    shared: Arc<Shared>,
    qos: QoS,
    cancel: CancellationToken,
    mut connected: Option<oneshot::Sender<()>>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => match connected.take() {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => {
                    tracing::info!("mqtt reconnected, restoring subscriptions");
                    shared.resubscribe_all(&client, qos);
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => shared.dispatch(&publish),
            Ok(Event::Incoming(Packet::SubAck(ack))) => shared.subscribe_acked(&ack),
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => shared.subscribe_sent(pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "mqtt connection error, reconnecting");
                shared.fail_sent(&format!("mqtt connection lost: {e}"));
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
    shared.fail_sent("mqtt client stopped");
    tracing::debug!("mqtt event loop finished");
}

/// Feed one subscription's queue to its handler, one message at a time.
async fn deliver(mut queue: mpsc::Receiver<InboundMessage>, handler: Arc<dyn MessageHandler>, cancel: CancellationToken) {
    loop {
        let message = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            message = queue.recv() => match message {
                Some(m) => m,
                None => break,
            },
        };
        handler.handle(message).await;
    }
}

// ═══════════════════════════════════════════════════════════════
//  MqttBroker
// ═══════════════════════════════════════════════════════════════

struct Running {
    client: AsyncClient,
    cancel: CancellationToken,
    event_loop: JoinHandle<()>,
}

pub struct MqttBroker {
    settings: MqttSettings,
    qos: QoS,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
    next_id: AtomicU64,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Result<Self, CollaboratorError> {
        let qos = qos_from_level(settings.qos)?;
        if settings.dispatch_buffer == 0 {
            return Err(CollaboratorError::rejected("dispatch_buffer must be positive"));
        }
        Ok(Self {
            settings,
            qos,
            shared: Arc::new(Shared::default()),
            running: Mutex::new(None),
            next_id: AtomicU64::new(1),
        })
    }

    /// Client handle and shutdown token of the current connection.
    fn session(&self) -> Result<(AsyncClient, CancellationToken), CollaboratorError> {
        lock(&self.running, "running")
            .as_ref()
            .map(|r| (r.client.clone(), r.cancel.clone()))
            .ok_or_else(|| CollaboratorError::unavailable("mqtt client not started"))
    }

    fn forget(&self, id: u64) -> Option<Route> {
        self.shared.routes().remove(&id)
    }
}

impl Component for MqttBroker {
    fn name(&self) -> &str {
        "broker-mqtt"
    }

    fn start(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            if lock(&self.running, "running").is_some() {
                return Ok(());
            }

            let s = &self.settings;
            let mut options = MqttOptions::new(s.client_id.clone(), s.host.clone(), s.port);
            options.set_keep_alive(s.keep_alive);
            let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

            let cancel = CancellationToken::new();
            let (connected_tx, connected_rx) = oneshot::channel();
            let event_loop = tokio::spawn(drive(
                eventloop,
                client.clone(),
                self.shared.clone(),
                self.qos,
                cancel.clone(),
                Some(connected_tx),
            ));

            // Tear the loop down if we give up, or are dropped, before CONNACK.
            let guard = cancel.clone().drop_guard();
            match tokio::time::timeout(s.connect_timeout, connected_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(CollaboratorError::unavailable("mqtt event loop exited before CONNACK"));
                }
                Err(_) => {
                    return Err(CollaboratorError::unavailable(format!(
                        "no CONNACK from {}:{} within {}ms",
                        s.host,
                        s.port,
                        s.connect_timeout.as_millis()
                    )));
                }
            }
            guard.disarm();

            tracing::info!(host = %s.host, port = s.port, client_id = %s.client_id, "mqtt connected");
            *lock(&self.running, "running") = Some(Running {
                client,
                cancel,
                event_loop,
            });
            Ok(())
        })
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        Box::pin(async move {
            let Some(mut running) = lock(&self.running, "running").take() else {
                return Ok(());
            };

            if let Err(e) = running.client.try_disconnect() {
                tracing::debug!(error = %e, "disconnect not queued");
            }
            if tokio::time::timeout(DISCONNECT_WAIT, &mut running.event_loop).await.is_err() {
                tracing::debug!("event loop still busy, cancelling");
            }
            // Dispatch tasks finish the message in hand and exit.
            running.cancel.cancel();
            running.event_loop.abort();
            self.shared.routes().clear();
            tracing::info!("mqtt disconnected");
            Ok(())
        })
    }
}

impl Broker for MqttBroker {
    fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Pin<Box<dyn Future<Output = Result<SubscriptionHandle, CollaboratorError>> + Send + '_>> {
        let filter = topic.to_string();
        Box::pin(async move {
            topic::validate_filter(&filter).map_err(CollaboratorError::rejected)?;
            let (client, cancel) = self.session()?;

            // Route first, so retained messages sent right after SUBACK are kept.
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let (queue, rx) = mpsc::channel(self.settings.dispatch_buffer);
            self.shared.routes().insert(
                id,
                Route {
                    filter: filter.clone(),
                    queue,
                },
            );
            let mut pending = PendingRoute {
                shared: &self.shared,
                id,
                filter: filter.clone(),
                awaiting_ack: None,
                settled: false,
            };

            let (ack_tx, ack_rx) = oneshot::channel();
            {
                let mut acks = self.shared.acks();
                if let Err(e) = client.try_subscribe(filter.clone(), self.qos) {
                    return Err(CollaboratorError::unavailable(format!("subscribe not queued: {e}")));
                }
                acks.queued.push_back(Some(ack_tx));
            }

            pending.awaiting_ack = Some(client);
            let outcome = ack_rx
                .await
                .unwrap_or_else(|_| Err(CollaboratorError::unavailable("mqtt client stopped before SUBACK")));
            // Answered either way; a refused or lost SUBSCRIBE needs no undo.
            pending.awaiting_ack = None;
            outcome?;
            pending.settle();

            tokio::spawn(deliver(rx, handler, cancel));
            tracing::debug!(topic = %filter, subscription = id, "mqtt subscribed");
            Ok(SubscriptionHandle { id, topic: filter })
        })
    }

    fn unsubscribe(
        &self,
        handle: &SubscriptionHandle,
    ) -> Pin<Box<dyn Future<Output = Result<(), CollaboratorError>> + Send + '_>> {
        let handle = handle.clone();
        Box::pin(async move {
            let Some(route) = self.forget(handle.id) else {
                return Err(CollaboratorError::not_found(format!("no subscription {handle}")));
            };
            let still_used = self.shared.routes().values().any(|r| r.filter == route.filter);
            if still_used {
                return Ok(());
            }

            let (client, _) = self.session()?;
            client
                .unsubscribe(route.filter.clone())
                .await
                .map_err(|e| CollaboratorError::unavailable(format!("unsubscribe not queued: {e}")))?;
            tracing::debug!(topic = %route.filter, subscription = handle.id, "mqtt unsubscribed");
            Ok(())
        })
    }
}
