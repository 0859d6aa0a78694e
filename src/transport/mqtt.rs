//! MQTT transport on top of `rumqttc`
//!
//! One driver task per connection polls the `rumqttc` event loop, turns
//! connection and publish packets into [`TransportEvent`]s, and resolves the
//! per-request [`Delivery`] handles from the broker's acknowledgments.
//!
//! # Acknowledgment tracking
//!
//! `rumqttc` assigns packet ids inside the event loop, so a request's id is
//! only known once the matching `Outgoing::Publish(pkid)` event shows up.
//! Requests leave the client in submission order, so pending confirmations
//! are queued FIFO and bound to their packet id when the outgoing event
//! arrives.
//!
//! ```text
//! publish() ─► queued ──Outgoing::Publish(pkid)──► in flight ──PubComp/PubAck(pkid)──► confirmed
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Connection, ConnectParams, Connector, Delivery, Qos, Transport, TransportEvent};
use crate::config::MqttConfig;
use crate::error::TransportError;

impl From<Qos> for QoS {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => QoS::AtMostOnce,
            Qos::AtLeastOnce => QoS::AtLeastOnce,
            Qos::ExactlyOnce => QoS::ExactlyOnce,
        }
    }
}

/// Opens `rumqttc` connections with the driver settings from [`MqttConfig`]
#[derive(Debug, Clone)]
pub struct MqttConnector {
    channel_capacity: usize,
    reconnect_delay: Duration,
    close_grace: Duration,
}

impl MqttConnector {
    pub fn new(config: &MqttConfig) -> Self {
        Self {
            channel_capacity: config.channel_capacity.max(1),
            reconnect_delay: Duration::from_millis(config.reconnect_delay_ms),
            close_grace: Duration::from_millis(config.close_grace_ms),
        }
    }
}

impl Default for MqttConnector {
    fn default() -> Self {
        Self::new(&MqttConfig::default())
    }
}

#[async_trait]
impl Connector for MqttConnector {
    async fn connect(&self, params: ConnectParams) -> Result<Connection, TransportError> {
        if params.host.is_empty() {
            return Err(TransportError::Connect("empty broker host".to_string()));
        }

        let mut mqtt_options = MqttOptions::new(params.client_id, params.host.clone(), params.port);
        mqtt_options
            .set_keep_alive(params.keep_alive)
            .set_clean_session(true)
            .set_last_will(rumqttc::LastWill::new(
                params.last_will.topic,
                params.last_will.payload,
                params.last_will.qos.into(),
                params.last_will.retain,
            ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, self.channel_capacity);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let acks = Arc::new(Mutex::new(AckTracker::default()));
        let cancel = CancellationToken::new();

        info!("Opening MQTT connection to {}:{}", params.host, params.port);
        tokio::spawn(drive(
            eventloop,
            events_tx,
            acks.clone(),
            cancel.clone(),
            self.reconnect_delay,
            self.close_grace,
        ));

        Ok(Connection {
            transport: Arc::new(MqttTransport {
                client,
                acks,
                request_order: tokio::sync::Mutex::new(()),
                cancel,
            }),
            events: events_rx,
        })
    }
}

/// Live `rumqttc` connection
pub struct MqttTransport {
    client: AsyncClient,
    acks: Arc<Mutex<AckTracker>>,
    /// Keeps "queue confirmation, then submit" atomic across callers
    request_order: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<Delivery, TransportError> {
        let _order = self.request_order.lock().await;
        let (tx, delivery) = Delivery::pending();
        lock(&self.acks).queued_publishes.push_back((qos, tx));

        if let Err(e) = self.client.publish(topic, qos.into(), retain, payload).await {
            lock(&self.acks).queued_publishes.pop_back();
            return Err(TransportError::Request(e.to_string()));
        }
        Ok(delivery)
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<Delivery, TransportError> {
        let _order = self.request_order.lock().await;
        let (tx, delivery) = Delivery::pending();
        lock(&self.acks).queued_subscribes.push_back(tx);

        if let Err(e) = self.client.subscribe(topic, qos.into()).await {
            lock(&self.acks).queued_subscribes.pop_back();
            return Err(TransportError::Request(e.to_string()));
        }
        Ok(delivery)
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Default)]
struct AckTracker {
    queued_publishes: VecDeque<(Qos, oneshot::Sender<()>)>,
    queued_subscribes: VecDeque<oneshot::Sender<()>>,
    publishes: HashMap<u16, oneshot::Sender<()>>,
    subscribes: HashMap<u16, oneshot::Sender<()>>,
}

impl AckTracker {
    fn on_outgoing_publish(&mut self, pkid: u16) {
        // Retransmissions after a reconnect reuse their packet id.
        if pkid != 0 && self.publishes.contains_key(&pkid) {
            return;
        }
        if let Some((qos, tx)) = self.queued_publishes.pop_front() {
            if qos == Qos::AtMostOnce || pkid == 0 {
                let _ = tx.send(());
            } else {
                self.publishes.insert(pkid, tx);
            }
        }
    }

    fn on_outgoing_subscribe(&mut self, pkid: u16) {
        if let Some(tx) = self.queued_subscribes.pop_front() {
            self.subscribes.insert(pkid, tx);
        }
    }

    fn confirm_publish(&mut self, pkid: u16) {
        if let Some(tx) = self.publishes.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    fn confirm_subscribe(&mut self, pkid: u16) {
        if let Some(tx) = self.subscribes.remove(&pkid) {
            let _ = tx.send(());
        }
    }

    /// SUBSCRIBEs are not retransmitted after a reconnect, so the ones in
    /// flight never see a SUBACK; their waiters get `Dropped`.
    ///
    /// Queued subscribes stay: they are still in the client's request channel
    /// and go out once the link is back.
    fn on_link_lost(&mut self) {
        if !self.subscribes.is_empty() {
            debug!("Dropping {} unacknowledged subscriptions", self.subscribes.len());
        }
        self.subscribes.clear();
    }
}

async fn drive(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<TransportEvent>,
    acks: Arc<Mutex<AckTracker>>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
    close_grace: Duration,
) {
    let mut connected = false;
    let mut closing = false;

    loop {
        let polled = if closing {
            match tokio::time::timeout(close_grace, eventloop.poll()).await {
                Ok(polled) => polled,
                Err(_) => {
                    debug!("No close confirmation within grace period, treating link as closed");
                    let _ = events.send(TransportEvent::Disconnected { clean: true });
                    break;
                }
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("MQTT driver cancelled");
                    break;
                }
                polled = eventloop.poll() => polled,
            }
        };

        let forward = match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    Some(TransportEvent::Connected)
                } else {
                    warn!("Broker refused connection: {:?}", ack.code);
                    None
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => Some(TransportEvent::Message {
                topic: publish.topic,
                payload: publish.payload.to_vec(),
            }),
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                lock(&acks).confirm_publish(ack.pkid);
                None
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                lock(&acks).confirm_publish(comp.pkid);
                None
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                lock(&acks).confirm_subscribe(ack.pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                lock(&acks).on_outgoing_publish(pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                lock(&acks).on_outgoing_subscribe(pkid);
                None
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                closing = true;
                None
            }
            Ok(_) => None,
            Err(e) if closing => {
                debug!("MQTT link closed: {}", e);
                let _ = events.send(TransportEvent::Disconnected { clean: true });
                break;
            }
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                lock(&acks).on_link_lost();
                let was_connected = std::mem::replace(&mut connected, false);
                tokio::time::sleep(reconnect_delay).await;
                was_connected.then_some(TransportEvent::Disconnected { clean: false })
            }
        };

        if let Some(event) = forward {
            if events.send(event).is_err() {
                debug!("Event receiver dropped, stopping MQTT driver");
                break;
            }
        }
    }
}

fn lock(acks: &Mutex<AckTracker>) -> std::sync::MutexGuard<'_, AckTracker> {
    acks.lock().unwrap_or_else(PoisonError::into_inner)
}
