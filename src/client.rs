//! # DAN Client
//!
//! Registers a device, keeps its session alive across transport drops, and
//! tears it down again.
//!
//! ## Execution contexts
//!
//! ```text
//!  caller task                         delivery task (one per session epoch)
//!  ───────────                         ─────────────────────────────────────
//!  register ──PUT──► server
//!           ──connect──► transport ──► events ──► Connected ──► subscribe ctrl + publish online
//!           ◄─────────── presence gate (mpsc) ◄────────────────┘
//!           waits for SUBACK + PUBCOMP, again after a reconnect if the link dropped first
//!  push ─────────────► publish                   Message ──► control topic? signal handler
//!                                                                       : data dispatch
//!  deregister ──► publish offline ──► disconnect
//!             ──DELETE──► server
//!             ◄─────────── disconnect gate (oneshot) ◄── Disconnected { clean }
//! ```
//!
//! Gates are channels, so an event that fires before the caller starts
//! waiting is kept, never lost. Every session increments the context epoch;
//! the delivery task only acts while its epoch is the current one.
//!
//! A `register` that fails or is dropped before `Ready` (for example by a
//! caller's timeout) rolls the session back to `Unregistered`.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel_pool::CTRL;
use crate::config::DanConfig;
use crate::context::{ConnectionState, Hooks, SessionContext, SessionInfo, SessionStatus};
use crate::data;
use crate::error::{RegistrationError, TransportError};
use crate::feature::DeviceFeature;
use crate::registration::{self, Handshake, HttpRegistrar, RegisterBody, RegistrationApi};
use crate::signal;
use crate::transport::{
    ConnectParams, Connector, Delivery, LastWill, MqttConnector, Qos, Transport, TransportEvent,
};

/// Control-plane messages must not be lost silently
const CONTROL_QOS: Qos = Qos::ExactlyOnce;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Presence {
    Online,
    Offline,
    Broken,
}

fn presence_payload(presence: Presence, rev: &Value) -> Vec<u8> {
    json!({ "state": presence, "rev": rev }).to_string().into_bytes()
}

/// What to register
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    url: String,
    id: Option<String>,
    name: Option<String>,
    idf_list: Vec<DeviceFeature>,
    odf_list: Vec<DeviceFeature>,
    accept_protos: Option<Vec<String>>,
    profile: Option<Value>,
}

impl RegisterOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Device id as a UUID string; a random one is generated otherwise
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn idf(mut self, feature: DeviceFeature) -> Self {
        self.idf_list.push(feature);
        self
    }

    pub fn odf(mut self, feature: DeviceFeature) -> Self {
        self.odf_list.push(feature);
        self
    }

    pub fn accept_protos<I, T>(mut self, protos: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.accept_protos = Some(protos.into_iter().map(Into::into).collect());
        self
    }

    pub fn profile(mut self, profile: Value) -> Self {
        self.profile = Some(profile);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PushMode {
    /// Return once the publish is handed to the transport
    #[default]
    Fire,
    /// Return once the transport confirmed this publish
    Blocking,
}

struct PresenceAcks {
    subscribed: Delivery,
    online: Delivery,
}

/// Stays open until `register` is done, one message per connect-ack
type PresenceGate = mpsc::UnboundedSender<Result<PresenceAcks, TransportError>>;

#[derive(Default)]
struct Gates {
    presence: Option<(u64, PresenceGate)>,
    disconnected: Option<(u64, oneshot::Sender<()>)>,
    /// Epoch of the last delivery task that ran to completion
    finished: Option<u64>,
}

struct Inner {
    config: DanConfig,
    registrar: Arc<dyn RegistrationApi>,
    connector: Arc<dyn Connector>,
    context: RwLock<SessionContext>,
    state: watch::Sender<ConnectionState>,
    /// Serializes register and deregister
    lifecycle: Arc<Mutex<()>>,
    gates: Mutex<Gates>,
}

/// One device session
///
/// Cloning yields another handle to the same session. Independent sessions
/// come from separate [`Client::new`] calls.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Client with default configuration, HTTP via `reqwest` and MQTT via `rumqttc`
    pub fn new() -> Self {
        Self::with_config(DanConfig::default())
    }

    pub fn with_config(config: DanConfig) -> Self {
        let registrar = Arc::new(HttpRegistrar::new(&config.http));
        let connector = Arc::new(MqttConnector::new(&config.mqtt));
        Self::with_backends(config, registrar, connector)
    }

    pub fn with_backends(
        config: DanConfig,
        registrar: Arc<dyn RegistrationApi>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Unregistered);
        Self {
            inner: Arc::new(Inner {
                config,
                registrar,
                connector,
                context: RwLock::new(SessionContext::new()),
                state,
                lifecycle: Arc::new(Mutex::new(())),
                gates: Mutex::new(Gates::default()),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub async fn session(&self) -> Option<SessionInfo> {
        let ctx = self.inner.context.read().await;
        ctx.is_registered().then(|| ctx.info()).flatten()
    }

    pub async fn status(&self) -> SessionStatus {
        let mut status = self.inner.context.read().await.status.clone();
        status.connection_state = self.state();
        status
    }

    /// Registers the device and waits until it is reachable and announced
    ///
    /// Returns once the outbound control topic is subscribed and the `online`
    /// presence message is confirmed by the broker.
    pub async fn register(
        &self,
        options: RegisterOptions,
        hooks: Hooks,
    ) -> Result<SessionInfo, RegistrationError> {
        let lifecycle = self.inner.lifecycle.clone().lock_owned().await;
        if self.inner.context.read().await.is_registered() {
            return Err(RegistrationError::AlreadyRegistered);
        }

        let RegisterOptions {
            url,
            id,
            name,
            idf_list,
            odf_list,
            accept_protos,
            profile,
        } = options;
        let body = RegisterBody::new(name, &idf_list, &odf_list, accept_protos, profile);
        let accepted = Handshake::prepare(&url, id.as_deref(), body)?
            .submit(self.inner.registrar.as_ref())
            .await?;
        let (url, app_id, metadata) = accepted.into_parts()?;

        let host = metadata.url.host.clone();
        let port = metadata.url.port;
        let inbound_ctrl = metadata.ctrl_chans.0.clone();
        let rev = metadata.rev.clone();

        let mut rollback = Rollback::arm(self.inner.clone(), lifecycle);
        let epoch = {
            let mut ctx = self.inner.context.write().await;
            ctx.install(url, app_id, metadata, hooks, idf_list, odf_list);
            ctx.epoch += 1;
            debug!("Session {} (epoch {})", &*ctx, ctx.epoch);
            ctx.epoch
        };
        self.inner.state.send_replace(ConnectionState::Connecting);

        let (presence_tx, mut presence_rx) = mpsc::unbounded_channel();
        self.inner.gates.lock().await.presence = Some((epoch, presence_tx));

        let mqtt = &self.inner.config.mqtt;
        let params = ConnectParams {
            host,
            port,
            client_id: format!("{}-{}", mqtt.client_id_prefix, Uuid::new_v4().simple()),
            keep_alive: mqtt.keep_alive(),
            last_will: LastWill {
                topic: inbound_ctrl,
                payload: presence_payload(Presence::Broken, &rev),
                qos: CONTROL_QOS,
                retain: true,
            },
        };
        let connection = match self.inner.connector.connect(params).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Failed to open transport: {}", e);
                rollback.abort().await;
                return Err(e.into());
            }
        };

        rollback.transport = Some(connection.transport.clone());
        self.inner.context.write().await.transport = Some(connection.transport);
        self.inner
            .state
            .send_replace(ConnectionState::AwaitingPresence);
        tokio::spawn(deliver(self.inner.clone(), epoch, connection.events));

        loop {
            let acks = match presence_rx.recv().await {
                Some(Ok(acks)) => acks,
                Some(Err(e)) => {
                    rollback.abort().await;
                    return Err(e.into());
                }
                None => {
                    rollback.abort().await;
                    return Err(RegistrationError::Transport(
                        "transport closed before connecting".to_string(),
                    ));
                }
            };

            let (subscribed, online) = tokio::join!(acks.subscribed.wait(), acks.online.wait());
            match subscribed.and(online) {
                Ok(()) => break,
                Err(e) => warn!("Presence not confirmed ({}), waiting for reconnect", e),
            }
        }
        debug!("Online info published");
        self.inner.gates.lock().await.presence = None;

        self.inner.state.send_if_modified(|state| {
            let awaiting = *state == ConnectionState::AwaitingPresence;
            if awaiting {
                *state = ConnectionState::Ready;
            }
            awaiting
        });
        rollback.disarm();

        self.inner
            .context
            .read()
            .await
            .info()
            .ok_or(RegistrationError::NotRegistered)
    }

    /// Announces `offline`, closes the transport and deletes the device record
    ///
    /// Returns the server's response body once the transport reported the
    /// disconnect. The session is cleared even if the server rejects the
    /// DELETE, since the transport is closed by then.
    pub async fn deregister(&self) -> Result<Value, RegistrationError> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let (transport, url, app_id, rev, inbound_ctrl, epoch) = {
            let ctx = self.inner.context.read().await;
            let transport = ctx
                .transport
                .clone()
                .ok_or(RegistrationError::NotRegistered)?;
            let app_id = ctx.app_id.ok_or(RegistrationError::NotRegistered)?;
            let rev = ctx.rev.clone().ok_or(RegistrationError::NotRegistered)?;
            let (inbound_ctrl, _) = ctx.ctrl_topics().ok_or(RegistrationError::NotRegistered)?;
            (transport, ctx.url.clone(), app_id, rev, inbound_ctrl, ctx.epoch)
        };
        self.inner.state.send_replace(ConnectionState::Deregistering);

        let disconnected = {
            let (tx, rx) = oneshot::channel();
            let mut gates = self.inner.gates.lock().await;
            if gates.finished == Some(epoch) {
                let _ = tx.send(());
            } else {
                gates.disconnected = Some((epoch, tx));
            }
            rx
        };

        let close = async {
            match transport
                .publish(
                    &inbound_ctrl,
                    presence_payload(Presence::Offline, &rev),
                    CONTROL_QOS,
                    true,
                )
                .await
            {
                Ok(delivery) => match delivery.wait().await {
                    Ok(()) => debug!("Offline info published"),
                    Err(e) => warn!("Offline presence not confirmed: {}", e),
                },
                Err(e) => warn!("Failed to publish offline presence: {}", e),
            }

            match transport.disconnect().await {
                Ok(()) => {
                    if disconnected.await.is_err() {
                        debug!("Delivery task ended without reporting the disconnect");
                    }
                }
                Err(e) => warn!("Transport refused to disconnect: {}", e),
            }
        };
        let delete = registration::deregister(self.inner.registrar.as_ref(), &url, &app_id, &rev);

        let ((), response) = tokio::join!(close, delete);

        self.inner.context.write().await.reset();
        self.inner.state.send_replace(ConnectionState::Unregistered);
        info!("Deregistered {}", app_id);
        response
    }

    /// Publishes `data` on the topic currently assigned to `idf`
    ///
    /// `Ok(false)` means nothing was sent: the feature is not connected yet,
    /// or the transport refused the publish.
    pub async fn push(
        &self,
        idf: &str,
        data: impl Into<Value>,
        mode: PushMode,
    ) -> Result<bool, RegistrationError> {
        let (transport, topic) = {
            let ctx = self.inner.context.read().await;
            let transport = ctx
                .transport
                .clone()
                .filter(|_| self.state() != ConnectionState::Deregistering)
                .ok_or(RegistrationError::NotRegistered)?;
            if idf == CTRL {
                return Ok(false);
            }
            let Some(topic) = ctx.i_chans.topic_of(idf) else {
                debug!("Feature {} is not connected, dropping push", idf);
                return Ok(false);
            };
            (transport, topic.to_string())
        };

        let payload = match data::encode(data.into()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Could not encode data for {}: {}", idf, e);
                return Ok(false);
            }
        };

        let delivery = match transport
            .publish(&topic, payload, self.inner.config.mqtt.data_qos, false)
            .await
        {
            Ok(delivery) => delivery,
            Err(e) => {
                warn!("Push to {} failed: {}", topic, e);
                return Ok(false);
            }
        };
        self.inner.context.write().await.status.record_sent();

        if mode == PushMode::Blocking {
            if let Err(e) = delivery.wait().await {
                warn!("Push to {} not confirmed: {}", topic, e);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Pushes the next value of the feature's own producer
    ///
    /// `Ok(false)` when the feature has no producer or it yields nothing.
    pub async fn push_produced(&self, idf: &str, mode: PushMode) -> Result<bool, RegistrationError> {
        let producer = {
            let ctx = self.inner.context.read().await;
            if !ctx.is_registered() {
                return Err(RegistrationError::NotRegistered);
            }
            ctx.idf(idf).and_then(|feature| feature.push_data().cloned())
        };

        match producer.and_then(|produce| produce()) {
            Some(value) => self.push(idf, value, mode).await,
            None => Ok(false),
        }
    }

    /// Resolves once the session is back to `Unregistered`
    pub async fn wait_until_deregistered(&self) {
        let mut state = self.state_watch();
        if *state.borrow() == ConnectionState::Unregistered {
            warn!("Please register first");
            return;
        }
        let _ = state
            .wait_for(|state| *state == ConnectionState::Unregistered)
            .await;
    }
}

/// Undoes a registration that has not reached `Ready`
///
/// Holds the lifecycle lock until the rollback is done. When dropped while
/// still armed, the rollback runs on a spawned task.
struct Rollback {
    inner: Arc<Inner>,
    lifecycle: Option<OwnedMutexGuard<()>>,
    transport: Option<Arc<dyn Transport>>,
}

impl Rollback {
    fn arm(inner: Arc<Inner>, lifecycle: OwnedMutexGuard<()>) -> Self {
        Self {
            inner,
            lifecycle: Some(lifecycle),
            transport: None,
        }
    }

    async fn abort(mut self) {
        self.inner
            .abort_registration(self.transport.clone())
            .await;
        self.lifecycle = None;
    }

    fn disarm(mut self) {
        self.lifecycle = None;
    }
}

impl Drop for Rollback {
    fn drop(&mut self) {
        let Some(lifecycle) = self.lifecycle.take() else {
            return;
        };
        let inner = self.inner.clone();
        let transport = self.transport.take();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Registration cancelled, rolling back");
                handle.spawn(async move {
                    inner.abort_registration(transport).await;
                    drop(lifecycle);
                });
            }
            Err(_) => warn!("Registration cancelled outside a runtime, session not rolled back"),
        }
    }
}

impl Inner {
    /// Transport of the session, if `epoch` is still the live one
    async fn current_transport(&self, epoch: u64) -> Option<Arc<dyn Transport>> {
        if *self.state.borrow() == ConnectionState::Deregistering {
            return None;
        }
        let ctx = self.context.read().await;
        if ctx.epoch != epoch {
            return None;
        }
        ctx.transport.clone()
    }

    async fn abort_registration(&self, transport: Option<Arc<dyn Transport>>) {
        if let Some(transport) = transport {
            if let Err(e) = transport.disconnect().await {
                debug!("Disconnect after failed registration: {}", e);
            }
        }
        self.gates.lock().await.presence = None;
        self.context.write().await.reset();
        self.state.send_replace(ConnectionState::Unregistered);
    }

    /// Called once the delivery task of `epoch` has stopped
    async fn finish_epoch(&self, epoch: u64) {
        let mut gates = self.gates.lock().await;
        gates.finished = Some(epoch);
        if matches!(gates.presence, Some((gate_epoch, _)) if gate_epoch == epoch) {
            gates.presence = None;
        }
        if let Some((gate_epoch, tx)) = gates.disconnected.take() {
            if gate_epoch == epoch {
                let _ = tx.send(());
            } else {
                gates.disconnected = Some((gate_epoch, tx));
            }
        }
    }

    async fn on_connect(&self, epoch: u64, transport: &Arc<dyn Transport>, reconnect: bool) {
        let (url, app_id, name, o_chans, ctrl, rev, on_connect) = {
            let ctx = self.context.read().await;
            (
                ctx.url.clone(),
                ctx.app_id,
                ctx.name.clone().unwrap_or_default(),
                ctx.o_chans.clone(),
                ctx.ctrl_topics(),
                ctx.rev.clone().unwrap_or(Value::Null),
                ctx.hooks.as_ref().and_then(|hooks| hooks.on_connect.clone()),
            )
        };
        let Some((inbound_ctrl, outbound_ctrl)) = ctrl else {
            warn!("Connected without control channels, ignoring");
            return;
        };
        let presence_pending = matches!(
            self.gates.lock().await.presence,
            Some((gate_epoch, _)) if gate_epoch == epoch
        );

        if !reconnect {
            info!("Successfully connect to {}.", url);
            if let Some(app_id) = app_id {
                info!("Device ID: {}.", app_id);
            }
            info!("Device name: {}.", name);
        } else {
            info!("Reconnect: {}.", name);
        }

        if presence_pending {
            let acks = async {
                let subscribed = transport.subscribe(&outbound_ctrl, CONTROL_QOS).await?;
                let online = transport
                    .publish(
                        &inbound_ctrl,
                        presence_payload(Presence::Online, &rev),
                        CONTROL_QOS,
                        true,
                    )
                    .await?;
                Ok::<_, TransportError>(PresenceAcks { subscribed, online })
            }
            .await;

            if let Some((gate_epoch, tx)) = self.gates.lock().await.presence.as_ref() {
                if *gate_epoch == epoch {
                    let _ = tx.send(acks);
                }
            }
        } else {
            let link_was_down = self.state.send_if_modified(|state| {
                let down = *state == ConnectionState::Disconnected;
                if down {
                    *state = ConnectionState::Reconnecting;
                }
                down
            });

            for (feature, topic) in o_chans.iter() {
                info!("Renew subscriptions for {} -> {}", feature, topic);
                let qos = if feature == CTRL {
                    CONTROL_QOS
                } else {
                    self.config.mqtt.data_qos
                };
                if let Err(e) = transport.subscribe(topic, qos).await {
                    warn!("Failed to renew subscription {}: {}", topic, e);
                }
            }

            if link_was_down {
                self.state.send_if_modified(|state| {
                    let reconnecting = *state == ConnectionState::Reconnecting;
                    if reconnecting {
                        *state = ConnectionState::Ready;
                    }
                    reconnecting
                });
            }
        }

        if let Some(on_connect) = on_connect {
            on_connect();
        }
    }

    fn on_link_lost(&self) {
        warn!("Connection lost, waiting for the transport to reconnect");
        self.state.send_if_modified(|state| {
            let live = matches!(
                state,
                ConnectionState::Ready | ConnectionState::Reconnecting
            );
            if live {
                *state = ConnectionState::Disconnected;
            }
            live
        });
    }

    async fn on_message(&self, transport: &Arc<dyn Transport>, topic: &str, payload: &[u8]) {
        let ctrl = {
            let mut ctx = self.context.write().await;
            ctx.status.record_received();
            ctx.ctrl_topics()
        };
        let Some((inbound_ctrl, outbound_ctrl)) = ctrl else {
            return;
        };

        if topic != outbound_ctrl {
            data::dispatch(&self.context, topic, payload).await;
            return;
        }

        let Some(reply) = signal::handle(
            &self.context,
            transport.as_ref(),
            self.config.mqtt.data_qos,
            payload,
        )
        .await
        else {
            return;
        };

        let body = match serde_json::to_vec(&reply) {
            Ok(body) => body,
            Err(e) => {
                error!("Could not encode control reply: {}", e);
                return;
            }
        };
        if let Err(e) = transport
            .publish(&inbound_ctrl, body, CONTROL_QOS, false)
            .await
        {
            warn!("Failed to send control reply: {}", e);
        }
    }
}

/// Delivery context of one session epoch
async fn deliver(
    inner: Arc<Inner>,
    epoch: u64,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut reconnect = false;

    while let Some(event) = events.recv().await {
        if event == (TransportEvent::Disconnected { clean: true }) {
            let url = inner.context.read().await.url.clone();
            info!("Disconnect to {}.", url);
            break;
        }

        let Some(transport) = inner.current_transport(epoch).await else {
            debug!("Dropping event of stale session epoch {}", epoch);
            continue;
        };

        match event {
            TransportEvent::Connected => {
                inner.on_connect(epoch, &transport, reconnect).await;
                reconnect = true;
            }
            TransportEvent::Disconnected { .. } => inner.on_link_lost(),
            TransportEvent::Message { topic, payload } => {
                inner.on_message(&transport, &topic, &payload).await
            }
        }
    }

    inner.finish_epoch(epoch).await;
}
