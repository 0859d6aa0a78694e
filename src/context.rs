//! Session state of one registered device
//!
//! [`SessionContext`] is owned by a single [`crate::Client`] and lives behind
//! its lock. It is populated from an accepted registration handshake and
//! reset once the device deregisters.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde_json::Value;
use uuid::Uuid;

use crate::channel_pool::{ChannelPool, CTRL};
use crate::feature::{DataHandler, DeviceFeature};
use crate::registration::ServerMetadata;
use crate::signal::Command;
use crate::transport::Transport;

/// Application reaction to a control command
///
/// `Err(reason)` is reported back to the server as an error reply.
pub type SignalHandler = Arc<dyn Fn(Command, Vec<String>) -> Result<(), String> + Send + Sync>;

/// Invoked after every successful transport connect
pub type ConnectHook = Arc<dyn Fn() + Send + Sync>;

/// Application callbacks of a session
#[derive(Clone)]
pub struct Hooks {
    pub(crate) on_signal: SignalHandler,
    pub(crate) on_data: DataHandler,
    pub(crate) on_connect: Option<ConnectHook>,
}

impl Hooks {
    pub fn new<S, D>(on_signal: S, on_data: D) -> Self
    where
        S: Fn(Command, Vec<String>) -> Result<(), String> + Send + Sync + 'static,
        D: Fn(&str, Value) + Send + Sync + 'static,
    {
        Self {
            on_signal: Arc::new(on_signal),
            on_data: Arc::new(on_data),
            on_connect: None,
        }
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_connect", &self.on_connect.is_some())
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a session
///
/// ```text
/// Unregistered ─► Connecting ─► AwaitingPresence ─► Ready ─► Deregistering ─► Unregistered
///                                                     │  ▲
///                                                     ▼  │
///                                          Disconnected ─► Reconnecting
/// ```
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Unregistered,
    Connecting,
    AwaitingPresence,
    Ready,
    Disconnected,
    Reconnecting,
    Deregistering,
}

impl ConnectionState {
    /// Whether a live session exists that push/deregister may act on
    pub fn is_registered(self) -> bool {
        matches!(
            self,
            ConnectionState::Ready | ConnectionState::Disconnected | ConnectionState::Reconnecting
        )
    }
}

/// Traffic counters of the current session
#[derive(Clone, Debug, Default)]
pub struct SessionStatus {
    pub connection_state: ConnectionState,
    pub messages_received: usize,
    pub messages_sent: usize,
    pub last_activity: Option<DateTime<Local>>,
}

impl SessionStatus {
    pub(crate) fn record_received(&mut self) {
        self.messages_received += 1;
        self.last_activity = Some(Local::now());
    }

    pub(crate) fn record_sent(&mut self) {
        self.messages_sent += 1;
        self.last_activity = Some(Local::now());
    }
}

/// Snapshot of a registered session handed back to the caller
#[derive(Clone, Debug, PartialEq)]
pub struct SessionInfo {
    pub url: String,
    pub app_id: Uuid,
    pub name: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub rev: Value,
    /// `(inbound, outbound)` control topics
    pub ctrl_chans: (String, String),
}

#[derive(Default)]
pub struct SessionContext {
    pub(crate) url: String,
    pub(crate) app_id: Option<Uuid>,
    pub(crate) name: Option<String>,
    pub(crate) mqtt_host: Option<String>,
    pub(crate) mqtt_port: Option<u16>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    /// Topics this device publishes on
    pub(crate) i_chans: ChannelPool,
    /// Topics this device subscribes to
    pub(crate) o_chans: ChannelPool,
    pub(crate) rev: Option<Value>,
    pub(crate) hooks: Option<Hooks>,
    pub(crate) idf_list: Vec<DeviceFeature>,
    pub(crate) odf_list: Vec<DeviceFeature>,
    /// Generation of the session; delivery events carry the epoch they belong to
    pub(crate) epoch: u64,
    pub(crate) status: SessionStatus,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn install(
        &mut self,
        url: String,
        app_id: Uuid,
        metadata: ServerMetadata,
        hooks: Hooks,
        idf_list: Vec<DeviceFeature>,
        odf_list: Vec<DeviceFeature>,
    ) {
        self.url = url;
        self.app_id = Some(app_id);
        self.name = Some(metadata.name);
        self.mqtt_host = Some(metadata.url.host);
        self.mqtt_port = Some(metadata.url.port);
        self.i_chans.clear();
        self.o_chans.clear();
        self.i_chans.set(CTRL, metadata.ctrl_chans.0);
        self.o_chans.set(CTRL, metadata.ctrl_chans.1);
        self.rev = Some(metadata.rev);
        self.hooks = Some(hooks);
        self.idf_list = idf_list;
        self.odf_list = odf_list;
        self.status = SessionStatus::default();
    }

    /// Clears everything except the epoch counter
    pub(crate) fn reset(&mut self) {
        let epoch = self.epoch;
        *self = Self::default();
        self.epoch = epoch;
    }

    pub fn is_registered(&self) -> bool {
        self.transport.is_some()
    }

    pub fn i_chans(&self) -> &ChannelPool {
        &self.i_chans
    }

    pub fn o_chans(&self) -> &ChannelPool {
        &self.o_chans
    }

    pub(crate) fn ctrl_topics(&self) -> Option<(String, String)> {
        Some((
            self.i_chans.topic_of(CTRL)?.to_string(),
            self.o_chans.topic_of(CTRL)?.to_string(),
        ))
    }

    pub(crate) fn idf(&self, name: &str) -> Option<&DeviceFeature> {
        self.idf_list.iter().find(|f| f.name() == name)
    }

    pub(crate) fn odf(&self, name: &str) -> Option<&DeviceFeature> {
        self.odf_list.iter().find(|f| f.name() == name)
    }

    pub fn info(&self) -> Option<SessionInfo> {
        Some(SessionInfo {
            url: self.url.clone(),
            app_id: self.app_id?,
            name: self.name.clone()?,
            mqtt_host: self.mqtt_host.clone()?,
            mqtt_port: self.mqtt_port?,
            rev: self.rev.clone()?,
            ctrl_chans: self.ctrl_topics()?,
        })
    }
}

impl fmt::Display for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let app_id = self.app_id.map(|id| id.to_string()).unwrap_or_default();
        write!(
            f,
            "[{}/{}, mqtt://{}:{}]",
            self.url,
            app_id,
            self.mqtt_host.as_deref().unwrap_or(""),
            self.mqtt_port.map(|p| p.to_string()).unwrap_or_default()
        )
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("url", &self.url)
            .field("app_id", &self.app_id)
            .field("name", &self.name)
            .field("i_chans", &self.i_chans)
            .field("o_chans", &self.o_chans)
            .field("rev", &self.rev)
            .field("registered", &self.is_registered())
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registration::BrokerAddress;
    use serde_json::json;

    fn metadata() -> ServerMetadata {
        ServerMetadata {
            name: "dev1".to_string(),
            url: BrokerAddress {
                host: "h".to_string(),
                port: 1883,
            },
            ctrl_chans: ("in/ctrl".to_string(), "out/ctrl".to_string()),
            rev: json!(1),
        }
    }

    #[test]
    fn install_populates_control_channels() {
        let mut ctx = SessionContext::new();
        let id = Uuid::new_v4();
        ctx.install(
            "http://server".to_string(),
            id,
            metadata(),
            Hooks::new(|_, _| Ok(()), |_, _| {}),
            Vec::new(),
            Vec::new(),
        );

        assert_eq!(ctx.i_chans().topic_of(CTRL), Some("in/ctrl"));
        assert_eq!(ctx.o_chans().feature_of("out/ctrl"), Some(CTRL));

        let info = ctx.info().unwrap();
        assert_eq!(info.name, "dev1");
        assert_eq!(info.app_id, id);
        assert_eq!(info.rev, json!(1));
        assert_eq!(
            ctx.to_string(),
            format!("[http://server/{id}, mqtt://h:1883]")
        );
    }

    #[test]
    fn reset_keeps_epoch() {
        let mut ctx = SessionContext::new();
        ctx.install(
            "http://server".to_string(),
            Uuid::new_v4(),
            metadata(),
            Hooks::new(|_, _| Ok(()), |_, _| {}),
            Vec::new(),
            Vec::new(),
        );
        ctx.epoch = 3;
        ctx.reset();

        assert_eq!(ctx.epoch, 3);
        assert!(ctx.info().is_none());
        assert!(ctx.i_chans().is_empty());
        assert!(!ctx.is_registered());
    }
}
