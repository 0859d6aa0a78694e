//! # Pub/Sub Transport Boundary
//!
//! The DAN client never speaks MQTT itself. It talks to a [`Connector`] that
//! opens a [`Transport`] and hands back a stream of [`TransportEvent`]s which
//! the client's delivery task consumes.
//!
//! ```text
//! Connector::connect ──► Connection { transport, events }
//!                               │            │
//!        publish/subscribe ◄────┘            └──► Connected / Disconnected / Message
//!        (each returns a Delivery)                 (unbounded mpsc, consumed by delivery task)
//! ```
//!
//! The event channel is unbounded: a transport must keep polling its link
//! while the delivery task is itself waiting on a publish to that link.
//!
//! Every publish and subscribe returns its own [`Delivery`] so that a caller
//! waiting for one confirmation never blocks unrelated requests.

pub mod mqtt;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

pub use mqtt::MqttConnector;

/// Delivery guarantee requested for a publish or subscription
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Qos {
    #[default]
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl TryFrom<u8> for Qos {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(Qos::AtMostOnce),
            1 => Ok(Qos::AtLeastOnce),
            2 => Ok(Qos::ExactlyOnce),
            other => Err(format!("qos must be 0, 1 or 2, got {other}")),
        }
    }
}

impl From<Qos> for u8 {
    fn from(qos: Qos) -> Self {
        match qos {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }
}

/// Message the broker publishes on our behalf if the connection drops uncleanly
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: Qos,
    pub retain: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive: Duration,
    pub last_will: LastWill,
}

/// Events produced by the transport's background context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Connect acknowledged by the broker (first connect or reconnect)
    Connected,
    /// Link lost; `clean` is true only after a requested disconnect
    Disconnected { clean: bool },
    Message { topic: String, payload: Vec<u8> },
}

/// Confirmation handle for a single publish or subscribe request
///
/// Resolves once the broker acknowledged the request (PUBCOMP/PUBACK/SUBACK,
/// or the packet left the socket for QoS 0).
pub struct Delivery {
    rx: oneshot::Receiver<()>,
}

impl Delivery {
    /// Creates an unresolved delivery and the sender that resolves it
    pub fn pending() -> (oneshot::Sender<()>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }

    /// A delivery that is already confirmed
    pub fn confirmed() -> Self {
        let (tx, delivery) = Self::pending();
        let _ = tx.send(());
        delivery
    }

    pub async fn wait(self) -> Result<(), TransportError> {
        self.rx.await.map_err(|_| TransportError::Dropped)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery").finish_non_exhaustive()
    }
}

/// Handle to an open pub/sub connection
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<Delivery, TransportError>;

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<Delivery, TransportError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Requests a clean close; completion is reported as
    /// `TransportEvent::Disconnected { clean: true }`
    async fn disconnect(&self) -> Result<(), TransportError>;
}

pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transport connections
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, params: ConnectParams) -> Result<Connection, TransportError>;
}
