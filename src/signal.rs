//! Control-channel command protocol
//!
//! The server drives data channels over the device's outbound control topic:
//!
//! ```text
//! {"command": "CONNECT",    "msg_id": 7, "idf": "temp", "topic": "app/123/temp"}
//! {"command": "DISCONNECT", "msg_id": 8, "odf": "lamp"}
//! ```
//!
//! Every command that carries a `msg_id` is answered on the inbound control
//! topic with `{"msg_id": .., "state": "ok"}` or
//! `{"msg_id": .., "state": "error", "reason": ..}`. Nothing raised while
//! handling a command leaves this module; failures become error replies.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::channel_pool::CTRL;
use crate::context::SessionContext;
use crate::error::{PoolError, SignalError};
use crate::transport::{Qos, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Connect,
    Disconnect,
}

impl Command {
    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Disconnect => "DISCONNECT",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CONNECT" => Ok(Command::Connect),
            "DISCONNECT" => Ok(Command::Disconnect),
            other => Err(SignalError::UnknownCommand(other.to_string())),
        }
    }
}

/// Which pool a command targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureRef {
    Idf(String),
    Odf(String),
}

impl FeatureRef {
    pub fn name(&self) -> &str {
        match self {
            FeatureRef::Idf(name) | FeatureRef::Odf(name) => name,
        }
    }
}

/// A well-formed control command
#[derive(Debug, Clone, PartialEq)]
pub struct ControlSignal {
    pub msg_id: Value,
    pub command: Command,
    pub feature: FeatureRef,
    pub topic: Option<String>,
}

/// A command that could not be accepted
///
/// `msg_id` is present when the command carried one, so it can still be
/// answered.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub msg_id: Option<Value>,
    pub error: SignalError,
}

#[derive(Deserialize)]
struct RawSignal {
    command: Option<String>,
    msg_id: Option<Value>,
    idf: Option<String>,
    odf: Option<String>,
    topic: Option<String>,
}

impl ControlSignal {
    pub fn parse(payload: &[u8]) -> Result<Self, Rejection> {
        let value: Value = serde_json::from_slice(payload).map_err(|e| Rejection {
            msg_id: None,
            error: SignalError::Malformed(e.to_string()),
        })?;
        let msg_id = value.get("msg_id").cloned().filter(|id| !id.is_null());
        let reject = |error: SignalError| Rejection {
            msg_id: msg_id.clone(),
            error,
        };

        let raw: RawSignal = serde_json::from_value(value)
            .map_err(|e| reject(SignalError::Malformed(e.to_string())))?;

        let Some(id) = raw.msg_id.filter(|id| !id.is_null()) else {
            return Err(reject(SignalError::Malformed("missing msg_id".to_string())));
        };
        let command: Command = raw
            .command
            .ok_or_else(|| reject(SignalError::Malformed("missing command".to_string())))?
            .parse()
            .map_err(reject)?;

        let feature = match (raw.idf, raw.odf) {
            (Some(idf), None) => FeatureRef::Idf(idf),
            (None, Some(odf)) => FeatureRef::Odf(odf),
            (None, None) => return Err(reject(SignalError::MissingFeature)),
            (Some(_), Some(_)) => return Err(reject(SignalError::AmbiguousFeature)),
        };
        if feature.name() == CTRL {
            return Err(reject(SignalError::Malformed(
                "control channel cannot be reassigned".to_string(),
            )));
        }
        if command == Command::Connect && raw.topic.is_none() {
            return Err(reject(SignalError::MissingTopic));
        }

        Ok(Self {
            msg_id: id,
            command,
            feature,
            topic: raw.topic,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplyState {
    Ok,
    Error,
}

/// Acknowledgment correlated to a command by its `msg_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlReply {
    pub msg_id: Value,
    pub state: ReplyState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ControlReply {
    pub fn ok(msg_id: Value) -> Self {
        Self {
            msg_id,
            state: ReplyState::Ok,
            reason: None,
        }
    }

    pub fn error(msg_id: Value, reason: impl Into<String>) -> Self {
        Self {
            msg_id,
            state: ReplyState::Error,
            reason: Some(reason.into()),
        }
    }
}

/// Applies a command to the channel pools and the transport subscriptions
pub(crate) async fn apply(
    context: &RwLock<SessionContext>,
    transport: &dyn Transport,
    data_qos: Qos,
    signal: &ControlSignal,
) -> Result<(), SignalError> {
    match (&signal.command, &signal.feature) {
        (Command::Connect, FeatureRef::Idf(idf)) => {
            let topic = signal.topic.clone().ok_or(SignalError::MissingTopic)?;
            info!("Connect IDF {} -> {}", idf, topic);
            context.write().await.i_chans.set(idf.clone(), topic);
        }
        (Command::Connect, FeatureRef::Odf(odf)) => {
            let topic = signal.topic.clone().ok_or(SignalError::MissingTopic)?;
            info!("Connect ODF {} -> {}", odf, topic);
            context.write().await.o_chans.set(odf.clone(), topic.clone());
            if let Err(e) = transport.subscribe(&topic, data_qos).await {
                let _ = context.write().await.o_chans.remove(odf);
                return Err(e.into());
            }
        }
        (Command::Disconnect, FeatureRef::Idf(idf)) => {
            let topic = context.write().await.i_chans.remove(idf)?;
            info!("Disconnect IDF {} from {}", idf, topic);
        }
        (Command::Disconnect, FeatureRef::Odf(odf)) => {
            let topic = context
                .read()
                .await
                .o_chans
                .topic_of(odf)
                .map(str::to_string)
                .ok_or_else(|| PoolError::NotFound(odf.clone()))?;
            transport.unsubscribe(&topic).await?;
            context.write().await.o_chans.remove(odf)?;
            info!("Disconnect ODF {} from {}", odf, topic);
        }
    }
    Ok(())
}

/// Handles one control-topic payload and builds the reply, if one can be sent
pub(crate) async fn handle(
    context: &RwLock<SessionContext>,
    transport: &dyn Transport,
    data_qos: Qos,
    payload: &[u8],
) -> Option<ControlReply> {
    let signal = match ControlSignal::parse(payload) {
        Ok(signal) => signal,
        Err(rejection) => {
            warn!("Rejecting control command: {}", rejection.error);
            if rejection.msg_id.is_none() {
                debug!("No msg_id to answer, dropping {:?}", String::from_utf8_lossy(payload));
            }
            return rejection
                .msg_id
                .map(|id| ControlReply::error(id, rejection.error.to_string()));
        }
    };

    if let Err(e) = apply(context, transport, data_qos, &signal).await {
        warn!("{} {} failed: {}", signal.command, signal.feature.name(), e);
        return Some(ControlReply::error(signal.msg_id, e.to_string()));
    }

    let on_signal = context
        .read()
        .await
        .hooks
        .as_ref()
        .map(|hooks| hooks.on_signal.clone());
    let outcome = match on_signal {
        Some(on_signal) => on_signal(signal.command, vec![signal.feature.name().to_string()]),
        None => Ok(()),
    };

    Some(match outcome {
        Ok(()) => ControlReply::ok(signal.msg_id),
        Err(reason) => ControlReply::error(signal.msg_id, reason),
    })
}
