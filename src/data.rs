//! Data channel payloads
//!
//! Data travels as a JSON array. A single outbound value `v` is sent as
//! `[v]`, an array is sent unchanged. Inbound payloads are handed to the
//! application as parsed JSON.

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::context::SessionContext;

/// Wraps a non-array value into a one-element array
pub fn wrap(value: Value) -> Value {
    match value {
        Value::Array(_) => value,
        other => Value::Array(vec![other]),
    }
}

pub fn encode(value: Value) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&wrap(value))
}

/// Routes an inbound payload to the handler of the feature owning `topic`
///
/// Returns whether a handler was invoked. Topics that no longer map to a
/// feature (a DISCONNECT raced the delivery) are dropped.
pub(crate) async fn dispatch(context: &RwLock<SessionContext>, topic: &str, payload: &[u8]) -> bool {
    let (feature, handler) = {
        let ctx = context.read().await;
        let Some(feature) = ctx.o_chans.feature_of(topic) else {
            debug!("Dropping data on unmapped topic {}", topic);
            return false;
        };
        let handler = ctx
            .odf(feature)
            .and_then(|odf| odf.on_data().cloned())
            .or_else(|| ctx.hooks.as_ref().map(|hooks| hooks.on_data.clone()));
        (feature.to_string(), handler)
    };

    let value: Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            warn!("Dropping undecodable data for {}: {}", feature, e);
            return false;
        }
    };

    match handler {
        Some(handler) => {
            handler(&feature, value);
            true
        }
        None => false,
    }
}
