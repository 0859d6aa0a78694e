//! Registration handshake with the IoTtalk server
//!
//! ```text
//! PUT    <url>/<device-id>  {name?, idf_list?, odf_list?, accept_protos, profile?}
//!        200 → {name, url: {host, port}, ctrl_chans: [in, out], rev}
//! DELETE <url>/<device-id>  {rev}
//!        200 → opaque JSON
//! ```
//!
//! The handshake is a two-state machine: a [`Handshake<Prepared>`] holds a
//! validated request, submitting it yields a [`Handshake<Accepted>`] which is
//! the only thing a session can be built from.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use statum::{machine, state};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HttpConfig;
use crate::error::RegistrationError;
use crate::feature::DeviceFeature;

/// Status code and JSON body of a registration request
#[derive(Debug, Clone, PartialEq)]
pub struct HttpReply {
    pub status: u16,
    pub body: Value,
}

/// HTTP side of the handshake
///
/// Implementations report transport-level failures (DNS, refused, timeout) as
/// [`RegistrationError::Connection`] and return every HTTP answer as an
/// [`HttpReply`], whatever its status.
#[async_trait]
pub trait RegistrationApi: Send + Sync {
    async fn put_json(&self, url: &str, body: &Value) -> Result<HttpReply, RegistrationError>;

    async fn delete_json(&self, url: &str, body: &Value) -> Result<HttpReply, RegistrationError>;
}

/// `reqwest` backed [`RegistrationApi`]
#[derive(Clone, Debug)]
pub struct HttpRegistrar {
    http: reqwest::Client,
}

impl HttpRegistrar {
    pub fn new(config: &HttpConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self { http }
    }

    async fn reply(res: reqwest::Response) -> HttpReply {
        let status = res.status().as_u16();
        let body = res.json::<Value>().await.unwrap_or(Value::Null);
        HttpReply { status, body }
    }
}

impl Default for HttpRegistrar {
    fn default() -> Self {
        Self::new(&HttpConfig::default())
    }
}

fn connection_error(err: reqwest::Error) -> RegistrationError {
    warn!("Registration request failed: {}", err);
    RegistrationError::Connection
}

#[async_trait]
impl RegistrationApi for HttpRegistrar {
    async fn put_json(&self, url: &str, body: &Value) -> Result<HttpReply, RegistrationError> {
        let res = self
            .http
            .put(url)
            .json(body)
            .send()
            .await
            .map_err(connection_error)?;
        Ok(Self::reply(res).await)
    }

    async fn delete_json(&self, url: &str, body: &Value) -> Result<HttpReply, RegistrationError> {
        let res = self
            .http
            .delete(url)
            .json(body)
            .send()
            .await
            .map_err(connection_error)?;
        Ok(Self::reply(res).await)
    }
}

/// Body of the registration PUT
///
/// `accept_protos` is always sent, as `null` when not given.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegisterBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idf_list: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub odf_list: Option<Vec<Value>>,
    pub accept_protos: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<Value>,
}

impl RegisterBody {
    pub fn new(
        name: Option<String>,
        idf_list: &[DeviceFeature],
        odf_list: &[DeviceFeature],
        accept_protos: Option<Vec<String>>,
        profile: Option<Value>,
    ) -> Self {
        let profiles = |features: &[DeviceFeature]| {
            (!features.is_empty()).then(|| features.iter().map(DeviceFeature::profile).collect())
        };

        Self {
            name: name.filter(|n| !n.is_empty()),
            idf_list: profiles(idf_list),
            odf_list: profiles(odf_list),
            accept_protos,
            profile: profile.filter(|p| !is_empty_json(p)),
        }
    }
}

fn is_empty_json(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

/// Successful registration response
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerMetadata {
    pub name: String,
    pub url: BrokerAddress,
    /// `[inbound, outbound]` control topics
    pub ctrl_chans: (String, String),
    pub rev: Value,
}

#[state]
#[derive(Debug, Clone)]
pub enum HandshakeState {
    Prepared,                 // request validated, not sent
    Accepted(ServerMetadata), // server created the device record
}

#[machine]
pub struct Handshake<S: HandshakeState> {
    url: String,
    app_id: Uuid,
    body: RegisterBody,
}

impl<S: HandshakeState> Handshake<S> {
    pub fn app_id(&self) -> Uuid {
        self.app_id
    }

    pub fn resource_url(&self) -> String {
        resource_url(&self.url, &self.app_id)
    }
}

impl Handshake<Prepared> {
    /// Validates the server URL and device id
    ///
    /// Without a supplied id a random UUID is generated.
    pub fn prepare(
        url: &str,
        id: Option<&str>,
        body: RegisterBody,
    ) -> Result<Self, RegistrationError> {
        if url.trim().is_empty() {
            return Err(RegistrationError::InvalidUrl);
        }

        let app_id = match id {
            Some(id) => {
                Uuid::parse_str(id).map_err(|_| RegistrationError::InvalidId(id.to_string()))?
            }
            None => Uuid::new_v4(),
        };

        Ok(Self::new(url.to_string(), app_id, body))
    }

    /// Issues the PUT and transitions to `Accepted` on HTTP 200
    pub async fn submit(
        self,
        api: &dyn RegistrationApi,
    ) -> Result<Handshake<Accepted>, RegistrationError> {
        let url = self.resource_url();
        let body = serde_json::to_value(&self.body)
            .map_err(|e| RegistrationError::Rejected(format!("unencodable request: {e}")))?;

        debug!("PUT {} {}", url, body);
        let reply = api.put_json(&url, &body).await?;
        let body = check_reply(reply)?;

        let metadata: ServerMetadata = serde_json::from_value(body)
            .map_err(|e| RegistrationError::Rejected(format!("malformed response: {e}")))?;
        info!("Server accepted device {} as {:?}", self.app_id, metadata.name);

        Ok(self.transition_with(metadata))
    }
}

impl Handshake<Accepted> {
    /// Server answer carried by the `Accepted` state
    pub fn metadata(&self) -> Option<&ServerMetadata> {
        self.get_state_data()
    }

    /// `(url, app_id, metadata)` for installing into a session
    pub fn into_parts(self) -> Result<(String, Uuid, ServerMetadata), RegistrationError> {
        // statum hands state data out as an Option even though `Accepted` always has it
        let metadata = self.get_state_data().cloned().ok_or_else(|| {
            RegistrationError::Rejected("handshake accepted without metadata".to_string())
        })?;
        Ok((self.url, self.app_id, metadata))
    }
}

/// Removes the device record; returns the server's JSON answer
pub async fn deregister(
    api: &dyn RegistrationApi,
    url: &str,
    app_id: &Uuid,
    rev: &Value,
) -> Result<Value, RegistrationError> {
    let url = resource_url(url, app_id);
    debug!("DELETE {}", url);
    let reply = api.delete_json(&url, &json!({ "rev": rev })).await?;
    check_reply(reply)
}

fn resource_url(base: &str, app_id: &Uuid) -> String {
    format!("{}/{}", base.trim_end_matches('/'), app_id)
}

fn check_reply(reply: HttpReply) -> Result<Value, RegistrationError> {
    if reply.status == 200 {
        return Ok(reply.body);
    }

    let reason = reply
        .body
        .get("reason")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", reply.status));
    warn!("Server rejected request: {}", reason);
    Err(RegistrationError::Rejected(reason))
}
