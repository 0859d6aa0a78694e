#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dan::registration::{HttpReply, RegistrationApi};
use dan::transport::{
    ConnectParams, Connection, Connector, Delivery, Qos, Transport, TransportEvent,
};
use dan::{Client, DanConfig, RegistrationError, TransportError};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

pub const APP_ID: &str = "6f1c2a1e-6f3b-4c1e-9d3a-2b0c8e7f9a10";

pub fn accepted_body() -> Value {
    json!({
        "name": "dev1",
        "url": {"host": "broker.local", "port": 1883},
        "ctrl_chans": ["in/ctrl", "out/ctrl"],
        "rev": 1
    })
}

/// Records every request and answers with canned replies
pub struct FakeRegistrar {
    pub puts: Mutex<Vec<(String, Value)>>,
    pub deletes: Mutex<Vec<(String, Value)>>,
    put_reply: Mutex<Result<HttpReply, RegistrationError>>,
    delete_reply: Mutex<Result<HttpReply, RegistrationError>>,
}

impl FakeRegistrar {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self {
            puts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            put_reply: Mutex::new(Ok(HttpReply {
                status: 200,
                body: accepted_body(),
            })),
            delete_reply: Mutex::new(Ok(HttpReply {
                status: 200,
                body: json!({"id": APP_ID}),
            })),
        })
    }

    pub fn rejecting(status: u16, body: Value) -> Arc<Self> {
        let registrar = Self::accepting();
        *registrar.put_reply.lock().unwrap() = Ok(HttpReply { status, body });
        registrar
    }

    pub fn put_count(&self) -> usize {
        self.puts.lock().unwrap().len()
    }

    pub fn deletes(&self) -> Vec<(String, Value)> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl RegistrationApi for FakeRegistrar {
    async fn put_json(&self, url: &str, body: &Value) -> Result<HttpReply, RegistrationError> {
        self.puts
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        self.put_reply.lock().unwrap().clone()
    }

    async fn delete_json(&self, url: &str, body: &Value) -> Result<HttpReply, RegistrationError> {
        self.deletes
            .lock()
            .unwrap()
            .push((url.to_string(), body.clone()));
        self.delete_reply.lock().unwrap().clone()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    },
    Subscribe {
        topic: String,
        qos: Qos,
    },
    Unsubscribe(String),
    Disconnect,
}

/// In-memory link; tests drive it by injecting [`TransportEvent`]s
pub struct FakeTransport {
    calls: Mutex<Vec<Call>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    hold: bool,
    /// `disconnect` is recorded but the test reports the close itself
    manual_disconnect: bool,
    held: Mutex<Vec<oneshot::Sender<()>>>,
}

impl FakeTransport {
    fn delivery(&self) -> Delivery {
        if !self.hold {
            return Delivery::confirmed();
        }
        let (tx, delivery) = Delivery::pending();
        self.held.lock().unwrap().push(tx);
        delivery
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Publishes on `topic`, payloads decoded as JSON
    pub fn published(&self, topic: &str) -> Vec<(Value, Qos, bool)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Publish {
                    topic: t,
                    payload,
                    qos,
                    retain,
                } if t == topic => Some((
                    serde_json::from_slice(&payload).unwrap_or(Value::Null),
                    qos,
                    retain,
                )),
                _ => None,
            })
            .collect()
    }

    pub fn subscriptions(&self, topic: &str) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Subscribe { topic: t, .. } if t == topic))
            .count()
    }

    pub fn publish_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, Call::Publish { .. }))
            .count()
    }

    pub async fn emit(&self, event: TransportEvent) {
        // the delivery task is gone once the session ended
        let _ = self.events.send(event);
        tokio::task::yield_now().await;
    }

    pub async fn send_control(&self, command: Value) {
        self.emit(TransportEvent::Message {
            topic: "out/ctrl".to_string(),
            payload: serde_json::to_vec(&command).unwrap(),
        })
        .await;
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    pub fn release_all(&self) {
        for tx in self.held.lock().unwrap().drain(..) {
            let _ = tx.send(());
        }
    }

    /// Drops held confirmations, as a broker link lost mid-request does
    pub fn drop_held(&self) {
        self.held.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: Qos,
        retain: bool,
    ) -> Result<Delivery, TransportError> {
        self.calls.lock().unwrap().push(Call::Publish {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(self.delivery())
    }

    async fn subscribe(&self, topic: &str, qos: Qos) -> Result<Delivery, TransportError> {
        self.calls.lock().unwrap().push(Call::Subscribe {
            topic: topic.to_string(),
            qos,
        });
        Ok(self.delivery())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Unsubscribe(topic.to_string()));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.calls.lock().unwrap().push(Call::Disconnect);
        if !self.manual_disconnect {
            let _ = self.events.send(TransportEvent::Disconnected { clean: true });
        }
        Ok(())
    }
}

/// Hands out [`FakeTransport`]s that report `Connected` right away
#[derive(Default)]
pub struct FakeConnector {
    links: Mutex<Vec<Arc<FakeTransport>>>,
    params: Mutex<Vec<ConnectParams>>,
    hold: bool,
    manual_disconnect: bool,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliveries stay unconfirmed until [`FakeTransport::release_all`]
    pub fn holding() -> Arc<Self> {
        Arc::new(Self {
            hold: true,
            ..Self::default()
        })
    }

    /// Links whose `disconnect` waits for the test to emit `Disconnected`
    pub fn withholding_disconnect() -> Arc<Self> {
        Arc::new(Self {
            manual_disconnect: true,
            ..Self::default()
        })
    }

    pub fn connects(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, index: usize) -> Arc<FakeTransport> {
        self.links.lock().unwrap()[index].clone()
    }

    pub fn last_link(&self) -> Arc<FakeTransport> {
        self.links
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened")
    }

    pub fn last_params(&self) -> ConnectParams {
        self.params
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no connection opened")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, params: ConnectParams) -> Result<Connection, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Connected)
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let link = Arc::new(FakeTransport {
            calls: Mutex::new(Vec::new()),
            events: tx,
            hold: self.hold,
            manual_disconnect: self.manual_disconnect,
            held: Mutex::new(Vec::new()),
        });
        self.links.lock().unwrap().push(link.clone());
        self.params.lock().unwrap().push(params);

        Ok(Connection {
            transport: link,
            events: rx,
        })
    }
}

pub fn client(registrar: &Arc<FakeRegistrar>, connector: &Arc<FakeConnector>) -> Client {
    Client::with_backends(DanConfig::default(), registrar.clone(), connector.clone())
}

/// Polls `condition` until it holds, failing the test after two seconds
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), future)
        .await
        .expect("future did not complete in time")
}
