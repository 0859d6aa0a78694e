//! # IoTtalk Device Application Node (DAN)
//!
//! Registers a process as a device on an IoTtalk server and exchanges data
//! with it over channels the server assigns at runtime.
//!
//! ## Module Architecture
//!
//! ```text
//! client.rs        - register / push / deregister and the delivery task
//! registration.rs  - HTTP handshake (PUT / DELETE) with the server
//! signal.rs        - CONNECT / DISCONNECT commands on the control channel
//! data.rs          - data payload wrapping and inbound dispatch
//! channel_pool.rs  - feature ⇄ topic table
//! context.rs       - session state, hooks, lifecycle states
//! feature.rs       - device feature descriptors
//! transport/       - pub/sub boundary and its rumqttc implementation
//! config.rs        - TOML configuration
//! ```
//!
//! ## Usage
//!
//! A process with a single device can use the module-level functions, which
//! share one lazily created [`Client`]:
//!
//! ```rust,no_run
//! use dan::{DeviceFeature, Hooks, PushMode, RegisterOptions};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let options = RegisterOptions::new("http://localhost:9992")
//!     .name("Dummy")
//!     .idf(DeviceFeature::new("temp", ["C"])?);
//! let hooks = Hooks::new(|_command, _features| Ok(()), |feature, data| {
//!     println!("{feature}: {data}");
//! });
//!
//! dan::register(options, hooks).await?;
//! dan::push("temp", 25.0, PushMode::Fire).await?;
//! dan::deregister().await?;
//! # Ok(())
//! # }
//! ```
//!
//! Processes with several devices create one [`Client`] per device.

pub mod channel_pool;
pub mod client;
pub mod config;
pub mod context;
pub mod data;
pub mod error;
pub mod feature;
pub mod registration;
pub mod signal;
pub mod transport;

use once_cell::sync::Lazy;
use serde_json::Value;

pub use channel_pool::ChannelPool;
pub use client::{Client, PushMode, RegisterOptions};
pub use config::DanConfig;
pub use context::{ConnectionState, Hooks, SessionContext, SessionInfo, SessionStatus};
pub use error::{ConfigError, PoolError, RegistrationError, SignalError, TransportError};
pub use feature::DeviceFeature;
pub use signal::{Command, ControlReply, ReplyState};

static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(Client::new);

/// The process-wide client behind the module-level functions
pub fn default_client() -> &'static Client {
    &DEFAULT_CLIENT
}

pub async fn register(options: RegisterOptions, hooks: Hooks) -> Result<SessionInfo, RegistrationError> {
    DEFAULT_CLIENT.register(options, hooks).await
}

pub async fn deregister() -> Result<Value, RegistrationError> {
    DEFAULT_CLIENT.deregister().await
}

pub async fn push(
    idf: &str,
    data: impl Into<Value>,
    mode: PushMode,
) -> Result<bool, RegistrationError> {
    DEFAULT_CLIENT.push(idf, data, mode).await
}

pub async fn push_produced(idf: &str, mode: PushMode) -> Result<bool, RegistrationError> {
    DEFAULT_CLIENT.push_produced(idf, mode).await
}

pub async fn wait_until_deregistered() {
    DEFAULT_CLIENT.wait_until_deregistered().await
}
