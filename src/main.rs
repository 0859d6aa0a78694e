use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use dan::{Client, Command, DanConfig, DeviceFeature, Hooks, PushMode, RegisterOptions};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const FALLBACK_URL: &str = "http://localhost:9992";
const PUSH_INTERVAL: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = DanConfig::load_default().await?;
    let device = config.device.clone();
    let url = if device.url.is_empty() {
        FALLBACK_URL.to_string()
    } else {
        device.url.clone()
    };

    let mut counter = 0u64;
    let dummy_sensor = DeviceFeature::new("Dummy_Sensor", ["int"])?;
    let dummy_control = DeviceFeature::new("Dummy_Control", ["int"])?
        .with_on_data(|feature, data| info!("{} <- {}", feature, data));

    let mut options = RegisterOptions::new(url)
        .name(device.name.unwrap_or_else(|| "Dummy".to_string()))
        .idf(dummy_sensor)
        .odf(dummy_control);
    if let Some(id) = device.id {
        options = options.id(id);
    }
    if let Some(protos) = device.accept_protos {
        options = options.accept_protos(protos);
    }

    let hooks = Hooks::new(
        |command: Command, features: Vec<String>| {
            info!("Signal {} for {:?}", command, features);
            Ok(())
        },
        |feature, data| info!("{} <- {}", feature, data),
    )
    .on_connect(|| info!("Transport connected"));

    let client = Client::with_config(config);
    let session = client
        .register(options, hooks)
        .await
        .map_err(|e| eyre!("Registration failed: {}", e))?;
    info!("Registered {}", session.app_id);

    let mut ticker = tokio::time::interval(PUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
            _ = ticker.tick() => {
                counter += 1;
                match client.push("Dummy_Sensor", counter, PushMode::Fire).await {
                    Ok(true) => {}
                    Ok(false) => warn!("Dummy_Sensor not connected yet"),
                    Err(e) => {
                        error!("Push failed: {}", e);
                        break;
                    }
                }
            }
        }
    }

    match client.deregister().await {
        Ok(response) => info!("Deregistered: {}", response),
        Err(e) => error!("Deregistration failed: {}", e),
    }
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
