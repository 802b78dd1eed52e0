//! Connect to the broker, enroll devices from a JSON inventory file and log
//! every push notification until interrupted.
//!
//! ```text
//! HEARTHFLOW_ACCOUNT=... HEARTHFLOW_KEY=... HEARTHFLOW_TOKEN=... \
//!     cargo run --example notification_monitor -- config.toml inventory.json
//! ```
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use hearthflow_core::config::ConfigBuilder;
use hearthflow_core::logging;
use hearthflow_devices::device::DeviceRecord;
use hearthflow_devices::discovery::StaticInventory;
use hearthflow_devices::{
    ConnectionEvent, Credentials, Device, DiscoveryOptions, Manager, MqttTransport, Notification,
    NotificationObserver,
};

struct LogObserver;

#[async_trait]
impl NotificationObserver for LogObserver {
    async fn on_notification(
        &self,
        notification: &Notification,
        devices: &[Arc<Device>],
    ) -> hearthflow_devices::Result<()> {
        let targets: Vec<String> = devices.iter().map(|d| d.id().to_string()).collect();
        info!(
            "{} from {} -> {:?}: {}",
            notification.namespace, notification.originating_uuid, targets, notification.payload
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let config_path = args.next().context("missing config path")?;
    let inventory_path = args.next().context("missing inventory path")?;

    let config = ConfigBuilder::new()
        .with_config_file(&config_path)
        .with_environment_prefix("HEARTHFLOW")
        .build()?;
    logging::init_from_config(&config.logging)?;

    let records: Vec<DeviceRecord> = serde_json::from_slice(
        &tokio::fs::read(&inventory_path)
            .await
            .with_context(|| format!("reading {}", inventory_path))?,
    )?;
    let inventory = records
        .into_iter()
        .fold(StaticInventory::new(), |inventory, record| {
            inventory.with_device(record, None)
        });

    let credentials = Credentials::new(
        std::env::var("HEARTHFLOW_ACCOUNT")?,
        std::env::var("HEARTHFLOW_KEY")?,
        std::env::var("HEARTHFLOW_TOKEN")?,
    );
    let manager = Manager::new(
        config,
        credentials,
        Arc::new(MqttTransport::new()),
        Arc::new(inventory),
    )?;
    manager.add_observer(Arc::new(LogObserver)).await;

    let mut connection = manager.events().subscribe::<ConnectionEvent>()?;
    manager.connect().await?;

    let result = manager.discover_devices(&DiscoveryOptions::new()).await?;
    info!(
        "Enrolled {} devices, {} failed",
        result.enrolled.len(),
        result.failed.len()
    );
    for device in manager.registry().devices() {
        info!("{} {} ({})", device.id(), device.name(), device.online_status());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = connection.recv() => match event {
                Ok(event) => info!("Connection: {:?}", event),
                Err(_) => break,
            },
        }
    }

    manager.disconnect().await?;
    Ok(())
}
