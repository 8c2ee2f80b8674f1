use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use mai_deploy::config::DeployConfig;
use mai_deploy::launcher::{Launcher, SystemSpawner};
use mai_deploy::manager::Manager;
use mai_deploy::port::{PortAllocator, PortManager, TcpProbe};
use mai_deploy::process_monitor::SysinfoSource;
use mai_deploy::takeover::LocalTakeover;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    tracing::info!("MaiBot deploy core starting");

    let cfg = DeployConfig::load()?;
    let manager = Arc::new(Manager::open(cfg.state_file.clone()));

    let allocator = PortAllocator::with_probe(
        cfg.port_range_start,
        cfg.port_range_end,
        TcpProbe::new(cfg.probe_timeout()),
    );
    let ports = PortManager::new(manager.clone(), allocator).with_env_file_name(&cfg.env_file_name);
    ports.restore_from_registry();
    let port_status = ports.global_port_status();
    tracing::info!(
        "Ports {}: {} allocated, next free {:?}",
        port_status.port_range,
        port_status.allocated_ports.len(),
        port_status.next_available
    );

    let launcher = Arc::new(
        Launcher::new(manager.clone(), Arc::new(SystemSpawner::new()))
            .with_launch_interval(cfg.default_launch_interval())
            .with_restart_delay(cfg.restart_delay()),
    );
    let takeover = Arc::new(LocalTakeover::new(manager.clone(), SysinfoSource::new()));

    manager.register_callback("on_error", |event| {
        tracing::warn!(group = %event.group, instance = %event.instance, "Instance error: {:?}", event.error);
        Ok(())
    });

    // Restored instances are all stopped; the first tick fires immediately so
    // takeovers are reconciled before any status is reported.
    let monitor_takeover = takeover.clone();
    let monitor_launcher = launcher.clone();
    let monitor_interval = cfg.monitor_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(monitor_interval);
        let mut error_count = 0u32;
        loop {
            ticker.tick().await;

            let takeover = monitor_takeover.clone();
            match tokio::task::spawn_blocking(move || takeover.monitor_takeover_instances()).await {
                Ok(reports) => {
                    if error_count > 0 {
                        tracing::info!("Monitor recovered after {} errors", error_count);
                    }
                    error_count = 0;
                    let exited = reports.values().filter(|r| !r.is_running).count();
                    if exited > 0 {
                        tracing::info!("{} taken-over bots have exited", exited);
                    }
                }
                Err(e) => {
                    error_count += 1;
                    // first 3, then every 10th
                    if error_count <= 3 || error_count % 10 == 0 {
                        tracing::error!("Monitor error (count: {}): {}", error_count, e);
                    }
                }
            }

            let status = monitor_launcher.global_status();
            tracing::info!(
                groups = status.total_groups,
                instances = status.total_instances,
                running = status.total_running,
                memory_mb = status.total_memory_mb,
                "Registry status"
            );
        }
    });

    let scan = takeover.clone();
    match tokio::task::spawn_blocking(move || scan.detect_all()).await {
        Ok(found) if !found.is_empty() => {
            tracing::info!("{} local bots available for takeover: {:?}", found.len(), found.keys().collect::<Vec<_>>());
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Initial bot scan failed: {}", e),
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received, saving registry");
    if let Err(e) = manager.save() {
        tracing::error!("Failed to save registry on shutdown: {}", e);
    }
    tracing::info!("MaiBot deploy core shutting down");
    Ok(())
}
