use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod ambient;
mod config;
mod dbus_interface;
mod engine;
mod store_sqlite;

use ambient::AmbientConfig;
use config::Config;
use dbus_interface::AttendanceService;
use rollcall_hw::SharedCamera;
use store_sqlite::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "rollcalld starting");

    let config = Config::from_env();
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let camera = SharedCamera::new(config.camera_device.clone());

    // No landmark backend ships with the daemon; liveness gating switches
    // on when one is wired in here.
    let engine = engine::spawn_engine(&config, store.clone(), camera.clone(), None)?;

    let ambient = if config.ambient_enabled {
        let schedules = store.schedule_book(config.schedule)?;
        Some(ambient::spawn_ambient_loop(
            engine.clone(),
            camera.clone(),
            store.clone(),
            schedules,
            AmbientConfig {
                process_every: config.process_every,
                cooldown: Duration::from_secs(config.cooldown_secs),
                max_consecutive_failures: config.max_consecutive_failures,
            },
        ))
    } else {
        tracing::info!("ambient recognition disabled via ROLLCALL_AMBIENT_ENABLED=0");
        None
    };

    let _connection = zbus::connection::Builder::session()?
        .name("org.rollcall.Attendance1")?
        .serve_at("/org/rollcall/Attendance1", AttendanceService::new(engine))?
        .build()
        .await?;

    tracing::info!("rollcalld ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    if let Some(ambient) = ambient {
        ambient.shutdown();
    }
    camera.release();

    Ok(())
}
