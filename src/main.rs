#![cfg_attr(not(target_os = "espidf"), allow(dead_code))]

use anyhow::Result;
use log::{info, LevelFilter};

#[cfg(target_os = "espidf")]
use {
    anyhow::Context,
    esp_idf_hal::{delay::FreeRtos, prelude::Peripherals},
    esp_idf_svc::{eventloop::EspSystemEventLoop, nvs::EspDefaultNvsPartition},
    esp_idf_sys as _, // Binstart
    ota_core::{OtaService, ProgressLog, ViewerConfig},
    std::sync::Arc,
};

// Generate ESP-IDF app descriptor
#[cfg(target_os = "espidf")]
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

#[cfg(target_os = "espidf")]
mod config;
#[cfg(target_os = "espidf")]
mod network;
#[cfg(target_os = "espidf")]
mod ota;
#[cfg(target_os = "espidf")]
mod system;

mod logging;
mod templates;
mod version;

#[cfg(target_os = "espidf")]
fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    logging::init_logger(LevelFilter::Info)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;

    info!("ESProom firmware {}", version::full_version());
    info!("Boot reason: {}", system::reset::get_reset_reason());

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    // Taken once; Wi-Fi and the config store share clones of it
    let nvs = EspDefaultNvsPartition::take()?;

    let device_config = config::load_or_default(&nvs).context("Loading device config")?;
    if let Err(e) = device_config.ota.validate() {
        anyhow::bail!("Update settings invalid: {}", e);
    }
    info!(
        "Update source: {}:{}{}",
        device_config.ota.server_host, device_config.ota.server_port, device_config.ota.image_path
    );

    let mut wifi = network::WifiLink::new(
        peripherals.modem,
        sys_loop,
        nvs.clone(),
        &device_config.wifi_ssid,
        &device_config.wifi_password,
    )?;
    wifi.connect().context("WiFi connection failed")?;

    let service = Arc::new(OtaService::new(
        Arc::new(ProgressLog::new()),
        ViewerConfig::from(&device_config.ota),
    ));
    let _web_server = network::WebServer::new(Arc::clone(&service), device_config.ota.clone())?;

    info!("Ready. Open http://{}/ota to update", wifi.ip().unwrap_or_else(|| "<device>".into()));

    loop {
        FreeRtos::delay_ms(1000);
    }
}

// The firmware only runs on ESP-IDF; the host build exists so the workspace and its tests build everywhere.
#[cfg(not(target_os = "espidf"))]
fn main() -> Result<()> {
    logging::init_logger(LevelFilter::Info)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    info!("ESProom firmware {} targets ESP-IDF; nothing to run on the host", version::full_version());
    Ok(())
}
