use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs};
use ota_core::OtaConfig;
use serde::{Deserialize, Serialize};

const CONFIG_NAMESPACE: &str = "esproom";
const CONFIG_KEY: &str = "config";
const MAX_CONFIG_BYTES: usize = 2048;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub wifi_ssid: String,
    pub wifi_password: String,
    #[serde(default)]
    pub ota: OtaConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        // Baked in by build.rs from device_config.h, which stays out of git
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        let mut ota = OtaConfig::default();
        ota.server_host = env!("OTA_SERVER_IP").to_string();
        ota.server_port = env!("OTA_SERVER_PORT").parse().unwrap_or(ota.server_port);
        ota.image_path = env!("OTA_FILENAME").to_string();

        Self {
            wifi_ssid: wifi_ssid.to_string(),
            wifi_password: wifi_password.to_string(),
            ota,
        }
    }
}

impl DeviceConfig {
    pub fn save(&self, nvs_partition: &EspDefaultNvsPartition) -> Result<()> {
        let mut nvs = EspNvs::new(nvs_partition.clone(), CONFIG_NAMESPACE, true)?;
        let data = serde_json::to_vec(self)?;
        nvs.set_blob(CONFIG_KEY, &data)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }
}

pub fn load_or_default(nvs_partition: &EspDefaultNvsPartition) -> Result<DeviceConfig> {
    let mut config = match load_from_nvs(nvs_partition) {
        Ok(config) => {
            log::info!("Loaded configuration from NVS");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
            let config = DeviceConfig::default();
            if let Err(save_err) = config.save(nvs_partition) {
                log::warn!("Failed to save default config to NVS: {:?}", save_err);
            }
            return Ok(config);
        }
    };

    let defaults = DeviceConfig::default();
    if config.wifi_ssid.is_empty() {
        log::warn!("NVS WiFi credentials empty, using compiled defaults: SSID='{}'", defaults.wifi_ssid);
        config.wifi_ssid = defaults.wifi_ssid;
        config.wifi_password = defaults.wifi_password;
    }
    if let Err(e) = config.ota.validate() {
        log::warn!("Stored update settings rejected ({}), using compiled defaults", e);
        config.ota = defaults.ota;
    }

    Ok(config)
}

fn load_from_nvs(nvs_partition: &EspDefaultNvsPartition) -> Result<DeviceConfig> {
    let nvs = EspNvs::new(nvs_partition.clone(), CONFIG_NAMESPACE, true)?;

    let mut buf = vec![0u8; MAX_CONFIG_BYTES];
    let data = nvs
        .get_blob(CONFIG_KEY, &mut buf)?
        .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

    Ok(serde_json::from_slice(data)?)
}
