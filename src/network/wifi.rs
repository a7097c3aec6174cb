use anyhow::{bail, Result};
use esp_idf_hal::modem::Modem;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi},
};

/// Station-mode Wi-Fi link. Dropping it tears the connection down.
pub struct WifiLink {
    wifi: BlockingWifi<EspWifi<'static>>,
    ssid: String,
}

impl WifiLink {
    pub fn new(
        modem: Modem,
        sys_loop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        ssid: &str,
        password: &str,
    ) -> Result<Self> {
        if ssid.is_empty() {
            log::error!("WiFi SSID is empty! Check device_config.h");
            bail!("WiFi SSID cannot be empty");
        }

        let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs))?;

        let cfg = Configuration::Client(ClientConfiguration {
            ssid: ssid
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid SSID format: {}", ssid))?,
            password: password
                .try_into()
                .map_err(|_| anyhow::anyhow!("Invalid password format"))?,
            auth_method: if password.is_empty() {
                log::warn!("WiFi password is empty, using open network");
                AuthMethod::None
            } else {
                AuthMethod::WPA2Personal
            },
            ..Default::default()
        });
        esp_wifi.set_configuration(&cfg)?;

        let wifi = BlockingWifi::wrap(esp_wifi, sys_loop)?;
        Ok(Self { wifi, ssid: ssid.to_string() })
    }

    pub fn connect(&mut self) -> Result<()> {
        log::info!("Connecting to {}...", self.ssid);
        self.wifi.start()?;
        self.wifi.connect()?;

        log::info!("Waiting for DHCP...");
        self.wifi.wait_netif_up()?;

        match self.ip() {
            Some(ip) => log::info!("WiFi connected, IP {}", ip),
            None => log::info!("WiFi connected"),
        }
        Ok(())
    }

    pub fn ip(&self) -> Option<String> {
        self.wifi
            .wifi()
            .sta_netif()
            .get_ip_info()
            .ok()
            .map(|ip_info| ip_info.ip.to_string())
    }
}
