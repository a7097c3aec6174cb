use esp_idf_hal::delay::FreeRtos;
use log::info;
use ota_core::DeviceReset;

/// Delay before restarting so the last log lines reach the UART and any
/// connected viewer.
const RESTART_GRACE_MS: u32 = 1000;

/// `esp_restart()` behind the updater's reset seam.
pub struct EspRestart;

impl DeviceReset for EspRestart {
    fn restart(&self) {
        info!("Restarting system...");
        log::logger().flush();
        FreeRtos::delay_ms(RESTART_GRACE_MS);
        unsafe { esp_idf_sys::esp_restart() }
    }
}

/// Get the last reset reason as a string
pub fn get_reset_reason() -> &'static str {
    let reason = unsafe { esp_idf_sys::esp_reset_reason() };

    match reason {
        esp_idf_sys::esp_reset_reason_t_ESP_RST_POWERON => "Power-on",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_EXT => "External pin",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_SW => "Software reset",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_PANIC => "Panic",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_INT_WDT => "Interrupt watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_TASK_WDT => "Task watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_WDT => "Other watchdog",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => "Deep sleep",
        esp_idf_sys::esp_reset_reason_t_ESP_RST_BROWNOUT => "Brownout",
        _ => "Unknown",
    }
}
