// Flash writer backed by the ESP-IDF OTA API

use anyhow::{anyhow, Result};
use core::ffi::c_void;
use esp_idf_sys::{
    esp, esp_ota_begin, esp_ota_end, esp_ota_get_app_partition_count, esp_ota_get_boot_partition,
    esp_ota_get_next_update_partition, esp_ota_get_running_partition, esp_ota_handle_t,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0,
    esp_partition_t, OTA_SIZE_UNKNOWN,
};
use ota_core::{FlashError, FlashWriter, ProgressSink, SlotGeometry};

/// Writes the target slot of the image into the next OTA partition.
pub struct EspFlashWriter {
    update_partition: &'static esp_partition_t,
    geometry: SlotGeometry,
}

impl EspFlashWriter {
    pub fn for_next_update_partition() -> Result<Self> {
        let update_partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()).as_ref() }
            .ok_or_else(|| anyhow!("No OTA update partition in the partition table"))?;

        let total_slots = unsafe { esp_ota_get_app_partition_count() };
        let target_slot = update_partition
            .subtype
            .checked_sub(esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_0)
            .and_then(|slot| u8::try_from(slot).ok())
            .ok_or_else(|| anyhow!("Update partition subtype {} is not an OTA app slot", update_partition.subtype))?;

        let geometry = SlotGeometry::new(total_slots, target_slot)?;
        log::info!(
            "Writing to partition subtype {} at offset 0x{:x} (slot {} of {})",
            update_partition.subtype,
            update_partition.address,
            target_slot,
            total_slots
        );

        Ok(Self { update_partition, geometry })
    }
}

impl FlashWriter for EspFlashWriter {
    type Handle = esp_ota_handle_t;

    fn geometry(&self) -> SlotGeometry {
        self.geometry
    }

    fn begin(&mut self) -> Result<esp_ota_handle_t, FlashError> {
        let mut handle: esp_ota_handle_t = 0;
        esp!(unsafe { esp_ota_begin(self.update_partition, OTA_SIZE_UNKNOWN as _, &mut handle) })
            .map_err(|e| FlashError::Begin(e.code()))?;
        Ok(handle)
    }

    fn write(&mut self, handle: &mut esp_ota_handle_t, bytes: &[u8]) -> Result<(), FlashError> {
        esp!(unsafe { esp_ota_write(*handle, bytes.as_ptr() as *const c_void, bytes.len() as _) })
            .map_err(|e| FlashError::Write(e.code()))
    }

    fn end(&mut self, handle: esp_ota_handle_t) -> Result<(), FlashError> {
        esp!(unsafe { esp_ota_end(handle) }).map_err(|e| FlashError::End(e.code()))
    }

    fn set_boot_partition(&mut self) -> Result<(), FlashError> {
        esp!(unsafe { esp_ota_set_boot_partition(self.update_partition) })
            .map_err(|e| FlashError::SetBootPartition(e.code()))
    }
}

/// Report which partition is running and which one the bootloader picks.
///
/// They differ when the configured boot partition is corrupted and the
/// bootloader fell back to another slot.
pub fn log_partitions(progress: &dyn ProgressSink) {
    let configured = unsafe { esp_ota_get_boot_partition().as_ref() };
    let running = unsafe { esp_ota_get_running_partition().as_ref() };

    let (Some(configured), Some(running)) = (configured, running) else {
        log::warn!("Partition table lookup failed");
        return;
    };

    if configured.address != running.address {
        let line = format!(
            "Configured OTA boot partition at offset 0x{:08x}, but running from offset 0x{:08x}",
            configured.address, running.address
        );
        log::warn!("{}", line);
        progress.push_line(&line);
        log::warn!("(This can happen if either the OTA boot data or preferred boot image become corrupted somehow.)");
    }

    let line = format!(
        "Running partition type {} subtype {} (offset 0x{:08x})",
        running.type_, running.subtype, running.address
    );
    log::info!("{}", line);
    progress.push_line(&line);
}
