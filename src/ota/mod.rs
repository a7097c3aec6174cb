// Firmware update task: wires the ESP-IDF flash writer and restart into the streaming updater

pub mod partition;

use std::sync::Arc;

use ota_core::{OtaConfig, Phase, ProgressLog, ProgressSink, TcpConnection, Updater};

use self::partition::EspFlashWriter;
use crate::system::reset::EspRestart;

/// Body of the update task started by [`ota_core::OtaService`].
pub fn update_job(config: OtaConfig) -> impl FnOnce(Arc<ProgressLog>) + Send + 'static {
    move |progress: Arc<ProgressLog>| {
        let banner = format!("Starting OTA update, running {}", crate::version::full_version());
        log::info!("{}", banner);
        progress.push_line(&banner);

        partition::log_partitions(&*progress);

        let flash = match EspFlashWriter::for_next_update_partition() {
            Ok(flash) => flash,
            Err(e) => {
                let line = format!("Cannot prepare update partition: {:#}", e);
                log::error!("{}", line);
                progress.push_line(&line);
                progress.set_phase(Phase::Failed);
                return;
            }
        };

        let mut updater = Updater::new(flash, EspRestart, &*progress, config.chunk_size);
        if let Err(e) = updater.execute(&config, TcpConnection::connect) {
            log::warn!("Update attempt ended without a new image: {}", e);
        }
    }
}
