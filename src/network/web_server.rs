use anyhow::Result;
use esp_idf_svc::http::server::{Configuration, EspHttpServer};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::Write;
use ota_core::{OtaConfig, OtaService};
use std::sync::Arc;

use crate::templates;

// The /ota handler runs the viewer loop on the server task
const HTTP_SERVER_STACK: usize = 10240;

const HTML_HEADERS: &[(&str, &str)] = &[
    ("Content-Type", "text/html; charset=utf-8"),
    ("Connection", "close"),
];

pub struct WebServer {
    _server: EspHttpServer<'static>,
}

impl WebServer {
    pub fn new(service: Arc<OtaService>, ota_config: OtaConfig) -> Result<Self> {
        let mut server = EspHttpServer::new(&Configuration {
            stack_size: HTTP_SERVER_STACK,
            ..Default::default()
        })?;

        // Start an update, or join the one in flight, and stream its progress
        let ota_service = Arc::clone(&service);
        server.fn_handler("/ota", Method::Get, move |req| {
            log::info!("Update requested over HTTP");
            let mut response = req.into_response(200, Some("OK"), HTML_HEADERS)?;
            response.write_all(templates::page_head("Firmware update").as_bytes())?;
            response.flush()?;

            let outcome = ota_service.trigger(
                crate::ota::update_job(ota_config.clone()),
                |line| -> Result<()> {
                    response.write_all(templates::progress_line(line).as_bytes())?;
                    response.flush()?;
                    Ok(())
                },
            )?;

            log::info!("Update viewer finished: {:?}", outcome);
            let bytes_written = ota_service.progress().bytes_written();
            response.write_all(templates::outcome_footer(outcome, bytes_written).as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        let log_service = Arc::clone(&service);
        server.fn_handler("/logs", Method::Get, move |req| {
            let progress = log_service.progress();
            let html = templates::render_logs_page(
                &progress.recent_lines(),
                log_service.is_running(),
                progress.bytes_written(),
            );
            let mut response = req.into_response(200, Some("OK"), HTML_HEADERS)?;
            response.write_all(html.as_bytes())?;
            Ok::<(), anyhow::Error>(())
        })?;

        log::info!("Web server started: /ota, /logs");
        Ok(Self { _server: server })
    }
}
