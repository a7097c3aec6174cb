//! Host-based tests for the ESProom update engine
//! These run the real TCP transport against a loopback image server, with an
//! in-memory flash standing in for the OTA partition.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ota_core::{DeviceReset, FlashError, FlashWriter, OtaConfig, SlotGeometry};

/// How the loopback server delivers its canned response.
#[derive(Debug, Clone, Copy)]
pub struct ServePlan {
    /// Bytes per write; small values force header and slot boundaries to straddle reads.
    pub segment: usize,
    /// Stop sending after this many response bytes.
    pub cut_after: Option<usize>,
    /// Keep the socket open without sending anything for this long before closing.
    pub stall: Option<Duration>,
}

impl Default for ServePlan {
    fn default() -> Self {
        Self { segment: 97, cut_after: None, stall: None }
    }
}

/// Single-shot HTTP/1.0 server that answers one request with `response`.
pub struct ImageServer {
    port: u16,
    handle: JoinHandle<Vec<u8>>,
}

impl ImageServer {
    pub fn serve(response: Vec<u8>, plan: ServePlan) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let port = listener.local_addr().expect("local addr").port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept");
            let request = read_request(&mut stream);

            let limit = plan.cut_after.unwrap_or(response.len()).min(response.len());
            for segment in response[..limit].chunks(plan.segment.max(1)) {
                // The client hangs up once its slot is complete.
                if stream.write_all(segment).and_then(|_| stream.flush()).is_err() {
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            }
            if let Some(stall) = plan.stall {
                thread::sleep(stall);
            }
            request
        });

        Self { port, handle }
    }

    pub fn config(&self) -> OtaConfig {
        OtaConfig {
            server_host: "127.0.0.1".into(),
            server_port: self.port,
            recv_timeout_ms: 2_000,
            ..OtaConfig::default()
        }
    }

    /// Wait for the server thread and return the request it received.
    pub fn finish(self) -> Vec<u8> {
        self.handle.join().expect("image server thread")
    }
}

fn read_request(stream: &mut TcpStream) -> Vec<u8> {
    let mut request = Vec::new();
    let mut buf = [0u8; 256];
    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => request.extend_from_slice(&buf[..n]),
        }
    }
    request
}

/// Multi-slot image whose bytes encode their own offset, so misplaced writes show up.
pub fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn http_response(content_length: Option<usize>, body: &[u8]) -> Vec<u8> {
    let mut raw = String::from("HTTP/1.0 200 OK\r\nServer: SimpleHTTP/0.6 Python/3.11\r\n");
    if let Some(len) = content_length {
        raw.push_str(&format!("Content-Length: {}\r\n", len));
    }
    raw.push_str("Content-Type: application/octet-stream\r\n\r\n");

    let mut bytes = raw.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlashCall {
    Begin,
    Write(usize),
    End,
    SetBoot,
}

#[derive(Debug, Default, Clone)]
pub struct FlashState {
    pub calls: Vec<FlashCall>,
    pub data: Vec<u8>,
    pub fail_write_after: Option<usize>,
    pub fail_end: bool,
    pub fail_set_boot: bool,
}

/// In-memory partition shared with the test through an `Arc`, so it can live
/// inside an update task.
#[derive(Clone)]
pub struct MemoryFlash {
    geometry: SlotGeometry,
    state: Arc<Mutex<FlashState>>,
}

impl MemoryFlash {
    pub fn new(geometry: SlotGeometry) -> Self {
        Self { geometry, state: Arc::default() }
    }

    pub fn failing_after(geometry: SlotGeometry, bytes: usize) -> Self {
        let flash = Self::new(geometry);
        flash.lock().fail_write_after = Some(bytes);
        flash
    }

    pub fn failing_finalize(geometry: SlotGeometry, end: bool, set_boot: bool) -> Self {
        let flash = Self::new(geometry);
        {
            let mut state = flash.lock();
            state.fail_end = end;
            state.fail_set_boot = set_boot;
        }
        flash
    }

    pub fn snapshot(&self) -> FlashState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, FlashState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl FlashWriter for MemoryFlash {
    type Handle = ();

    fn geometry(&self) -> SlotGeometry {
        self.geometry
    }

    fn begin(&mut self) -> Result<(), FlashError> {
        self.lock().calls.push(FlashCall::Begin);
        Ok(())
    }

    fn write(&mut self, _handle: &mut (), bytes: &[u8]) -> Result<(), FlashError> {
        let mut state = self.lock();
        if state.fail_write_after.is_some_and(|limit| state.data.len() >= limit) {
            return Err(FlashError::Write(0x1503));
        }
        state.calls.push(FlashCall::Write(bytes.len()));
        state.data.extend_from_slice(bytes);
        Ok(())
    }

    fn end(&mut self, _handle: ()) -> Result<(), FlashError> {
        let mut state = self.lock();
        state.calls.push(FlashCall::End);
        if state.fail_end {
            return Err(FlashError::End(0x1503));
        }
        Ok(())
    }

    fn set_boot_partition(&mut self) -> Result<(), FlashError> {
        let mut state = self.lock();
        state.calls.push(FlashCall::SetBoot);
        if state.fail_set_boot {
            return Err(FlashError::SetBootPartition(0x102));
        }
        Ok(())
    }
}

/// Counts restarts instead of performing them.
#[derive(Clone, Default)]
pub struct CountingReset(Arc<AtomicU32>);

impl CountingReset {
    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

impl DeviceReset for CountingReset {
    fn restart(&self) {
        log::info!("restart requested");
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ota_core::{
        HeaderError, OtaError, OtaService, Phase, ProgressLog, ProgressSink, TcpConnection,
        TransportError, Updater, ViewerConfig, WatchOutcome,
    };
    use sha2::{Digest, Sha256};
    use std::sync::mpsc;

    fn geometry(total: u8, target: u8) -> SlotGeometry {
        SlotGeometry::new(total, target).unwrap()
    }

    fn run(
        server: &ImageServer,
        flash: &MemoryFlash,
        reset: &CountingReset,
        progress: &ProgressLog,
    ) -> Result<ota_core::UpdateReport, OtaError> {
        let config = server.config();
        let mut updater = Updater::new(flash.clone(), reset.clone(), progress, config.chunk_size);
        updater.execute(&config, TcpConnection::connect)
    }

    #[test]
    fn writes_only_the_target_slot() {
        let body = image(3000);
        let server = ImageServer::serve(http_response(Some(3000), &body), ServePlan::default());
        let flash = MemoryFlash::new(geometry(3, 1));
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let report = run(&server, &flash, &reset, &progress).unwrap();
        let request = server.finish();

        let state = flash.snapshot();
        assert_eq!(state.data, &body[1000..2000]);
        assert_eq!(state.calls.first(), Some(&FlashCall::Begin));
        assert_eq!(&state.calls[state.calls.len() - 2..], &[FlashCall::End, FlashCall::SetBoot]);
        assert_eq!(reset.count(), 1);
        assert_eq!(progress.phase(), Phase::Completed);
        assert_eq!(progress.bytes_written(), 1000);

        assert_eq!(report.slot_bytes_written, 1000);
        assert_eq!(report.content_length, 3000);
        assert_eq!(report.sha256.as_slice(), Sha256::digest(&body[1000..2000]).as_slice());

        let request = String::from_utf8(request).unwrap();
        assert!(request.starts_with("GET /esproom.bin HTTP/1.0\r\n"));
        assert!(request.contains("User-Agent: esp-idf/1.0 esp32\r\n"));
    }

    #[test]
    fn last_slot_takes_the_division_remainder_only_up_to_slot_size() {
        // 3001 / 3 = 1000 per slot; the trailing byte belongs to no slot.
        let body = image(3001);
        let server = ImageServer::serve(http_response(Some(3001), &body), ServePlan { segment: 13, ..ServePlan::default() });
        let flash = MemoryFlash::new(geometry(3, 2));
        let reset = CountingReset::default();

        run(&server, &flash, &reset, &ProgressLog::new()).unwrap();
        server.finish();

        assert_eq!(flash.snapshot().data, &body[2000..3000]);
        assert_eq!(reset.count(), 1);
    }

    #[test]
    fn peer_closing_before_slot_end_aborts_without_reset() {
        let body = image(3000);
        let response = http_response(Some(3000), &body);
        let header_len = response.len() - body.len();
        let server = ImageServer::serve(
            response,
            ServePlan { cut_after: Some(header_len + 1500), ..ServePlan::default() },
        );
        let flash = MemoryFlash::new(geometry(3, 1));
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let err = run(&server, &flash, &reset, &progress).unwrap_err();
        server.finish();

        assert_eq!(
            err,
            OtaError::Transport(TransportError::PrematureClose { body_bytes_seen: 1500 })
        );
        let state = flash.snapshot();
        assert_eq!(state.data, &body[1000..1500]);
        assert!(!state.calls.contains(&FlashCall::End));
        assert!(!state.calls.contains(&FlashCall::SetBoot));
        assert_eq!(reset.count(), 0);
        assert_eq!(progress.phase(), Phase::Failed);
    }

    #[test]
    fn missing_content_length_writes_nothing() {
        let server = ImageServer::serve(http_response(None, &image(500)), ServePlan::default());
        let flash = MemoryFlash::new(geometry(2, 0));
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let err = run(&server, &flash, &reset, &progress).unwrap_err();
        server.finish();

        assert_eq!(err, OtaError::Header(HeaderError::MissingContentLength));
        assert!(flash.snapshot().data.is_empty());
        assert_eq!(reset.count(), 0);
        assert!(progress
            .recent_lines()
            .iter()
            .any(|l| l == "Exiting task due to fatal error..."));
    }

    #[test]
    fn stalled_server_times_out() {
        let body = image(2000);
        let response = http_response(Some(2000), &body);
        let header_len = response.len() - body.len();
        let server = ImageServer::serve(
            response,
            ServePlan {
                cut_after: Some(header_len + 100),
                stall: Some(Duration::from_millis(800)),
                ..ServePlan::default()
            },
        );
        let mut config = server.config();
        config.recv_timeout_ms = 200;
        let flash = MemoryFlash::new(geometry(2, 0));
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let mut updater = Updater::new(flash.clone(), reset.clone(), &progress, config.chunk_size);
        let err = updater.execute(&config, TcpConnection::connect).unwrap_err();
        server.finish();

        assert_eq!(err, OtaError::Transport(TransportError::Timeout));
        assert_eq!(flash.snapshot().data, &body[..100]);
        assert_eq!(reset.count(), 0);
    }

    #[test]
    fn flash_write_failure_resets_device() {
        let body = image(4000);
        let server = ImageServer::serve(http_response(Some(4000), &body), ServePlan::default());
        let flash = MemoryFlash::failing_after(geometry(2, 1), 500);
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let err = run(&server, &flash, &reset, &progress).unwrap_err();
        server.finish();

        assert!(matches!(err, OtaError::Flash(FlashError::Write(_))));
        assert!(err.requires_reset());
        assert_eq!(reset.count(), 1);
        assert_eq!(progress.phase(), Phase::Failed);
        assert!(!flash.snapshot().calls.contains(&FlashCall::SetBoot));
    }

    #[test]
    fn finalize_failures_reset_device() {
        let body = image(2000);

        let server = ImageServer::serve(http_response(Some(2000), &body), ServePlan::default());
        let flash = MemoryFlash::failing_finalize(geometry(2, 1), true, false);
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let err = run(&server, &flash, &reset, &progress).unwrap_err();
        server.finish();

        assert_eq!(err, OtaError::Flash(FlashError::End(0x1503)));
        let state = flash.snapshot();
        assert_eq!(state.data, &body[1000..2000]);
        assert!(!state.calls.contains(&FlashCall::SetBoot));
        assert_eq!(reset.count(), 1);
        assert_eq!(progress.phase(), Phase::Failed);

        let server = ImageServer::serve(http_response(Some(2000), &body), ServePlan::default());
        let flash = MemoryFlash::failing_finalize(geometry(2, 0), false, true);
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let err = run(&server, &flash, &reset, &progress).unwrap_err();
        server.finish();

        assert_eq!(err, OtaError::Flash(FlashError::SetBootPartition(0x102)));
        assert_eq!(flash.snapshot().calls.last(), Some(&FlashCall::SetBoot));
        assert_eq!(reset.count(), 1);
        assert_eq!(progress.phase(), Phase::Failed);
    }

    #[test]
    fn unreachable_server_fails_before_touching_flash() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = OtaConfig {
            server_host: "127.0.0.1".into(),
            server_port: port,
            ..OtaConfig::default()
        };
        let flash = MemoryFlash::new(geometry(2, 0));
        let reset = CountingReset::default();
        let progress = ProgressLog::new();

        let mut updater = Updater::new(flash.clone(), reset.clone(), &progress, config.chunk_size);
        let err = updater.execute(&config, TcpConnection::connect).unwrap_err();

        assert!(matches!(err, OtaError::Transport(TransportError::Connect(_))));
        assert!(flash.snapshot().calls.is_empty());
        assert_eq!(reset.count(), 0);
    }

    #[test]
    fn viewer_streams_a_full_update() {
        let body = image(2048);
        let server = ImageServer::serve(http_response(Some(2048), &body), ServePlan::default());
        let config = server.config();
        let flash = MemoryFlash::new(geometry(2, 1));
        let reset = CountingReset::default();
        let service = OtaService::new(
            Arc::new(ProgressLog::new()),
            ViewerConfig { poll_interval: Duration::from_millis(5), max_polls: 2_000 },
        );

        let (job_flash, job_reset) = (flash.clone(), reset.clone());
        let mut seen = Vec::new();
        let outcome = service
            .trigger::<OtaError, _, _>(
                move |progress| {
                    let mut updater = Updater::new(job_flash, job_reset, &*progress, config.chunk_size);
                    let _ = updater.execute(&config, TcpConnection::connect);
                },
                |line| {
                    seen.push(line.to_string());
                    Ok(())
                },
            )
            .unwrap();
        server.finish();

        assert_eq!(outcome, WatchOutcome::Completed);
        assert_eq!(flash.snapshot().data, &body[1024..2048]);
        assert_eq!(reset.count(), 1);
        assert!(seen.iter().any(|l| l.starts_with("Have written image length")));
        assert_eq!(seen.last().map(String::as_str), Some("Prepare to restart system!"));
    }

    #[test]
    fn concurrent_trigger_joins_instead_of_starting_a_second_session() {
        let service = OtaService::new(
            Arc::new(ProgressLog::new()),
            ViewerConfig { poll_interval: Duration::from_millis(5), max_polls: 2_000 },
        );
        let sessions = Arc::new(AtomicU32::new(0));
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let counter = Arc::clone(&sessions);
        service
            .start(move |progress| {
                counter.fetch_add(1, Ordering::SeqCst);
                progress.push_line("Connected to server");
                let _ = release_rx.recv();
                progress.set_phase(Phase::Completed);
            })
            .unwrap();

        let counter = Arc::clone(&sessions);
        let mut release = Some(release_tx);
        let outcome = service
            .trigger::<OtaError, _, _>(
                move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                |_| {
                    if let Some(tx) = release.take() {
                        let _ = tx.send(());
                    }
                    Ok(())
                },
            )
            .unwrap();

        assert_eq!(outcome, WatchOutcome::Completed);
        assert_eq!(sessions.load(Ordering::SeqCst), 1);
    }
}
