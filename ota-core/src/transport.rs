//! Transport loop: request the image, drive an [`UpdateSession`] with every
//! received chunk and hand the target slot's bytes to the flash writer.
//!
//! Failure policy:
//! - header and socket errors abort the attempt and leave the running firmware alone;
//! - a flash failure after the partition was touched, and any successful
//!   finalize, end with a device reset.

use log::Level;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::OtaConfig;
use crate::error::{FlashError, HeaderError, OtaError, TransportError};
use crate::progress::{Phase, ProgressSink};
use crate::session::{SlotGeometry, UpdateSession};

/// Progress lines per slot; the ring must keep a whole poll interval's worth.
const PROGRESS_STEPS: u64 = 10;

/// Byte stream to the update server. A `recv` of 0 bytes means the peer closed.
pub trait Connection {
    fn send_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
}

/// Append-only writer for the partition being updated.
///
/// Called in strict order: one `begin`, any number of `write`, one `end`,
/// one `set_boot_partition`.
pub trait FlashWriter {
    type Handle;

    /// Slot layout of the partition this writer targets.
    fn geometry(&self) -> SlotGeometry;

    fn begin(&mut self) -> Result<Self::Handle, FlashError>;

    fn write(&mut self, handle: &mut Self::Handle, bytes: &[u8]) -> Result<(), FlashError>;

    fn end(&mut self, handle: Self::Handle) -> Result<(), FlashError>;

    fn set_boot_partition(&mut self) -> Result<(), FlashError>;
}

/// Unconditional device restart. On hardware this never returns.
pub trait DeviceReset {
    fn restart(&self);
}

pub fn build_request(config: &OtaConfig) -> String {
    format!(
        "GET {} HTTP/1.0\r\nHost: {}:{}\r\nUser-Agent: {}\r\n\r\n",
        config.image_path, config.server_host, config.server_port, config.user_agent
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub geometry: SlotGeometry,
    pub content_length: u64,
    pub body_bytes_seen: u64,
    pub slot_bytes_written: u64,
    /// Digest of the bytes handed to the flash writer. Reported, never verified.
    pub sha256: [u8; 32],
}

impl UpdateReport {
    pub fn sha256_hex(&self) -> String {
        self.sha256.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

pub struct Updater<'a, F, R, P: ?Sized> {
    flash: F,
    reset: R,
    progress: &'a P,
    chunk_size: usize,
}

impl<'a, F, R, P> Updater<'a, F, R, P>
where
    F: FlashWriter,
    R: DeviceReset,
    P: ProgressSink + ?Sized,
{
    pub fn new(flash: F, reset: R, progress: &'a P, chunk_size: usize) -> Self {
        Self { flash, reset, progress, chunk_size }
    }

    /// Run one complete update attempt and apply the reset policy to its outcome.
    pub fn execute<C, K>(&mut self, config: &OtaConfig, connect: K) -> Result<UpdateReport, OtaError>
    where
        C: Connection,
        K: FnOnce(&OtaConfig) -> Result<C, TransportError>,
    {
        let result = self.download(config, connect);

        match &result {
            Ok(report) => {
                self.report(Level::Info, format_args!("Image sha256 {}", report.sha256_hex()));
                self.report(Level::Info, format_args!("Prepare to restart system!"));
                self.progress.set_phase(Phase::Completed);
                self.reset.restart();
            }
            Err(e) if e.requires_reset() => {
                self.report(Level::Error, format_args!("{}", e));
                self.report(Level::Error, format_args!("Restarting after flash failure"));
                self.progress.set_phase(Phase::Failed);
                self.reset.restart();
            }
            Err(e) => {
                self.report(Level::Error, format_args!("{}", e));
                self.report(Level::Error, format_args!("Exiting task due to fatal error..."));
                self.progress.set_phase(Phase::Failed);
            }
        }

        result
    }

    fn download<C, K>(&mut self, config: &OtaConfig, connect: K) -> Result<UpdateReport, OtaError>
    where
        C: Connection,
        K: FnOnce(&OtaConfig) -> Result<C, TransportError>,
    {
        self.report(
            Level::Info,
            format_args!("Server IP: {} Server Port:{}", config.server_host, config.server_port),
        );
        let mut conn = connect(config)?;
        self.report(Level::Info, format_args!("Connected to server"));

        conn.send_all(build_request(config).as_bytes())?;
        self.report(Level::Info, format_args!("Send GET request to server succeeded"));

        let geometry = self.flash.geometry();
        let mut handle = self.flash.begin()?;
        self.report(
            Level::Info,
            format_args!(
                "Flash writer ready for slot {} of {}",
                geometry.target_slot(),
                geometry.total_slots()
            ),
        );

        let mut session = UpdateSession::new(geometry);
        let report = self.stream(&mut conn, &mut session, &mut handle)?;
        drop(conn);

        self.report(
            Level::Info,
            format_args!("Total Write binary data length : {}", report.slot_bytes_written),
        );

        self.flash.end(handle)?;
        self.flash.set_boot_partition()?;
        Ok(report)
    }

    fn stream<C: Connection>(
        &mut self,
        conn: &mut C,
        session: &mut UpdateSession,
        handle: &mut F::Handle,
    ) -> Result<UpdateReport, OtaError> {
        let mut buf = vec![0u8; self.chunk_size];
        // Header bytes carried over until the blank line arrives.
        let mut filled = 0;
        let mut hasher = Sha256::new();
        let mut next_report = 0;

        loop {
            if filled == buf.len() {
                return Err(HeaderError::HeaderTooLarge { limit: buf.len() }.into());
            }

            let received = conn.recv(&mut buf[filled..])?;
            if received == 0 {
                return Err(TransportError::PrematureClose {
                    body_bytes_seen: session.body_bytes_seen(),
                }
                .into());
            }

            let end = filled + received;
            let chunk = &buf[..end];
            let feed = session.feed(chunk)?;

            if let Some(bytes) = feed.writable.and_then(|range| range.slice(chunk)) {
                self.flash.write(handle, bytes)?;
                hasher.update(bytes);
                let written = session.slot_bytes_written();
                self.progress.set_bytes_written(written);
                if written >= next_report {
                    self.report(Level::Info, format_args!("Have written image length {}", written));
                    next_report = written + (session.slot_size() / PROGRESS_STEPS).max(1);
                } else {
                    log::debug!("Have written image length {}", written);
                }
            }

            filled = if feed.consumed < end {
                buf.copy_within(feed.consumed..end, 0);
                end - feed.consumed
            } else {
                0
            };

            if session.is_slot_complete() {
                session.step(&[])?;
                break;
            }
        }

        let mut sha256 = [0u8; 32];
        sha256.copy_from_slice(&hasher.finalize());

        Ok(UpdateReport {
            geometry: session.geometry(),
            content_length: session.content_length(),
            body_bytes_seen: session.body_bytes_seen(),
            slot_bytes_written: session.slot_bytes_written(),
            sha256,
        })
    }

    fn report(&self, level: Level, args: fmt::Arguments<'_>) {
        let line = args.to_string();
        log::log!(level, "{}", line);
        self.progress.push_line(&line);
    }
}
