//! Update session: the per-attempt state machine that turns arbitrarily chunked
//! response bytes into the sub-ranges belonging to the target slot.
//!
//! ```text
//! Init -> HeaderParsed -> Writing -> SlotComplete -> Done
//! ```
//!
//! The remote image is `total_slots` equally sized images back to back. Integer
//! division decides the slot size, so any remainder bytes at the end of the body
//! belong to no slot and are never written.

use log::{debug, info};

use crate::error::{HeaderError, OtaError};
use crate::header;

/// Which slot of a multi-slot image this device flashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGeometry {
    total_slots: u8,
    target_slot: u8,
}

impl SlotGeometry {
    pub fn new(total_slots: u8, target_slot: u8) -> Result<Self, OtaError> {
        if total_slots == 0 || target_slot >= total_slots {
            return Err(OtaError::InvalidGeometry { total_slots, target_slot });
        }
        Ok(Self { total_slots, target_slot })
    }

    pub fn total_slots(&self) -> u8 {
        self.total_slots
    }

    pub fn target_slot(&self) -> u8 {
        self.target_slot
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum State {
    Init,
    HeaderParsed,
    Writing,
    SlotComplete,
    Done,
}

/// `(offset, len)` pair inside one chunk, validated against the chunk length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubRange {
    offset: usize,
    len: usize,
}

impl SubRange {
    pub fn within(offset: usize, len: usize, chunk_len: usize) -> Option<Self> {
        match offset.checked_add(len) {
            Some(end) if end <= chunk_len => Some(Self { offset, len }),
            _ => None,
        }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slice<'a>(&self, chunk: &'a [u8]) -> Option<&'a [u8]> {
        chunk.get(self.offset..self.offset.checked_add(self.len)?)
    }
}

/// Result of a single state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Step {
    /// Bytes of the input this step accounted for; 0 means "need more data".
    pub consumed: usize,
    pub writable: Option<SubRange>,
    /// Set exactly once, on the `SlotComplete -> Done` transition.
    pub completed: bool,
}

/// Result of driving the session over one whole chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Feed {
    /// Less than the chunk length only while the header block is incomplete.
    pub consumed: usize,
    /// Relative to the start of the chunk.
    pub writable: Option<SubRange>,
}

#[derive(Debug)]
pub struct UpdateSession {
    geometry: SlotGeometry,
    state: State,
    content_length: u64,
    slot_size: u64,
    slot_offset: u64,
    body_bytes_seen: u64,
    slot_bytes_written: u64,
}

impl UpdateSession {
    pub fn new(geometry: SlotGeometry) -> Self {
        debug!(
            "Total OTA number {} update to {} part",
            geometry.total_slots, geometry.target_slot
        );
        Self {
            geometry,
            state: State::Init,
            content_length: 0,
            slot_size: 0,
            slot_offset: 0,
            body_bytes_seen: 0,
            slot_bytes_written: 0,
        }
    }

    pub fn geometry(&self) -> SlotGeometry {
        self.geometry
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn slot_offset(&self) -> u64 {
        self.slot_offset
    }

    pub fn body_bytes_seen(&self) -> u64 {
        self.body_bytes_seen
    }

    pub fn slot_bytes_written(&self) -> u64 {
        self.slot_bytes_written
    }

    pub fn is_slot_complete(&self) -> bool {
        self.state == State::SlotComplete
    }

    /// Advance the state machine by one transition over `input`.
    ///
    /// While the header block is incomplete nothing is consumed and the caller
    /// must present the same bytes again, extended by whatever arrives next.
    ///
    /// # Panics
    ///
    /// Panics if the session is already `Done`.
    pub fn step(&mut self, input: &[u8]) -> Result<Step, HeaderError> {
        match self.state {
            State::Init => self.parse_header(input),
            State::HeaderParsed => Ok(self.skip_to_slot(input)),
            State::Writing => {
                self.body_bytes_seen += input.len() as u64;
                Ok(Step {
                    consumed: input.len(),
                    writable: self.claim(0, input.len()),
                    completed: false,
                })
            }
            State::SlotComplete => {
                self.state = State::Done;
                Ok(Step { completed: true, ..Step::default() })
            }
            State::Done => panic!("update session driven after Done"),
        }
    }

    /// Run as many steps as `chunk` allows, stopping once the slot is complete.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Feed, HeaderError> {
        let mut feed = Feed::default();

        while feed.consumed < chunk.len() && self.state < State::SlotComplete {
            let step = self.step(&chunk[feed.consumed..])?;
            if let Some(range) = step.writable {
                feed.writable = SubRange::within(feed.consumed + range.offset, range.len, chunk.len());
            }
            if step.consumed == 0 {
                break;
            }
            feed.consumed += step.consumed;
        }

        Ok(feed)
    }

    fn parse_header(&mut self, input: &[u8]) -> Result<Step, HeaderError> {
        let scan = header::scan(input)?;

        if self.content_length == 0 {
            if let Some(len) = scan.content_length.filter(|&len| len > 0) {
                self.content_length = len;
                info!("parse Content-Length:{}", len);
            }
        }

        let Some(header_len) = scan.header_len else {
            return Ok(Step::default());
        };

        if let Some(status) = scan.status_line {
            info!("Response: {}", status);
        }

        if self.content_length == 0 {
            return Err(HeaderError::MissingContentLength);
        }

        let total_slots = u64::from(self.geometry.total_slots);
        self.slot_size = self.content_length / total_slots;
        if self.slot_size == 0 {
            return Err(HeaderError::ImageTooSmall {
                content_length: self.content_length,
                total_slots: self.geometry.total_slots,
            });
        }
        self.slot_offset = self.slot_size * u64::from(self.geometry.target_slot);
        self.state = State::HeaderParsed;

        info!(
            "ota_size {} at offset {} of {}",
            self.slot_size, self.slot_offset, self.content_length
        );
        debug!("Http parse {} bytes", header_len);

        Ok(Step { consumed: header_len, ..Step::default() })
    }

    fn skip_to_slot(&mut self, input: &[u8]) -> Step {
        let seen_before = self.body_bytes_seen;
        self.body_bytes_seen += input.len() as u64;

        if self.body_bytes_seen < self.slot_offset {
            return Step { consumed: input.len(), ..Step::default() };
        }

        // Bytes of this chunk still belonging to earlier slots.
        let skip = self.slot_offset.saturating_sub(seen_before) as usize;
        self.state = State::Writing;
        debug!("Receive {} bytes and start to update", self.body_bytes_seen);

        Step {
            consumed: input.len(),
            writable: self.claim(skip, input.len() - skip),
            completed: false,
        }
    }

    /// Account `len` bytes at `offset` towards the slot, clipped to what the slot still needs.
    fn claim(&mut self, offset: usize, len: usize) -> Option<SubRange> {
        let remaining = self.slot_size - self.slot_bytes_written;
        let take = remaining.min(len as u64) as usize;
        self.slot_bytes_written += take as u64;

        if self.slot_bytes_written == self.slot_size {
            self.state = State::SlotComplete;
        }

        debug!("Write {} total {}", take, self.slot_bytes_written);
        SubRange::within(offset, take, offset + len).filter(|range| !range.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(content_length: usize) -> Vec<u8> {
        let mut raw = format!(
            "HTTP/1.0 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            content_length
        )
        .into_bytes();
        raw.extend((0..content_length).map(|i| (i % 251) as u8));
        raw
    }

    fn header_len(raw: &[u8]) -> usize {
        header::scan(raw).unwrap().header_len.unwrap()
    }

    fn session(total: u8, target: u8) -> UpdateSession {
        UpdateSession::new(SlotGeometry::new(total, target).unwrap())
    }

    #[test]
    fn geometry_rejects_out_of_range_target() {
        assert!(SlotGeometry::new(0, 0).is_err());
        assert_eq!(
            SlotGeometry::new(2, 2),
            Err(OtaError::InvalidGeometry { total_slots: 2, target_slot: 2 })
        );
        assert!(SlotGeometry::new(2, 1).is_ok());
    }

    #[test]
    fn sub_range_is_bounds_checked() {
        assert!(SubRange::within(10, 5, 15).is_some());
        assert!(SubRange::within(10, 6, 15).is_none());
        assert!(SubRange::within(usize::MAX, 2, 15).is_none());
        let range = SubRange::within(1, 2, 4).unwrap();
        assert_eq!(range.slice(b"abcd"), Some(&b"bc"[..]));
        assert_eq!(range.slice(b"ab"), None);
    }

    #[test]
    fn middle_slot_of_three() {
        let raw = response(3000);
        let body = header_len(&raw);
        let mut s = session(3, 1);

        let step = s.step(&raw[..body]).unwrap();
        assert_eq!(step.consumed, body);
        assert_eq!(s.state(), State::HeaderParsed);
        assert_eq!(s.slot_size(), 1000);
        assert_eq!(s.slot_offset(), 1000);

        let step = s.step(&raw[body..body + 999]).unwrap();
        assert_eq!(step.writable, None);
        let step = s.step(&raw[body + 999..body + 1000]).unwrap();
        assert_eq!(step.writable, None);
        assert_eq!(s.state(), State::Writing);
        assert_eq!(s.slot_bytes_written(), 0);

        let chunk = &raw[body + 1000..body + 2500];
        let step = s.step(chunk).unwrap();
        assert_eq!(step.consumed, 1500);
        let range = step.writable.unwrap();
        assert_eq!((range.offset(), range.len()), (0, 1000));
        assert_eq!(range.slice(chunk).unwrap(), &raw[body + 1000..body + 2000]);
        assert_eq!(s.state(), State::SlotComplete);

        let step = s.step(&[]).unwrap();
        assert!(step.completed);
        assert_eq!(s.state(), State::Done);
    }

    #[test]
    fn single_slot_writes_whole_body() {
        let raw = response(700);
        let mut s = session(1, 0);
        let feed = s.feed(&raw).unwrap();
        let body = header_len(&raw);

        assert_eq!(s.slot_offset(), 0);
        assert_eq!(feed.consumed, raw.len());
        assert_eq!(feed.writable.unwrap().slice(&raw).unwrap(), &raw[body..]);
        assert_eq!(s.slot_bytes_written(), 700);
        assert!(s.is_slot_complete());
    }

    #[test]
    fn header_and_slot_start_in_one_chunk() {
        let raw = response(300);
        let body = header_len(&raw);
        let mut s = session(3, 1);
        let chunk = &raw[..body + 150];

        let feed = s.feed(chunk).unwrap();
        let range = feed.writable.unwrap();
        assert_eq!(range.offset(), body + 100);
        assert_eq!(range.slice(chunk).unwrap(), &raw[body + 100..body + 150]);
        assert_eq!(s.state(), State::Writing);
    }

    #[test]
    fn missing_content_length_fails_at_blank_line() {
        let mut s = session(2, 0);
        let raw = b"HTTP/1.0 200 OK\r\nServer: x\r\n\r\nbody bytes";
        assert_eq!(s.feed(raw), Err(HeaderError::MissingContentLength));
        assert_eq!(s.body_bytes_seen(), 0);
    }

    #[test]
    fn zero_content_length_counts_as_missing() {
        let mut s = session(1, 0);
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(s.feed(raw), Err(HeaderError::MissingContentLength));
    }

    #[test]
    fn image_smaller_than_slot_count_is_rejected() {
        let mut s = session(3, 0);
        let raw = b"HTTP/1.0 200 OK\r\nContent-Length: 2\r\n\r\n";
        assert_eq!(
            s.feed(raw),
            Err(HeaderError::ImageTooSmall { content_length: 2, total_slots: 3 })
        );
    }

    #[test]
    fn header_split_mid_token() {
        let raw = b"HTTP/1.0 200 OK\r\nContent-Len";
        let rest = b"gth: 300\r\nServer: test\r\n\r\n";
        let mut s = session(1, 0);

        assert_eq!(s.feed(raw).unwrap().consumed, 0);
        assert_eq!(s.state(), State::Init);
        assert_eq!(s.content_length(), 0);

        let mut joined = raw.to_vec();
        joined.extend_from_slice(rest);
        let feed = s.feed(&joined).unwrap();
        assert_eq!(feed.consumed, joined.len());
        assert_eq!(s.content_length(), 300);
        assert_eq!(s.state(), State::HeaderParsed);
    }

    #[test]
    fn content_length_is_cached_before_blank_line() {
        let mut s = session(1, 0);
        s.feed(b"HTTP/1.0 200 OK\r\nContent-Length: 300\r\nX-A: 1").unwrap();
        assert_eq!(s.content_length(), 300);
        assert_eq!(s.state(), State::Init);
    }

    #[test]
    fn remainder_bytes_belong_to_no_slot() {
        let raw = response(3002);
        let body = header_len(&raw);
        let mut s = session(3, 2);
        let feed = s.feed(&raw).unwrap();

        assert_eq!(s.slot_size(), 1000);
        assert_eq!(s.slot_offset(), 2000);
        let range = feed.writable.unwrap();
        assert_eq!(range.slice(&raw).unwrap(), &raw[body + 2000..body + 3000]);
        assert!(s.is_slot_complete());
    }

    #[test]
    fn whole_slot_inside_first_body_chunk_is_clipped() {
        let raw = response(90);
        let body = header_len(&raw);
        let mut s = session(3, 1);
        s.feed(&raw[..body]).unwrap();

        let step = s.step(&raw[body..]).unwrap();
        let range = step.writable.unwrap();
        assert_eq!((range.offset(), range.len()), (30, 30));
        assert_eq!(s.slot_bytes_written(), 30);
        assert_eq!(s.state(), State::SlotComplete);
    }

    #[test]
    fn slot_completes_when_exactly_filled() {
        let raw = response(200);
        let body = header_len(&raw);
        let mut s = session(2, 1);
        s.feed(&raw[..body + 100]).unwrap();
        assert_eq!(s.state(), State::Writing);

        let feed = s.feed(&raw[body + 100..]).unwrap();
        assert_eq!(feed.writable.unwrap().len(), 100);
        assert!(s.is_slot_complete());
    }

    #[test]
    fn written_bytes_are_monotonic_and_bounded() {
        let raw = response(2048);
        let body = header_len(&raw);
        let mut s = session(4, 2);
        s.feed(&raw[..body]).unwrap();
        let mut last = 0;
        let mut state = s.state();
        for chunk in raw[body..].chunks(37) {
            if s.is_slot_complete() {
                break;
            }
            s.feed(chunk).unwrap();
            assert!(s.slot_bytes_written() >= last);
            assert!(s.slot_bytes_written() <= s.slot_size());
            assert!(s.state() >= state);
            last = s.slot_bytes_written();
            state = s.state();
        }
        assert_eq!(last, 512);
    }

    #[test]
    #[should_panic(expected = "after Done")]
    fn driving_a_done_session_panics() {
        let raw = response(10);
        let mut s = session(1, 0);
        s.feed(&raw).unwrap();
        assert!(s.step(&[]).unwrap().completed);
        let _ = s.step(b"more");
    }
}
