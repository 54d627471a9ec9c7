//! MTU-bounded framing of Pouch payloads.
//!
//! Every frame is one control byte followed by payload bytes. The control
//! byte carries `FIRST` on the opening frame and `LAST` on the closing one;
//! a payload that fits in a single frame carries both. All other control
//! bits are reserved and must be zero.

use bytes::{Bytes, BytesMut};
use pouch_core::GatewayError;
use thiserror::Error;
use tracing::trace;

pub const FLAG_FIRST: u8 = 0x01;
pub const FLAG_LAST: u8 = 0x02;
const RESERVED_MASK: u8 = !(FLAG_FIRST | FLAG_LAST);

/// Control byte plus at least one payload byte.
pub const MIN_FRAME_LEN: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketizerError {
    #[error("frame too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad control byte 0x{0:02x}")]
    BadControlByte(u8),
    #[error("frame size {0} leaves no room for payload")]
    FrameTooSmall(usize),
    #[error("source wrote {written} bytes into a {capacity} byte window")]
    SourceOverrun { written: usize, capacity: usize },
    #[error("unexpected {0} frame")]
    OutOfOrder(&'static str),
    #[error("last frame already produced")]
    Finished,
    #[error(transparent)]
    Source(GatewayError),
}

impl From<PacketizerError> for GatewayError {
    fn from(err: PacketizerError) -> Self {
        match err {
            PacketizerError::Source(inner) => inner,
            other => GatewayError::protocol(other.to_string()),
        }
    }
}

/// Whether a producer has more bytes coming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    /// More bytes will follow, possibly not yet available.
    MoreData,
    /// The bytes just written are the end of the payload.
    NoMoreData,
}

/// Result of one `PacketSource::fill` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fill {
    pub len: usize,
    pub status: FillStatus,
}

impl Fill {
    pub fn more(len: usize) -> Self {
        Self {
            len,
            status: FillStatus::MoreData,
        }
    }

    pub fn done(len: usize) -> Self {
        Self {
            len,
            status: FillStatus::NoMoreData,
        }
    }

    /// Producer has nothing right now but is not finished.
    pub fn not_ready() -> Self {
        Self::more(0)
    }
}

/// Pull-based byte producer feeding a `Packetizer`.
pub trait PacketSource {
    /// Writes up to `dst.len()` bytes and reports how many were written.
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError>;
}

/// One encoded frame. An empty `data` means the source was not ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub data: Bytes,
    pub status: FillStatus,
}

impl Packet {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_last(&self) -> bool {
        self.status == FillStatus::NoMoreData
    }
}

/// Encoder turning a `PacketSource` into a frame sequence.
#[derive(Debug)]
pub struct Packetizer<S> {
    source: S,
    max_frame: usize,
    first_pending: bool,
    finished: bool,
    error: Option<PacketizerError>,
}

impl<S: PacketSource> Packetizer<S> {
    /// `max_frame` is the full frame size, control byte included.
    pub fn new(source: S, max_frame: usize) -> Self {
        let error = (max_frame < MIN_FRAME_LEN).then_some(PacketizerError::FrameTooSmall(max_frame));
        Self {
            source,
            max_frame,
            first_pending: true,
            finished: false,
            error,
        }
    }

    /// Produces the next frame.
    ///
    /// When the source is not ready the returned packet is empty with
    /// `MoreData`; no frame was consumed and the caller retries later.
    /// Errors are sticky.
    pub fn get(&mut self) -> Result<Packet, PacketizerError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        if self.finished {
            return Err(PacketizerError::Finished);
        }

        let capacity = self.max_frame - 1;
        let mut frame = BytesMut::zeroed(self.max_frame);
        let fill = match self.source.fill(&mut frame[1..]) {
            Ok(fill) => fill,
            Err(err) => return Err(self.fail(err)),
        };
        if fill.len > capacity {
            return Err(self.fail(PacketizerError::SourceOverrun {
                written: fill.len,
                capacity,
            }));
        }
        if fill.len == 0 && fill.status == FillStatus::MoreData {
            return Ok(Packet {
                data: Bytes::new(),
                status: FillStatus::MoreData,
            });
        }

        let mut control = 0;
        if self.first_pending {
            control |= FLAG_FIRST;
            self.first_pending = false;
        }
        if fill.status == FillStatus::NoMoreData {
            control |= FLAG_LAST;
            self.finished = true;
        }
        frame[0] = control;
        frame.truncate(1 + fill.len);
        trace!(control, len = fill.len, frame = %hex::encode(&frame), "packetizer frame");

        Ok(Packet {
            data: frame.freeze(),
            status: fill.status,
        })
    }

    fn fail(&mut self, err: PacketizerError) -> PacketizerError {
        self.error = Some(err.clone());
        err
    }

    pub fn error(&self) -> Option<&PacketizerError> {
        self.error.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Ends encoding and hands the source back.
    pub fn finish(self) -> S {
        self.source
    }
}

/// Zero-copy view of one decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedPacket<'a> {
    pub payload: &'a [u8],
    pub is_first: bool,
    pub is_last: bool,
}

pub fn decode(frame: &[u8]) -> Result<DecodedPacket<'_>, PacketizerError> {
    let Some((&control, payload)) = frame.split_first() else {
        return Err(PacketizerError::TooShort(frame.len()));
    };
    if control & RESERVED_MASK != 0 {
        return Err(PacketizerError::BadControlByte(control));
    }
    Ok(DecodedPacket {
        payload,
        is_first: control & FLAG_FIRST != 0,
        is_last: control & FLAG_LAST != 0,
    })
}

/// Ordering check for a frame sequence received one frame at a time.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    started: bool,
    done: bool,
    received: usize,
}

impl PacketAssembler {
    /// Decodes `frame`, rejecting continuation frames before a first frame,
    /// a second first frame, and anything after the last frame.
    pub fn accept<'a>(&mut self, frame: &'a [u8]) -> Result<DecodedPacket<'a>, PacketizerError> {
        let packet = decode(frame)?;
        if self.done {
            return Err(PacketizerError::OutOfOrder("trailing"));
        }
        match (self.started, packet.is_first) {
            (false, false) => return Err(PacketizerError::OutOfOrder("continuation")),
            (true, true) => return Err(PacketizerError::OutOfOrder("repeated first")),
            _ => {}
        }
        self.started = true;
        self.done = packet.is_last;
        self.received += packet.payload.len();
        Ok(packet)
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Payload bytes accepted so far.
    pub fn received(&self) -> usize {
        self.received
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Source over an owned, fully available payload.
#[derive(Debug, Clone)]
pub struct SliceSource {
    data: Bytes,
    offset: usize,
}

impl SliceSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl PacketSource for SliceSource {
    fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
        let len = self.remaining().min(dst.len());
        dst[..len].copy_from_slice(&self.data[self.offset..self.offset + len]);
        self.offset += len;
        if self.remaining() == 0 {
            Ok(Fill::done(len))
        } else {
            Ok(Fill::more(len))
        }
    }
}

/// Encodes a whole payload into frames of at most `max_frame` bytes.
pub fn encode_all(payload: &[u8], max_frame: usize) -> Result<Vec<Bytes>, PacketizerError> {
    let mut packetizer = Packetizer::new(SliceSource::new(Bytes::copy_from_slice(payload)), max_frame);
    let mut frames = Vec::new();
    loop {
        let packet = packetizer.get()?;
        let last = packet.is_last();
        frames.push(packet.data);
        if last {
            return Ok(frames);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Trickle {
        script: Vec<Result<Fill, PacketizerError>>,
    }

    impl PacketSource for Trickle {
        fn fill(&mut self, dst: &mut [u8]) -> Result<Fill, PacketizerError> {
            let next = self.script.remove(0)?;
            let n = next.len.min(dst.len());
            dst[..n].fill(0xAB);
            Ok(next)
        }
    }

    #[test]
    fn single_frame_payload_carries_first_and_last() {
        let frames = encode_all(b"hi", 8).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[0x03, b'h', b'i'])]);
    }

    #[test]
    fn empty_payload_is_one_control_only_frame() {
        let frames = encode_all(b"", 20).unwrap();
        assert_eq!(frames, vec![Bytes::from_static(&[FLAG_FIRST | FLAG_LAST])]);
    }

    #[test]
    fn not_ready_source_does_not_consume_first_flag() {
        let mut packetizer = Packetizer::new(
            Trickle {
                script: vec![Ok(Fill::not_ready()), Ok(Fill::more(3)), Ok(Fill::done(1))],
            },
            8,
        );

        let idle = packetizer.get().unwrap();
        assert!(idle.is_empty());
        assert_eq!(idle.status, FillStatus::MoreData);

        let first = packetizer.get().unwrap();
        assert_eq!(first.data[0], FLAG_FIRST);
        assert_eq!(first.data.len(), 4);

        let last = packetizer.get().unwrap();
        assert_eq!(last.data[0], FLAG_LAST);
        assert!(last.is_last());
        assert_eq!(packetizer.get(), Err(PacketizerError::Finished));
    }

    #[test]
    fn source_errors_are_sticky() {
        let mut packetizer = Packetizer::new(
            Trickle {
                script: vec![Err(PacketizerError::Source(GatewayError::exhausted("pool")))],
            },
            8,
        );
        let err = packetizer.get().unwrap_err();
        assert_eq!(GatewayError::from(err.clone()).class(), "exhausted");
        assert_eq!(packetizer.error(), Some(&err));
        assert_eq!(packetizer.get(), Err(err));
    }

    #[test]
    fn overrunning_source_is_rejected() {
        let mut packetizer = Packetizer::new(
            Trickle {
                script: vec![Ok(Fill::more(10))],
            },
            4,
        );
        assert_eq!(
            packetizer.get(),
            Err(PacketizerError::SourceOverrun {
                written: 10,
                capacity: 3
            })
        );
    }

    #[test]
    fn frame_without_payload_room_is_an_error() {
        let mut packetizer = Packetizer::new(SliceSource::new(Bytes::from_static(b"x")), 1);
        assert_eq!(packetizer.get(), Err(PacketizerError::FrameTooSmall(1)));
    }

    #[test]
    fn decode_rejects_malformed_frames() {
        assert_eq!(decode(&[]), Err(PacketizerError::TooShort(0)));
        assert_eq!(decode(&[0x80, 1, 2]), Err(PacketizerError::BadControlByte(0x80)));

        let packet = decode(&[FLAG_LAST, 9, 9]).unwrap();
        assert!(!packet.is_first);
        assert!(packet.is_last);
        assert_eq!(packet.payload, &[9, 9]);
    }

    #[test]
    fn assembler_enforces_frame_order() {
        let mut assembler = PacketAssembler::default();
        assert_eq!(
            assembler.accept(&[0x00, 1]),
            Err(PacketizerError::OutOfOrder("continuation"))
        );
        assembler.accept(&[FLAG_FIRST, 1]).unwrap();
        assert_eq!(
            assembler.accept(&[FLAG_FIRST, 2]),
            Err(PacketizerError::OutOfOrder("repeated first"))
        );
        assembler.accept(&[FLAG_LAST, 2, 3]).unwrap();
        assert!(assembler.is_done());
        assert_eq!(assembler.received(), 3);
        assert_eq!(
            assembler.accept(&[FLAG_LAST]),
            Err(PacketizerError::OutOfOrder("trailing"))
        );
    }
}
