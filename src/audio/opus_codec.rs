//! Streamed Ogg/Opus at 24 kHz mono.
//!
//! - Writer: float frame → Opus encode → one Ogg page per packet
//! - Reader: arbitrary byte chunks → Ogg page reassembly → Opus decode

use ogg::reading::{BasePacketReader, PageParser};
use ogg::writing::{PacketWriteEndInfo, PacketWriter};

use super::stream_codec::{StreamDecoder, StreamEncoder};
use super::REMOTE_SAMPLE_RATE;
use crate::error::ConversionError;

const OPUS_HEAD: &[u8] = b"OpusHead";
const OPUS_TAGS: &[u8] = b"OpusTags";
const VENDOR: &str = concat!("voxbridge ", env!("CARGO_PKG_VERSION"));
/// Encoder lookahead in 48 kHz samples, as advertised in OpusHead.
const PRE_SKIP: u16 = 312;
/// Granule positions are always counted at 48 kHz.
const GRANULE_RATE: u64 = 48_000;
const MAX_PACKET_BYTES: usize = 4000;
/// 120 ms at 24 kHz, the longest Opus packet.
const MAX_DECODED_SAMPLES: usize = 2880;

const PAGE_HEADER_LEN: usize = 27;
const CAPTURE_PATTERN: &[u8] = b"OggS";

// ======================== Ogg/Opus Writer ========================

pub struct OggOpusWriter {
    encoder: opus::Encoder,
    pages: PacketWriter<'static, Vec<u8>>,
    serial: u32,
    granule: u64,
    headers_written: bool,
}

impl OggOpusWriter {
    pub fn new() -> Result<Self, ConversionError> {
        let encoder = opus::Encoder::new(
            REMOTE_SAMPLE_RATE,
            opus::Channels::Mono,
            opus::Application::Voip,
        )?;
        // Any value works as long as it is stable for the lifetime of the stream
        let serial = uuid::Uuid::new_v4().as_u128() as u32;

        Ok(Self {
            encoder,
            pages: PacketWriter::new(Vec::new()),
            serial,
            granule: 0,
            headers_written: false,
        })
    }

    fn write_headers(&mut self) -> Result<(), ConversionError> {
        self.pages
            .write_packet(opus_head(), self.serial, PacketWriteEndInfo::EndPage, 0)?;
        self.pages
            .write_packet(opus_tags(), self.serial, PacketWriteEndInfo::EndPage, 0)?;
        self.headers_written = true;
        Ok(())
    }
}

impl StreamEncoder for OggOpusWriter {
    fn encode(&mut self, frame: &[f32]) -> Result<Vec<u8>, ConversionError> {
        if !self.headers_written {
            self.write_headers()?;
        }

        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        let len = self.encoder.encode_float(frame, &mut packet)?;
        packet.truncate(len);

        self.granule += frame.len() as u64 * GRANULE_RATE / REMOTE_SAMPLE_RATE as u64;
        self.pages.write_packet(
            packet,
            self.serial,
            PacketWriteEndInfo::EndPage,
            self.granule,
        )?;

        Ok(std::mem::take(self.pages.inner_mut()))
    }
}

fn opus_head() -> Vec<u8> {
    let mut head = Vec::with_capacity(19);
    head.extend_from_slice(OPUS_HEAD);
    head.push(1); // version
    head.push(1); // channel count
    head.extend_from_slice(&PRE_SKIP.to_le_bytes());
    head.extend_from_slice(&REMOTE_SAMPLE_RATE.to_le_bytes());
    head.extend_from_slice(&0i16.to_le_bytes()); // output gain
    head.push(0); // mapping family
    head
}

fn opus_tags() -> Vec<u8> {
    let mut tags = Vec::with_capacity(16 + VENDOR.len());
    tags.extend_from_slice(OPUS_TAGS);
    tags.extend_from_slice(&(VENDOR.len() as u32).to_le_bytes());
    tags.extend_from_slice(VENDOR.as_bytes());
    tags.extend_from_slice(&0u32.to_le_bytes()); // user comments
    tags
}

// ======================== Ogg/Opus Reader ========================

pub struct OggOpusReader {
    decoder: opus::Decoder,
    /// Bytes received that do not yet form a complete page.
    pending: Vec<u8>,
    packets: BasePacketReader,
    pcm: Vec<f32>,
}

impl OggOpusReader {
    pub fn new() -> Result<Self, ConversionError> {
        let decoder = opus::Decoder::new(REMOTE_SAMPLE_RATE, opus::Channels::Mono)?;
        Ok(Self {
            decoder,
            pending: Vec::new(),
            packets: BasePacketReader::new(),
            pcm: vec![0f32; MAX_DECODED_SAMPLES],
        })
    }

    /// Drop garbage in front of the next capture pattern.
    fn resync(&mut self) {
        let skip = self
            .pending
            .windows(CAPTURE_PATTERN.len())
            .skip(1)
            .position(|w| w == CAPTURE_PATTERN)
            .map(|p| p + 1)
            .unwrap_or(self.pending.len());
        self.pending.drain(..skip);
        log::warn!("Lost ogg page sync, skipped {} bytes", skip);
    }

    fn push_page(&mut self, page: &[u8]) -> Result<(), ConversionError> {
        let mut header = [0u8; PAGE_HEADER_LEN];
        header.copy_from_slice(&page[..PAGE_HEADER_LEN]);
        let (mut parser, segments_len) = PageParser::new(header)?;
        let body_start = PAGE_HEADER_LEN + segments_len;
        parser.parse_segments(page[PAGE_HEADER_LEN..body_start].to_vec());
        let page = parser.parse_packet_data(page[body_start..].to_vec())?;
        self.packets.push_page(page)?;
        Ok(())
    }
}

impl StreamDecoder for OggOpusReader {
    fn decode(&mut self, chunk: &[u8]) -> Result<Vec<f32>, ConversionError> {
        self.pending.extend_from_slice(chunk);

        let mut samples = Vec::new();
        loop {
            let page_len = match complete_page_len(&self.pending) {
                PageScan::Complete(len) => len,
                PageScan::Partial => break,
                PageScan::LostSync => {
                    self.resync();
                    continue;
                }
            };
            let page: Vec<u8> = self.pending.drain(..page_len).collect();
            if let Err(e) = self.push_page(&page) {
                log::warn!("Dropping bad ogg page ({} bytes): {}", page.len(), e);
                continue;
            }

            while let Some(packet) = self.packets.read_packet() {
                if packet.data.starts_with(OPUS_HEAD) || packet.data.starts_with(OPUS_TAGS) {
                    continue;
                }
                let decoded = self
                    .decoder
                    .decode_float(&packet.data, &mut self.pcm, false)?;
                samples.extend_from_slice(&self.pcm[..decoded]);
            }
        }

        log::trace!(
            "ogg/opus decoded {} samples, {} bytes pending",
            samples.len(),
            self.pending.len()
        );
        Ok(samples)
    }
}

enum PageScan {
    Complete(usize),
    Partial,
    LostSync,
}

/// Length of the first page in `buf`, if it has fully arrived.
fn complete_page_len(buf: &[u8]) -> PageScan {
    if buf.len() < CAPTURE_PATTERN.len() {
        return PageScan::Partial;
    }
    if &buf[..CAPTURE_PATTERN.len()] != CAPTURE_PATTERN {
        return PageScan::LostSync;
    }
    if buf.len() < PAGE_HEADER_LEN {
        return PageScan::Partial;
    }
    let segments = buf[PAGE_HEADER_LEN - 1] as usize;
    let body_start = PAGE_HEADER_LEN + segments;
    if buf.len() < body_start {
        return PageScan::Partial;
    }
    let body_len: usize = buf[PAGE_HEADER_LEN..body_start]
        .iter()
        .map(|&lacing| lacing as usize)
        .sum();
    let total = body_start + body_len;
    if buf.len() < total {
        PageScan::Partial
    } else {
        PageScan::Complete(total)
    }
}
