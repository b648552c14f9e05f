//! Framing and field encoding shared by the WAL and the main store.
//!
//! Every record on disk is wrapped in the same envelope:
//!
//! ```text
//! | magic (4) | version (2) | kind (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The CRC covers everything before it. A record cut short at the end of the
//! file is treated as the end of the log; a bad CRC or magic is corruption.

use crate::error::{CoreError, CoreResult};
use yapdb_storage::StorageBackend;

/// Envelope header size: magic + version + kind + length.
pub(crate) const HEADER_SIZE: usize = 11;

/// Trailing checksum size.
pub(crate) const CRC_SIZE: usize = 4;

/// Format description of one record stream.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FrameFormat {
    pub magic: [u8; 4],
    pub version: u16,
    pub corruption: fn(String) -> CoreError,
}

/// A decoded envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub offset: u64,
    pub kind: u8,
    pub payload: Vec<u8>,
}

impl FrameFormat {
    /// Wraps `payload` in an envelope.
    pub fn encode(&self, kind: u8, payload: &[u8]) -> CoreResult<Vec<u8>> {
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("record payload too large"))?;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&self.magic);
        data.extend_from_slice(&self.version.to_le_bytes());
        data.push(kind);
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Streams frames out of `backend` using a buffer of `page_size` bytes.
    pub fn reader<'a>(
        &self,
        backend: &'a dyn StorageBackend,
        page_size: usize,
    ) -> CoreResult<FrameReader<'a>> {
        Ok(FrameReader {
            format: *self,
            total: backend.size()?,
            backend,
            page_size: page_size.max(HEADER_SIZE + CRC_SIZE),
            offset: 0,
            buffer: Vec::new(),
            buffer_start: 0,
            finished: false,
        })
    }
}

/// Iterator over the frames of a backend.
pub(crate) struct FrameReader<'a> {
    format: FrameFormat,
    backend: &'a dyn StorageBackend,
    total: u64,
    page_size: usize,
    offset: u64,
    buffer: Vec<u8>,
    buffer_start: u64,
    finished: bool,
}

impl FrameReader<'_> {
    /// Makes `[offset, offset + len)` available in the buffer. Returns false
    /// if the backend ends first.
    fn fill(&mut self, len: usize) -> CoreResult<bool> {
        let end = self.offset + len as u64;
        if end > self.total {
            return Ok(false);
        }
        let buffered_end = self.buffer_start + self.buffer.len() as u64;
        if self.offset >= self.buffer_start && end <= buffered_end {
            return Ok(true);
        }
        let want = len.max(self.page_size) as u64;
        let read = want.min(self.total - self.offset) as usize;
        self.buffer = self.backend.read_at(self.offset, read)?;
        self.buffer_start = self.offset;
        Ok(true)
    }

    fn slice(&self, from: u64, len: usize) -> &[u8] {
        let start = (from - self.buffer_start) as usize;
        &self.buffer[start..start + len]
    }

    fn next_frame(&mut self) -> CoreResult<Option<Frame>> {
        if !self.fill(HEADER_SIZE)? {
            return Ok(None);
        }
        let header = self.slice(self.offset, HEADER_SIZE).to_vec();
        if header[0..4] != self.format.magic {
            return Err((self.format.corruption)(format!(
                "invalid magic at offset {}",
                self.offset
            )));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > self.format.version {
            return Err((self.format.corruption)(format!(
                "unsupported record version {version} at offset {}",
                self.offset
            )));
        }
        let kind = header[6];
        let len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;

        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if !self.fill(frame_len)? {
            return Ok(None);
        }
        let frame = self.slice(self.offset, frame_len);
        let (body, crc_bytes) = frame.split_at(HEADER_SIZE + len);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = compute_crc32(body);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }
        let payload = body[HEADER_SIZE..].to_vec();
        let offset = self.offset;
        self.offset += frame_len as u64;
        Ok(Some(Frame {
            offset,
            kind,
            payload,
        }))
    }

    /// Offset just past the last complete frame read so far.
    pub fn position(&self) -> u64 {
        self.offset
    }
}

impl Iterator for FrameReader<'_> {
    type Item = CoreResult<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Little-endian field writer.
#[derive(Debug, Default)]
pub(crate) struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        // Lengths above u32::MAX are rejected by the envelope anyway.
        self.buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn str(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn opt_bytes(&mut self, value: Option<&[u8]>) -> &mut Self {
        match value {
            Some(bytes) => self.u8(1).bytes(bytes),
            None => self.u8(0),
        }
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Little-endian field reader over a payload.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    corruption: fn(String) -> CoreError,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], corruption: fn(String) -> CoreError) -> Self {
        Self {
            data,
            pos: 0,
            corruption,
        }
    }

    fn take(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        if self.pos + len > self.data.len() {
            return Err((self.corruption)(format!(
                "unexpected end of payload: need {len} bytes at {}",
                self.pos
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> CoreResult<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn str(&mut self) -> CoreResult<String> {
        let bytes = self.bytes()?;
        String::from_utf8(bytes).map_err(|_| (self.corruption)("invalid utf-8 string".into()))
    }

    pub fn opt_bytes(&mut self) -> CoreResult<Option<Vec<u8>>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.bytes()?)),
            flag => Err((self.corruption)(format!("invalid option flag {flag}"))),
        }
    }

    /// Fails if bytes remain.
    pub fn finish(&self) -> CoreResult<()> {
        if self.pos != self.data.len() {
            return Err((self.corruption)(format!(
                "trailing bytes: consumed {} of {}",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// CRC32 (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize];
    }
    !crc
}
