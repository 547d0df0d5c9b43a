use anyhow::bail;
use bytes::{Buf, Bytes};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

use crate::status::Status;

/// One protocol message exchanged over a transfer stream.
///
/// A chunk is a flat record of optional fields: which fields are present
///  determines its role. A *parameter* chunk carries window negotiation
///  (`pending_bytes`, `max_chunk_size_bytes`), a *data* chunk carries a
///  payload fragment at `offset`, and a *status* chunk is terminal - no
///  further chunks are exchanged for its transfer id after it.
///
/// Absent fields decode to `None` and are skipped when encoding, so "not set"
///  stays distinguishable from "set to zero" - the protocol depends on this
///  for `pending_bytes`, `remaining_bytes` and `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub transfer_id: u32,
    pub offset: u32,
    pub data: Bytes,
    pub pending_bytes: Option<u32>,
    pub max_chunk_size_bytes: Option<u32>,
    pub min_delay_microseconds: Option<u32>,
    pub remaining_bytes: Option<u64>,
    pub status: Option<Status>,
}

const FIELD_TRANSFER_ID: u32 = 1;
const FIELD_PENDING_BYTES: u32 = 2;
const FIELD_MAX_CHUNK_SIZE: u32 = 3;
const FIELD_MIN_DELAY: u32 = 4;
const FIELD_OFFSET: u32 = 5;
const FIELD_DATA: u32 = 6;
const FIELD_REMAINING_BYTES: u32 = 7;
const FIELD_STATUS: u32 = 8;

const WIRE_TYPE_VARINT: u32 = 0;
const WIRE_TYPE_FIXED64: u32 = 1;
const WIRE_TYPE_LEN_DELIMITED: u32 = 2;
const WIRE_TYPE_FIXED32: u32 = 5;

const fn varint_key(field: u32) -> u8 {
    (field << 3) as u8
}
const fn len_delimited_key(field: u32) -> u8 {
    ((field << 3) | WIRE_TYPE_LEN_DELIMITED) as u8
}

/// Upper bound for the encoded size of a data chunk excluding its payload:
///  transfer id and offset at full varint width, the data field header, and a
///  `remaining_bytes = 0` end marker.
pub(crate) const MAX_DATA_CHUNK_METADATA: usize =
    (1 + 5) + (1 + 5) + ChunkEncoder::DATA_FIELD_OVERHEAD + (1 + 1);

/// Number of bytes `value` occupies in variable-length encoding.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

impl Chunk {
    /// A chunk with only the transfer id set - the starting point for
    ///  assembling any specific kind of chunk via struct update syntax.
    pub fn new(transfer_id: u32) -> Chunk {
        Chunk {
            transfer_id,
            offset: 0,
            data: Bytes::new(),
            pending_bytes: None,
            max_chunk_size_bytes: None,
            min_delay_microseconds: None,
            remaining_bytes: None,
            status: None,
        }
    }

    /// The terminal chunk ending `transfer_id` with the given outcome.
    pub fn terminal(transfer_id: u32, status: Status) -> Chunk {
        Chunk {
            status: Some(status),
            ..Chunk::new(transfer_id)
        }
    }

    /// Parses a chunk from one inbound message.
    ///
    /// Fields that are absent from the message stay `None`. Unknown field
    ///  numbers are skipped per their wire type so peers may add fields
    ///  without breaking older implementations. Malformed or truncated input
    ///  fails; nothing after the malformed point is parsed.
    pub fn decode(message: &[u8]) -> anyhow::Result<Chunk> {
        let buf = &mut &*message;
        let mut chunk = Chunk::new(0);

        while buf.has_remaining() {
            let key = buf.try_get_u32_varint()?;
            let field = key >> 3;
            let wire_type = key & 7;

            match field {
                FIELD_TRANSFER_ID => chunk.transfer_id = Self::varint_u32(buf, wire_type)?,
                FIELD_PENDING_BYTES => chunk.pending_bytes = Some(Self::varint_u32(buf, wire_type)?),
                FIELD_MAX_CHUNK_SIZE => {
                    chunk.max_chunk_size_bytes = Some(Self::varint_u32(buf, wire_type)?)
                }
                FIELD_MIN_DELAY => {
                    chunk.min_delay_microseconds = Some(Self::varint_u32(buf, wire_type)?)
                }
                FIELD_OFFSET => chunk.offset = Self::varint_u32(buf, wire_type)?,
                FIELD_DATA => {
                    if wire_type != WIRE_TYPE_LEN_DELIMITED {
                        bail!("data field has wire type {} instead of length-delimited", wire_type);
                    }
                    let len = buf.try_get_usize_varint()?;
                    if buf.remaining() < len {
                        bail!("data field is truncated: {} bytes declared, {} available", len, buf.remaining());
                    }
                    chunk.data = buf.copy_to_bytes(len);
                }
                FIELD_REMAINING_BYTES => {
                    if wire_type != WIRE_TYPE_VARINT {
                        bail!("remaining_bytes field has unexpected wire type {}", wire_type);
                    }
                    chunk.remaining_bytes = Some(buf.try_get_u64_varint()?);
                }
                FIELD_STATUS => {
                    if wire_type != WIRE_TYPE_VARINT {
                        bail!("status field has unexpected wire type {}", wire_type);
                    }
                    chunk.status = Some(Status::from_wire(buf.try_get_u64_varint()?));
                }
                _ => Self::skip_unknown_field(buf, wire_type)?,
            }
        }

        Ok(chunk)
    }

    fn varint_u32(buf: &mut &[u8], wire_type: u32) -> anyhow::Result<u32> {
        if wire_type != WIRE_TYPE_VARINT {
            bail!("varint field has unexpected wire type {}", wire_type);
        }
        Ok(buf.try_get_u32_varint()?)
    }

    fn skip_unknown_field(buf: &mut &[u8], wire_type: u32) -> anyhow::Result<()> {
        use bytes_varint::try_get_fixed::TryGetFixedSupport;

        match wire_type {
            WIRE_TYPE_VARINT => {
                buf.try_get_u64_varint()?;
            }
            WIRE_TYPE_FIXED64 => {
                TryGetFixedSupport::try_get_u64(buf)?;
            }
            WIRE_TYPE_LEN_DELIMITED => {
                let len = buf.try_get_usize_varint()?;
                if buf.remaining() < len {
                    bail!("unknown length-delimited field is truncated");
                }
                buf.advance(len);
            }
            WIRE_TYPE_FIXED32 => {
                TryGetFixedSupport::try_get_u32(buf)?;
            }
            other => bail!("unsupported wire type {}", other),
        }
        Ok(())
    }

    /// Serializes the present fields into `buf`, returning the encoded length.
    ///
    /// Fails with a capacity error if `buf` cannot hold the chunk; the
    ///  buffer's prefix may have been written at that point but no partial
    ///  chunk length is ever reported.
    pub fn encode(&self, buf: &mut [u8]) -> anyhow::Result<usize> {
        let mut encoder = ChunkEncoder::new(buf);

        encoder.write_transfer_id(self.transfer_id)?;
        if let Some(pending_bytes) = self.pending_bytes {
            encoder.write_pending_bytes(pending_bytes)?;
        }
        if let Some(max_chunk_size_bytes) = self.max_chunk_size_bytes {
            encoder.write_max_chunk_size_bytes(max_chunk_size_bytes)?;
        }
        if let Some(min_delay) = self.min_delay_microseconds {
            encoder.write_min_delay_microseconds(min_delay)?;
        }
        if self.offset != 0 {
            encoder.write_offset(self.offset)?;
        }
        if !self.data.is_empty() {
            encoder.write_data(&self.data)?;
        }
        if let Some(remaining_bytes) = self.remaining_bytes {
            encoder.write_remaining_bytes(remaining_bytes)?;
        }
        if let Some(status) = self.status {
            encoder.write_status(status)?;
        }

        Ok(encoder.len())
    }

    /// Fast upper bound for this chunk's encoded size excluding the payload
    ///  bytes themselves. Never under-estimates; callers use it to reserve
    ///  buffer space ahead of filling in the payload.
    pub fn min_encoded_size(&self) -> usize {
        let mut size = 1 + varint_len(self.transfer_id as u64)
            + 1 + varint_len(self.offset as u64)
            + ChunkEncoder::DATA_FIELD_OVERHEAD;

        if let Some(pending_bytes) = self.pending_bytes {
            size += 1 + varint_len(pending_bytes as u64);
        }
        if let Some(max_chunk_size_bytes) = self.max_chunk_size_bytes {
            size += 1 + varint_len(max_chunk_size_bytes as u64);
        }
        if let Some(min_delay) = self.min_delay_microseconds {
            size += 1 + varint_len(min_delay as u64);
        }
        if let Some(remaining_bytes) = self.remaining_bytes {
            size += 1 + varint_len(remaining_bytes);
        }
        if let Some(status) = self.status {
            size += 1 + varint_len(status.code() as u64);
        }
        size
    }
}

/// Incremental chunk serializer over a caller-supplied fixed buffer.
///
/// Fields are written in the order the caller chooses; the one ordering
///  constraint worth having is served by [`payload_area`](Self::payload_area)
///  / [`commit_payload`](Self::commit_payload): the payload can be produced
///  directly into the tail of the buffer *after* the metadata fields are
///  encoded, without staging it anywhere else first.
pub struct ChunkEncoder<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ChunkEncoder<'a> {
    /// Worst-case encoding overhead of the data field itself: one key byte
    ///  plus the payload length at full u32 varint width.
    pub const DATA_FIELD_OVERHEAD: usize = 1 + 5;

    pub fn new(buf: &'a mut [u8]) -> ChunkEncoder<'a> {
        ChunkEncoder { buf, len: 0 }
    }

    /// Number of bytes encoded so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn write_transfer_id(&mut self, transfer_id: u32) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_TRANSFER_ID), transfer_id as u64)
    }

    pub fn write_pending_bytes(&mut self, pending_bytes: u32) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_PENDING_BYTES), pending_bytes as u64)
    }

    pub fn write_max_chunk_size_bytes(&mut self, max_chunk_size_bytes: u32) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_MAX_CHUNK_SIZE), max_chunk_size_bytes as u64)
    }

    pub fn write_min_delay_microseconds(&mut self, min_delay: u32) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_MIN_DELAY), min_delay as u64)
    }

    pub fn write_offset(&mut self, offset: u32) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_OFFSET), offset as u64)
    }

    pub fn write_remaining_bytes(&mut self, remaining_bytes: u64) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_REMAINING_BYTES), remaining_bytes)
    }

    pub fn write_status(&mut self, status: Status) -> anyhow::Result<()> {
        self.put_varint_field(varint_key(FIELD_STATUS), status.code() as u64)
    }

    /// Copies an externally produced payload into the buffer as the data
    ///  field. For payloads that can be produced in place, prefer
    ///  [`payload_area`](Self::payload_area) + [`commit_payload`](Self::commit_payload).
    pub fn write_data(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let header_len = 1 + varint_len(data.len() as u64);
        if self.remaining() < header_len + data.len() {
            bail!(
                "data field of {} bytes does not fit into the remaining {} buffer bytes",
                data.len(),
                self.remaining()
            );
        }
        self.put_data_header(data.len());
        self.buf[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// The buffer tail behind a reservation for the data field header, for
    ///  producing the payload in place (e.g. reading from a resource straight
    ///  into the outbound buffer).
    pub fn payload_area(&mut self) -> &mut [u8] {
        let start = usize::min(self.len + Self::DATA_FIELD_OVERHEAD, self.buf.len());
        &mut self.buf[start..]
    }

    /// Seals `payload_len` bytes previously produced into
    ///  [`payload_area`](Self::payload_area) as the data field: writes the
    ///  field header and moves the payload into place. A single in-buffer
    ///  move, no second staging buffer.
    pub fn commit_payload(&mut self, payload_len: usize) -> anyhow::Result<()> {
        let reserved_start = self.len + Self::DATA_FIELD_OVERHEAD;
        if reserved_start + payload_len > self.buf.len() {
            bail!(
                "payload of {} bytes exceeds the {} bytes available behind the reservation",
                payload_len,
                self.buf.len().saturating_sub(reserved_start)
            );
        }

        self.put_data_header(payload_len);
        // header_len <= DATA_FIELD_OVERHEAD, so this moves the payload towards
        //  the front and the ranges cannot collide with unwritten bytes
        self.buf
            .copy_within(reserved_start..reserved_start + payload_len, self.len);
        self.len += payload_len;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.len
    }

    fn put_varint_field(&mut self, key: u8, value: u64) -> anyhow::Result<()> {
        let needed = 1 + varint_len(value);
        if self.remaining() < needed {
            bail!(
                "chunk field does not fit: {} bytes needed, {} remaining",
                needed,
                self.remaining()
            );
        }
        self.buf[self.len] = key;
        let mut dst = &mut self.buf[self.len + 1..];
        dst.put_u64_varint(value);
        self.len += needed;
        Ok(())
    }

    fn put_data_header(&mut self, payload_len: usize) {
        self.buf[self.len] = len_delimited_key(FIELD_DATA);
        let mut dst = &mut self.buf[self.len + 1..];
        dst.put_usize_varint(payload_len);
        self.len += 1 + varint_len(payload_len as u64);
    }
}
