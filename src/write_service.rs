use std::cmp::min;
use std::sync::Arc;

use anyhow::bail;
use tracing::{debug, error, trace, warn};

use crate::chunk::{varint_len, Chunk};
use crate::config::TransferConfig;
use crate::context::ContextPool;
use crate::handlers::{MessageStream, ResourceWriter, TransferHandlers};
use crate::payload_buffer::PayloadBuf;
use crate::service::send_status_chunk;
use crate::status::Status;

/// Fixed envelope overhead of a stream message, from the enclosing protocol's
///  packet layout:
///
///   type:       1 byte key, 1 byte value
///   channel_id: 1 byte key, varint value (accounted separately)
///   service_id: 1 byte key, 4 byte value
///   method_id:  1 byte key, 4 byte value
///   payload:    1 byte key, varint length (accounted separately)
const ENVELOPE_FIXED_OVERHEAD: usize = 14;

/// Field keys for transfer id, offset and data in a write data chunk.
const CHUNK_FIELD_KEYS_OVERHEAD: usize = 3;

/// Write-direction service: the peer pushes data into locally registered
///  resources.
///
/// Inbound chunks carry data fragments (or a terminal status); this service
///  applies in-window fragments to the bound writer, grants a fresh window via
///  a parameter chunk whenever the previous one is spent, and acknowledges the
///  peer's `remaining_bytes = 0` end marker with a success status chunk.
pub struct WriteService {
    config: Arc<TransferConfig>,
    handlers: Arc<dyn TransferHandlers>,
    stream: Box<dyn MessageStream>,
    pool: ContextPool<Box<dyn ResourceWriter>>,
    payload_buf: PayloadBuf,
}

impl WriteService {
    pub fn new(
        config: Arc<TransferConfig>,
        handlers: Arc<dyn TransferHandlers>,
        stream: Box<dyn MessageStream>,
    ) -> anyhow::Result<WriteService> {
        config.validate()?;

        let worst_case = worst_case_write_chunk_size(config.max_chunk_size_bytes);
        if worst_case <= 0 {
            bail!(
                "max_chunk_size_bytes {} is too small to fit any write payload after protocol overhead",
                config.max_chunk_size_bytes
            );
        }

        Ok(WriteService {
            pool: ContextPool::new(config.max_concurrent_transfers),
            payload_buf: PayloadBuf::new(config.max_chunk_size_bytes as usize),
            config,
            handlers,
            stream,
        })
    }

    /// Attaches a new outbound stream, replacing the previously bound one.
    ///  Active transfers continue on the new stream.
    pub fn bind_stream(&mut self, stream: Box<dyn MessageStream>) {
        self.stream = stream;
    }

    /// Processes one inbound message from the write stream.
    pub fn on_chunk(&mut self, message: &[u8]) {
        let chunk = match Chunk::decode(message) {
            Ok(chunk) => chunk,
            Err(e) => {
                // no reply - the peer retransmits when it sees no response
                warn!("failed to decode incoming write transfer chunk: {:#}", e);
                return;
            }
        };
        let transfer_id = chunk.transfer_id;

        let Self {
            config,
            handlers,
            stream,
            pool,
            payload_buf,
        } = self;

        let transfer = match pool.get_or_start(transfer_id, config.max_chunk_size_bytes, |id| {
            handlers.open_writer(id)
        }) {
            Ok(transfer) => transfer,
            Err(status) => {
                error!("cannot handle write transfer {}: {}", transfer_id, status);
                send_status_chunk(stream.as_mut(), payload_buf, transfer_id, status);
                return;
            }
        };

        if let Some(status) = chunk.status {
            // the peer terminated the transfer and already knows the outcome
            if !status.is_ok() {
                error!("write transfer {} failed with status {}", transfer_id, status);
            }
            pool.release(transfer_id);
            return;
        }

        // Apply the fragment to the bound writer if it is at the expected
        //  offset. Empty data is handled as if it were applied, which covers
        //  zero-length transfers.
        let mut chunk_data_processed = false;

        if chunk.offset == transfer.offset {
            if chunk.data.is_empty() {
                chunk_data_processed = true;
            } else if chunk.data.len() <= transfer.pending_bytes as usize {
                if let Err(status) = transfer.resource.write(&chunk.data) {
                    error!(
                        "write transfer {}: writing to the bound resource failed: {}",
                        transfer_id, status
                    );
                    send_status_chunk(stream.as_mut(), payload_buf, transfer_id, status);
                    pool.release(transfer_id);
                    return;
                }
                transfer.offset += chunk.data.len() as u32;
                transfer.pending_bytes -= chunk.data.len() as u32;
                chunk_data_processed = true;
            }
            // data beyond the granted window is not applied
        } else {
            // out-of-window offset: drop the fragment and force a fresh
            //  parameter exchange
            trace!(
                "write transfer {}: chunk at offset {} does not match expected offset {}",
                transfer_id,
                chunk.offset,
                transfer.offset
            );
            transfer.pending_bytes = 0;
        }

        if chunk_data_processed && chunk.remaining_bytes == Some(0) {
            // the peer signalled completion; acknowledge and clean up
            send_status_chunk(stream.as_mut(), payload_buf, transfer_id, Status::Ok);
            pool.release(transfer_id);
            return;
        }

        if transfer.pending_bytes > 0 {
            // more data is expected under the current window
            return;
        }

        // the window is spent (or was voided): grant the next one
        transfer.pending_bytes = min(
            config.default_max_bytes_to_receive,
            transfer.resource.conservative_write_limit(),
        );

        let max_chunk_size = max_write_chunk_size(
            config.max_chunk_size_bytes,
            stream.channel_id(),
            transfer_id,
            transfer.offset as u64 + transfer.pending_bytes as u64,
        );

        let parameters = Chunk {
            offset: transfer.offset,
            pending_bytes: Some(transfer.pending_bytes),
            // strictly positive - construction validated the worst case
            max_chunk_size_bytes: Some(max_chunk_size as u32),
            ..Chunk::new(transfer_id)
        };

        trace!(
            "write transfer {}: granting a window of {} bytes at offset {}",
            transfer_id,
            transfer.pending_bytes,
            transfer.offset
        );
        payload_buf.clear();
        match parameters.encode(payload_buf.storage_mut()) {
            Ok(len) => {
                payload_buf.set_len(len);
                if stream.write(payload_buf.as_ref()).is_err() {
                    // not retried: the peer re-sends its last chunk when the
                    //  window stays silent, which re-triggers this grant
                    debug!(
                        "failed to send transfer parameters for write transfer {}",
                        transfer_id
                    );
                }
            }
            Err(e) => debug!(
                "failed to encode transfer parameters for write transfer {}: {:#}",
                transfer_id, e
            ),
        }
    }
}

/// The largest data payload a write-direction parameter chunk may advertise
///  such that the peer's resulting data chunk, wrapped in the enclosing
///  envelope, still fits `ceiling`.
///
/// Works down from the ceiling: first the envelope overhead (fixed bytes plus
///  the varint-encoded channel id and payload length), then this protocol's
///  own chunk overhead (field keys plus the varint-encoded transfer id, the
///  largest offset reachable within the window, and the data length).
///
/// The result can be zero or negative for pathological configurations; that
///  case is rejected at service construction via
///  [`worst_case_write_chunk_size`].
pub(crate) fn max_write_chunk_size(
    ceiling: u32,
    channel_id: u32,
    transfer_id: u32,
    max_offset_in_window: u64,
) -> i64 {
    let mut max_size = ceiling as i64;

    max_size -= ENVELOPE_FIXED_OVERHEAD as i64;
    max_size -= varint_len(channel_id as u64) as i64;
    max_size -= varint_len(max_size.max(0) as u64) as i64;

    max_size -= CHUNK_FIELD_KEYS_OVERHEAD as i64;
    max_size -= varint_len(transfer_id as u64) as i64;
    max_size -= varint_len(max_offset_in_window) as i64;
    max_size -= varint_len(max_size.max(0) as u64) as i64;

    max_size
}

/// [`max_write_chunk_size`] with every runtime-variable input at its widest
///  encoding. Positive means any transfer on any channel can carry payload.
pub(crate) fn worst_case_write_chunk_size(ceiling: u32) -> i64 {
    max_write_chunk_size(
        ceiling,
        u32::MAX,
        u32::MAX,
        u32::MAX as u64 + u32::MAX as u64,
    )
}
