//! The pulling/pushing peer of both handshakes - the counterpart to
//!  [`TransferService`](crate::service::TransferService).
//!
//! A [`TransferClient`] *reads* by granting windows to the remote service and
//!  accumulating its data chunks, and *writes* by sending data under the
//!  windows the remote service grants. It is driven the same way as the
//!  service: one inbound message at a time per direction, no background
//!  tasks, no timers. Retransmission pacing is the embedding application's
//!  job - when a transfer goes silent for too long, call
//!  [`resend_read_parameters`](TransferClient::resend_read_parameters) /
//!  [`resend_write_start`](TransferClient::resend_write_start) from its own
//!  clock.

use std::cmp::min;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tracing::{debug, error, trace, warn};

use crate::chunk::{Chunk, MAX_DATA_CHUNK_METADATA};
use crate::handlers::MessageStream;
use crate::payload_buffer::PayloadBuf;
use crate::service::send_status_chunk;
use crate::status::Status;

/// Static configuration of a transfer client.
pub struct ClientConfig {
    /// Window granted to the remote service per read parameter chunk. A
    ///  larger window means fewer negotiation round trips but more data in
    ///  flight on a retransmission.
    pub max_bytes_to_receive: u32,

    /// The size of an outbound message payload, the chunk size requested for
    ///  read transfers, and the ceiling on the chunk size this client accepts
    ///  for write transfers.
    pub max_chunk_size_bytes: u32,

    /// Forwarded on read parameter chunks for the remote side to pace its
    ///  sends; never enforced locally.
    pub min_delay_microseconds: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> ClientConfig {
        ClientConfig {
            max_bytes_to_receive: 8192,
            max_chunk_size_bytes: 1024,
            min_delay_microseconds: None,
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size_bytes as usize <= MAX_DATA_CHUNK_METADATA {
            bail!(
                "max_chunk_size_bytes {} cannot hold a data chunk's metadata ({} bytes) plus payload",
                self.max_chunk_size_bytes,
                MAX_DATA_CHUNK_METADATA
            );
        }
        if self.max_bytes_to_receive == 0 {
            bail!("max_bytes_to_receive must be positive");
        }
        Ok(())
    }
}

/// Completion of a transfer, surfaced from a dispatch call.
///
/// `status` is the final outcome; for a read transfer `data` is everything
///  accumulated up to that point (the full stream iff `status` is OK).
#[derive(Debug, PartialEq, Eq)]
pub enum TransferEvent {
    ReadCompleted {
        transfer_id: u32,
        status: Status,
        data: Bytes,
    },
    WriteCompleted {
        transfer_id: u32,
        status: Status,
    },
}

struct ReadState {
    offset: u32,
    pending_bytes: u32,
    data: BytesMut,
}

struct WriteState {
    data: Bytes,
    offset: usize,
    max_bytes_to_send: usize,
    max_chunk_size_bytes: u32,
}

/// Client-side dispatch for any number of concurrent transfers, keyed by
///  transfer id per direction.
pub struct TransferClient {
    config: ClientConfig,
    read_stream: Box<dyn MessageStream>,
    write_stream: Box<dyn MessageStream>,
    read_transfers: FxHashMap<u32, ReadState>,
    write_transfers: FxHashMap<u32, WriteState>,
    read_buf: PayloadBuf,
    write_buf: PayloadBuf,
}

impl TransferClient {
    pub fn new(
        config: ClientConfig,
        read_stream: Box<dyn MessageStream>,
        write_stream: Box<dyn MessageStream>,
    ) -> anyhow::Result<TransferClient> {
        config.validate()?;

        Ok(TransferClient {
            read_buf: PayloadBuf::new(config.max_chunk_size_bytes as usize),
            write_buf: PayloadBuf::new(config.max_chunk_size_bytes as usize),
            config,
            read_stream,
            write_stream,
            read_transfers: FxHashMap::default(),
            write_transfers: FxHashMap::default(),
        })
    }

    /// Starts pulling the remote resource registered under `transfer_id` by
    ///  sending the initial transfer parameters.
    pub fn start_read(&mut self, transfer_id: u32) -> anyhow::Result<()> {
        if self.read_transfers.contains_key(&transfer_id) {
            bail!("read transfer {} already exists", transfer_id);
        }

        debug!("starting read transfer {}", transfer_id);
        let state = self.read_transfers.entry(transfer_id).or_insert(ReadState {
            offset: 0,
            pending_bytes: 0,
            data: BytesMut::new(),
        });
        send_read_parameters(
            &self.config,
            self.read_stream.as_mut(),
            &mut self.read_buf,
            transfer_id,
            state,
        );
        Ok(())
    }

    /// Starts pushing `data` into the remote resource registered under
    ///  `transfer_id`. The remote side answers with its first window grant.
    pub fn start_write(&mut self, transfer_id: u32, data: Bytes) -> anyhow::Result<()> {
        if self.write_transfers.contains_key(&transfer_id) {
            bail!("write transfer {} already exists", transfer_id);
        }

        debug!(
            "starting write transfer {} with {} bytes",
            transfer_id,
            data.len()
        );
        self.write_transfers.insert(
            transfer_id,
            WriteState {
                data,
                offset: 0,
                max_bytes_to_send: 0,
                max_chunk_size_bytes: self.config.max_chunk_size_bytes,
            },
        );
        send_chunk(
            self.write_stream.as_mut(),
            &mut self.write_buf,
            &Chunk::new(transfer_id),
        );
        Ok(())
    }

    /// Processes one inbound message from the read stream - a data chunk or a
    ///  terminal status from the remote service.
    pub fn on_read_chunk(&mut self, message: &[u8]) -> Option<TransferEvent> {
        let chunk = match Chunk::decode(message) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("failed to decode incoming read chunk: {:#}", e);
                return None;
            }
        };
        let transfer_id = chunk.transfer_id;

        if let Some(status) = chunk.status {
            return match self.read_transfers.remove(&transfer_id) {
                Some(state) => Some(TransferEvent::ReadCompleted {
                    transfer_id,
                    status,
                    data: state.data.freeze(),
                }),
                None => {
                    error!("received status for unknown read transfer {}", transfer_id);
                    None
                }
            };
        }

        let Some(state) = self.read_transfers.get_mut(&transfer_id) else {
            error!("received chunk for unknown read transfer {}", transfer_id);
            return None;
        };

        if chunk.offset != state.offset {
            // out-of-order data: void the window and request retransmission
            //  from the offset this side expects
            trace!(
                "read transfer {}: expected offset {}, got {} - requesting retransmission",
                transfer_id,
                state.offset,
                chunk.offset
            );
            state.pending_bytes = 0;
            send_read_parameters(
                &self.config,
                self.read_stream.as_mut(),
                &mut self.read_buf,
                transfer_id,
                state,
            );
            return None;
        }

        state.data.extend_from_slice(&chunk.data);
        state.offset += chunk.data.len() as u32;
        state.pending_bytes = state.pending_bytes.saturating_sub(chunk.data.len() as u32);

        match chunk.remaining_bytes {
            Some(0) => {
                // end of data: acknowledge receipt and finish
                send_status_chunk(
                    self.read_stream.as_mut(),
                    &mut self.read_buf,
                    transfer_id,
                    Status::Ok,
                );
                let state = self
                    .read_transfers
                    .remove(&transfer_id)
                    .expect("this is a bug: the transfer was just looked up");
                return Some(TransferEvent::ReadCompleted {
                    transfer_id,
                    status: Status::Ok,
                    data: state.data.freeze(),
                });
            }
            Some(remaining) => {
                // advisory size hint, nothing to act on
                trace!(
                    "read transfer {}: {} bytes remaining on the remote side",
                    transfer_id,
                    remaining
                );
            }
            None => {}
        }

        if state.pending_bytes == 0 {
            // window spent: grant the next one
            send_read_parameters(
                &self.config,
                self.read_stream.as_mut(),
                &mut self.read_buf,
                transfer_id,
                state,
            );
        }
        None
    }

    /// Processes one inbound message from the write stream - a window grant
    ///  or a terminal status from the remote service.
    pub fn on_write_chunk(&mut self, message: &[u8]) -> Option<TransferEvent> {
        let chunk = match Chunk::decode(message) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!("failed to decode incoming write chunk: {:#}", e);
                return None;
            }
        };
        let transfer_id = chunk.transfer_id;

        if let Some(status) = chunk.status {
            return match self.write_transfers.remove(&transfer_id) {
                Some(_) => Some(TransferEvent::WriteCompleted {
                    transfer_id,
                    status,
                }),
                None => {
                    error!("received status for unknown write transfer {}", transfer_id);
                    None
                }
            };
        }

        let Some(state) = self.write_transfers.get_mut(&transfer_id) else {
            error!("received chunk for unknown write transfer {}", transfer_id);
            return None;
        };

        // the remote side owns the window, including rolling the offset back
        //  after it lost chunks; adopt its view
        if (chunk.offset as usize) < state.offset {
            debug!(
                "write transfer {} rolling back to offset {} from {}",
                transfer_id, chunk.offset, state.offset
            );
        }
        if chunk.offset as usize > state.data.len() {
            error!(
                "write transfer {}: remote requested offset {} beyond the {} source bytes",
                transfer_id,
                chunk.offset,
                state.data.len()
            );
            send_status_chunk(
                self.write_stream.as_mut(),
                &mut self.write_buf,
                transfer_id,
                Status::OutOfRange,
            );
            self.write_transfers.remove(&transfer_id);
            return Some(TransferEvent::WriteCompleted {
                transfer_id,
                status: Status::OutOfRange,
            });
        }
        state.offset = chunk.offset as usize;

        let Some(pending_bytes) = chunk.pending_bytes else {
            send_status_chunk(
                self.write_stream.as_mut(),
                &mut self.write_buf,
                transfer_id,
                Status::InvalidArgument,
            );
            self.write_transfers.remove(&transfer_id);
            return Some(TransferEvent::WriteCompleted {
                transfer_id,
                status: Status::InvalidArgument,
            });
        };

        state.max_bytes_to_send = min(pending_bytes as usize, state.data.len() - state.offset);
        if let Some(advertised) = chunk.max_chunk_size_bytes {
            state.max_chunk_size_bytes = min(advertised, self.config.max_chunk_size_bytes);
        }

        // the buffer must fit the payload next to the chunk metadata
        let payload_cap = self.config.max_chunk_size_bytes as usize - MAX_DATA_CHUNK_METADATA;

        if state.max_bytes_to_send == 0 && state.offset == state.data.len() {
            // nothing (left) to send: the end marker alone - covers
            //  zero-length transfers and re-granted windows after the final
            //  fragment was lost
            let final_chunk = Chunk {
                offset: state.offset as u32,
                remaining_bytes: Some(0),
                ..Chunk::new(transfer_id)
            };
            send_chunk(self.write_stream.as_mut(), &mut self.write_buf, &final_chunk);
            return None;
        }

        while state.max_bytes_to_send > 0 {
            let rest = state.data.len() - state.offset;
            let payload_len = [
                state.max_chunk_size_bytes as usize,
                rest,
                state.max_bytes_to_send,
                payload_cap,
            ]
            .into_iter()
            .min()
            .unwrap_or(0);
            if payload_len == 0 {
                // a grant that admits no payload (e.g. an advertised chunk
                //  size of zero) cannot make progress
                break;
            }
            let end = state.offset + payload_len;

            let mut data_chunk = Chunk {
                offset: state.offset as u32,
                data: state.data.slice(state.offset..end),
                ..Chunk::new(transfer_id)
            };
            if end == state.data.len() {
                data_chunk.remaining_bytes = Some(0);
            }

            if !send_chunk(self.write_stream.as_mut(), &mut self.write_buf, &data_chunk) {
                // stop here; the remote side re-grants the window from the
                //  offset it has actually received
                break;
            }

            state.offset = end;
            state.max_bytes_to_send -= payload_len;

            if end == state.data.len() {
                break;
            }
        }
        None
    }

    /// Re-issues the current transfer parameters of an active read transfer,
    ///  re-arming a full window at the expected offset. The retransmission
    ///  entry point for the application's own pacing.
    pub fn resend_read_parameters(&mut self, transfer_id: u32) {
        match self.read_transfers.get_mut(&transfer_id) {
            Some(state) => send_read_parameters(
                &self.config,
                self.read_stream.as_mut(),
                &mut self.read_buf,
                transfer_id,
                state,
            ),
            None => debug!("no active read transfer {} to re-arm", transfer_id),
        }
    }

    /// Re-announces an active write transfer. Safe at any point of the
    ///  handshake: a remote side that has progressed past the announced
    ///  offset re-grants its window instead.
    pub fn resend_write_start(&mut self, transfer_id: u32) {
        if self.write_transfers.contains_key(&transfer_id) {
            send_chunk(
                self.write_stream.as_mut(),
                &mut self.write_buf,
                &Chunk::new(transfer_id),
            );
        } else {
            debug!("no active write transfer {} to re-announce", transfer_id);
        }
    }

    /// Abandons an active read transfer, notifying the remote side.
    pub fn cancel_read(&mut self, transfer_id: u32) -> Option<TransferEvent> {
        let state = self.read_transfers.remove(&transfer_id)?;
        send_status_chunk(
            self.read_stream.as_mut(),
            &mut self.read_buf,
            transfer_id,
            Status::Cancelled,
        );
        Some(TransferEvent::ReadCompleted {
            transfer_id,
            status: Status::Cancelled,
            data: state.data.freeze(),
        })
    }

    /// Abandons an active write transfer, notifying the remote side.
    pub fn cancel_write(&mut self, transfer_id: u32) -> Option<TransferEvent> {
        self.write_transfers.remove(&transfer_id)?;
        send_status_chunk(
            self.write_stream.as_mut(),
            &mut self.write_buf,
            transfer_id,
            Status::Cancelled,
        );
        Some(TransferEvent::WriteCompleted {
            transfer_id,
            status: Status::Cancelled,
        })
    }

    /// Attaches a new outbound read stream, replacing the previous one.
    pub fn bind_read_stream(&mut self, stream: Box<dyn MessageStream>) {
        self.read_stream = stream;
    }

    /// Attaches a new outbound write stream, replacing the previous one.
    pub fn bind_write_stream(&mut self, stream: Box<dyn MessageStream>) {
        self.write_stream = stream;
    }
}

fn send_read_parameters(
    config: &ClientConfig,
    stream: &mut dyn MessageStream,
    buf: &mut PayloadBuf,
    transfer_id: u32,
    state: &mut ReadState,
) {
    state.pending_bytes = config.max_bytes_to_receive;

    let parameters = Chunk {
        offset: state.offset,
        pending_bytes: Some(state.pending_bytes),
        max_chunk_size_bytes: Some(config.max_chunk_size_bytes),
        min_delay_microseconds: config.min_delay_microseconds,
        ..Chunk::new(transfer_id)
    };
    trace!(
        "read transfer {}: requesting {} bytes from offset {}",
        transfer_id,
        state.pending_bytes,
        state.offset
    );
    send_chunk(stream, buf, &parameters);
}

fn send_chunk(stream: &mut dyn MessageStream, buf: &mut PayloadBuf, chunk: &Chunk) -> bool {
    buf.clear();
    match chunk.encode(buf.storage_mut()) {
        Ok(len) => {
            buf.set_len(len);
            match stream.write(buf.as_ref()) {
                Ok(()) => true,
                Err(status) => {
                    debug!(
                        "failed to send chunk for transfer {}: {}",
                        chunk.transfer_id, status
                    );
                    false
                }
            }
        }
        Err(e) => {
            debug!(
                "failed to encode chunk for transfer {}: {:#}",
                chunk.transfer_id, e
            );
            false
        }
    }
}
