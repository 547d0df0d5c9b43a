use std::sync::Arc;

use tracing::debug;

use crate::chunk::Chunk;
use crate::config::TransferConfig;
use crate::handlers::{MessageStream, TransferHandlers};
use crate::payload_buffer::PayloadBuf;
use crate::read_service::ReadService;
use crate::status::Status;
use crate::write_service::WriteService;

/// The place where both transfer directions come together: one read-direction
///  service and one write-direction service over a shared configuration and
///  handler directory.
///
/// The two directions have no shared mutable state; [`split_mut`](Self::split_mut)
///  hands out both so they can be driven independently. Within one direction,
///  inbound chunks must be delivered one at a time, in arrival order - the
///  transport's per-stream serialization is assumed, there is no internal
///  locking.
pub struct TransferService {
    read: ReadService,
    write: WriteService,
}

impl TransferService {
    /// Fails fast on a configuration that could never move payload - most
    ///  importantly a chunk-size ceiling too small to survive the protocol
    ///  overhead of the chunk-size negotiation.
    pub fn new(
        config: TransferConfig,
        handlers: Arc<dyn TransferHandlers>,
        read_stream: Box<dyn MessageStream>,
        write_stream: Box<dyn MessageStream>,
    ) -> anyhow::Result<TransferService> {
        let config = Arc::new(config);
        Ok(TransferService {
            read: ReadService::new(config.clone(), handlers.clone(), read_stream)?,
            write: WriteService::new(config, handlers, write_stream)?,
        })
    }

    /// Processes one inbound message from the read stream.
    pub fn on_read_chunk(&mut self, message: &[u8]) {
        self.read.on_chunk(message);
    }

    /// Processes one inbound message from the write stream.
    pub fn on_write_chunk(&mut self, message: &[u8]) {
        self.write.on_chunk(message);
    }

    /// Attaches a new outbound read stream, replacing the previous one.
    pub fn bind_read_stream(&mut self, stream: Box<dyn MessageStream>) {
        self.read.bind_stream(stream);
    }

    /// Attaches a new outbound write stream, replacing the previous one.
    pub fn bind_write_stream(&mut self, stream: Box<dyn MessageStream>) {
        self.write.bind_stream(stream);
    }

    /// Both direction services, for driving them from independent delivery
    ///  contexts.
    pub fn split_mut(&mut self) -> (&mut ReadService, &mut WriteService) {
        (&mut self.read, &mut self.write)
    }
}

/// Builds and sends the terminal chunk that ends `transfer_id` with `status`.
///
/// Sending is fire and forget: if the write fails, the peer never sees the
///  termination and must fall back on its own timeout - this core does not
///  retry or escalate.
pub(crate) fn send_status_chunk(
    stream: &mut dyn MessageStream,
    payload_buf: &mut PayloadBuf,
    transfer_id: u32,
    status: Status,
) {
    let chunk = Chunk::terminal(transfer_id, status);

    payload_buf.clear();
    match chunk.encode(payload_buf.storage_mut()) {
        Ok(len) => {
            payload_buf.set_len(len);
            if stream.write(payload_buf.as_ref()).is_err() {
                debug!(
                    "failed to send status chunk for transfer {}: {}",
                    transfer_id, status
                );
            }
        }
        Err(e) => debug!(
            "failed to encode status chunk for transfer {}: {:#}",
            transfer_id, e
        ),
    }
}
