use std::cmp::min;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::chunk::{Chunk, ChunkEncoder};
use crate::config::TransferConfig;
use crate::context::{ContextPool, TransferContext};
use crate::handlers::{MessageStream, ResourceReader, TransferHandlers};
use crate::payload_buffer::PayloadBuf;
use crate::service::send_status_chunk;
use crate::status::Status;

/// Read-direction service: the peer pulls data out of locally registered
///  resources.
///
/// Every inbound chunk on the read stream is a transfer-parameter update
///  (or a terminal status): it (re)arms the transfer's window, and this
///  service answers with as many data chunks as the window allows, straight
///  from the bound reader. The final data chunk carries `remaining_bytes = 0`;
///  the peer then closes the transfer with a status chunk.
pub struct ReadService {
    config: Arc<TransferConfig>,
    handlers: Arc<dyn TransferHandlers>,
    stream: Box<dyn MessageStream>,
    pool: ContextPool<Box<dyn ResourceReader>>,
    payload_buf: PayloadBuf,
}

impl ReadService {
    pub fn new(
        config: Arc<TransferConfig>,
        handlers: Arc<dyn TransferHandlers>,
        stream: Box<dyn MessageStream>,
    ) -> anyhow::Result<ReadService> {
        config.validate()?;

        Ok(ReadService {
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

    /// Processes one inbound message from the read stream.
    pub fn on_chunk(&mut self, message: &[u8]) {
        let parameters = match Chunk::decode(message) {
            Ok(parameters) => parameters,
            Err(e) => {
                // no reply - the peer retransmits when it sees no response
                warn!("failed to decode incoming read transfer chunk: {:#}", e);
                return;
            }
        };
        let transfer_id = parameters.transfer_id;

        let Self {
            config,
            handlers,
            stream,
            pool,
            payload_buf,
        } = self;

        let transfer = match pool.get_or_start(transfer_id, config.max_chunk_size_bytes, |id| {
            handlers.open_reader(id)
        }) {
            Ok(transfer) => transfer,
            Err(status) => {
                error!("cannot handle read transfer {}: {}", transfer_id, status);
                send_status_chunk(stream.as_mut(), payload_buf, transfer_id, status);
                return;
            }
        };

        if let Some(status) = parameters.status {
            // the peer terminated the transfer and already knows the outcome,
            //  so there is nothing to reply
            if !status.is_ok() {
                error!("read transfer {} failed with status {}", transfer_id, status);
            }
            pool.release(transfer_id);
            return;
        }

        let Some(pending_bytes) = parameters.pending_bytes else {
            send_status_chunk(
                stream.as_mut(),
                payload_buf,
                transfer_id,
                Status::InvalidArgument,
            );
            pool.release(transfer_id);
            return;
        };

        if parameters.offset != transfer.offset {
            // resuming at a different offset needs seek support, which the
            //  reader contract does not offer
            send_status_chunk(
                stream.as_mut(),
                payload_buf,
                transfer_id,
                Status::Unimplemented,
            );
            pool.release(transfer_id);
            return;
        }

        if let Some(max_chunk_size_bytes) = parameters.max_chunk_size_bytes {
            transfer.max_chunk_size_bytes = min(max_chunk_size_bytes, config.max_chunk_size_bytes);
        }
        transfer.pending_bytes = pending_bytes;

        trace!(
            "read transfer {}: window re-armed with {} bytes at offset {}",
            transfer_id,
            pending_bytes,
            transfer.offset
        );
        while send_next_read_chunk(stream.as_mut(), payload_buf, transfer) {}
    }
}

/// Sends the next data chunk of an active read transfer, returning whether
///  another send attempt can make progress.
fn send_next_read_chunk(
    stream: &mut dyn MessageStream,
    payload_buf: &mut PayloadBuf,
    transfer: &mut TransferContext<Box<dyn ResourceReader>>,
) -> bool {
    if transfer.pending_bytes == 0 {
        return false;
    }

    payload_buf.clear();
    let mut encoder = ChunkEncoder::new(payload_buf.storage_mut());

    // metadata first; the payload is then read straight into the buffer tail
    if encoder.write_transfer_id(transfer.transfer_id).is_err()
        || encoder.write_offset(transfer.offset).is_err()
    {
        debug!(
            "payload buffer cannot hold chunk metadata for read transfer {}",
            transfer.transfer_id
        );
        return false;
    }

    let max_bytes_to_send = min(transfer.pending_bytes, transfer.max_chunk_size_bytes) as usize;
    let payload_area = encoder.payload_area();
    let read_len = min(max_bytes_to_send, payload_area.len());

    match transfer.resource.read(&mut payload_area[..read_len]) {
        Err(Status::OutOfRange) => {
            // end of data: an end marker instead of a payload; the peer
            //  closes the transfer with a final status chunk
            if encoder.write_remaining_bytes(0).is_err() {
                return false;
            }
            transfer.pending_bytes = 0;
        }
        Err(status) => {
            // local failure - abandon the chunk without a reply; the peer's
            //  retransmitted parameters drive another attempt
            debug!(
                "read transfer {}: reading from the bound resource failed: {}",
                transfer.transfer_id, status
            );
            return false;
        }
        Ok(0) => {
            // a zero-length read cannot make progress
            return false;
        }
        Ok(bytes_read) => {
            if encoder.commit_payload(bytes_read).is_err() {
                return false;
            }
            transfer.offset += bytes_read as u32;
            transfer.pending_bytes -= bytes_read as u32;
        }
    }

    let encoded_len = encoder.len();
    payload_buf.set_len(encoded_len);

    trace!(
        "read transfer {}: sending chunk {:?}",
        transfer.transfer_id,
        payload_buf.as_ref()
    );
    stream.write(payload_buf.as_ref()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::testing::{FakeHandlers, RecordingStream, SliceReader};
    use bytes::Bytes;
    use rstest::rstest;
    use std::sync::{Arc, Mutex};

    fn small_config() -> TransferConfig {
        TransferConfig {
            max_chunk_size_bytes: 64,
            default_max_bytes_to_receive: 128,
            max_concurrent_transfers: 2,
        }
    }

    fn reader_handlers(data: &[u8]) -> Arc<FakeHandlers> {
        let data = data.to_vec();
        Arc::new(FakeHandlers::readable(move |_| {
            let reader: Box<dyn ResourceReader> = Box::new(SliceReader::new(data.clone()));
            Ok(reader)
        }))
    }

    fn read_service(
        config: TransferConfig,
        handlers: Arc<FakeHandlers>,
    ) -> (ReadService, Arc<Mutex<Vec<Vec<u8>>>>) {
        let (stream, messages) = RecordingStream::new(1);
        let service = ReadService::new(Arc::new(config), handlers, Box::new(stream)).unwrap();
        (service, messages)
    }

    fn encode(chunk: &Chunk) -> Vec<u8> {
        let mut buf = [0u8; 256];
        let len = chunk.encode(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    fn sent_chunks(messages: &Arc<Mutex<Vec<Vec<u8>>>>) -> Vec<Chunk> {
        messages
            .lock()
            .unwrap()
            .iter()
            .map(|message| Chunk::decode(message).unwrap())
            .collect()
    }

    #[test]
    fn test_single_window_scenario() {
        let data: Vec<u8> = (0..10).collect();
        let handlers = reader_handlers(&data);
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(1000),
            ..Chunk::new(1)
        }));

        let chunks = sent_chunks(&messages);
        assert_eq!(
            chunks,
            vec![
                Chunk {
                    data: Bytes::from(data),
                    ..Chunk::new(1)
                },
                Chunk {
                    offset: 10,
                    remaining_bytes: Some(0),
                    ..Chunk::new(1)
                },
            ]
        );
        assert_eq!(service.pool.active_count(), 1);

        // the peer acknowledges completion; no reply is sent
        service.on_chunk(&encode(&Chunk::terminal(1, Status::Ok)));
        assert_eq!(service.pool.active_count(), 0);
        assert_eq!(messages.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_chunks_respect_requested_chunk_size() {
        let data: Vec<u8> = (0..10).collect();
        let handlers = reader_handlers(&data);
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(1000),
            max_chunk_size_bytes: Some(4),
            ..Chunk::new(1)
        }));

        let chunks = sent_chunks(&messages);
        let payloads: Vec<Vec<u8>> = chunks.iter().map(|c| c.data.to_vec()).collect();
        assert_eq!(
            payloads,
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9], vec![]]
        );
        assert_eq!(chunks[2].offset, 8);
        assert_eq!(chunks[3].remaining_bytes, Some(0));
    }

    #[test]
    fn test_requested_chunk_size_is_clamped_to_ceiling() {
        let data = vec![7u8; 200];
        let handlers = reader_handlers(&data);
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(10_000),
            max_chunk_size_bytes: Some(1 << 20),
            ..Chunk::new(1)
        }));

        for chunk in sent_chunks(&messages) {
            assert!(chunk.data.len() <= 64);
        }
    }

    #[test]
    fn test_window_smaller_than_resource() {
        let data: Vec<u8> = (0..10).collect();
        let handlers = reader_handlers(&data);
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(4),
            ..Chunk::new(1)
        }));

        let chunks = sent_chunks(&messages);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].data.to_vec(), vec![0, 1, 2, 3]);
        assert_eq!(chunks[0].remaining_bytes, None);
        assert_eq!(service.pool.active_count(), 1);

        // the peer re-arms the window at the new offset for the rest
        service.on_chunk(&encode(&Chunk {
            offset: 4,
            pending_bytes: Some(100),
            ..Chunk::new(1)
        }));

        let chunks = sent_chunks(&messages);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].offset, 4);
        assert_eq!(chunks[1].data.to_vec(), vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(chunks[2].remaining_bytes, Some(0));
    }

    #[test]
    fn test_offset_mismatch_aborts_transfer() {
        let handlers = reader_handlers(b"0123456789");
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            offset: 5,
            pending_bytes: Some(100),
            ..Chunk::new(1)
        }));

        assert_eq!(
            sent_chunks(&messages),
            vec![Chunk::terminal(1, Status::Unimplemented)]
        );
        assert_eq!(service.pool.active_count(), 0);
    }

    #[test]
    fn test_missing_pending_bytes_is_invalid_argument() {
        let handlers = reader_handlers(b"0123456789");
        let (mut service, messages) = read_service(small_config(), handlers.clone());

        service.on_chunk(&encode(&Chunk::new(1)));

        assert_eq!(
            sent_chunks(&messages),
            vec![Chunk::terminal(1, Status::InvalidArgument)]
        );
        assert_eq!(service.pool.active_count(), 0);

        // a new transfer for the same id starts from scratch
        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(3),
            ..Chunk::new(1)
        }));
        assert_eq!(handlers.opened_readers.lock().unwrap().as_slice(), &[1, 1]);
        let chunks = sent_chunks(&messages);
        assert_eq!(chunks[1].offset, 0);
        assert_eq!(chunks[1].data.to_vec(), b"012");
    }

    #[test]
    fn test_unknown_transfer_id_is_not_found() {
        let handlers = Arc::new(FakeHandlers::readable(|_| Err(Status::NotFound)));
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(100),
            ..Chunk::new(9)
        }));

        assert_eq!(
            sent_chunks(&messages),
            vec![Chunk::terminal(9, Status::NotFound)]
        );
        assert_eq!(service.pool.active_count(), 0);
    }

    #[test]
    fn test_pool_exhaustion_is_reported() {
        let config = TransferConfig {
            max_concurrent_transfers: 1,
            ..small_config()
        };
        let handlers = reader_handlers(b"0123456789");
        let (mut service, messages) = read_service(config, handlers);

        // first transfer keeps its slot (window smaller than the resource)
        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(4),
            ..Chunk::new(1)
        }));
        assert_eq!(service.pool.active_count(), 1);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(4),
            ..Chunk::new(2)
        }));

        let chunks = sent_chunks(&messages);
        assert_eq!(
            chunks.last().unwrap(),
            &Chunk::terminal(2, Status::ResourceExhausted)
        );
        assert_eq!(service.pool.active_count(), 1);
    }

    #[test]
    fn test_undecodable_chunk_is_dropped_without_reply() {
        let handlers = reader_handlers(b"0123456789");
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&[0x08]);

        assert!(messages.lock().unwrap().is_empty());
        assert_eq!(service.pool.active_count(), 0);
    }

    #[test]
    fn test_peer_status_releases_without_reply() {
        let handlers = reader_handlers(b"0123456789");
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(4),
            ..Chunk::new(1)
        }));
        assert_eq!(service.pool.active_count(), 1);
        let messages_before = messages.lock().unwrap().len();

        service.on_chunk(&encode(&Chunk::terminal(1, Status::Cancelled)));

        assert_eq!(service.pool.active_count(), 0);
        assert_eq!(messages.lock().unwrap().len(), messages_before);
    }

    #[rstest]
    #[case::internal(Status::Internal)]
    #[case::data_loss(Status::DataLoss)]
    fn test_resource_read_failure_sends_nothing(#[case] failure: Status) {
        let handlers = Arc::new(FakeHandlers::readable(move |_| {
            let mut reader = crate::handlers::MockResourceReader::new();
            reader.expect_read().returning(move |_| Err(failure));
            let reader: Box<dyn ResourceReader> = Box::new(reader);
            Ok(reader)
        }));
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(100),
            ..Chunk::new(1)
        }));

        // a local failure is not reported to the peer by this path; the
        //  transfer stays active for a retransmitted parameter chunk
        assert!(messages.lock().unwrap().is_empty());
        assert_eq!(service.pool.active_count(), 1);
    }

    #[test]
    fn test_stream_write_failure_stops_the_loop() {
        let handlers = reader_handlers(&[1u8; 300]);
        let (stream, messages) = RecordingStream::new(1);
        let stream = RecordingStream {
            fail_writes: true,
            ..stream
        };
        let mut service =
            ReadService::new(Arc::new(small_config()), handlers, Box::new(stream)).unwrap();

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(1000),
            max_chunk_size_bytes: Some(4),
            ..Chunk::new(1)
        }));

        // exactly one failed attempt, then the loop stops until the peer
        //  retransmits its parameters
        assert!(messages.lock().unwrap().is_empty());
        assert_eq!(service.pool.active_count(), 1);
    }

    #[test]
    fn test_exact_wire_bytes_of_single_window() {
        let handlers = reader_handlers(&[0xAA, 0xBB]);
        let (mut service, messages) = read_service(small_config(), handlers);

        service.on_chunk(&encode(&Chunk {
            pending_bytes: Some(100),
            ..Chunk::new(1)
        }));

        assert_eq!(
            messages.lock().unwrap().as_slice(),
            &[
                vec![0x08, 1, 0x28, 0, 0x32, 2, 0xAA, 0xBB],
                vec![0x08, 1, 0x28, 2, 0x38, 0],
            ]
        );
    }
}
