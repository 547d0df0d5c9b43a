//! The interfaces this crate consumes, owned by the surrounding transport and
//!  application layers. The core never implements these; it is driven through
//!  them and mocks them away for testing.

#[cfg(test)]
use mockall::automock;

use crate::status::Status;

/// Outbound half of one bidirectional transfer stream.
///
/// The core stages a chunk in its own payload buffer and hands the finished
///  message to `write`. Sending is bounded and non-blocking; a failure is
///  returned immediately and never retried by the core.
#[cfg_attr(test, automock)]
pub trait MessageStream: Send {
    fn write(&mut self, message: &[u8]) -> Result<(), Status>;

    /// Identifier of the multiplexing channel this stream runs on, as encoded
    ///  into the enclosing message envelope. Feeds the chunk-size negotiation,
    ///  which must account for the envelope's varint-encoded channel id.
    fn channel_id(&self) -> u32;
}

/// Byte-stream resource a read transfer pulls its data from.
#[cfg_attr(test, automock)]
pub trait ResourceReader: Send {
    /// Reads up to `buf.len()` bytes, returning how many were produced.
    ///  `Err(Status::OutOfRange)` signals the end of the stream; any other
    ///  error is a local failure of the resource.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status>;
}

/// Byte-stream resource a write transfer pushes received data into.
#[cfg_attr(test, automock)]
pub trait ResourceWriter: Send {
    fn write(&mut self, data: &[u8]) -> Result<(), Status>;

    /// Upper bound on the bytes this resource accepts before the next window
    ///  must be re-negotiated. Caps the window the core grants to the peer.
    fn conservative_write_limit(&self) -> u32;
}

/// Directory of the byte-stream resources registered per transfer id.
///
/// Opening is the binding step of starting a transfer: the returned resource
///  is exclusively owned by that transfer's context until release.
#[cfg_attr(test, automock)]
pub trait TransferHandlers: Send + Sync {
    /// `Err(Status::NotFound)` if no readable handler is registered for the id.
    fn open_reader(&self, transfer_id: u32) -> Result<Box<dyn ResourceReader>, Status>;

    /// `Err(Status::NotFound)` if no writable handler is registered for the id.
    fn open_writer(&self, transfer_id: u32) -> Result<Box<dyn ResourceWriter>, Status>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-rolled fakes for flow tests; single expectations are better served
    //!  by the generated mocks.

    use super::*;
    use std::sync::{Arc, Mutex};

    /// Captures every message written to it, for later decoding/assertion.
    pub struct RecordingStream {
        pub messages: Arc<Mutex<Vec<Vec<u8>>>>,
        pub channel_id: u32,
        pub fail_writes: bool,
    }

    impl RecordingStream {
        pub fn new(channel_id: u32) -> (RecordingStream, Arc<Mutex<Vec<Vec<u8>>>>) {
            let messages: Arc<Mutex<Vec<Vec<u8>>>> = Default::default();
            let stream = RecordingStream {
                messages: messages.clone(),
                channel_id,
                fail_writes: false,
            };
            (stream, messages)
        }
    }

    impl MessageStream for RecordingStream {
        fn write(&mut self, message: &[u8]) -> Result<(), Status> {
            if self.fail_writes {
                return Err(Status::Unavailable);
            }
            self.messages.lock().unwrap().push(message.to_vec());
            Ok(())
        }

        fn channel_id(&self) -> u32 {
            self.channel_id
        }
    }

    /// Serves a fixed byte slice, then reports end-of-stream.
    pub struct SliceReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl SliceReader {
        pub fn new(data: impl Into<Vec<u8>>) -> SliceReader {
            SliceReader {
                data: data.into(),
                pos: 0,
            }
        }
    }

    impl ResourceReader for SliceReader {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
            if self.pos == self.data.len() {
                return Err(Status::OutOfRange);
            }
            let n = usize::min(buf.len(), self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    /// Accumulates written data into shared storage the test can inspect.
    pub struct SharedVecWriter {
        pub written: Arc<Mutex<Vec<u8>>>,
        pub write_limit: u32,
        pub fail_writes: bool,
    }

    impl SharedVecWriter {
        pub fn new(write_limit: u32) -> (SharedVecWriter, Arc<Mutex<Vec<u8>>>) {
            let written: Arc<Mutex<Vec<u8>>> = Default::default();
            let writer = SharedVecWriter {
                written: written.clone(),
                write_limit,
                fail_writes: false,
            };
            (writer, written)
        }
    }

    impl ResourceWriter for SharedVecWriter {
        fn write(&mut self, data: &[u8]) -> Result<(), Status> {
            if self.fail_writes {
                return Err(Status::DataLoss);
            }
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn conservative_write_limit(&self) -> u32 {
            self.write_limit
        }
    }

    /// Directory backed by per-test closures, counting how often each side
    ///  was opened.
    pub struct FakeHandlers {
        pub reader_factory: Box<dyn Fn(u32) -> Result<Box<dyn ResourceReader>, Status> + Send + Sync>,
        pub writer_factory: Box<dyn Fn(u32) -> Result<Box<dyn ResourceWriter>, Status> + Send + Sync>,
        pub opened_readers: Mutex<Vec<u32>>,
        pub opened_writers: Mutex<Vec<u32>>,
    }

    impl FakeHandlers {
        pub fn readable(
            factory: impl Fn(u32) -> Result<Box<dyn ResourceReader>, Status> + Send + Sync + 'static,
        ) -> FakeHandlers {
            FakeHandlers {
                reader_factory: Box::new(factory),
                writer_factory: Box::new(|_| Err(Status::NotFound)),
                opened_readers: Default::default(),
                opened_writers: Default::default(),
            }
        }

        pub fn writable(
            factory: impl Fn(u32) -> Result<Box<dyn ResourceWriter>, Status> + Send + Sync + 'static,
        ) -> FakeHandlers {
            FakeHandlers {
                reader_factory: Box::new(|_| Err(Status::NotFound)),
                writer_factory: Box::new(factory),
                opened_readers: Default::default(),
                opened_writers: Default::default(),
            }
        }
    }

    impl TransferHandlers for FakeHandlers {
        fn open_reader(&self, transfer_id: u32) -> Result<Box<dyn ResourceReader>, Status> {
            let result = (self.reader_factory)(transfer_id);
            if result.is_ok() {
                self.opened_readers.lock().unwrap().push(transfer_id);
            }
            result
        }

        fn open_writer(&self, transfer_id: u32) -> Result<Box<dyn ResourceWriter>, Status> {
            let result = (self.writer_factory)(transfer_id);
            if result.is_ok() {
                self.opened_writers.lock().unwrap().push(transfer_id);
            }
            result
        }
    }
}
