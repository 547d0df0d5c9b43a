//! A reliable, flow-controlled bulk-data transfer protocol layered on a
//!  bidirectional message-streaming transport. It moves an arbitrary byte
//!  stream between two endpoints - typically a resource-constrained device
//!  and a host - in bounded-size chunks, negotiating chunk size and window
//!  size dynamically so neither endpoint's buffers overflow and no more data
//!  is in flight than the receiver is ready for.
//!
//! ## Design goals
//!
//! * The abstraction underneath is sending / receiving *messages* over an
//!   already-reliable stream pair; this protocol adds sessions, windowed flow
//!   control and completion semantics on top
//!   * one stream per direction: *read* (this side serves data to a pulling
//!     peer) and *write* (this side accumulates data a peer pushes)
//!   * several transfers are multiplexed over the same stream pair via a
//!     per-direction transfer id
//! * Never produce or request more bytes than fit a caller-supplied fixed
//!   buffer
//!   * every outbound chunk is staged in a buffer of configured size, and the
//!     advertised chunk size is derived from that same ceiling minus the
//!     envelope and chunk overhead - a peer honouring the advertisement can
//!     never overflow this side
//! * Make forward progress under partial, duplicate and out-of-order
//!   delivery without timers of its own
//!   * all retry behavior is peer-driven: a sender that observes silence
//!     re-sends, a receiver that observes a gap re-negotiates; this core
//!     reacts to inbound chunks and does nothing in between
//! * No blocking, no background tasks, no internal locking
//!   * inbound chunks are processed to completion one at a time per
//!     direction, relying on the transport's serialized per-stream delivery;
//!     the two directions share no mutable state
//!
//! ## Chunk wire format
//!
//! A chunk is a sequence of key-prefixed fields (protobuf wire format, low
//!  field numbers, varint scalars). Only present fields are encoded:
//!
//! ```ascii
//! 1: transfer_id (varint u32) - session identifier, scoped per direction
//! 2: pending_bytes (varint u32) - window grant/request; parameter chunks only
//! 3: max_chunk_size_bytes (varint u32) - payload ceiling; parameter chunks only
//! 4: min_delay_microseconds (varint u32) - send pacing hint; never enforced here
//! 5: offset (varint u32) - where this chunk's data starts, or the offset a
//!     parameter chunk expects next
//! 6: data (length-delimited) - payload fragment
//! 7: remaining_bytes (varint u64) - 0 marks the end of a read transfer's data
//! 8: status (varint) - terminal outcome; a chunk carrying this ends the transfer
//! ```
//!
//! ## Handshakes
//!
//! *Read transfer* (peer pulls from a resource registered here):
//!
//! ```ascii
//! peer:  { transfer_id, offset, pending_bytes, [max_chunk_size_bytes] }
//! here:  { transfer_id, offset, data } ... until the window is spent
//! here:  { transfer_id, offset, remaining_bytes: 0 }   on end of data
//! peer:  { transfer_id, status: OK }
//! ```
//!
//! *Write transfer* (peer pushes into a resource registered here):
//!
//! ```ascii
//! peer:  { transfer_id }
//! here:  { transfer_id, offset, pending_bytes, max_chunk_size_bytes }
//! peer:  { transfer_id, offset, data } ... until the window is spent
//! peer:  { transfer_id, offset, remaining_bytes: 0 }   after the last byte
//! here:  { transfer_id, status: OK }
//! ```
//!
//! Either side may end a transfer at any point with a status chunk; the other
//!  side releases the transfer's state when it sees it.

pub mod chunk;
pub mod client;
pub mod config;
pub mod context;
pub mod handlers;
pub mod payload_buffer;
pub mod read_service;
pub mod service;
pub mod status;
pub mod write_service;

pub use chunk::Chunk;
pub use client::{ClientConfig, TransferClient, TransferEvent};
pub use config::TransferConfig;
pub use service::TransferService;
pub use status::Status;
