use tracing::debug;

use crate::status::Status;

/// Mutable state of one in-progress transfer in one direction.
///
/// The context exclusively owns its bound byte-stream resource (`R` is a
///  reader for the read direction, a writer for the write direction) for the
///  transfer's lifetime; releasing the context drops the resource.
pub struct TransferContext<R> {
    pub(crate) transfer_id: u32,
    /// Next byte offset in the transferred stream. Non-decreasing while the
    ///  transfer is active.
    pub(crate) offset: u32,
    /// Current window budget: bytes that may still flow under the last
    ///  parameter exchange before a new one is required.
    pub(crate) pending_bytes: u32,
    /// Negotiated ceiling for a single data chunk's payload.
    pub(crate) max_chunk_size_bytes: u32,
    pub(crate) resource: R,
}

impl<R> TransferContext<R> {
    fn new(transfer_id: u32, resource: R, max_chunk_size_bytes: u32) -> TransferContext<R> {
        TransferContext {
            transfer_id,
            offset: 0,
            pending_bytes: 0,
            max_chunk_size_bytes,
            resource,
        }
    }

    pub fn transfer_id(&self) -> u32 {
        self.transfer_id
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    pub fn pending_bytes(&self) -> u32 {
        self.pending_bytes
    }
}

/// Fixed-capacity set of transfer contexts for one direction.
///
/// Slots are reused: releasing a transfer frees its slot for a different
///  transfer id. A full pool fails new-transfer creation with
///  `Status::ResourceExhausted` - callers report that to the peer, it is
///  never swallowed.
pub struct ContextPool<R> {
    slots: Vec<Option<TransferContext<R>>>,
}

impl<R> ContextPool<R> {
    pub fn new(capacity: usize) -> ContextPool<R> {
        ContextPool {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    /// Returns the active context for `transfer_id`, creating one on first
    ///  sight by binding a resource through `open`.
    ///
    /// Binding and slot allocation are atomic with respect to this call: on
    ///  any failure (`open` failing with its own status, or the pool being
    ///  full) no partial context is left behind.
    pub fn get_or_start(
        &mut self,
        transfer_id: u32,
        max_chunk_size_bytes: u32,
        open: impl FnOnce(u32) -> Result<R, Status>,
    ) -> Result<&mut TransferContext<R>, Status> {
        let index = match self.position_of(transfer_id) {
            Some(index) => index,
            None => {
                let free = self
                    .slots
                    .iter()
                    .position(|slot| slot.is_none())
                    .ok_or(Status::ResourceExhausted)?;
                let resource = open(transfer_id)?;
                debug!("starting transfer {}", transfer_id);
                self.slots[free] = Some(TransferContext::new(
                    transfer_id,
                    resource,
                    max_chunk_size_bytes,
                ));
                free
            }
        };

        Ok(self.slots[index]
            .as_mut()
            .expect("this is a bug: the slot was just checked or filled"))
    }

    /// Finishes the transfer: drops the bound resource and frees the slot.
    ///  Releasing an id that is not active is a no-op.
    pub fn release(&mut self, transfer_id: u32) {
        if let Some(index) = self.position_of(transfer_id) {
            debug!("releasing transfer {}", transfer_id);
            self.slots[index] = None;
        }
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn position_of(&self, transfer_id: u32) -> Option<usize> {
        self.slots.iter().position(|slot| {
            slot.as_ref()
                .is_some_and(|context| context.transfer_id == transfer_id)
        })
    }
}
