use anyhow::bail;

use crate::chunk::MAX_DATA_CHUNK_METADATA;

/// Static configuration of a transfer service, shared by both directions.
pub struct TransferConfig {
    /// The size of an outbound message payload and the ceiling for any
    ///  negotiated chunk size, on either direction.
    ///
    /// This should be the usable payload length of the underlying transport
    ///  after its own envelope overhead - choosing it larger makes the
    ///  transport reject or truncate chunks, choosing it smaller wastes
    ///  bandwidth. The chunk-size negotiation subtracts the protocol overhead
    ///  from this value, so it must leave room for at least one payload byte
    ///  (validated at service construction).
    pub max_chunk_size_bytes: u32,

    /// Window granted to the peer whenever the write direction issues new
    ///  transfer parameters, capped further by the bound resource's own
    ///  conservative write limit.
    pub default_max_bytes_to_receive: u32,

    /// Number of concurrently active transfers per direction. A transfer
    ///  starting beyond this is rejected with a resource-exhaustion status.
    pub max_concurrent_transfers: usize,
}

impl Default for TransferConfig {
    fn default() -> TransferConfig {
        TransferConfig {
            max_chunk_size_bytes: 1024,
            default_max_bytes_to_receive: 8192,
            max_concurrent_transfers: 4,
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_chunk_size_bytes as usize <= MAX_DATA_CHUNK_METADATA {
            bail!(
                "max_chunk_size_bytes {} cannot hold a data chunk's metadata ({} bytes) plus payload",
                self.max_chunk_size_bytes,
                MAX_DATA_CHUNK_METADATA
            );
        }
        if self.default_max_bytes_to_receive == 0 {
            bail!("default_max_bytes_to_receive must be positive");
        }
        if self.max_concurrent_transfers == 0 {
            bail!("max_concurrent_transfers must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(TransferConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::chunk_size_zero(0, 8192, 4)]
    #[case::chunk_size_metadata_only(MAX_DATA_CHUNK_METADATA as u32, 8192, 4)]
    #[case::no_receive_window(1024, 0, 4)]
    #[case::no_transfer_slots(1024, 8192, 0)]
    fn test_validate_rejects(
        #[case] max_chunk_size_bytes: u32,
        #[case] default_max_bytes_to_receive: u32,
        #[case] max_concurrent_transfers: usize,
    ) {
        let config = TransferConfig {
            max_chunk_size_bytes,
            default_max_bytes_to_receive,
            max_concurrent_transfers,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_minimal_chunk_size() {
        let config = TransferConfig {
            max_chunk_size_bytes: MAX_DATA_CHUNK_METADATA as u32 + 1,
            ..TransferConfig::default()
        };
        assert!(config.validate().is_ok());
    }
}
