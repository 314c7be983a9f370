/// Tunable limits and protocol constants for one local identity.
#[derive(Clone, Debug)]
pub struct ProtocolConfig {
    /// Maximum receiving-chain gap tolerated before a decrypt is rejected.
    pub max_skipped_messages: u32,
    /// Maximum number of cached skipped message keys; the oldest entry is
    /// evicted beyond this.
    pub max_skipped_keys: usize,
    /// Target size of the one-time pre-key pool.
    pub max_one_time_pre_keys: usize,
    /// Consecutive decryption failures after which a session reports itself
    /// as desynchronized.
    pub desync_threshold: u32,
    /// HKDF info string separating this deployment's key material from any
    /// other protocol using the same primitives.
    pub protocol_info: Vec<u8>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            max_skipped_messages: 1000,
            max_skipped_keys: 1000,
            max_one_time_pre_keys: 100,
            desync_threshold: 5,
            protocol_info: b"Murmur-E2E-v1".to_vec(),
        }
    }
}
