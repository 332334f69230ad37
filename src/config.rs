//! Construction-time configuration for the assembly core.
//!
//! The upstream toggles that used to live in process-wide flags are passed
//! explicitly when the assembler is built; nothing here changes at runtime.

#![forbid(unsafe_code)]

/// Tunables of the packet assembly core.
#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    /// Pad every packet carrying crypto handshake data to the full MTU.
    pub fully_pad_crypto_handshake_packets: bool,

    /// Abort the connection if a ClientHello would span multiple packets.
    pub enforce_single_packet_chlo: bool,

    /// Accept PING frames that carry no control-frame ID.
    pub let_connection_handle_pings: bool,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            fully_pad_crypto_handshake_packets: true,
            enforce_single_packet_chlo: true,
            let_connection_handle_pings: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AssemblyConfig::default();
        assert!(config.fully_pad_crypto_handshake_packets);
        assert!(config.enforce_single_packet_chlo);
        assert!(!config.let_connection_handle_pings);
    }
}
