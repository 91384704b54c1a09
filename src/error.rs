// Copyright 2019 Petar Dambovaliev. All rights reserved.
// This software may be modified and distributed under the terms
// of the BSD license. See the LICENSE file for details.

use thiserror::Error;

/// Errors raised by the gateway.
///
/// Codec and decode errors are recovered locally by the connection task and
/// never terminate a connection; only socket I/O does. `Config` is fatal
/// during startup only.
#[derive(Debug, Error)]
pub enum Error {
    /// Lost frame synchronization (bad start, stop or length field).
    #[error("frame sync: {0}")]
    FrameSync(&'static str),

    /// CRC-ITU mismatch on an otherwise well-formed frame.
    #[error("checksum mismatch: expected {expected:#06x} got {actual:#06x}")]
    Checksum { expected: u16, actual: u16 },

    /// Malformed payload or out-of-range field.
    #[error("decode: {0}")]
    Decode(String),

    /// A non-login message arrived before login completed.
    #[error("unauthenticated connection")]
    Unauthenticated,

    /// The session registry is full.
    #[error("session capacity exceeded ({0})")]
    Capacity(usize),

    /// Command addressed to a device with no live, authenticated session.
    #[error("device not connected: {0}")]
    DeviceNotConnected(String),

    /// The peer went away while a command was in flight.
    #[error("channel closed")]
    ChannelClosed,

    /// Command is past the point where cancellation is legal.
    #[error("command {0} cannot be cancelled")]
    CannotCancel(String),

    /// Malformed or out-of-range configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn decode(msg: impl Into<String>) -> Error {
        Error::Decode(msg.into())
    }

    /// Whether the connection task may keep the connection open after this.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::FrameSync(_)
                | Error::Checksum { .. }
                | Error::Decode(_)
                | Error::Unauthenticated
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recoverable_kinds() {
        assert!(Error::decode("truncated").is_recoverable());
        assert!(Error::Checksum { expected: 1, actual: 2 }.is_recoverable());
        assert!(!Error::ChannelClosed.is_recoverable());
        assert!(!Error::Capacity(10_000).is_recoverable());
    }
}
