use thiserror::Error;

/// Errors surfaced to callers of the transport API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// `send` was attempted while the link is not active
    #[error("operation is not valid in the current link state")]
    InvalidState,

    /// `open` did not reach the active state in time, or a reliable send
    ///  exhausted its retransmissions without an acknowledgement
    #[error("timed out waiting for the peer")]
    Timeout,

    /// the lower transport failed to open, the state machine was already
    ///  running, or `close` was called on a transport that was never opened
    #[error("internal transport error")]
    Internal,
}

/// Status codes delivered through the status callback. Codes originating in
///  the lower transport are forwarded upward unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    /// a RESET was sent to the peer as part of link establishment
    ResetPerformed,
    /// the handshake completed and the link is ready for reliable traffic
    ConnectionActive,
    /// a handshake packet was retransmitted the maximum number of times
    ///  without a response
    PktSendMaxRetriesReached,
    /// the lower transport lost its I/O resources; the link cannot recover
    IoResourcesUnavailable,
}
