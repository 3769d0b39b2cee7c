//! A reliable, acknowledged, framed packet channel on top of an unreliable
//!  byte-oriented serial line, implementing the "Three-Wire UART" (H5)
//!  transport used between a host and a Bluetooth controller.
//!
//! ## Design goals
//!
//! * The abstraction is sending / receiving *packets* (defined-length chunks
//!   of data), not a stream of bytes
//! * Tolerate everything a serial line does to you: lost bytes, partial
//!   reads, line noise between frames, duplicated deliveries
//!   * frames are delimited by an escape codec so the receiver can always
//!     re-find a frame boundary
//!   * reliable packets carry sequence numbers and are acknowledged and
//!     re-sent; the receiver de-duplicates by sequence number
//! * Guarantee that the payloads that are delivered are delivered in the
//!   order they were sent, exactly once
//!   * the window is fixed at one packet, so there is never more than one
//!     unacknowledged packet in flight
//! * Establish the link with an explicit handshake and recover link-level
//!   faults by running it again
//! * No assumptions about the driver below: anything that can move bytes and
//!   invoke a callback can sit underneath
//!
//! ## Frame layout
//!
//! Every transmitted packet is `0xC0 | escaped( header(4) | payload ) | 0xC0`:
//!
//! ```ascii
//! 0:  bits 0-2: sequence number (modulo 8)
//!     bits 3-5: acknowledgement number (modulo 8)
//!     bit  6:   data-integrity flag - a CRC16 follows the payload
//!     bit  7:   reliable flag - this packet must be acknowledged
//! 1:  bits 0-3: packet type
//!     bits 4-7: payload length, low nibble
//! 2:  payload length, high byte (12 bits total)
//! 3:  header checksum (two's complement of the sum of bytes 0-2)
//! 4:  payload
//! *:  CRC16 over header and payload, low byte first - only with the
//!      data-integrity flag
//! ```
//!
//! The escape codec maps 0xC0 to 0xDB 0xDC and 0xDB to 0xDB 0xDD, so 0xC0
//!  appears on the wire only at frame boundaries.
//!
//! ## Link establishment
//!
//! ```ascii
//! START -> RESET -> UNINITIALIZED -> INITIALIZED -> ACTIVE
//!            ^      (SYNC handshake)  (CONFIG handshake)  |
//!            +----------- re-sync or ack error -----------+
//! ```
//!
//! The handshake frames are LINK_CONTROL packets with fixed payloads (SYNC,
//!  SYNC RESPONSE, CONFIG, CONFIG RESPONSE); the config field announces a
//!  sliding window of one and CRC data-integrity checks. Failure to complete
//!  a handshake step within its retransmission budget ends in the terminal
//!  FAILED state; `close` ends in CLOSED from everywhere.
//!
//! ## Related
//!
//! * BLUETOOTH SPECIFICATION v4.2 [Vol 4, Part D] - the Three-Wire UART
//!   transport layer this implements
//! * BCSP - BlueCore Serial Protocol, the ancestor of H5
//! * SLIP (RFC 1055) - the escape framing

pub mod config;
pub mod control_packets;
pub mod error;
pub mod frame_assembler;
pub mod link_layer;
pub mod packet_header;
pub mod slip;
pub mod test_util;
pub mod transport;
pub mod uart;

mod exit_criteria;
