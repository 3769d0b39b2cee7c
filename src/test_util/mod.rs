//! Test doubles for the lower transport and the upper callbacks: a pair of
//!  in-memory uarts wired to each other, a uart that swallows everything,
//!  and an event handler that records what it sees. These live in a regular
//!  module so integration-style tests and downstream crates can drive a
//!  transport without hardware.

use std::pin::pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::trace;

use crate::control_packets;
use crate::error::AppStatus;
use crate::packet_header::{self, PacketType};
use crate::slip;
use crate::transport::TransportEvents;
use crate::uart::{UartHandler, UartTransport};

/// Classification of a framed packet, for filters and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Reset,
    Sync,
    SyncResponse,
    SyncConfig,
    SyncConfigResponse,
    Ack,
    VendorSpecific,
    Other,
}

/// Builds the framed wire bytes of a control packet, for injecting traffic
///  directly into a uart.
pub fn control_frame(packet: control_packets::ControlPacket) -> Vec<u8> {
    let header = packet_header::PacketHeader::for_payload(
        packet.payload(),
        0,
        0,
        false,
        false,
        packet.packet_type(),
    );
    let h5_packet = packet_header::encode_packet(&header, packet.payload());
    let mut buf = bytes::BytesMut::new();
    slip::encode(&h5_packet, &mut buf);
    buf.to_vec()
}

/// Decodes a whole frame just enough to tell what it carries. Returns `None`
///  for frames that do not decode.
pub fn classify_frame(frame: &[u8]) -> Option<FrameKind> {
    let h5_packet = slip::decode(frame).ok()?;
    let packet = packet_header::decode_packet(&h5_packet).ok()?;

    Some(match packet.header.packet_type {
        PacketType::Reset => FrameKind::Reset,
        PacketType::Ack => FrameKind::Ack,
        PacketType::VendorSpecific => FrameKind::VendorSpecific,
        PacketType::LinkControl => {
            if control_packets::is_sync(&packet.payload) {
                FrameKind::Sync
            } else if control_packets::is_sync_response(&packet.payload) {
                FrameKind::SyncResponse
            } else if control_packets::is_sync_config(&packet.payload) {
                FrameKind::SyncConfig
            } else if control_packets::is_sync_config_response(&packet.payload) {
                FrameKind::SyncConfigResponse
            } else {
                FrameKind::Other
            }
        }
        _ => FrameKind::Other,
    })
}

/// One half of an in-memory uart pair. Frames sent on one half arrive at the
///  other half's handler, pumped by a task per direction so delivery happens
///  outside the sender's call stack, like a real serial driver's read loop.
///
/// RESET frames are not forwarded - resetting a peer makes no sense for an
///  in-memory channel - and [`LoopbackUart::drop_incoming`] suppresses
///  delivery of one frame kind, which is how the handshake failure scenarios
///  are staged.
pub struct LoopbackUart {
    name: &'static str,
    peer_tx: StdMutex<Option<UnboundedSender<Vec<u8>>>>,
    inbox: StdMutex<Option<UnboundedReceiver<Vec<u8>>>>,
    drop_kind: Arc<StdMutex<Option<FrameKind>>>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl LoopbackUart {
    pub fn pair(name_a: &'static str, name_b: &'static str) -> (Arc<LoopbackUart>, Arc<LoopbackUart>) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let a = Arc::new(LoopbackUart {
            name: name_a,
            peer_tx: StdMutex::new(Some(tx_b)),
            inbox: StdMutex::new(Some(rx_a)),
            drop_kind: Arc::new(StdMutex::new(None)),
            pump: StdMutex::new(None),
        });
        let b = Arc::new(LoopbackUart {
            name: name_b,
            peer_tx: StdMutex::new(Some(tx_a)),
            inbox: StdMutex::new(Some(rx_b)),
            drop_kind: Arc::new(StdMutex::new(None)),
            pump: StdMutex::new(None),
        });

        (a, b)
    }

    /// Suppress delivery of the given frame kind to this uart's handler.
    pub fn drop_incoming(&self, kind: FrameKind) {
        *self.drop_kind.lock().unwrap() = Some(kind);
    }
}

#[async_trait]
impl UartTransport for LoopbackUart {
    async fn open(&self, handler: Arc<dyn UartHandler>) -> anyhow::Result<()> {
        let mut inbox = self
            .inbox
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| anyhow!("uart {} opened twice", self.name))?;

        let name = self.name;
        let drop_kind = self.drop_kind.clone();
        let pump = tokio::spawn(async move {
            while let Some(frame) = inbox.recv().await {
                let filtered = {
                    let drop_kind = drop_kind.lock().unwrap();
                    drop_kind.is_some() && *drop_kind == classify_frame(&frame)
                };
                if filtered {
                    trace!("[{}] suppressing filtered frame", name);
                    continue;
                }
                handler.on_bytes(&frame).await;
            }
        });
        *self.pump.lock().unwrap() = Some(pump);

        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        if let Some(pump) = self.pump.lock().unwrap().take() {
            pump.abort();
        }
        *self.peer_tx.lock().unwrap() = None;
        Ok(())
    }

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()> {
        if classify_frame(buf) == Some(FrameKind::Reset) {
            trace!("[{}] not forwarding RESET to the in-memory peer", self.name);
            return Ok(());
        }

        let peer_tx = self.peer_tx.lock().unwrap().clone();
        match peer_tx {
            Some(peer_tx) => {
                if peer_tx.send(buf.to_vec()).is_err() {
                    trace!("[{}] peer uart is closed - dropping frame", self.name);
                }
            }
            None => trace!("[{}] uart is closed - dropping frame", self.name),
        }

        Ok(())
    }
}

/// A lower transport that opens fine but never delivers a byte: every send
///  disappears. Drives the "no valid response from the controller" paths.
pub struct BlackholeUart;

#[async_trait]
impl UartTransport for BlackholeUart {
    async fn open(&self, _handler: Arc<dyn UartHandler>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn send(&self, _buf: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Records every status code and data payload delivered by the transport.
pub struct RecordingEvents {
    data: StdMutex<Vec<Vec<u8>>>,
    statuses: StdMutex<Vec<AppStatus>>,
    changed: Notify,
}

impl RecordingEvents {
    pub fn new() -> Arc<RecordingEvents> {
        Arc::new(RecordingEvents {
            data: StdMutex::new(Vec::new()),
            statuses: StdMutex::new(Vec::new()),
            changed: Notify::new(),
        })
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.data.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<AppStatus> {
        self.statuses.lock().unwrap().clone()
    }

    /// Waits until at least `count` payloads have arrived.
    pub async fn wait_for_data(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let mut changed = pin!(self.changed.notified());
            changed.as_mut().enable();

            if self.data.lock().unwrap().len() >= count {
                return true;
            }

            if time::timeout_at(deadline, changed).await.is_err() {
                return self.data.lock().unwrap().len() >= count;
            }
        }
    }
}

#[async_trait]
impl TransportEvents for RecordingEvents {
    async fn on_status(&self, status: AppStatus, message: &str) {
        trace!(?status, message, "recorded status");
        self.statuses.lock().unwrap().push(status);
        self.changed.notify_waiters();
    }

    async fn on_data(&self, payload: &[u8]) {
        self.data.lock().unwrap().push(payload.to_vec());
        self.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::control_packets::ControlPacket;

    #[rstest]
    #[case::reset(ControlPacket::Reset, FrameKind::Reset)]
    #[case::sync(ControlPacket::Sync, FrameKind::Sync)]
    #[case::sync_response(ControlPacket::SyncResponse, FrameKind::SyncResponse)]
    #[case::sync_config(ControlPacket::SyncConfig, FrameKind::SyncConfig)]
    #[case::sync_config_response(ControlPacket::SyncConfigResponse, FrameKind::SyncConfigResponse)]
    #[case::ack(ControlPacket::Ack, FrameKind::Ack)]
    fn test_classify_frame(#[case] packet: ControlPacket, #[case] expected: FrameKind) {
        assert_eq!(classify_frame(&control_frame(packet)), Some(expected));
    }

    #[rstest]
    fn test_classify_frame_garbage() {
        assert_eq!(classify_frame(&[0x01, 0x02]), None);
    }
}
