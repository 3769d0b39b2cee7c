//! The transport instance: public API, packet dispatch and the reliable send
//!  path. This is the place where all other parts come together: it owns the
//!  uart, the sequence bookkeeping, the frame assembler and the state-machine
//!  task, dispatches every reassembled packet by (link state x packet type),
//!  and bridges caller tasks to the state machine.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
#[cfg(test)]
use mockall::automock;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, trace, warn};

use crate::config::{H5Config, OPEN_WAIT_TIMEOUT, PACKET_RETRANSMISSIONS};
use crate::control_packets::{self, ControlPacket};
use crate::error::{AppStatus, TransportError};
use crate::exit_criteria::{ExitCriteria, StateCriteria};
use crate::frame_assembler::FrameAssembler;
use crate::link_layer::{LinkLayer, LinkState};
use crate::packet_header::{self, DecodedPacket, PacketHeader, PacketType};
use crate::slip;
use crate::uart::{UartHandler, UartTransport};

/// Upper-layer callbacks. `on_data` delivers reassembled, decoded and
///  de-duplicated vendor-specific payloads in receive order; `on_status`
///  reports link lifecycle events and lower-layer status transitions. Both
///  are invoked from the task that happens to process the triggering packet,
///  so implementations must be prepared for calls from any task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TransportEvents: Send + Sync + 'static {
    async fn on_status(&self, status: AppStatus, message: &str);

    async fn on_data(&self, payload: &[u8]);
}

/// Monotonic per-instance packet counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketStats {
    pub incoming: u64,
    pub outgoing: u64,
    pub errors: u64,
}

/// A reliable, ordered, framed packet channel over an unreliable uart, as
///  specified by the Three-Wire UART transport layer: SLIP framing, a
///  SYNC / SYNC CONFIG link establishment handshake, and a sliding window of
///  one reliable packet with sequence and acknowledgement numbers modulo 8.
pub struct H5Transport {
    inner: Arc<TransportInner>,
}

pub(crate) struct LinkShared {
    pub criteria: ExitCriteria,
    pub worker_ready: bool,
}

/// Sequence bookkeeping of the reliable channel. `last_packet` holds the
///  framed bytes of the one packet awaiting acknowledgement, and nothing
///  otherwise.
pub(crate) struct ReliableState {
    pub seq_num: u8,
    pub ack_num: u8,
    pub last_packet: Option<Vec<u8>>,
}

pub(crate) struct TransportInner {
    pub uart: Arc<dyn UartTransport>,
    pub config: H5Config,

    /// written only by the state machine task
    pub state_tx: watch::Sender<LinkState>,
    pub link: Mutex<LinkShared>,
    pub link_changed: Notify,

    pub reliable: Mutex<ReliableState>,
    pub ack_received: Notify,
    /// held by a reliable send for its whole send-and-wait cycle
    send_window: Mutex<()>,

    assembler: Mutex<FrameAssembler>,
    events: Mutex<Option<Arc<dyn TransportEvents>>>,
    worker: Mutex<Option<JoinHandle<()>>>,

    incoming_packets: AtomicU64,
    outgoing_packets: AtomicU64,
    error_packets: AtomicU64,
}

impl H5Transport {
    pub fn new(uart: Arc<dyn UartTransport>, config: H5Config) -> anyhow::Result<H5Transport> {
        config.validate()?;

        let (state_tx, _) = watch::channel(LinkState::Start);

        Ok(H5Transport {
            inner: Arc::new(TransportInner {
                uart,
                config,
                state_tx,
                link: Mutex::new(LinkShared {
                    criteria: ExitCriteria::for_state(LinkState::Start),
                    worker_ready: false,
                }),
                link_changed: Notify::new(),
                reliable: Mutex::new(ReliableState {
                    seq_num: 0,
                    ack_num: 0,
                    last_packet: None,
                }),
                ack_received: Notify::new(),
                send_window: Mutex::new(()),
                assembler: Mutex::new(FrameAssembler::new()),
                events: Mutex::new(None),
                worker: Mutex::new(None),
                incoming_packets: AtomicU64::new(0),
                outgoing_packets: AtomicU64::new(0),
                error_packets: AtomicU64::new(0),
            }),
        })
    }

    /// Starts the state machine, opens the lower transport and drives the
    ///  handshake, waiting up to the open timeout for the link to become
    ///  active.
    pub async fn open(&self, events: Arc<dyn TransportEvents>) -> Result<(), TransportError> {
        if self.state() != LinkState::Start {
            warn!(
                "not able to open, current link state {:?} is not valid",
                self.state()
            );
            return Err(TransportError::Internal);
        }

        {
            let mut worker = self.inner.worker.lock().await;
            if worker.is_some() {
                warn!("the state machine is already running");
                return Err(TransportError::Internal);
            }

            *self.inner.events.lock().await = Some(events);
            self.inner.reliable.lock().await.last_packet = None;

            let link_layer = LinkLayer::new(self.inner.clone());
            *worker = Some(tokio::spawn(link_layer.run()));
        }

        self.inner.wait_worker_ready().await;

        let handler: Arc<dyn UartHandler> = self.inner.clone();
        if let Err(e) = self.inner.uart.open(handler).await {
            warn!("opening the uart failed: {:#}", e);
            self.inner
                .with_criteria(|c| c.io_resource_error = true)
                .await;
            return Err(TransportError::Internal);
        }

        self.inner.with_criteria(|c| c.mark_opened()).await;

        let mut state_rx = self.inner.state_tx.subscribe();
        let reached_active = time::timeout(OPEN_WAIT_TIMEOUT, async move {
            loop {
                if *state_rx.borrow_and_update() == LinkState::Active {
                    return;
                }
                if state_rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
        .await;

        match reached_active {
            Ok(()) => Ok(()),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Asks the state machine to shut down, joins it, and closes the lower
    ///  transport. Closing is cooperative: the current state observes the
    ///  close flag on its next wakeup.
    pub async fn close(&self) -> Result<(), TransportError> {
        let handle = self.inner.worker.lock().await.take();
        let Some(handle) = handle else {
            warn!("close called on a transport that was never opened");
            return Err(TransportError::Internal);
        };

        self.inner.with_criteria(|c| c.close = true).await;

        if handle.await.is_err() {
            warn!("the state machine task panicked");
        }

        let closed = self.inner.uart.close().await;
        *self.inner.events.lock().await = None;
        self.inner.link.lock().await.worker_ready = false;

        closed.map_err(|e| {
            warn!("closing the uart failed: {:#}", e);
            TransportError::Internal
        })
    }

    /// Sends a vendor-specific payload reliably: the packet carries the
    ///  current sequence number and is retransmitted until the peer
    ///  acknowledges it or the retransmission budget is exhausted.
    ///
    /// At most one reliable packet is in flight; concurrent senders queue on
    ///  the send window. The payload must fit the 12 bit length field of the
    ///  packet header.
    pub async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        if self.state() != LinkState::Active {
            return Err(TransportError::InvalidState);
        }

        let _window = self.inner.send_window.lock().await;

        let header = {
            let mut reliable = self.inner.reliable.lock().await;
            let header = PacketHeader::for_payload(
                payload,
                reliable.seq_num,
                reliable.ack_num,
                true,
                true,
                PacketType::VendorSpecific,
            );
            let h5_packet = packet_header::encode_packet(&header, payload);
            let mut framed = BytesMut::new();
            slip::encode(&h5_packet, &mut framed);
            reliable.last_packet = Some(framed.to_vec());
            header
        };

        for _ in 0..PACKET_RETRANSMISSIONS {
            let (seq_num_before, frame) = {
                let reliable = self.inner.reliable.lock().await;
                let frame = reliable
                    .last_packet
                    .clone()
                    .expect("the last packet is only cleared when the send completes");
                (reliable.seq_num, frame)
            };

            self.inner.log_packet(true, &header, payload);
            if let Err(e) = self.inner.uart.send(&frame).await {
                warn!("error sending reliable packet: {:#}", e);
            }

            let deadline = Instant::now() + self.inner.config.retransmission_interval;
            loop {
                // register interest before checking the sequence number, so
                //  an acknowledgement arriving in between is not lost
                let mut acked = pin!(self.inner.ack_received.notified());
                acked.as_mut().enable();

                if self.inner.reliable.lock().await.seq_num != seq_num_before {
                    self.inner.reliable.lock().await.last_packet = None;
                    return Ok(());
                }

                if time::timeout_at(deadline, acked).await.is_err() {
                    break;
                }
            }
        }

        self.inner.reliable.lock().await.last_packet = None;
        Err(TransportError::Timeout)
    }

    pub fn state(&self) -> LinkState {
        *self.inner.state_tx.borrow()
    }

    pub fn stats(&self) -> PacketStats {
        PacketStats {
            incoming: self.inner.incoming_packets.load(Ordering::Relaxed),
            outgoing: self.inner.outgoing_packets.load(Ordering::Relaxed),
            errors: self.inner.error_packets.load(Ordering::Relaxed),
        }
    }
}

/// How a decoded packet leaves the dispatch table. Flag updates happen while
///  the link record is locked; sends and notifications afterwards.
enum Route {
    Discard,
    NotifyLink,
    Reply(ControlPacket),
    ReplyAndNotify(ControlPacket),
    ReliableData,
    Ack,
}

impl TransportInner {
    /// Dispatches one complete frame: escape decoding, header decoding, then
    ///  routing by the state the link record is in. Undecodable frames are
    ///  counted and dropped.
    async fn on_frame(&self, frame: &[u8]) {
        let h5_packet = match slip::decode(frame) {
            Ok(payload) => payload,
            Err(e) => {
                self.error_packets.fetch_add(1, Ordering::Relaxed);
                trace!("dropping frame with broken escape coding: {:#}", e);
                return;
            }
        };

        let DecodedPacket { header, payload } = match packet_header::decode_packet(&h5_packet) {
            Ok(packet) => packet,
            Err(e) => {
                self.error_packets.fetch_add(1, Ordering::Relaxed);
                trace!("dropping undecodable packet: {:#}", e);
                return;
            }
        };

        self.log_packet(false, &header, &payload);

        let route = {
            let mut link = self.link.lock().await;
            match (link.criteria.per_state, header.packet_type) {
                // while resetting, everything incoming is discarded
                (StateCriteria::Reset { .. }, _) => Route::NotifyLink,

                (StateCriteria::Uninitialized { .. }, PacketType::LinkControl) => {
                    if control_packets::is_sync_response(&payload) {
                        link.criteria.mark_sync_rsp_received();
                        Route::NotifyLink
                    } else if control_packets::is_sync(&payload) {
                        Route::Reply(ControlPacket::SyncResponse)
                    } else {
                        Route::Discard
                    }
                }

                (StateCriteria::Initialized { .. }, PacketType::LinkControl) => {
                    if control_packets::is_sync_config_response(&payload) {
                        link.criteria.mark_sync_config_rsp_received();
                        Route::NotifyLink
                    } else if control_packets::is_sync_config(&payload) {
                        Route::ReplyAndNotify(ControlPacket::SyncConfigResponse)
                    } else if control_packets::is_sync(&payload) {
                        Route::ReplyAndNotify(ControlPacket::SyncResponse)
                    } else {
                        Route::Discard
                    }
                }

                (StateCriteria::Active { .. }, PacketType::LinkControl) => {
                    if control_packets::is_sync(&payload) {
                        // the peer restarted its handshake - force a re-sync
                        link.criteria.mark_sync_received();
                        Route::NotifyLink
                    } else if control_packets::is_sync_config(&payload) {
                        Route::Reply(ControlPacket::SyncConfigResponse)
                    } else {
                        Route::Discard
                    }
                }

                (StateCriteria::Active { .. }, PacketType::VendorSpecific)
                    if header.reliable =>
                {
                    Route::ReliableData
                }

                (StateCriteria::Active { .. }, PacketType::Ack) => Route::Ack,

                _ => Route::Discard,
            }
        };

        match route {
            Route::Discard => {}
            Route::NotifyLink => self.link_changed.notify_waiters(),
            Route::Reply(reply) => self.send_control(reply).await,
            Route::ReplyAndNotify(reply) => {
                self.send_control(reply).await;
                self.link_changed.notify_waiters();
            }
            Route::ReliableData => self.on_reliable_data(&header, payload).await,
            Route::Ack => self.on_ack(header.ack_num).await,
        }
    }

    /// An incoming reliable packet is acknowledged unconditionally, but only
    ///  delivered upward when its sequence number is the expected one -
    ///  retransmitted duplicates are acked and dropped.
    async fn on_reliable_data(&self, header: &PacketHeader, payload: Vec<u8>) {
        let fresh = {
            let mut reliable = self.reliable.lock().await;
            if header.seq_num == reliable.ack_num {
                reliable.ack_num = (reliable.ack_num + 1) & 0x07;
                true
            } else {
                false
            }
        };

        self.send_control(ControlPacket::Ack).await;

        if fresh {
            let events = self.events.lock().await.clone();
            if let Some(events) = events {
                events.on_data(&payload).await;
            }
        }
    }

    async fn on_ack(&self, ack_num: u8) {
        enum AckOutcome {
            Advanced,
            Stale,
            OutOfSync,
        }

        let outcome = {
            let mut reliable = self.reliable.lock().await;
            let expected = (reliable.seq_num + 1) & 0x07;
            if ack_num == expected {
                reliable.seq_num = expected;
                AckOutcome::Advanced
            } else if ack_num == reliable.seq_num {
                AckOutcome::Stale
            } else {
                AckOutcome::OutOfSync
            }
        };

        match outcome {
            AckOutcome::Advanced => self.ack_received.notify_waiters(),
            // a reply to an earlier packet the peer saw twice - discard
            AckOutcome::Stale => {}
            AckOutcome::OutOfSync => {
                trace!("acknowledgement out of sequence - forcing a new handshake");
                self.with_criteria(|c| c.mark_irrecoverable_sync_error())
                    .await;
            }
        }
    }

    /// Encodes and transmits a control packet. ACK carries the current
    ///  acknowledgement number; everything else is sent with zeroed sequence
    ///  fields, unreliable and without data integrity.
    pub(crate) async fn send_control(&self, packet: ControlPacket) {
        let ack_num = match packet {
            ControlPacket::Ack => self.reliable.lock().await.ack_num,
            _ => 0,
        };

        let payload = packet.payload();
        let header =
            PacketHeader::for_payload(payload, 0, ack_num, false, false, packet.packet_type());

        self.log_packet(true, &header, payload);

        let h5_packet = packet_header::encode_packet(&header, payload);
        let mut framed = BytesMut::new();
        slip::encode(&h5_packet, &mut framed);

        if let Err(e) = self.uart.send(&framed).await {
            warn!("error sending {:?} control packet: {:#}", packet, e);
        }
    }

    pub(crate) async fn emit_status(&self, status: AppStatus, message: &str) {
        let events = self.events.lock().await.clone();
        if let Some(events) = events {
            events.on_status(status, message).await;
        }
    }

    /// Updates the exit-criteria record under the link lock and notifies
    ///  every waiter of the change.
    pub(crate) async fn with_criteria(&self, update: impl FnOnce(&mut ExitCriteria)) {
        {
            let mut link = self.link.lock().await;
            update(&mut link.criteria);
        }
        self.link_changed.notify_waiters();
    }

    pub(crate) async fn criteria_snapshot(&self) -> ExitCriteria {
        self.link.lock().await.criteria
    }

    pub(crate) async fn reset_criteria(&self, state: LinkState) {
        self.link.lock().await.criteria = ExitCriteria::for_state(state);
    }

    pub(crate) async fn reset_sequence_numbers(&self) {
        let mut reliable = self.reliable.lock().await;
        reliable.seq_num = 0;
        reliable.ack_num = 0;
    }

    pub(crate) fn publish_state(&self, state: LinkState) {
        self.state_tx.send_replace(state);
    }

    /// Waits until the exit-criteria record is fulfilled, or until the
    ///  deadline if one is given. Callers re-check the record afterwards, so
    ///  returning on timeout is fine.
    pub(crate) async fn wait_link_fulfilled(&self, deadline: Option<Instant>) {
        loop {
            let mut changed = pin!(self.link_changed.notified());
            changed.as_mut().enable();

            if self.link.lock().await.criteria.is_fulfilled() {
                return;
            }

            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, changed).await.is_err() {
                        return;
                    }
                }
                None => changed.await,
            }
        }
    }

    async fn wait_worker_ready(&self) {
        loop {
            let mut changed = pin!(self.link_changed.notified());
            changed.as_mut().enable();

            if self.link.lock().await.worker_ready {
                return;
            }

            changed.await;
        }
    }

    fn log_packet(&self, outgoing: bool, header: &PacketHeader, payload: &[u8]) {
        let (incoming_count, outgoing_count) = if outgoing {
            (
                self.incoming_packets.load(Ordering::Relaxed),
                self.outgoing_packets.fetch_add(1, Ordering::Relaxed) + 1,
            )
        } else {
            (
                self.incoming_packets.fetch_add(1, Ordering::Relaxed) + 1,
                self.outgoing_packets.load(Ordering::Relaxed),
            )
        };

        let direction = if outgoing { "->" } else { "<-" };
        if header.packet_type == PacketType::LinkControl {
            trace!(
                direction,
                incoming = incoming_count,
                outgoing = outgoing_count,
                errors = self.error_packets.load(Ordering::Relaxed),
                packet_type = ?header.packet_type,
                reliable = header.reliable,
                seq = header.seq_num,
                ack = header.ack_num,
                payload_len = header.payload_len,
                data_integrity = header.data_integrity,
                control = %control_packets::describe_link_control(payload),
                "h5 packet"
            );
        } else {
            trace!(
                direction,
                incoming = incoming_count,
                outgoing = outgoing_count,
                errors = self.error_packets.load(Ordering::Relaxed),
                packet_type = ?header.packet_type,
                reliable = header.reliable,
                seq = header.seq_num,
                ack = header.ack_num,
                payload_len = header.payload_len,
                data_integrity = header.data_integrity,
                "h5 packet"
            );
        }
    }
}

#[async_trait]
impl UartHandler for TransportInner {
    async fn on_bytes(&self, chunk: &[u8]) {
        let frames = self.assembler.lock().await.push(chunk);
        for frame in frames {
            self.on_frame(&frame).await;
        }
    }

    async fn on_status(&self, status: AppStatus, message: &str) {
        debug!(?status, message, "status from the uart layer");

        if status == AppStatus::IoResourcesUnavailable {
            self.with_criteria(|c| c.io_resource_error = true).await;
        }

        self.emit_status(status, message).await;
    }
}
