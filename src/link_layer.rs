//! The link establishment state machine.
//!
//! One dedicated task drives the handshake:
//!
//! ```ascii
//! START --open--> RESET --wait--> UNINITIALIZED --SYNC/SYNC_RESP-->
//!     INITIALIZED --CONFIG/CONFIG_RESP--> ACTIVE
//! ```
//!
//! ACTIVE falls back to RESET when the peer re-syncs or acknowledges out of
//!  sequence; `close` and I/O errors lead to the terminal CLOSED and FAILED
//!  states from everywhere. Each state action resets its exit-criteria
//!  record on entry, performs its sends, and then waits for the record to be
//!  fulfilled by the packet dispatcher, the status handler or the public API.

use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{NON_ACTIVE_STATE_TIMEOUT, PACKET_RETRANSMISSIONS, RESET_WAIT_DURATION};
use crate::control_packets::ControlPacket;
use crate::error::AppStatus;
use crate::exit_criteria::{ExitCriteria, StateCriteria};
use crate::transport::TransportInner;

/// The states of the link establishment handshake. FAILED and CLOSED are
///  terminal; recovering from FAILED requires a new transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Start,
    Reset,
    Uninitialized,
    Initialized,
    Active,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }
}

/// The state machine worker. The task running it is the sole writer of the
///  published link state.
pub(crate) struct LinkLayer {
    inner: Arc<TransportInner>,
}

impl LinkLayer {
    pub(crate) fn new(inner: Arc<TransportInner>) -> LinkLayer {
        LinkLayer { inner }
    }

    pub(crate) async fn run(self) {
        let mut current = LinkState::Start;

        loop {
            let next = match current {
                LinkState::Start => self.on_start().await,
                LinkState::Reset => self.on_reset().await,
                LinkState::Uninitialized => self.on_uninitialized().await,
                LinkState::Initialized => self.on_initialized().await,
                LinkState::Active => self.on_active().await,
                LinkState::Failed | LinkState::Closed => return,
            };

            debug!("link state change: {:?} -> {:?}", current, next);
            current = next;

            if current.is_terminal() {
                self.inner.reset_criteria(current).await;
            }
            self.inner.publish_state(current);

            if current.is_terminal() {
                debug!("entered terminal state {:?}, the state machine stops", current);
                return;
            }
        }
    }

    /// Waits until the transport is opened. This is also where the worker
    ///  reports itself ready, unblocking `open`.
    async fn on_start(&self) -> LinkState {
        {
            let mut link = self.inner.link.lock().await;
            link.criteria = ExitCriteria::for_state(LinkState::Start);
            link.worker_ready = true;
        }
        self.inner.link_changed.notify_waiters();

        self.inner.wait_link_fulfilled(None).await;

        let criteria = self.inner.criteria_snapshot().await;
        if criteria.io_resource_error {
            return LinkState::Failed;
        }
        if criteria.close {
            return LinkState::Closed;
        }
        if matches!(criteria.per_state, StateCriteria::Start { is_opened: true }) {
            return LinkState::Reset;
        }
        LinkState::Failed
    }

    /// Sends RESET and gives the peer time to come back up before the
    ///  handshake proper starts.
    async fn on_reset(&self) -> LinkState {
        self.inner.reset_criteria(LinkState::Reset).await;

        self.inner.send_control(ControlPacket::Reset).await;
        self.inner
            .emit_status(AppStatus::ResetPerformed, "target reset performed")
            .await;
        self.inner.with_criteria(|c| c.mark_reset_sent()).await;

        self.inner
            .wait_link_fulfilled(Some(Instant::now() + RESET_WAIT_DURATION))
            .await;
        self.inner.with_criteria(|c| c.mark_reset_wait()).await;

        let criteria = self.inner.criteria_snapshot().await;
        if criteria.io_resource_error {
            return LinkState::Failed;
        }
        if criteria.close {
            return LinkState::Closed;
        }
        if matches!(
            criteria.per_state,
            StateCriteria::Reset {
                reset_sent: true,
                reset_wait: true,
            }
        ) {
            return LinkState::Uninitialized;
        }
        LinkState::Failed
    }

    async fn on_uninitialized(&self) -> LinkState {
        self.inner.reset_criteria(LinkState::Uninitialized).await;

        let mut retransmissions_left = PACKET_RETRANSMISSIONS;
        while !self.inner.criteria_snapshot().await.is_fulfilled() && retransmissions_left > 0 {
            self.inner.send_control(ControlPacket::Sync).await;
            self.inner.with_criteria(|c| c.mark_sync_sent()).await;
            self.inner
                .wait_link_fulfilled(Some(Instant::now() + NON_ACTIVE_STATE_TIMEOUT))
                .await;
            retransmissions_left -= 1;
        }

        let criteria = self.inner.criteria_snapshot().await;
        if criteria.io_resource_error {
            return LinkState::Failed;
        }
        if criteria.close {
            return LinkState::Closed;
        }
        if matches!(
            criteria.per_state,
            StateCriteria::Uninitialized {
                sync_sent: true,
                sync_rsp_received: true,
            }
        ) {
            return LinkState::Initialized;
        }
        if retransmissions_left == 0 {
            self.inner
                .emit_status(AppStatus::PktSendMaxRetriesReached, "max retries reached")
                .await;
        }
        LinkState::Failed
    }

    async fn on_initialized(&self) -> LinkState {
        self.inner.reset_criteria(LinkState::Initialized).await;

        let mut retransmissions_left = PACKET_RETRANSMISSIONS;
        while !self.inner.criteria_snapshot().await.is_fulfilled() && retransmissions_left > 0 {
            self.inner.send_control(ControlPacket::SyncConfig).await;
            self.inner.with_criteria(|c| c.mark_sync_config_sent()).await;
            self.inner
                .wait_link_fulfilled(Some(Instant::now() + NON_ACTIVE_STATE_TIMEOUT))
                .await;
            retransmissions_left -= 1;
        }

        let criteria = self.inner.criteria_snapshot().await;
        if criteria.io_resource_error {
            return LinkState::Failed;
        }
        if criteria.close {
            return LinkState::Closed;
        }
        if matches!(
            criteria.per_state,
            StateCriteria::Initialized {
                sync_config_sent: true,
                sync_config_rsp_received: true,
            }
        ) {
            return LinkState::Active;
        }
        if retransmissions_left == 0 {
            self.inner
                .emit_status(AppStatus::PktSendMaxRetriesReached, "max retries reached")
                .await;
        }
        LinkState::Failed
    }

    /// The link is up: sequence numbers start over, reliable traffic flows.
    ///  The state is left when the peer re-syncs, on an unrecoverable
    ///  acknowledgement error, on close, or on an I/O error.
    async fn on_active(&self) -> LinkState {
        self.inner.reset_criteria(LinkState::Active).await;
        self.inner.reset_sequence_numbers().await;

        self.inner
            .emit_status(AppStatus::ConnectionActive, "connection active")
            .await;

        self.inner.wait_link_fulfilled(None).await;

        let criteria = self.inner.criteria_snapshot().await;
        if criteria.io_resource_error {
            return LinkState::Failed;
        }
        if criteria.close {
            return LinkState::Closed;
        }
        if matches!(
            criteria.per_state,
            StateCriteria::Active {
                sync_received: true,
                ..
            } | StateCriteria::Active {
                irrecoverable_sync_error: true,
                ..
            }
        ) {
            return LinkState::Reset;
        }
        LinkState::Failed
    }
}
