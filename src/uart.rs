use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::error::AppStatus;

/// Abstraction of the byte-oriented serial channel underneath the transport,
///  introduced to decouple the link layer from the actual uart driver and to
///  facilitate mocking the I/O part away for testing.
///
/// Implementations deliver received bytes and status transitions through the
///  [`UartHandler`] passed to `open`, possibly from any task.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UartTransport: Send + Sync + 'static {
    async fn open(&self, handler: Arc<dyn UartHandler>) -> anyhow::Result<()>;

    async fn close(&self) -> anyhow::Result<()>;

    async fn send(&self, buf: &[u8]) -> anyhow::Result<()>;
}

/// Receiving side of the lower transport contract: byte chunks of arbitrary
///  size and framing, plus status transitions such as
///  [`AppStatus::IoResourcesUnavailable`].
#[async_trait]
pub trait UartHandler: Send + Sync + 'static {
    async fn on_bytes(&self, chunk: &[u8]);

    async fn on_status(&self, status: AppStatus, message: &str);
}
