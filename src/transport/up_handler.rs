use async_trait::async_trait;
#[cfg(test)] use mockall::automock;

use crate::transport::transport_events::UpEvent;


/// The seam between the transport and the protocol layer above it: everything the transport
///  wants to tell the rest of the stack goes through this trait.
///
/// Implementations are called from the dispatch pools (or directly from the receive path if
///  a pool is disabled), so they should hand longer-running work off rather than block a
///  worker for long.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UpHandler: Send + Sync + 'static {
    async fn up(&self, event: UpEvent);
}
