//! The shared interface both upstream client implementations present to the
//! pipeline.

use async_trait::async_trait;
use conduit_core::error::GatewayError;
use conduit_core::event::NormalizedEvent;
use conduit_core::request::CanonicalRequest;

/// Callback invoked once per normalized event as it is produced. Both client
/// implementations must guarantee that after `send_request_with_payload`
/// returns, no further calls to this callback occur.
pub type OnEvent<'a> = dyn Fn(NormalizedEvent) + Send + Sync + 'a;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send_request_with_payload(
        &self,
        request: &CanonicalRequest,
        on_event: &OnEvent<'_>,
    ) -> Result<(), GatewayError>;
}
