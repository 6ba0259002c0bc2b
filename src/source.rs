use crate::delivery::DeliveryHandler;
use crate::error::error_chain_fmt;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Trait which defines a push based message source, i.e. a source which calls back into
/// the pipeline for every delivered record instead of being polled
pub trait PushSource: Send + Sync + 'static {
    type Subscription: Subscription;

    /// opens the subscription, errors here are fatal for the delivery adapter
    fn subscribe(&self) -> impl Future<Output = Result<Self::Subscription, SourceError>> + Send;
}

/// An opened subscription of a [`PushSource`]
pub trait Subscription: Send + 'static {
    /// Receives records until the source closes or `shutdown` fires.
    ///
    /// The handler may be cloned and invoked concurrently from as many tasks or threads as the
    /// source likes. Redelivery of nacked or never acknowledged records is up to the source.
    fn receive(
        self,
        handler: DeliveryHandler,
        shutdown: CancellationToken,
    ) -> impl Future<Output = Result<(), SourceError>> + Send;
}

#[derive(thiserror::Error)]
pub enum SourceError {
    #[error("Failed to open subscription")]
    Subscription(#[source] anyhow::Error),
    #[error("Subscription failed while receiving")]
    Runtime(#[source] anyhow::Error),
}

impl std::fmt::Debug for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        error_chain_fmt(self, f)
    }
}
