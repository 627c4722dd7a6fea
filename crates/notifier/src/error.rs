use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("nats connect failed: {0}")]
    Connect(#[from] async_nats::ConnectError),
    #[error("nats publish failed: {0}")]
    Publish(#[from] async_nats::PublishError),
    #[error("nats subscribe failed: {0}")]
    Subscribe(#[from] async_nats::SubscribeError),
    #[error("not yet connected to nats")]
    NotConnected,
}
