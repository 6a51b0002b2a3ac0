use std::time::Duration;

/// Why a message could not be handed to a connection's transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,

    #[error("send queue still full after {0:?}")]
    Timeout(Duration),
}

/// Why a request could not be submitted to the hub.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("hub is not running")]
    Closed,

    #[error("hub queue still full after {0:?}")]
    Busy(Duration),
}
