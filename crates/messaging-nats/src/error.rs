use thiserror::Error;

/// Errors raised while connecting to NATS.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to the cluster failed.
    #[error("failed to connect to nats: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// A node does not form a valid URL.
    #[error("invalid nats address {address}: {source}")]
    InvalidAddress {
        /// `host:port` of the node.
        address: String,
        /// Parse error.
        source: std::io::Error,
    },

    /// Wrapping the connection in a messaging client failed.
    #[error(transparent)]
    Messaging(#[from] relay_messaging::Error),

    /// The configuration lists no nodes.
    #[error("no nats broker specified")]
    NoNodes,
}
