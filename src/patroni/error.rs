//! Error types for the Patroni REST client

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatroniError {
    /// HTTP request to the Patroni API failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Patroni answered with a non-success status
    #[error("{url} returned HTTP {status}: {body}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },

    /// The pod has no IP yet, so its API cannot be reached
    #[error("pod {0} has no IP address")]
    MissingPodIp(String),

    /// Failed to decode a Patroni response
    #[error("Failed to decode Patroni response: {0}")]
    DecodeError(String),
}
