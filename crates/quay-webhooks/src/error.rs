use thiserror::Error;

use quay_db::DbError;

/// Webhook staging and delivery errors.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// The token that created the subscription has expired; the delivery is
    /// abandoned without retry.
    #[error("The authentication token used to create this webhook has expired")]
    SubscriptionExpired,

    /// The stored query exceeds the server's complexity limit. Recorded in
    /// the delivery row's response body; nothing is POSTed.
    #[error("operation has complexity {complexity}, which exceeds the maximum of {max}")]
    TooComplex { complexity: usize, max: usize },

    /// The current authentication method cannot configure native webhooks.
    #[error("{0}")]
    UnsupportedAuth(&'static str),

    #[error(transparent)]
    Database(#[from] DbError),
}
