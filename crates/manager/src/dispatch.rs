//! Delivery strategies selected by [`DispatchPolicy`].

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::DispatchPolicy;

/// A message that could not be handed over, given back to the caller.
#[derive(Debug, PartialEq, Eq)]
pub enum Undelivered<T> {
    /// The queue had no room. Worth retrying later.
    Full(T),
    /// The receiver is gone.
    Closed(T),
}

impl<T> Undelivered<T> {
    pub fn into_inner(self) -> T {
        match self {
            Undelivered::Full(message) | Undelivered::Closed(message) => message,
        }
    }
}

impl<T> From<TrySendError<T>> for Undelivered<T> {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(message) => Undelivered::Full(message),
            TrySendError::Closed(message) => Undelivered::Closed(message),
        }
    }
}

impl DispatchPolicy {
    /// Hands `message` to `sender`. On failure the message is given back so
    /// the caller can queue or drop it.
    pub async fn deliver<T>(
        self,
        sender: &mpsc::Sender<T>,
        message: T,
    ) -> Result<(), Undelivered<T>> {
        match self {
            DispatchPolicy::Blocking => sender
                .send(message)
                .await
                .map_err(|e| Undelivered::Closed(e.0)),
            DispatchPolicy::NonBlocking => sender.try_send(message).map_err(Undelivered::from),
        }
    }
}
