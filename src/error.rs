//! Error kinds shared by the notification and dispatch layers.

use thiserror::Error;

/// Boxed error raised by a subscriber that is not one of the crate's own
/// conditions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error
{
    /// The target object of a weak method has been destroyed.
    ///
    /// Notifiers and the main dispatcher treat this as an expected outcome
    /// and never hand it back to their callers.
    #[error("the target object of a weak method no longer exists")]
    DanglingFunction,

    /// No dispatcher was bound to the notifier and none is installed for the
    /// process.
    #[error("no main dispatcher is available")]
    NoDispatcher,

    /// The main context that owned the dispatcher queue is gone.
    #[error("the main dispatcher has shut down")]
    DispatcherClosed,

    /// Any other failure reported by a subscriber or a dispatched call.
    #[error(transparent)]
    Subscriber(BoxError),
}

impl Error
{
    /// Wraps an arbitrary error raised by user code.
    pub fn subscriber<E>(err: E) -> Self
    where
        E: Into<BoxError>,
    {
        Error::Subscriber(err.into())
    }

    pub fn is_dangling(&self) -> bool { matches!(self, Error::DanglingFunction) }
}

/// Reports a violated usage contract.
///
/// These are bugs in the calling code, so they are fatal rather than
/// recoverable: the message is logged and the thread panics.
#[cold]
#[track_caller]
pub fn programming_error(message: &str) -> !
{
    tracing::error!(target: "objcore", "programming error: {}", message);
    panic!("programming error: {message}")
}
