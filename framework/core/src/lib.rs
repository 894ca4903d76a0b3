mod cancel;
mod error;
mod retry;

pub mod prelude {
    pub use crate::cancel::{CancelHandle, CancelListener};
    pub use crate::error::{CancelledError, StageError};
    pub use crate::retry::{RetryExhausted, RetryPolicy};
}
