pub mod error;
pub mod retry;

pub use error::{Error, Result};
pub use retry::{RetryPolicy, RetryState};
