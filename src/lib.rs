pub mod client;
pub mod clock;
pub mod error;
pub mod interceptor;
pub mod protocol;
pub mod scenario;
pub mod server;
pub mod types;
pub mod wire;

pub use crate::error::{Error, Result};
pub use crate::types::ProcessId;
