pub mod manager;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use manager::{ConnectionManager, ManagerError, ManagerOptions};
pub use session::{McpSession, SessionError, SessionOptions};
pub use types::ConnectionStatus;
