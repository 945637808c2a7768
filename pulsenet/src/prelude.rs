pub use crate::config::{AuthPolicy, ContextConfig, Role};
pub use crate::context::Context;
pub use crate::error::{ErrorKind, NetworkError, NetworkResult};
pub use crate::event::Event;
pub use crate::identity::ConnectionId;
pub use crate::log::LogLevel;
