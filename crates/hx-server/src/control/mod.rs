//! Control sessions and their registry

mod manager;
mod session;

pub use manager::ControlManager;
pub use session::{ControlSession, SessionContext, SessionState};
