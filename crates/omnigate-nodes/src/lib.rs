pub mod registry;
pub mod sweeper;
pub mod tunnel;

pub use registry::{HeartbeatInput, NodeRegistry, RegisterInput};
pub use sweeper::sweep_once;
pub use tunnel::TunnelManager;
