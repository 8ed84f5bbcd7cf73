pub mod applications;
pub mod broker;
pub mod client;
pub mod config;
pub mod device_tunnel;
pub mod router;
pub mod security;
pub mod ssh_sessions;
pub mod state;
