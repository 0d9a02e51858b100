pub mod bridge;
pub mod chat;
pub mod config_cmd;
mod session;
