pub mod api;
pub mod config;
pub mod mux;
pub mod protocol;
pub mod pty;
pub mod session;
