//! IPC server for build tooling

pub mod protocol;
pub mod server;

pub use server::IpcServer;
