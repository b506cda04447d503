//! Control socket for front ends

pub mod protocol;
mod server;

pub use server::ControlModule;
