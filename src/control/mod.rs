//! HTTP control surface for the host application

pub mod handlers;
pub mod server;

pub use server::{router, ControlServer, ControlState};
