pub mod bridge;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod listener;
pub mod registry;
pub mod session;

#[cfg(test)]
mod test;

pub use bridge::{Bridge, BridgeState, BridgeStats};
pub use config::{BridgeConfig, ReadMode};
pub use device::{Device, Tun};
pub use error::{BridgeError, CloseReason, FrameError, Result};
pub use listener::Listener;
