pub mod backend;
pub mod emulator;
pub mod error;
pub mod hub;
pub mod info;
pub mod location;
pub mod provision;
pub mod registry;
pub mod service;
pub mod trust;

#[cfg(test)]
mod testing;

pub use hub::{DeviceIdentity, Hub, ProvisionOutcome, SpoofTarget};
