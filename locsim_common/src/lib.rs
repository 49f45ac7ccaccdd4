pub mod config;
pub mod device;
pub mod disk_image;
pub mod events;
pub mod value;

pub use device::{ConnectionTypes, Device, DeviceIdentifier, DiscoveryMode, ProductVersion, Transport};
pub use value::PropertyValue;
