use crate::device::{Device, DeviceIdentifier, Transport};

/// Raw connection event reported by the device backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceEvent {
    pub udid: DeviceIdentifier,
    pub kind: DeviceEventKind,
    pub transport: Transport,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceEventKind {
    Added,
    Paired,
    Removed,
}

/// What the rest of the application is told after a [`DeviceEvent`] was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceNotification {
    Connected(Device),
    Paired(Device),
    /// A connection type was added to or removed from a known device.
    Changed(Device),
    Disconnected(Device),
}

impl DeviceNotification {
    pub fn device(&self) -> &Device {
        match self {
            DeviceNotification::Connected(d)
            | DeviceNotification::Paired(d)
            | DeviceNotification::Changed(d)
            | DeviceNotification::Disconnected(d) => d,
        }
    }
}
