//! Known physical devices and the transports they are reachable through.

use std::collections::HashMap;

use locsim_common::{
    config::Settings,
    device::{ConnectionTypes, Device, DeviceIdentifier, DiscoveryMode, Transport},
    events::{DeviceEvent, DeviceEventKind, DeviceNotification},
};
use parking_lot::Mutex;

pub struct DeviceRegistry {
    devices: Mutex<HashMap<DeviceIdentifier, Device>>,
    detect_network: bool,
    prefer_network: bool,
}

impl DeviceRegistry {
    pub fn new(detect_network: bool, prefer_network: bool) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            detect_network,
            prefer_network,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.detect_network_devices, settings.prefer_network_connection)
    }

    pub fn get(&self, udid: &DeviceIdentifier) -> Option<Device> {
        self.devices.lock().get(udid).cloned()
    }

    /// Snapshot sorted by identifier.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.devices.lock().values().cloned().collect();
        devices.sort_by(|a, b| a.udid.cmp(&b.udid));
        devices
    }

    pub fn clear(&self) {
        self.devices.lock().clear();
    }

    /// Applies a backend event. `name_for` is asked for the display name of a
    /// newly seen device and runs without the registry lock held; a device
    /// whose name cannot be read is not registered.
    pub fn apply(
        &self,
        event: &DeviceEvent,
        name_for: impl FnOnce(&DeviceIdentifier, DiscoveryMode) -> Option<String>,
    ) -> Option<DeviceNotification> {
        if event.transport == Transport::Network && !self.detect_network {
            tracing::debug!("Ignoring network event for {}", event.udid);
            return None;
        }

        match event.kind {
            DeviceEventKind::Added | DeviceEventKind::Paired => {
                {
                    let mut devices = self.devices.lock();
                    if let Some(device) = devices.get_mut(&event.udid) {
                        if !device.connection.insert(event.transport) {
                            return None;
                        }
                        tracing::info!("{} now reachable over {}", device.udid, device.connection);
                        return Some(DeviceNotification::Changed(device.clone()));
                    }
                }

                let connection = ConnectionTypes::only(event.transport);
                let mode = connection.discovery_mode(self.prefer_network);
                let Some(name) = name_for(&event.udid, mode) else {
                    tracing::warn!("Could not read the name of {}, ignoring it", event.udid);
                    return None;
                };

                let mut devices = self.devices.lock();
                // Another event may have registered the device while the name was read.
                if let Some(device) = devices.get_mut(&event.udid) {
                    return device
                        .connection
                        .insert(event.transport)
                        .then(|| DeviceNotification::Changed(device.clone()));
                }
                let device = Device {
                    udid: event.udid.clone(),
                    name,
                    connection,
                    prefer_network: self.prefer_network,
                };
                devices.insert(device.udid.clone(), device.clone());
                tracing::info!("{} ({}) connected over {}", device.name, device.udid, event.transport);
                Some(match event.kind {
                    DeviceEventKind::Paired => DeviceNotification::Paired(device),
                    _ => DeviceNotification::Connected(device),
                })
            }
            DeviceEventKind::Removed => {
                let mut devices = self.devices.lock();
                let device = devices.get_mut(&event.udid)?;
                if !device.connection.remove(event.transport) {
                    return None;
                }
                if device.connection.is_empty() {
                    let device = devices.remove(&event.udid)?;
                    tracing::info!("{} ({}) disconnected", device.name, device.udid);
                    Some(DeviceNotification::Disconnected(device))
                } else {
                    tracing::info!("{} now reachable over {}", device.udid, device.connection);
                    Some(DeviceNotification::Changed(device.clone()))
                }
            }
        }
    }
}
