//! Trusted control sessions with a physical device.

use locsim_common::{device::DeviceIdentifier, value::PropertyValue, DiscoveryMode};

use crate::{
    backend::{DeviceBackend, LockdownSession, ServiceDescriptor, TransportHandle},
    error::{ConnectError, RemoteError},
};

/// Authenticated session over a transport. Owns the transport; service channels
/// borrow the client and therefore cannot outlive it.
pub struct ControlClient {
    udid: DeviceIdentifier,
    // Field order matters: the session is dropped before the transport it runs on.
    session: Box<dyn LockdownSession>,
    transport: Box<dyn TransportHandle>,
}

impl ControlClient {
    pub fn udid(&self) -> &DeviceIdentifier {
        &self.udid
    }

    pub fn get_value(
        &self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<Option<PropertyValue>, RemoteError> {
        self.session.get_value(domain, key)
    }

    pub(crate) fn start_service(&self, name: &str) -> Result<ServiceDescriptor, RemoteError> {
        self.session.start_service(name)
    }

    pub(crate) fn transport(&self) -> &dyn TransportHandle {
        self.transport.as_ref()
    }
}

impl Drop for ControlClient {
    fn drop(&mut self) {
        tracing::debug!("Releasing control session with {}", self.udid);
    }
}

/// Opens a transport to `udid` and performs the handshake under `label`.
/// On handshake failure the transport is released before returning.
pub fn establish(
    backend: &dyn DeviceBackend,
    udid: &DeviceIdentifier,
    mode: DiscoveryMode,
    label: &str,
) -> Result<ControlClient, ConnectError> {
    tracing::debug!("Connecting to {} ({:?})", udid, mode);
    let transport = backend.connect(udid, mode)?;
    let session = match transport.handshake(label) {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!("Handshake with {} failed: {}", udid, e);
            return Err(e);
        }
    };
    tracing::debug!("Control session with {} established as {}", udid, label);
    Ok(ControlClient {
        udid: udid.clone(),
        session,
        transport,
    })
}

/// Validates pairing by establishing a session and releasing it right away.
pub fn pair(
    backend: &dyn DeviceBackend,
    udid: &DeviceIdentifier,
    mode: DiscoveryMode,
) -> Result<(), ConnectError> {
    let client = establish(backend, udid, mode, "devicepair")?;
    tracing::info!("Paired with {}", client.udid());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBackend;

    #[test]
    fn unknown_device_is_not_found() {
        let backend = FakeBackend::new("known");
        let err = establish(&backend, &"other".into(), DiscoveryMode::LocalOnly, "test")
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::DeviceNotFound(udid) if udid.as_str() == "other"));
    }

    #[test]
    fn handshake_failure_releases_transport() {
        let backend = FakeBackend::new("dev");
        backend.state().handshake_fails = true;
        let err = pair(&backend, &"dev".into(), DiscoveryMode::LocalOnly).unwrap_err();
        assert!(matches!(err, ConnectError::HandshakeFailed { .. }));
        assert_eq!(backend.state().open_transports, 0);
    }

    #[test]
    fn pair_releases_everything() {
        let backend = FakeBackend::new("dev");
        pair(&backend, &"dev".into(), DiscoveryMode::PreferNetwork).unwrap();
        let state = backend.state();
        assert_eq!(state.open_transports, 0);
        assert_eq!(state.labels, ["devicepair"]);
        assert_eq!(state.last_mode, Some(DiscoveryMode::PreferNetwork));
    }
}
