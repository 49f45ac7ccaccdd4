use std::{fmt, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BridgeCapabilities {
    pub set_location: bool,
    pub reset_location: bool,
}

/// What the emulator reports about the device it emulates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmulatorIdentity {
    pub udid: Option<String>,
    pub name: Option<String>,
}

/// Location override surface exposed by an emulator host process.
pub trait LocationBridge: Send + Sync {
    fn capabilities(&self) -> BridgeCapabilities;

    fn identity(&self) -> EmulatorIdentity {
        EmulatorIdentity::default()
    }

    fn set_location(&self, latitude: f64, longitude: f64) -> bool;

    fn reset_location(&self) -> bool;

    fn supports_reset(&self) -> bool {
        self.capabilities().reset_location
    }
}

/// `<bundle-id>.bridge.<pid>`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EndpointName(String);

impl EndpointName {
    pub fn for_process(bundle_id: &str, pid: u32) -> Self {
        Self(format!("{bundle_id}.bridge.{pid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SocketName {
    Namespaced(String),
    Path(PathBuf),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BridgeEndpoint {
    pub name: EndpointName,
    pub socket: SocketName,
}

pub trait EndpointLookup: Send + Sync {
    /// Must return promptly; `None` when nothing is registered under `name`.
    fn lookup(&self, name: &EndpointName) -> Option<BridgeEndpoint>;
}

pub trait BridgeConnector: Send + Sync {
    fn root_proxy(&self, endpoint: &BridgeEndpoint) -> Result<Arc<dyn LocationBridge>, BridgeError>;
}

/// A discovered emulator with a verified location bridge.
#[derive(Clone)]
pub struct EmulatorHandle {
    pid: u32,
    endpoint: EndpointName,
    identity: EmulatorIdentity,
    supports_reset: bool,
    bridge: Arc<dyn LocationBridge>,
}

impl EmulatorHandle {
    pub fn new(pid: u32, endpoint: EndpointName, bridge: Arc<dyn LocationBridge>) -> Self {
        Self {
            pid,
            endpoint,
            identity: bridge.identity(),
            supports_reset: bridge.supports_reset(),
            bridge,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn endpoint(&self) -> &EndpointName {
        &self.endpoint
    }

    pub fn identity(&self) -> &EmulatorIdentity {
        &self.identity
    }

    pub fn supports_reset(&self) -> bool {
        self.supports_reset
    }

    pub fn set_location(&self, latitude: f64, longitude: f64) -> bool {
        self.bridge.set_location(latitude, longitude)
    }

    /// Succeeds without doing anything when the emulator cannot reset.
    pub fn reset_location(&self) -> bool {
        if !self.supports_reset {
            return true;
        }
        self.bridge.reset_location()
    }
}

impl fmt::Debug for EmulatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmulatorHandle")
            .field("pid", &self.pid)
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("supports_reset", &self.supports_reset)
            .finish()
    }
}

impl fmt::Display for EmulatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.identity.name {
            Some(name) => write!(f, "{} (pid {})", name, self.pid),
            None => write!(f, "emulator (pid {})", self.pid),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        reset: bool,
        resets: AtomicUsize,
    }

    impl LocationBridge for Recorder {
        fn capabilities(&self) -> BridgeCapabilities {
            BridgeCapabilities {
                set_location: true,
                reset_location: self.reset,
            }
        }

        fn set_location(&self, _latitude: f64, _longitude: f64) -> bool {
            true
        }

        fn reset_location(&self) -> bool {
            self.resets.fetch_add(1, Ordering::SeqCst);
            false
        }
    }

    #[test]
    fn endpoint_name_format() {
        assert_eq!(
            EndpointName::for_process("com.apple.iphonesimulator", 4242).as_str(),
            "com.apple.iphonesimulator.bridge.4242"
        );
    }

    #[test]
    fn reset_without_capability_is_noop() {
        let bridge = Arc::new(Recorder::default());
        let handle = EmulatorHandle::new(1, EndpointName::for_process("b", 1), bridge.clone());
        assert!(!handle.supports_reset());
        assert!(handle.reset_location());
        assert_eq!(bridge.resets.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reset_with_capability_forwards() {
        let bridge = Arc::new(Recorder {
            reset: true,
            ..Default::default()
        });
        let handle = EmulatorHandle::new(1, EndpointName::for_process("b", 1), bridge.clone());
        assert!(!handle.reset_location());
        assert_eq!(bridge.resets.load(Ordering::SeqCst), 1);
    }
}
