//! Discovery of running emulators that expose a location override bridge.

pub mod bridge;
pub mod local_socket;
pub mod process;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use locsim_common::config::EmulatorSettings;
use parking_lot::Mutex;
use slab::Slab;
use tokio::{runtime::Handle, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;

pub use bridge::{
    BridgeCapabilities, BridgeConnector, BridgeEndpoint, EmulatorHandle, EmulatorIdentity,
    EndpointLookup, EndpointName, LocationBridge, SocketName,
};
pub use local_socket::{LocalSocketConnector, LocalSocketLookup};
pub use process::{ProcessInfo, ProcessSource, SysinfoProcesses};

pub type SubscriptionId = usize;

type EmulatorCallback = Arc<dyn Fn(&[EmulatorHandle]) + Send + Sync>;

pub struct EmulatorLocator {
    bundle_id: String,
    processes: Box<dyn ProcessSource>,
    lookup: Box<dyn EndpointLookup>,
    connector: Box<dyn BridgeConnector>,
    subscribers: Mutex<Slab<EmulatorCallback>>,
}

impl EmulatorLocator {
    pub fn new(
        bundle_id: impl Into<String>,
        processes: Box<dyn ProcessSource>,
        lookup: Box<dyn EndpointLookup>,
        connector: Box<dyn BridgeConnector>,
    ) -> Self {
        Self {
            bundle_id: bundle_id.into(),
            processes,
            lookup,
            connector,
            subscribers: Mutex::new(Slab::new()),
        }
    }

    /// Process enumeration through `sysinfo` and bridges over local sockets.
    pub fn from_settings(settings: &EmulatorSettings, runtime: Handle) -> Self {
        Self::new(
            settings.bundle_id.clone(),
            Box::new(SysinfoProcesses::from_settings(settings)),
            Box::new(LocalSocketLookup::new()),
            Box::new(LocalSocketConnector::new(runtime, settings.request_timeout())),
        )
    }

    pub fn bundle_id(&self) -> &str {
        &self.bundle_id
    }

    /// Pids of running emulator host processes, sorted.
    pub fn emulator_pids(&self) -> BTreeSet<u32> {
        self.processes
            .running()
            .into_iter()
            .filter(|p| p.bundle_id.as_deref() == Some(self.bundle_id.as_str()))
            .map(|p| p.pid)
            .collect()
    }

    /// Re-scans running processes. Blocking.
    pub fn discover(&self) -> Vec<EmulatorHandle> {
        self.emulator_pids()
            .into_iter()
            .filter_map(|pid| self.resolve(pid))
            .collect()
    }

    fn resolve(&self, pid: u32) -> Option<EmulatorHandle> {
        let name = EndpointName::for_process(&self.bundle_id, pid);
        let Some(endpoint) = self.lookup.lookup(&name) else {
            tracing::debug!("No bridge endpoint {} for pid {}", name, pid);
            return None;
        };
        let bridge = match self.connector.root_proxy(&endpoint) {
            Ok(bridge) => bridge,
            Err(e) => {
                tracing::debug!("Bridge {} unusable: {}", name, e);
                return None;
            }
        };
        if !bridge.capabilities().set_location {
            tracing::debug!("Bridge {} cannot set the location", name);
            return None;
        }
        let handle = EmulatorHandle::new(pid, name, bridge);
        tracing::debug!("Found {:?}", handle);
        Some(handle)
    }

    pub fn subscribe(&self, callback: impl Fn(&[EmulatorHandle]) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribers.lock().insert(Arc::new(callback))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.lock().try_remove(id).is_some()
    }

    /// Calls every subscriber outside the registry lock, so callbacks may
    /// subscribe or unsubscribe.
    pub fn notify(&self, emulators: &[EmulatorHandle]) {
        let callbacks: Vec<EmulatorCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(emulators);
        }
    }
}

/// What a watcher tick last reported: emulator pids and the endpoints that
/// resolved to usable bridges.
#[derive(Debug, Default, PartialEq, Eq)]
struct WatchState {
    pids: BTreeSet<u32>,
    endpoints: BTreeSet<EndpointName>,
}

impl WatchState {
    /// Some emulator host is running without a usable bridge yet.
    fn incomplete(&self) -> bool {
        self.endpoints.len() < self.pids.len()
    }
}

/// Polls the running process set every `interval`. Discovery runs again when
/// the emulator pids change or while an emulator has no usable bridge, and
/// subscribers are notified whenever the discovered endpoints differ from the
/// last notification. Runs until `cancel` fires.
pub fn spawn_watcher(
    locator: Arc<EmulatorLocator>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut known: Option<WatchState> = None;
        loop {
            let scan = {
                let locator = locator.clone();
                tokio::task::spawn_blocking(move || locator.emulator_pids())
            };
            match scan.await {
                Ok(pids)
                    if known
                        .as_ref()
                        .map_or(true, |k| k.pids != pids || k.incomplete()) =>
                {
                    let scanner = locator.clone();
                    match tokio::task::spawn_blocking(move || (pids, scanner.discover())).await {
                        Ok((pids, emulators)) => {
                            let state = WatchState {
                                pids,
                                endpoints: emulators.iter().map(|e| e.endpoint().clone()).collect(),
                            };
                            if known.as_ref() != Some(&state) {
                                tracing::info!(
                                    "Emulators changed: {} running, {} usable",
                                    state.pids.len(),
                                    state.endpoints.len()
                                );
                                known = Some(state);
                                let notifier = locator.clone();
                                if let Err(e) =
                                    tokio::task::spawn_blocking(move || notifier.notify(&emulators)).await
                                {
                                    tracing::error!("Emulator notification task failed: {}", e);
                                }
                            }
                        }
                        Err(e) => tracing::error!("Emulator discovery task failed: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!("Process scan task failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        tracing::info!("Emulator watcher stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::error::BridgeError;

    struct Processes(Arc<Mutex<Vec<ProcessInfo>>>);

    impl ProcessSource for Processes {
        fn running(&self) -> Vec<ProcessInfo> {
            self.0.lock().clone()
        }
    }

    struct Lookup;

    impl EndpointLookup for Lookup {
        fn lookup(&self, name: &EndpointName) -> Option<BridgeEndpoint> {
            // pid 3 has no endpoint
            (!name.as_str().ends_with(".3")).then(|| BridgeEndpoint {
                name: name.clone(),
                socket: SocketName::Namespaced(format!("{name}.sock")),
            })
        }
    }

    /// Endpoints exist only once `registered` is set.
    struct LateLookup(Arc<AtomicBool>);

    impl EndpointLookup for LateLookup {
        fn lookup(&self, name: &EndpointName) -> Option<BridgeEndpoint> {
            self.0.load(Ordering::SeqCst).then(|| BridgeEndpoint {
                name: name.clone(),
                socket: SocketName::Namespaced(format!("{name}.sock")),
            })
        }
    }

    struct Bridge {
        set_location: bool,
    }

    impl LocationBridge for Bridge {
        fn capabilities(&self) -> BridgeCapabilities {
            BridgeCapabilities {
                set_location: self.set_location,
                reset_location: false,
            }
        }

        fn set_location(&self, _latitude: f64, _longitude: f64) -> bool {
            true
        }

        fn reset_location(&self) -> bool {
            true
        }
    }

    struct Connector;

    impl BridgeConnector for Connector {
        fn root_proxy(&self, endpoint: &BridgeEndpoint) -> Result<Arc<dyn LocationBridge>, BridgeError> {
            match endpoint.name.as_str().rsplit('.').next() {
                Some("4") => Err(BridgeError::Timeout),
                Some("5") => Ok(Arc::new(Bridge { set_location: false })),
                _ => Ok(Arc::new(Bridge { set_location: true })),
            }
        }
    }

    const BUNDLE: &str = "com.apple.iphonesimulator";

    fn process(pid: u32, bundle: Option<&str>) -> ProcessInfo {
        ProcessInfo {
            pid,
            bundle_id: bundle.map(str::to_owned),
        }
    }

    fn locator(processes: Vec<ProcessInfo>) -> (EmulatorLocator, Arc<Mutex<Vec<ProcessInfo>>>) {
        let shared = Arc::new(Mutex::new(processes));
        let locator = EmulatorLocator::new(
            BUNDLE,
            Box::new(Processes(shared.clone())),
            Box::new(Lookup),
            Box::new(Connector),
        );
        (locator, shared)
    }

    #[test]
    fn discovery_keeps_only_usable_bridges() {
        let (locator, _) = locator(vec![
            process(1, Some(BUNDLE)),
            process(2, Some("com.example.other")),
            process(3, Some(BUNDLE)),
            process(4, Some(BUNDLE)),
            process(5, Some(BUNDLE)),
            process(6, None),
            process(7, Some(BUNDLE)),
        ]);
        let found: Vec<u32> = locator.discover().iter().map(EmulatorHandle::pid).collect();
        assert_eq!(found, [1, 7]);
        assert_eq!(
            locator.discover()[0].endpoint().as_str(),
            "com.apple.iphonesimulator.bridge.1"
        );
    }

    #[test]
    fn subscribe_and_unsubscribe() {
        let (locator, _) = locator(vec![process(1, Some(BUNDLE))]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let id = locator.subscribe(move |emulators| {
            counter.fetch_add(emulators.len(), Ordering::SeqCst);
        });
        locator.notify(&locator.discover());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert!(locator.unsubscribe(id));
        assert!(!locator.unsubscribe(id));
        locator.notify(&locator.discover());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_may_unsubscribe_themselves() {
        let (locator, _) = locator(vec![]);
        let locator = Arc::new(locator);
        let id = Arc::new(AtomicUsize::new(usize::MAX));
        let inner = (locator.clone(), id.clone());
        let assigned = locator.subscribe(move |_| {
            inner.0.unsubscribe(inner.1.load(Ordering::SeqCst));
        });
        id.store(assigned, Ordering::SeqCst);
        locator.notify(&[]);
        assert!(!locator.unsubscribe(assigned));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_notifies_on_change() {
        let (locator, shared) = locator(vec![process(1, Some(BUNDLE))]);
        let locator = Arc::new(locator);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        locator.subscribe(move |emulators| {
            let _ = tx.send(emulators.iter().map(EmulatorHandle::pid).collect::<Vec<_>>());
        });

        let cancel = CancellationToken::new();
        let watcher = spawn_watcher(locator.clone(), Duration::from_millis(10), cancel.clone());
        assert_eq!(rx.recv().await.unwrap(), [1]);

        shared.lock().push(process(7, Some(BUNDLE)));
        assert_eq!(rx.recv().await.unwrap(), [1, 7]);

        cancel.cancel();
        watcher.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn watcher_notices_bridge_registered_after_launch() {
        let registered = Arc::new(AtomicBool::new(false));
        let locator = Arc::new(EmulatorLocator::new(
            BUNDLE,
            Box::new(Processes(Arc::new(Mutex::new(vec![process(1, Some(BUNDLE))])))),
            Box::new(LateLookup(registered.clone())),
            Box::new(Connector),
        ));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        locator.subscribe(move |emulators| {
            let _ = tx.send(emulators.iter().map(EmulatorHandle::pid).collect::<Vec<_>>());
        });

        let cancel = CancellationToken::new();
        let watcher = spawn_watcher(locator.clone(), Duration::from_millis(10), cancel.clone());
        assert_eq!(rx.recv().await.unwrap(), Vec::<u32>::new());

        registered.store(true, Ordering::SeqCst);
        let next = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(next.unwrap(), [1]);

        // Nothing changes once the bridge is known.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        watcher.await.unwrap();
    }
}
