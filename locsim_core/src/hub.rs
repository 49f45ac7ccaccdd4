//! Entry point for the GUI and CLI layers. Every device operation blocks, so each
//! one runs on its own `spawn_blocking` worker.

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use locsim_common::{
    config::{self, Settings},
    device::{Device, DeviceIdentifier, DiscoveryMode, ProductVersion},
    disk_image::DiskImageStore,
    events::{DeviceEvent, DeviceNotification},
};
use tokio::{runtime::Handle, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::DeviceBackend,
    emulator::{spawn_watcher, EmulatorHandle, EmulatorLocator, SubscriptionId},
    error::{ProvisionError, SpoofError},
    info,
    location::{spoof, LocationCommand},
    provision::{is_mounted, ImageMountState, Provisioner, TransferProgress},
    registry::DeviceRegistry,
    trust::{self, establish, ControlClient},
};

const INFO_LABEL: &str = "deviceinfo";
const MOUNTER_LABEL: &str = "deviceimagemounter";

#[derive(Clone, Debug)]
pub enum SpoofTarget {
    Physical(DeviceIdentifier, DiscoveryMode),
    Emulator(EmulatorHandle),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub product_name: String,
    pub version: ProductVersion,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionOutcome {
    AlreadyMounted,
    Mounted,
}

#[derive(Clone)]
pub struct Hub {
    backend: Arc<dyn DeviceBackend>,
    settings: Arc<Settings>,
    emulators: Arc<EmulatorLocator>,
    registry: Arc<DeviceRegistry>,
    store: DiskImageStore,
}

async fn on_worker<T, F>(op: &'static str, f: F) -> anyhow::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .with_context(|| format!("{op} worker failed"))?
        .with_context(|| format!("{op} failed"))
}

impl Hub {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        settings: Arc<Settings>,
        emulators: Arc<EmulatorLocator>,
        store: DiskImageStore,
    ) -> Self {
        Self {
            registry: Arc::new(DeviceRegistry::from_settings(&settings)),
            backend,
            settings,
            emulators,
            store,
        }
    }

    /// Wires up the `sysinfo` and local socket emulator adapters and the disk
    /// image store from `settings`.
    pub fn from_settings(
        backend: Arc<dyn DeviceBackend>,
        settings: Arc<Settings>,
        runtime: Handle,
    ) -> config::Result<Self> {
        let store = DiskImageStore::new(config::support_directory(&settings)?);
        let emulators = Arc::new(EmulatorLocator::from_settings(&settings.emulator, runtime));
        Ok(Self::new(backend, settings, emulators, store))
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &DiskImageStore {
        &self.store
    }

    pub fn devices(&self) -> Vec<Device> {
        self.registry.devices()
    }

    /// Mode from the registry, or the configured default for unknown devices.
    pub fn discovery_mode(&self, udid: &DeviceIdentifier) -> DiscoveryMode {
        self.registry
            .get(udid)
            .map(|device| device.discovery_mode())
            .unwrap_or_else(|| self.settings.default_discovery_mode())
    }

    pub fn physical_target(&self, udid: DeviceIdentifier) -> SpoofTarget {
        let mode = self.discovery_mode(&udid);
        SpoofTarget::Physical(udid, mode)
    }

    fn connect(&self, udid: &DeviceIdentifier, label: &str) -> anyhow::Result<ControlClient> {
        let mode = self.discovery_mode(udid);
        establish(self.backend.as_ref(), udid, mode, label)
            .with_context(|| format!("Connecting to {udid}"))
    }

    pub async fn identify_device(&self, udid: DeviceIdentifier) -> anyhow::Result<DeviceIdentity> {
        let hub = self.clone();
        on_worker("identify", move || {
            let client = hub.connect(&udid, INFO_LABEL)?;
            Ok(DeviceIdentity {
                name: info::device_name(&client)?,
                product_name: info::product_name(&client)?,
                version: info::product_version(&client)?,
            })
        })
        .await
    }

    pub async fn pair_device(&self, udid: DeviceIdentifier) -> anyhow::Result<()> {
        let hub = self.clone();
        on_worker("pair", move || {
            let mode = hub.discovery_mode(&udid);
            Ok(trust::pair(hub.backend.as_ref(), &udid, mode)?)
        })
        .await
    }

    pub async fn mount_state(&self, udid: DeviceIdentifier) -> anyhow::Result<ImageMountState> {
        let hub = self.clone();
        on_worker("mount state", move || {
            let client = hub.connect(&udid, MOUNTER_LABEL)?;
            Ok(is_mounted(&client))
        })
        .await
    }

    fn provision_with(
        &self,
        client: &ControlClient,
        image: &std::path::Path,
        signature: &std::path::Path,
        cancel: CancellationToken,
        progress: impl FnMut(TransferProgress) + Send + 'static,
    ) -> anyhow::Result<ProvisionOutcome> {
        if is_mounted(client) == ImageMountState::Mounted {
            tracing::info!("Developer image already mounted on {}", client.udid());
            return Ok(ProvisionOutcome::AlreadyMounted);
        }
        Provisioner::new()
            .with_chunk_size(self.settings.upload_chunk_size)
            .with_cancel(cancel)
            .with_progress(progress)
            .provision(client, image, signature)?;
        Ok(ProvisionOutcome::Mounted)
    }

    /// Mounts the given image unless a developer image is already mounted.
    pub async fn provision_developer_support(
        &self,
        udid: DeviceIdentifier,
        image: PathBuf,
        signature: PathBuf,
        cancel: CancellationToken,
        progress: impl FnMut(TransferProgress) + Send + 'static,
    ) -> anyhow::Result<ProvisionOutcome> {
        let hub = self.clone();
        on_worker("provision", move || {
            let client = hub.connect(&udid, MOUNTER_LABEL)?;
            hub.provision_with(&client, &image, &signature, cancel, progress)
        })
        .await
    }

    /// Like [`Hub::provision_developer_support`], with the image picked from the
    /// disk image store by the device's product name and version.
    pub async fn provision_from_store(
        &self,
        udid: DeviceIdentifier,
        cancel: CancellationToken,
        progress: impl FnMut(TransferProgress) + Send + 'static,
    ) -> anyhow::Result<ProvisionOutcome> {
        let hub = self.clone();
        on_worker("provision", move || {
            let client = hub.connect(&udid, MOUNTER_LABEL)?;
            let os = info::product_name(&client)?;
            let version = info::product_version(&client)
                .map_err(|_| ProvisionError::VersionUnavailable)?
                .to_string();
            let paths = hub.store.image_paths(&os, &version).ok_or_else(|| {
                ProvisionError::ImageNotInstalled {
                    os: os.clone(),
                    version: version.clone(),
                }
            })?;
            tracing::info!("Using stored developer image {} {} for {}", os, version, udid);
            hub.provision_with(&client, &paths.image, &paths.signature, cancel, progress)
        })
        .await
    }

    pub async fn set_location(
        &self,
        target: SpoofTarget,
        latitude: f64,
        longitude: f64,
    ) -> anyhow::Result<()> {
        let command = LocationCommand::Start {
            latitude,
            longitude,
        };
        self.send_location(target, command).await
    }

    pub async fn reset_location(&self, target: SpoofTarget) -> anyhow::Result<()> {
        self.send_location(target, LocationCommand::Stop).await
    }

    async fn send_location(&self, target: SpoofTarget, command: LocationCommand) -> anyhow::Result<()> {
        let backend = self.backend.clone();
        on_worker("location", move || match target {
            SpoofTarget::Physical(udid, mode) => Ok(spoof(backend.as_ref(), &udid, mode, &command)?),
            SpoofTarget::Emulator(handle) => {
                let accepted = match command {
                    LocationCommand::Start {
                        latitude,
                        longitude,
                    } => handle.set_location(latitude, longitude),
                    LocationCommand::Stop => handle.reset_location(),
                };
                if !accepted {
                    tracing::error!("{} rejected {:?}", handle, command);
                    return Err(SpoofError::EmulatorRejected.into());
                }
                tracing::info!("Sent {:?} to {}", command, handle);
                Ok(())
            }
        })
        .await
    }

    pub async fn discover_emulators(&self) -> anyhow::Result<Vec<EmulatorHandle>> {
        let emulators = self.emulators.clone();
        on_worker("emulator discovery", move || Ok(emulators.discover())).await
    }

    pub fn subscribe_emulators(
        &self,
        callback: impl Fn(&[EmulatorHandle]) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.emulators.subscribe(callback)
    }

    pub fn unsubscribe_emulators(&self, id: SubscriptionId) -> bool {
        self.emulators.unsubscribe(id)
    }

    /// Starts the background emulator watcher with the configured poll interval.
    pub fn watch_emulators(&self, cancel: CancellationToken) -> JoinHandle<()> {
        spawn_watcher(
            self.emulators.clone(),
            self.settings.emulator.poll_interval(),
            cancel,
        )
    }

    /// Applies a backend connection event, reading the name of new devices.
    pub async fn handle_device_event(
        &self,
        event: DeviceEvent,
    ) -> anyhow::Result<Option<DeviceNotification>> {
        let hub = self.clone();
        on_worker("device event", move || {
            Ok(hub.registry.apply(&event, |udid, mode| {
                let client = establish(hub.backend.as_ref(), udid, mode, INFO_LABEL).ok()?;
                info::device_name(&client).ok()
            }))
        })
        .await
    }
}
