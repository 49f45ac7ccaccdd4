//! Capability traits implemented by a platform device-management backend.
//!
//! Everything here is blocking and object-safe so callers can hold `Box<dyn ..>`
//! handles and drive them from a blocking worker thread.

use std::io;

use locsim_common::{device::DeviceIdentifier, value::PropertyValue, DiscoveryMode};

use crate::error::{ConnectError, FileServiceError, RemoteError};

/// Negotiated by [`LockdownSession::start_service`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub port: u16,
    pub ssl_enabled: bool,
}

pub trait DeviceBackend: Send + Sync {
    fn connect(
        &self,
        udid: &DeviceIdentifier,
        mode: DiscoveryMode,
    ) -> Result<Box<dyn TransportHandle>, ConnectError>;
}

/// One live connection to a device. Released on drop.
pub trait TransportHandle: Send {
    fn udid(&self) -> &DeviceIdentifier;

    fn handshake(&self, label: &str) -> Result<Box<dyn LockdownSession>, ConnectError>;

    fn open_stream(&self, service: &ServiceDescriptor) -> io::Result<Box<dyn ServiceStream>>;

    fn open_file_service(&self, service: &ServiceDescriptor) -> io::Result<Box<dyn FileService>>;

    fn open_image_mounter(&self, service: &ServiceDescriptor)
        -> io::Result<Box<dyn ImageMounter>>;
}

pub trait LockdownSession: Send {
    /// `Ok(None)` when the device has no value for `key`.
    fn get_value(
        &self,
        domain: Option<&str>,
        key: &str,
    ) -> Result<Option<PropertyValue>, RemoteError>;

    fn start_service(&self, name: &str) -> Result<ServiceDescriptor, RemoteError>;
}

pub trait RemoteService: Send {
    fn close(&mut self);
}

pub trait ServiceStream: RemoteService {
    /// Returns how many bytes the remote accepted.
    fn send(&mut self, data: &[u8]) -> io::Result<usize>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileMode {
    ReadOnly,
    WriteOnly,
}

pub trait FileService: RemoteService {
    fn file_info(&mut self, path: &str) -> Result<FileInfo, FileServiceError>;

    fn make_directory(&mut self, path: &str) -> Result<(), FileServiceError>;

    /// Returns a remote file handle.
    fn open_file(&mut self, path: &str, mode: FileMode) -> Result<u64, FileServiceError>;

    fn write(&mut self, handle: u64, data: &[u8]) -> Result<usize, FileServiceError>;

    fn close_file(&mut self, handle: u64) -> Result<(), FileServiceError>;
}

pub trait ImageMounter: RemoteService {
    fn lookup_image(&mut self, image_type: &str) -> Result<PropertyValue, RemoteError>;

    /// Streams `size` bytes pulled from `source` until it returns `Ok(0)`.
    fn upload_image(
        &mut self,
        image_type: &str,
        size: u64,
        signature: &[u8],
        source: &mut dyn FnMut(&mut [u8]) -> io::Result<usize>,
    ) -> Result<(), RemoteError>;

    fn mount_image(
        &mut self,
        path: &str,
        signature: &[u8],
        image_type: &str,
    ) -> Result<PropertyValue, RemoteError>;

    fn hangup(&mut self) -> Result<(), RemoteError>;
}
