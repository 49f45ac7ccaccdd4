//! Scriptable in-memory backend for protocol tests.

use std::{collections::{HashMap, VecDeque}, io, sync::Arc};

use locsim_common::{device::DeviceIdentifier, value::PropertyValue, DiscoveryMode};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    backend::{
        DeviceBackend, FileInfo, FileMode, FileService, ImageMounter, LockdownSession,
        RemoteService, ServiceDescriptor, ServiceStream, TransportHandle,
    },
    error::{ConnectError, FileServiceError, RemoteError},
    provision::STAGING_IMAGE,
};

#[derive(Clone, Copy, Debug)]
pub enum WriteOutcome {
    Full,
    Short(usize),
    Zero,
    Error,
}

pub struct FakeState {
    pub udid: DeviceIdentifier,
    pub handshake_fails: bool,
    pub open_transports: usize,
    pub labels: Vec<String>,
    pub last_mode: Option<DiscoveryMode>,
    pub values: HashMap<String, PropertyValue>,

    pub refused_services: Vec<String>,
    pub zero_port: bool,
    pub started_services: Vec<String>,
    pub closed_services: Vec<String>,

    pub stream_accept_limit: Option<usize>,
    pub sent_frames: Vec<Vec<u8>>,

    pub mkdir_already_exists: bool,
    pub made_dirs: Vec<String>,
    pub opened_files: Vec<String>,
    pub closed_files: usize,
    pub write_script: VecDeque<WriteOutcome>,
    pub write_calls: Vec<usize>,
    pub staged: Vec<u8>,

    pub mounted: bool,
    pub lookup_fails: bool,
    pub lookups: usize,
    pub uploads: Vec<(String, u64, Vec<u8>)>,
    pub uploaded: Vec<u8>,
    pub mount_reply: PropertyValue,
    pub mounts: Vec<(String, Vec<u8>, String)>,
    pub hangups: usize,
}

impl FakeState {
    fn new(udid: &str) -> Self {
        Self {
            udid: udid.into(),
            handshake_fails: false,
            open_transports: 0,
            labels: Vec::new(),
            last_mode: None,
            values: HashMap::new(),
            refused_services: Vec::new(),
            zero_port: false,
            started_services: Vec::new(),
            closed_services: Vec::new(),
            stream_accept_limit: None,
            sent_frames: Vec::new(),
            mkdir_already_exists: false,
            made_dirs: Vec::new(),
            opened_files: Vec::new(),
            closed_files: 0,
            write_script: VecDeque::new(),
            write_calls: Vec::new(),
            staged: Vec::new(),
            mounted: false,
            lookup_fails: false,
            lookups: 0,
            uploads: Vec::new(),
            uploaded: Vec::new(),
            mount_reply: PropertyValue::dictionary([("Status", PropertyValue::from("Complete"))]),
            mounts: Vec::new(),
            hangups: 0,
        }
    }
}

#[derive(Clone)]
pub struct FakeBackend {
    state: Arc<Mutex<FakeState>>,
}

impl FakeBackend {
    pub fn new(udid: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState::new(udid))),
        }
    }

    pub fn with_identity(self, name: &str, product: &str, version: &str) -> Self {
        {
            let mut state = self.state();
            state.values.insert("DeviceName".into(), name.into());
            state.values.insert("ProductName".into(), product.into());
            state.values.insert("ProductVersion".into(), version.into());
        }
        self
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock()
    }
}

impl DeviceBackend for FakeBackend {
    fn connect(
        &self,
        udid: &DeviceIdentifier,
        mode: DiscoveryMode,
    ) -> Result<Box<dyn TransportHandle>, ConnectError> {
        let mut state = self.state();
        if *udid != state.udid {
            return Err(ConnectError::DeviceNotFound(udid.clone()));
        }
        state.open_transports += 1;
        state.last_mode = Some(mode);
        Ok(Box::new(FakeTransport {
            udid: udid.clone(),
            state: self.state.clone(),
        }))
    }
}

struct FakeTransport {
    udid: DeviceIdentifier,
    state: Arc<Mutex<FakeState>>,
}

impl Drop for FakeTransport {
    fn drop(&mut self) {
        self.state.lock().open_transports -= 1;
    }
}

impl FakeTransport {
    fn service(&self, service: &ServiceDescriptor) -> FakeService {
        FakeService {
            name: service.name.clone(),
            state: self.state.clone(),
            next_handle: 1,
        }
    }
}

impl TransportHandle for FakeTransport {
    fn udid(&self) -> &DeviceIdentifier {
        &self.udid
    }

    fn handshake(&self, label: &str) -> Result<Box<dyn LockdownSession>, ConnectError> {
        let mut state = self.state.lock();
        if state.handshake_fails {
            return Err(ConnectError::HandshakeFailed {
                udid: self.udid.clone(),
                reason: "pairing record rejected".into(),
            });
        }
        state.labels.push(label.to_owned());
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
        }))
    }

    fn open_stream(&self, service: &ServiceDescriptor) -> io::Result<Box<dyn ServiceStream>> {
        Ok(Box::new(self.service(service)))
    }

    fn open_file_service(&self, service: &ServiceDescriptor) -> io::Result<Box<dyn FileService>> {
        Ok(Box::new(self.service(service)))
    }

    fn open_image_mounter(
        &self,
        service: &ServiceDescriptor,
    ) -> io::Result<Box<dyn ImageMounter>> {
        Ok(Box::new(self.service(service)))
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

impl LockdownSession for FakeSession {
    fn get_value(
        &self,
        _domain: Option<&str>,
        key: &str,
    ) -> Result<Option<PropertyValue>, RemoteError> {
        Ok(self.state.lock().values.get(key).cloned())
    }

    fn start_service(&self, name: &str) -> Result<ServiceDescriptor, RemoteError> {
        let mut state = self.state.lock();
        if state.refused_services.iter().any(|s| s == name) {
            return Err(RemoteError::Refused(format!("{name} is not allowed")));
        }
        state.started_services.push(name.to_owned());
        Ok(ServiceDescriptor {
            name: name.to_owned(),
            port: if state.zero_port { 0 } else { 49152 },
            ssl_enabled: false,
        })
    }
}

/// One fake implements every service kind; tests only touch the calls they expect.
struct FakeService {
    name: String,
    state: Arc<Mutex<FakeState>>,
    next_handle: u64,
}

impl RemoteService for FakeService {
    fn close(&mut self) {
        self.state.lock().closed_services.push(self.name.clone());
    }
}

impl ServiceStream for FakeService {
    fn send(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let accepted = state.stream_accept_limit.map_or(data.len(), |l| l.min(data.len()));
        state.sent_frames.push(data[..accepted].to_vec());
        Ok(accepted)
    }
}

impl FileService for FakeService {
    fn file_info(&mut self, path: &str) -> Result<FileInfo, FileServiceError> {
        let state = self.state.lock();
        if state.made_dirs.iter().any(|d| d == path) {
            Ok(FileInfo { is_dir: true, size: 0 })
        } else {
            Err(FileServiceError::NotFound)
        }
    }

    fn make_directory(&mut self, path: &str) -> Result<(), FileServiceError> {
        let mut state = self.state.lock();
        if state.mkdir_already_exists {
            return Err(FileServiceError::AlreadyExists);
        }
        state.made_dirs.push(path.to_owned());
        Ok(())
    }

    fn open_file(&mut self, path: &str, mode: FileMode) -> Result<u64, FileServiceError> {
        assert_eq!(mode, FileMode::WriteOnly);
        self.state.lock().opened_files.push(path.to_owned());
        let handle = self.next_handle;
        self.next_handle += 1;
        Ok(handle)
    }

    fn write(&mut self, _handle: u64, data: &[u8]) -> Result<usize, FileServiceError> {
        let mut state = self.state.lock();
        state.write_calls.push(data.len());
        let accepted = match state.write_script.pop_front().unwrap_or(WriteOutcome::Full) {
            WriteOutcome::Full => data.len(),
            WriteOutcome::Short(n) => n.min(data.len()),
            WriteOutcome::Zero => 0,
            WriteOutcome::Error => {
                return Err(FileServiceError::Refused(format!("write to {STAGING_IMAGE} failed")))
            }
        };
        state.staged.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn close_file(&mut self, _handle: u64) -> Result<(), FileServiceError> {
        self.state.lock().closed_files += 1;
        Ok(())
    }
}

impl ImageMounter for FakeService {
    fn lookup_image(&mut self, _image_type: &str) -> Result<PropertyValue, RemoteError> {
        let mut state = self.state.lock();
        state.lookups += 1;
        if state.lookup_fails {
            return Err(RemoteError::Refused("lookup failed".into()));
        }
        let signatures = if state.mounted {
            vec![PropertyValue::Data(vec![0xaa; 4])]
        } else {
            Vec::new()
        };
        Ok(PropertyValue::dictionary([(
            "ImageSignature",
            PropertyValue::Array(signatures),
        )]))
    }

    fn upload_image(
        &mut self,
        image_type: &str,
        size: u64,
        signature: &[u8],
        source: &mut dyn FnMut(&mut [u8]) -> io::Result<usize>,
    ) -> Result<(), RemoteError> {
        self.state
            .lock()
            .uploads
            .push((image_type.to_owned(), size, signature.to_vec()));
        let mut buf = [0u8; 3];
        loop {
            let n = source(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            self.state.lock().uploaded.extend_from_slice(&buf[..n]);
        }
    }

    fn mount_image(
        &mut self,
        path: &str,
        signature: &[u8],
        image_type: &str,
    ) -> Result<PropertyValue, RemoteError> {
        let mut state = self.state.lock();
        state
            .mounts
            .push((path.to_owned(), signature.to_vec(), image_type.to_owned()));
        state.mounted = true;
        Ok(state.mount_reply.clone())
    }

    fn hangup(&mut self) -> Result<(), RemoteError> {
        self.state.lock().hangups += 1;
        Ok(())
    }
}
