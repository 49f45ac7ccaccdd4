//! Developer disk image upload and mount.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use locsim_common::{device::ProductVersion, value::PropertyValue};
use tokio_util::sync::CancellationToken;

use crate::{
    backend::{FileMode, FileService, ImageMounter},
    error::{FileServiceError, ProvisionError},
    info,
    service::{start_file_service, start_image_mounter, ServiceChannel},
    trust::ControlClient,
};

pub const IMAGE_TYPE: &str = "Developer";
pub const STAGING_DIR: &str = "PublicStaging";
pub const STAGING_IMAGE: &str = "PublicStaging/staging.dimage";
pub const MOUNT_PATH: &str = "/private/var/mobile/Media/PublicStaging/staging.dimage";
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// First major OS version that accepts a streamed image upload.
const DIRECT_UPLOAD_MIN_MAJOR: u32 = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadStrategy {
    /// Copy the image into the staging area over the file service, then mount it.
    LegacyFilesystemPush,
    /// Stream the image straight to the image mounter.
    DirectStreamUpload,
}

pub fn select_strategy(version: Option<ProductVersion>) -> UploadStrategy {
    match version {
        Some(v) if v.major >= DIRECT_UPLOAD_MIN_MAJOR => UploadStrategy::DirectStreamUpload,
        _ => UploadStrategy::LegacyFilesystemPush,
    }
}

pub fn strategy_for_version_string(raw: &str) -> UploadStrategy {
    select_strategy(ProductVersion::parse(raw))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageMountState {
    NotMounted,
    Mounted,
    /// The lookup itself failed.
    Unknown,
}

pub fn mount_state_from_lookup(reply: &PropertyValue) -> ImageMountState {
    match reply.get("ImageSignature").and_then(PropertyValue::as_array) {
        Some(signatures) if !signatures.is_empty() => ImageMountState::Mounted,
        _ => ImageMountState::NotMounted,
    }
}

/// Asks the image mounter whether a developer image is mounted. Read only.
pub fn is_mounted(client: &ControlClient) -> ImageMountState {
    let mut mounter = match start_image_mounter(client) {
        Ok(mounter) => mounter,
        Err(e) => {
            tracing::warn!("Image lookup on {} failed: {}", client.udid(), e);
            return ImageMountState::Unknown;
        }
    };
    let state = match mounter.lookup_image(IMAGE_TYPE) {
        Ok(reply) => mount_state_from_lookup(&reply),
        Err(e) => {
            tracing::warn!("Image lookup on {} failed: {}", client.udid(), e);
            ImageMountState::Unknown
        }
    };
    hangup(&mut mounter);
    mounter.close();
    state
}

fn hangup(mounter: &mut ServiceChannel<'_, dyn ImageMounter>) {
    if let Err(e) = mounter.hangup() {
        tracing::debug!("Image mounter hangup failed: {}", e);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub total_bytes: u64,
}

struct ProgressReader<R, F> {
    inner: R,
    total_size: u64,
    bytes_read: u64,
    last_logged_percent: u64,
    callback: Option<F>,
}

impl<R, F> ProgressReader<R, F> {
    fn new(inner: R, total_size: u64, callback: Option<F>) -> Self {
        Self {
            inner,
            total_size,
            bytes_read: 0,
            last_logged_percent: 0,
            callback,
        }
    }
}

impl<R: Read, F: FnMut(TransferProgress)> Read for ProgressReader<R, F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Ok(0);
        }
        self.bytes_read += n as u64;
        let percent = if self.total_size > 0 {
            (self.bytes_read * 100) / self.total_size
        } else {
            100
        };

        // Log every 10%
        if percent >= self.last_logged_percent + 10 || percent == 100 {
            tracing::info!(
                "Image upload progress: {}/{} bytes ({}%)",
                self.bytes_read,
                self.total_size,
                percent
            );
            self.last_logged_percent = (percent / 10) * 10;
        }

        let progress = TransferProgress {
            bytes_sent: self.bytes_read,
            total_bytes: self.total_size,
        };
        if let Some(ref mut cb) = self.callback {
            cb(progress);
        }
        Ok(n)
    }
}

type ProgressCallback = Box<dyn FnMut(TransferProgress) + Send>;

/// Runs one provisioning pass: version query, strategy selection, transfer and mount.
pub struct Provisioner {
    chunk_size: usize,
    cancel: CancellationToken,
    progress: Option<ProgressCallback>,
}

impl Default for Provisioner {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }
}

impl Provisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: impl FnMut(TransferProgress) + Send + 'static) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    pub fn provision(
        &mut self,
        client: &ControlClient,
        image_path: &Path,
        signature_path: &Path,
    ) -> Result<(), ProvisionError> {
        let version = match info::product_version(client) {
            Ok(version) => Some(version),
            Err(e) => {
                tracing::warn!("Could not read OS version of {}: {}", client.udid(), e);
                None
            }
        };
        let strategy = select_strategy(version);
        tracing::info!(
            "Provisioning {} (version {}) using {:?}",
            client.udid(),
            version.map_or_else(|| "unknown".to_owned(), |v| v.to_string()),
            strategy
        );

        let signature = read_signature(signature_path)?;
        let image = File::open(image_path).map_err(|source| ProvisionError::LocalFileMissing {
            path: image_path.to_owned(),
            source,
        })?;
        let size = image.metadata()?.len();

        let mut mounter = start_image_mounter(client)?;
        let result = self.upload_and_mount(client, &mut mounter, strategy, image, size, &signature);
        hangup(&mut mounter);
        mounter.close();

        match &result {
            Ok(()) => tracing::info!("Developer image mounted on {}", client.udid()),
            Err(e) => tracing::error!("Provisioning {} failed: {}", client.udid(), e),
        }
        result
    }

    fn upload_and_mount(
        &mut self,
        client: &ControlClient,
        mounter: &mut ServiceChannel<'_, dyn ImageMounter>,
        strategy: UploadStrategy,
        image: File,
        size: u64,
        signature: &[u8],
    ) -> Result<(), ProvisionError> {
        match strategy {
            UploadStrategy::LegacyFilesystemPush => self.push_legacy(client, image, size)?,
            UploadStrategy::DirectStreamUpload => self.upload_direct(mounter, image, size, signature)?,
        }
        let reply = mounter.mount_image(MOUNT_PATH, signature, IMAGE_TYPE)?;
        mount_result(&reply)
    }

    fn push_legacy(
        &mut self,
        client: &ControlClient,
        image: File,
        size: u64,
    ) -> Result<(), ProvisionError> {
        let mut afc = start_file_service(client)?;
        let result = self.push_to_staging(&mut afc, image, size);
        afc.close();
        result
    }

    fn push_to_staging(
        &mut self,
        afc: &mut ServiceChannel<'_, dyn FileService>,
        image: File,
        size: u64,
    ) -> Result<(), ProvisionError> {
        ensure_staging_dir(afc);
        let handle = afc.open_file(STAGING_IMAGE, FileMode::WriteOnly)?;
        let result = self.write_chunks(afc, handle, image, size);
        if let Err(e) = afc.close_file(handle) {
            tracing::warn!("Closing {} failed: {}", STAGING_IMAGE, e);
        }
        result
    }

    fn write_chunks(
        &mut self,
        afc: &mut ServiceChannel<'_, dyn FileService>,
        handle: u64,
        image: File,
        size: u64,
    ) -> Result<(), ProvisionError> {
        let mut reader = ProgressReader::new(image, size, self.progress.as_mut());
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            if self.cancel.is_cancelled() {
                tracing::info!("Image upload cancelled");
                return Err(ProvisionError::Cancelled);
            }
            let n = reader.read(&mut buf)?;
            if n == 0 {
                return Ok(());
            }
            let written = write_fully(afc, handle, &buf[..n]);
            if written != n {
                return Err(ProvisionError::ShortWrite {
                    written,
                    expected: n,
                });
            }
        }
    }

    fn upload_direct(
        &mut self,
        mounter: &mut ServiceChannel<'_, dyn ImageMounter>,
        image: File,
        size: u64,
        signature: &[u8],
    ) -> Result<(), ProvisionError> {
        let cancel = self.cancel.clone();
        let mut reader = ProgressReader::new(image, size, self.progress.as_mut());
        let mut pull = |buf: &mut [u8]| -> io::Result<usize> {
            if cancel.is_cancelled() {
                return Err(io::Error::other("upload cancelled"));
            }
            reader.read(buf)
        };
        match mounter.upload_image(IMAGE_TYPE, size, signature, &mut pull) {
            Ok(()) => Ok(()),
            Err(_) if self.cancel.is_cancelled() => {
                tracing::info!("Image upload cancelled");
                Err(ProvisionError::Cancelled)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn read_signature(path: &Path) -> Result<Vec<u8>, ProvisionError> {
    let missing = |source| ProvisionError::LocalFileMissing {
        path: path.to_owned(),
        source,
    };
    let signature = std::fs::read(path).map_err(missing)?;
    if signature.is_empty() {
        return Err(missing(io::Error::new(
            io::ErrorKind::InvalidData,
            "signature file is empty",
        )));
    }
    Ok(signature)
}

/// Creates the staging directory if needed. Failures are logged and the upload
/// carries on; opening the target file reports anything fatal.
fn ensure_staging_dir(afc: &mut ServiceChannel<'_, dyn FileService>) {
    if let Ok(info) = afc.file_info(STAGING_DIR) {
        if info.is_dir {
            return;
        }
    }
    match afc.make_directory(STAGING_DIR) {
        Ok(()) => tracing::debug!("Created {}", STAGING_DIR),
        Err(FileServiceError::AlreadyExists) => {
            tracing::warn!("{} already exists", STAGING_DIR)
        }
        Err(e) => tracing::warn!("Creating {} failed: {}", STAGING_DIR, e),
    }
}

/// Writes `chunk`, retrying with the remainder until everything is accepted,
/// the remote accepts nothing, or a write fails. Returns the bytes accepted.
fn write_fully(afc: &mut ServiceChannel<'_, dyn FileService>, handle: u64, chunk: &[u8]) -> usize {
    let mut total = 0;
    while total < chunk.len() {
        match afc.write(handle, &chunk[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) => {
                tracing::warn!("Write to {} failed: {}", STAGING_IMAGE, e);
                break;
            }
        }
    }
    total
}

fn mount_result(reply: &PropertyValue) -> Result<(), ProvisionError> {
    if reply.get("Status").and_then(PropertyValue::as_str) == Some("Complete") {
        return Ok(());
    }
    let code = reply
        .get("ErrorCode")
        .and_then(PropertyValue::as_integer)
        .unwrap_or(-1);
    let message = ["DetailedError", "Error"]
        .iter()
        .find_map(|key| reply.get(key).and_then(PropertyValue::as_str))
        .unwrap_or("unknown error")
        .to_owned();
    Err(ProvisionError::MountRejected { code, message })
}
