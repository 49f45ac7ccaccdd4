//! Starting named services through a [`ControlClient`].

use std::{
    io,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

use crate::{
    backend::{FileService, ImageMounter, RemoteService, ServiceDescriptor, ServiceStream, TransportHandle},
    error::ServiceError,
    trust::ControlClient,
};

pub const LOCATION_SERVICE: &str = "com.apple.dt.simulatelocation";
pub const IMAGE_MOUNTER_SERVICE: &str = "com.apple.mobile.mobile_image_mounter";
pub const FILE_SERVICE: &str = "com.apple.afc";

/// Connected stream bound to one service. Borrows the client it was started from.
/// Closed explicitly with [`ServiceChannel::close`], or on drop otherwise.
pub struct ServiceChannel<'c, S: RemoteService + ?Sized> {
    name: String,
    inner: Box<S>,
    closed: bool,
    _client: PhantomData<&'c ControlClient>,
}

impl<S: RemoteService + ?Sized> ServiceChannel<'_, S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn close(mut self) {
        self.inner.close();
        self.closed = true;
        tracing::debug!("Closed service {}", self.name);
    }
}

impl<S: RemoteService + ?Sized> Deref for ServiceChannel<'_, S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.inner
    }
}

impl<S: RemoteService + ?Sized> DerefMut for ServiceChannel<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: RemoteService + ?Sized> Drop for ServiceChannel<'_, S> {
    fn drop(&mut self) {
        if !self.closed {
            tracing::warn!("Service {} dropped without close", self.name);
            self.inner.close();
        }
    }
}

fn start<'c, S, F>(
    client: &'c ControlClient,
    name: &str,
    open: F,
) -> Result<ServiceChannel<'c, S>, ServiceError>
where
    S: RemoteService + ?Sized,
    F: FnOnce(&dyn TransportHandle, &ServiceDescriptor) -> io::Result<Box<S>>,
{
    let descriptor = client
        .start_service(name)
        .map_err(|e| ServiceError::ServiceUnavailable {
            name: name.to_owned(),
            reason: e.to_string(),
        })?;
    if descriptor.port == 0 {
        return Err(ServiceError::ServiceUnavailable {
            name: name.to_owned(),
            reason: "no port assigned".into(),
        });
    }

    let inner = open(client.transport(), &descriptor).map_err(|source| {
        ServiceError::ServiceConnectFailed {
            name: name.to_owned(),
            source,
        }
    })?;
    tracing::debug!(
        "Started {} on {} (port {}, ssl {})",
        name,
        client.udid(),
        descriptor.port,
        descriptor.ssl_enabled
    );
    Ok(ServiceChannel {
        name: name.to_owned(),
        inner,
        closed: false,
        _client: PhantomData,
    })
}

pub fn start_stream<'c>(
    client: &'c ControlClient,
    name: &str,
) -> Result<ServiceChannel<'c, dyn ServiceStream>, ServiceError> {
    start(client, name, |transport, descriptor| transport.open_stream(descriptor))
}

pub fn start_file_service(
    client: &ControlClient,
) -> Result<ServiceChannel<'_, dyn FileService>, ServiceError> {
    start(client, FILE_SERVICE, |transport, descriptor| {
        transport.open_file_service(descriptor)
    })
}

pub fn start_image_mounter(
    client: &ControlClient,
) -> Result<ServiceChannel<'_, dyn ImageMounter>, ServiceError> {
    start(client, IMAGE_MOUNTER_SERVICE, |transport, descriptor| {
        transport.open_image_mounter(descriptor)
    })
}
