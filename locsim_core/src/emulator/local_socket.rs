//! Emulator bridge over `interprocess` local sockets, speaking newline-delimited JSON.

use std::{path::PathBuf, sync::Arc, time::Duration};

use interprocess::local_socket::{
    tokio::Stream, traits::tokio::Stream as _, GenericFilePath, GenericNamespaced, Name,
    NameType as _, ToFsName, ToNsName,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    runtime::Handle,
};

use super::bridge::{
    BridgeCapabilities, BridgeConnector, BridgeEndpoint, EmulatorIdentity, EndpointLookup,
    EndpointName, LocationBridge, SocketName,
};
use crate::error::BridgeError;

const SET_LOCATION: &str = "set_location";
const RESET_LOCATION: &str = "reset_location";

/// Resolves endpoint names to local socket names.
pub struct LocalSocketLookup {
    directory: Option<PathBuf>,
}

impl LocalSocketLookup {
    /// Namespaced sockets where the platform has them, `/tmp` socket files otherwise.
    pub fn new() -> Self {
        if GenericNamespaced::is_supported() {
            Self { directory: None }
        } else {
            Self::filesystem("/tmp")
        }
    }

    /// Socket files under `directory`.
    pub fn filesystem(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: Some(directory.into()),
        }
    }
}

impl Default for LocalSocketLookup {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointLookup for LocalSocketLookup {
    fn lookup(&self, name: &EndpointName) -> Option<BridgeEndpoint> {
        let file_name = format!("{name}.sock");
        let socket = match &self.directory {
            None => SocketName::Namespaced(file_name),
            Some(dir) => {
                let path = dir.join(file_name);
                if !path.exists() {
                    return None;
                }
                SocketName::Path(path)
            }
        };
        Some(BridgeEndpoint {
            name: name.clone(),
            socket,
        })
    }
}

fn socket_name(socket: &SocketName) -> std::io::Result<Name<'static>> {
    match socket {
        SocketName::Namespaced(name) => name.clone().to_ns_name::<GenericNamespaced>(),
        SocketName::Path(path) => path.clone().to_fs_name::<GenericFilePath>(),
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "method", rename_all = "snake_case")]
enum BridgeRequest {
    Probe,
    SetLocation { latitude: f64, longitude: f64 },
    ResetLocation,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BridgeReply {
    ok: bool,
    capabilities: Vec<String>,
    udid: Option<String>,
    name: Option<String>,
    error: Option<String>,
}

type Connection = BufReader<Stream>;

async fn exchange(conn: &mut Connection, request: &BridgeRequest) -> Result<BridgeReply, BridgeError> {
    let mut line = serde_json::to_string(request).map_err(|e| BridgeError::Protocol(e.to_string()))?;
    line.push('\n');
    conn.get_mut().write_all(line.as_bytes()).await?;
    conn.get_mut().flush().await?;

    let mut reply = String::new();
    if conn.read_line(&mut reply).await? == 0 {
        return Err(BridgeError::Protocol("bridge closed the connection".into()));
    }
    serde_json::from_str(reply.trim_end()).map_err(|e| BridgeError::Protocol(e.to_string()))
}

async fn connect(name: Name<'static>, timeout: Duration) -> Result<Connection, BridgeError> {
    let stream = tokio::time::timeout(timeout, Stream::connect(name))
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(BridgeError::Connect)?;
    Ok(BufReader::new(stream))
}

/// Connects to bridge endpoints and probes them.
///
/// Blocks on `runtime`, so it must be called from a blocking worker thread of a
/// multi-threaded runtime.
pub struct LocalSocketConnector {
    runtime: Handle,
    timeout: Duration,
}

impl LocalSocketConnector {
    pub fn new(runtime: Handle, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }
}

impl BridgeConnector for LocalSocketConnector {
    fn root_proxy(&self, endpoint: &BridgeEndpoint) -> Result<Arc<dyn LocationBridge>, BridgeError> {
        let name = socket_name(&endpoint.socket).map_err(BridgeError::Connect)?;
        let timeout = self.timeout;
        let (conn, reply) = self.runtime.block_on(async {
            let mut conn = connect(name.clone(), timeout).await?;
            let reply = tokio::time::timeout(timeout, exchange(&mut conn, &BridgeRequest::Probe))
                .await
                .map_err(|_| BridgeError::Timeout)??;
            Ok::<_, BridgeError>((conn, reply))
        })?;
        if !reply.ok {
            return Err(BridgeError::Protocol(
                reply.error.unwrap_or_else(|| "probe refused".into()),
            ));
        }

        let has = |capability: &str| reply.capabilities.iter().any(|c| c == capability);
        let capabilities = BridgeCapabilities {
            set_location: has(SET_LOCATION),
            reset_location: has(RESET_LOCATION),
        };
        tracing::debug!("Bridge {} offers {:?}", endpoint.name, capabilities);
        Ok(Arc::new(LocalSocketBridge {
            endpoint: endpoint.name.clone(),
            socket: name,
            runtime: self.runtime.clone(),
            timeout,
            capabilities,
            identity: EmulatorIdentity {
                udid: reply.udid,
                name: reply.name,
            },
            conn: Mutex::new(Some(conn)),
        }))
    }
}

struct LocalSocketBridge {
    endpoint: EndpointName,
    socket: Name<'static>,
    runtime: Handle,
    timeout: Duration,
    capabilities: BridgeCapabilities,
    identity: EmulatorIdentity,
    /// `None` after a failed exchange; the next request reconnects.
    conn: Mutex<Option<Connection>>,
}

impl LocalSocketBridge {
    fn request(&self, request: BridgeRequest) -> bool {
        let mut slot = self.conn.lock();
        let timeout = self.timeout;
        let result = self.runtime.block_on(async {
            let conn = match slot.take() {
                Some(conn) => conn,
                None => {
                    tracing::debug!("Reconnecting to bridge {}", self.endpoint);
                    connect(self.socket.clone(), timeout).await?
                }
            };
            let conn = slot.insert(conn);
            let reply = tokio::time::timeout(timeout, exchange(conn, &request))
                .await
                .map_err(|_| BridgeError::Timeout)??;
            Ok::<_, BridgeError>(reply)
        });
        match result {
            Ok(reply) if reply.ok => true,
            Ok(reply) => {
                tracing::warn!(
                    "Bridge {} refused {:?}: {}",
                    self.endpoint,
                    request,
                    reply.error.as_deref().unwrap_or("no reason given")
                );
                false
            }
            Err(e) => {
                // A late reply or half-written request would desync the stream.
                *slot = None;
                tracing::warn!("Bridge {} request failed: {}", self.endpoint, e);
                false
            }
        }
    }
}

impl LocationBridge for LocalSocketBridge {
    fn capabilities(&self) -> BridgeCapabilities {
        self.capabilities
    }

    fn identity(&self) -> EmulatorIdentity {
        self.identity.clone()
    }

    fn set_location(&self, latitude: f64, longitude: f64) -> bool {
        if !latitude.is_finite() || !longitude.is_finite() {
            tracing::warn!(
                "Bridge {}: refusing non-finite location {}, {}",
                self.endpoint,
                latitude,
                longitude
            );
            return false;
        }
        self.request(BridgeRequest::SetLocation {
            latitude,
            longitude,
        })
    }

    fn reset_location(&self) -> bool {
        self.request(BridgeRequest::ResetLocation)
    }
}
