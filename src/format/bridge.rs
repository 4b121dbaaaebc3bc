//! Legacy bridge backend.
//!
//! Formats without a native reader are served by an external process that
//! speaks JSON lines on stdin/stdout. Every request is one JSON object with
//! an `op` field; every response is one JSON line with `ok`. A chunk
//! response declares `length` and is followed by exactly that many raw
//! bytes in native byte order.
//!
//! ```text
//! -> {"op":"open","path":"/data/a.vsi"}
//! <- {"ok":true,"scene_count":2}
//! -> {"op":"metadata","path":"/data/a.vsi","scene":0}
//! <- {"ok":true,"metadata":{"dims":{"t":1,"c":2,"z":5,"y":512,"x":512},"dtype":"uint16",...}}
//! -> {"op":"read_chunk","path":"/data/a.vsi","scene":0,"t":0,"c":1,"z":2,"y":0,"x":0,"h":512,"w":512}
//! <- {"ok":true,"length":524288}
//!    <524288 bytes>
//! ```

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::BridgeConfig;
use crate::error::FormatError;
use crate::metadata::{BridgeNative, NativeMetadata, PixelType, SceneInfo};

use super::layout::{ChunkRequest, NativeLayout};

/// Upper bound on a declared chunk payload.
const MAX_PAYLOAD_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// One request/response exchange with a bridge.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Send `request` and return the response header with its payload, if any.
    ///
    /// Implementations return `FormatError::Bridge` when the bridge answers
    /// `ok: false` or the exchange breaks.
    async fn request(&self, request: Value) -> Result<(Value, Option<Bytes>), FormatError>;
}

// =============================================================================
// Process transport
// =============================================================================

struct BridgeIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,

    /// Set when an exchange broke part-way and the pipe position is unknown
    broken: Option<String>,
}

impl BridgeIo {
    async fn exchange(&mut self, request: &Value) -> Result<(Value, Option<Bytes>), FormatError> {
        if let Some(reason) = &self.broken {
            return Err(FormatError::Bridge(format!("bridge unusable: {}", reason)));
        }
        match self.exchange_once(request).await {
            // A refusal is a complete response and leaves the pipe in sync.
            Ok((header, payload)) => Ok((check_ok(header)?, payload)),
            Err(e) => {
                self.broken = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Write one request and read its header line and payload.
    async fn exchange_once(
        &mut self,
        request: &Value,
    ) -> Result<(Value, Option<Bytes>), FormatError> {
        let broken = |e: std::io::Error| FormatError::Bridge(format!("bridge pipe: {}", e));

        let mut line = request.to_string();
        line.push('\n');
        self.stdin.write_all(line.as_bytes()).await.map_err(broken)?;
        self.stdin.flush().await.map_err(broken)?;

        let mut response = String::new();
        if self.stdout.read_line(&mut response).await.map_err(broken)? == 0 {
            return Err(FormatError::Bridge("bridge closed its output".to_string()));
        }
        let header = parse_header(&response)?;

        let payload = match header.get("length").and_then(Value::as_u64) {
            Some(len) if len > MAX_PAYLOAD_BYTES => {
                return Err(FormatError::Bridge(format!(
                    "bridge declared a {} byte payload",
                    len
                )))
            }
            Some(len) => {
                let mut buf = vec![0u8; len as usize];
                self.stdout.read_exact(&mut buf).await.map_err(broken)?;
                Some(Bytes::from(buf))
            }
            None => None,
        };
        Ok((header, payload))
    }
}

/// A bridge running as a child process.
///
/// Requests are serialized. Each exchange runs in its own task, so a caller
/// that gives up mid-response never leaves half a payload in the pipe. The
/// process is killed when the transport drops.
pub struct ProcessBridge {
    io: Arc<Mutex<BridgeIo>>,
    _child: Child,
}

impl ProcessBridge {
    /// Start the configured bridge command.
    ///
    /// # Errors
    ///
    /// Returns `FormatError::Bridge` if the process cannot be spawned.
    pub fn spawn(config: &BridgeConfig) -> Result<Self, FormatError> {
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FormatError::Bridge(format!("cannot start {}: {}", config.command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| FormatError::Bridge("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| FormatError::Bridge("bridge stdout unavailable".to_string()))?;

        info!(command = %config.command, "started legacy bridge");
        Ok(Self {
            io: Arc::new(Mutex::new(BridgeIo {
                stdin,
                stdout: BufReader::new(stdout),
                broken: None,
            })),
            _child: child,
        })
    }
}

#[async_trait]
impl BridgeTransport for ProcessBridge {
    async fn request(&self, request: Value) -> Result<(Value, Option<Bytes>), FormatError> {
        let io = self.io.clone();
        let exchange = tokio::spawn(async move {
            let mut io = io.lock().await;
            io.exchange(&request).await
        });
        exchange
            .await
            .map_err(|e| FormatError::Bridge(format!("bridge exchange task failed: {}", e)))?
    }
}

/// Parse one response line and surface `ok: false` as an error.
pub fn parse_response(line: &str) -> Result<Value, FormatError> {
    check_ok(parse_header(line)?)
}

fn parse_header(line: &str) -> Result<Value, FormatError> {
    serde_json::from_str(line.trim())
        .map_err(|e| FormatError::Bridge(format!("malformed response: {}", e)))
}

fn check_ok(header: Value) -> Result<Value, FormatError> {
    if header.get("ok").and_then(Value::as_bool) != Some(true) {
        let message = header
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("bridge reported failure");
        return Err(FormatError::Bridge(message.to_string()));
    }
    Ok(header)
}

// =============================================================================
// Backend
// =============================================================================

pub struct BridgeBackend {
    transport: Arc<dyn BridgeTransport>,
    path: String,
    layouts: Vec<NativeLayout>,
    documents: Vec<Value>,
    scenes: Vec<SceneInfo>,
}

impl BridgeBackend {
    /// Open `identifier` through the bridge and fetch every scene's metadata.
    ///
    /// # Errors
    ///
    /// Returns `FormatError::Bridge` when the bridge fails, and `Corrupt`
    /// when its metadata lacks dimensions or a known pixel type.
    pub async fn open(
        transport: Arc<dyn BridgeTransport>,
        identifier: &str,
    ) -> Result<Self, FormatError> {
        let path = identifier
            .strip_prefix("file://")
            .unwrap_or(identifier)
            .to_string();

        let (opened, _) = transport.request(json!({"op": "open", "path": path})).await?;
        let scene_count = opened
            .get("scene_count")
            .and_then(Value::as_u64)
            .unwrap_or(1)
            .max(1) as usize;

        let mut layouts = Vec::with_capacity(scene_count);
        let mut documents = Vec::with_capacity(scene_count);
        let mut scenes = Vec::with_capacity(scene_count);
        for scene in 0..scene_count {
            let (response, _) = transport
                .request(json!({"op": "metadata", "path": path, "scene": scene}))
                .await?;
            let document = response.get("metadata").cloned().unwrap_or(Value::Null);
            layouts.push(layout_from_document(scene, &document)?);
            scenes.push(SceneInfo {
                index: scene,
                id: document
                    .get("scene_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| Some(format!("Image:{}", scene))),
                name: document
                    .get("scene_name")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
            documents.push(document);
        }

        info!(path = %path, scenes = scene_count, "opened through legacy bridge");
        Ok(Self {
            transport,
            path,
            layouts,
            documents,
            scenes,
        })
    }

    pub fn scene_count(&self) -> usize {
        self.layouts.len()
    }

    fn index(&self, scene: usize) -> Result<usize, FormatError> {
        if scene < self.layouts.len() {
            Ok(scene)
        } else {
            Err(FormatError::corrupt(format!(
                "scene {} requested from a bridge source with {} scenes",
                scene,
                self.layouts.len()
            )))
        }
    }

    pub fn scene_layout(&self, scene: usize) -> Result<NativeLayout, FormatError> {
        Ok(self.layouts[self.index(scene)?].clone())
    }

    pub fn native_metadata(&self, scene: usize) -> Result<NativeMetadata, FormatError> {
        let scene = self.index(scene)?;
        Ok(NativeMetadata::Bridge(BridgeNative {
            scenes: self.scenes.clone(),
            document: self.documents[scene].clone(),
        }))
    }

    /// Read one chunk, one request per channel.
    pub async fn read_chunk(
        &self,
        scene: usize,
        request: &ChunkRequest,
    ) -> Result<Bytes, FormatError> {
        self.index(scene)?;
        let mut out = Vec::with_capacity(request.expected_len(self.layouts[scene].dtype));
        for c in request.c..request.c + request.channels {
            debug!(scene, t = request.t, c, z = request.z, "bridge chunk request");
            let (_, payload) = self
                .transport
                .request(json!({
                    "op": "read_chunk",
                    "path": self.path,
                    "scene": scene,
                    "t": request.t,
                    "c": c,
                    "z": request.z,
                    "y": request.y,
                    "x": request.x,
                    "h": request.height,
                    "w": request.width,
                }))
                .await?;
            let payload = payload
                .ok_or_else(|| FormatError::Bridge("chunk response without payload".to_string()))?;
            out.extend_from_slice(&payload);
        }
        Ok(Bytes::from(out))
    }
}

fn layout_from_document(scene: usize, document: &Value) -> Result<NativeLayout, FormatError> {
    let dims = &document["dims"];
    let size = |axis: &str| dims[axis].as_u64().map(|v| v as usize);
    let (Some(size_y), Some(size_x)) = (size("y"), size("x")) else {
        return Err(FormatError::corrupt(format!(
            "bridge metadata for scene {} has no Y/X size",
            scene
        )));
    };

    let dtype_name = document["dtype"].as_str().unwrap_or("");
    let dtype = PixelType::from_ome_name(dtype_name).ok_or_else(|| {
        FormatError::corrupt(format!("bridge pixel type {:?}", dtype_name))
    })?;

    let chunk = |key: &str, full: usize| {
        document["chunk"][key]
            .as_u64()
            .map(|v| (v as usize).clamp(1, full.max(1)))
            .unwrap_or(full)
    };

    Ok(NativeLayout {
        scene,
        plane_axes: vec![
            ('T', size("t").unwrap_or(1)),
            ('C', size("c").unwrap_or(1)),
            ('Z', size("z").unwrap_or(1)),
        ],
        size_y,
        size_x,
        samples_per_pixel: 1,
        dtype,
        chunk_y: chunk("y", size_y),
        chunk_x: chunk("x", size_x),
    })
}
