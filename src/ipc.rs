//! IPC surface
//!
//! Newline-delimited JSON over a Unix socket. Callers issue requests
//! against object paths; monitor clients switch the connection into a
//! signal stream fed from the bus hub. Caller identity comes from the
//! socket peer credentials.

use crate::auth::CallerCreds;
use crate::bus::FacetMap;
use crate::error::Error;
use crate::nvme::NvmeManager;
use crate::ops::{self, OpContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcRequest {
    GetManagedObjects,
    GetObject { path: String },
    Monitor,
    ListJobs,
    CancelJob { id: Uuid },
    EnableModules,
    ListModules,
    ModuleOp { op: String, args: Value },

    Mount { path: String, options: Value },
    Unmount { path: String, options: Value },
    Format { path: String, options: Value },
    Unlock { path: String, passphrase: String, options: Value },
    Lock { path: String, options: Value },
    LoopSetup { file: String, options: Value },
    LoopDelete { path: String, options: Value },
    MdraidStart { path: String, options: Value },
    MdraidStop { path: String, options: Value },
    Eject { path: String, options: Value },
    PowerOff { path: String, options: Value },
    PartitionCreate { path: String, options: Value },
    PartitionDelete { path: String, options: Value },
    PartitionResize { path: String, options: Value },

    NvmeGetHost,
    NvmeSetHostNqn { nqn: String },
    NvmeSetHostId { id: String },
    NvmeConnect { subsysnqn: String, transport: String, address: Option<String>, port: Option<u16> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum IpcResponse {
    Ok { data: Value },
    Objects { objects: BTreeMap<String, FacetMap> },
    Error { error: Error },
}

pub struct IpcServer {
    socket_path: PathBuf,
    ctx: Arc<OpContext>,
    nvme: Arc<NvmeManager>,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf, ctx: Arc<OpContext>, nvme: Arc<NvmeManager>) -> Self {
        Self {
            socket_path,
            ctx,
            nvme,
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        info!("IPC listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let ctx = Arc::clone(&self.ctx);
                    let nvme = Arc::clone(&self.nvme);
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, ctx, nvme).await {
                            debug!("client closed: {}", e);
                        }
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
    }
}

async fn handle_client(
    stream: UnixStream,
    ctx: Arc<OpContext>,
    nvme: Arc<NvmeManager>,
) -> anyhow::Result<()> {
    let caller = match stream.peer_cred() {
        Ok(cred) => CallerCreds {
            uid: cred.uid(),
            gid: cred.gid(),
            pid: cred.pid(),
        },
        Err(e) => {
            error!("cannot resolve peer credentials: {}", e);
            return Ok(());
        }
    };

    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let request = match serde_json::from_str::<IpcRequest>(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = IpcResponse::Error {
                    error: Error::failed(format!("bad request: {}", e)),
                };
                writer
                    .write_all(format!("{}\n", serde_json::to_string(&response)?).as_bytes())
                    .await?;
                line.clear();
                continue;
            }
        };

        if matches!(request, IpcRequest::Monitor) {
            // The connection becomes a one-way signal stream.
            let mut rx = ctx.registry.hub.subscribe();
            let hello = IpcResponse::Ok { data: json!({ "monitoring": true }) };
            writer
                .write_all(format!("{}\n", serde_json::to_string(&hello)?).as_bytes())
                .await?;
            while let Ok(signal) = rx.recv().await {
                let text = serde_json::to_string(&signal)?;
                if writer.write_all(format!("{}\n", text).as_bytes()).await.is_err() {
                    break;
                }
            }
            return Ok(());
        }

        let response = process_request(request, caller, &ctx, &nvme).await;
        writer
            .write_all(format!("{}\n", serde_json::to_string(&response)?).as_bytes())
            .await?;
        writer.flush().await?;
        line.clear();
    }

    Ok(())
}

async fn process_request(
    request: IpcRequest,
    caller: CallerCreds,
    ctx: &Arc<OpContext>,
    nvme: &Arc<NvmeManager>,
) -> IpcResponse {
    let result: crate::error::Result<Value> = match request {
        IpcRequest::GetManagedObjects => {
            return IpcResponse::Objects {
                objects: ctx.registry.hub.snapshot(),
            };
        }
        IpcRequest::GetObject { path } => match ctx.registry.hub.object(&path) {
            Some(facets) => {
                let mut objects = BTreeMap::new();
                objects.insert(path, facets);
                return IpcResponse::Objects { objects };
            }
            None => Err(Error::failed(format!("no such object {}", path))),
        },
        IpcRequest::Monitor => unreachable!("handled by the caller"),

        IpcRequest::ListJobs => Ok(json!(ctx.jobs.list())),
        IpcRequest::CancelJob { id } => ctx.jobs.cancel(id).map(|()| json!({})),

        IpcRequest::EnableModules => {
            let loaded = ctx.registry.enable_modules();
            Ok(json!({ "newly_loaded": loaded }))
        }
        IpcRequest::ListModules => Ok(json!({
            "loaded": ctx.registry.modules_loaded(),
            "modules": ctx.registry.module_ids(),
        })),
        IpcRequest::ModuleOp { op, args } => {
            // The registry lock is only held while the module builds the
            // future; the helper runs after release.
            match ctx.registry.handle_module_manager_op(&op, &args) {
                Some(pending) => pending.await,
                None => Err(Error::NotSupported(format!("unknown manager op {}", op))),
            }
        }

        IpcRequest::Mount { path, options } => ops::mount(ctx, caller, &path, &options).await,
        IpcRequest::Unmount { path, options } => ops::unmount(ctx, caller, &path, &options).await,
        IpcRequest::Format { path, options } => ops::format(ctx, caller, &path, &options).await,
        IpcRequest::Unlock {
            path,
            passphrase,
            options,
        } => ops::unlock(ctx, caller, &path, &passphrase, &options).await,
        IpcRequest::Lock { path, options } => ops::lock(ctx, caller, &path, &options).await,
        IpcRequest::LoopSetup { file, options } => {
            ops::loop_setup(ctx, caller, &file, &options).await
        }
        IpcRequest::LoopDelete { path, options } => {
            ops::loop_delete(ctx, caller, &path, &options).await
        }
        IpcRequest::MdraidStart { path, options } => {
            ops::mdraid_start(ctx, caller, &path, &options).await
        }
        IpcRequest::MdraidStop { path, options } => {
            ops::mdraid_stop(ctx, caller, &path, &options).await
        }
        IpcRequest::Eject { path, options } => ops::eject(ctx, caller, &path, &options).await,
        IpcRequest::PowerOff { path, options } => {
            ops::power_off(ctx, caller, &path, &options).await
        }
        IpcRequest::PartitionCreate { path, options } => {
            ops::partition_create(ctx, caller, &path, &options).await
        }
        IpcRequest::PartitionDelete { path, options } => {
            ops::partition_delete(ctx, caller, &path, &options).await
        }
        IpcRequest::PartitionResize { path, options } => {
            ops::partition_resize(ctx, caller, &path, &options).await
        }

        IpcRequest::NvmeGetHost => Ok(json!({
            "hostnqn": nvme.host_nqn(),
            "hostid": nvme.host_id(),
        })),
        IpcRequest::NvmeSetHostNqn { nqn } => nvme.set_host_nqn(&nqn).map(|()| json!({})),
        IpcRequest::NvmeSetHostId { id } => nvme.set_host_id(&id).map(|()| json!({})),
        IpcRequest::NvmeConnect {
            subsysnqn,
            transport,
            address,
            port,
        } => {
            let handle = ctx
                .jobs
                .start("nvme-connect", Vec::new(), caller.uid, true);
            let mut cancel = handle.cancel.clone();
            let result = nvme
                .connect(&subsysnqn, &transport, address.as_deref(), port, &mut cancel)
                .await;
            match &result {
                Ok(()) => ctx.jobs.complete(handle.id, true, "connected"),
                Err(e) => ctx.jobs.complete(handle.id, false, &e.to_string()),
            }
            result.map(|()| json!({}))
        }
    };

    match result {
        Ok(data) => IpcResponse::Ok { data },
        Err(error) => IpcResponse::Error { error },
    }
}

/// Client side, used by the CLI subcommands.
pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn send(&self, request: IpcRequest) -> anyhow::Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let json = serde_json::to_string(&request)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        Ok(serde_json::from_str(&line)?)
    }

    pub async fn managed_objects(&self) -> anyhow::Result<BTreeMap<String, FacetMap>> {
        match self.send(IpcRequest::GetManagedObjects).await? {
            IpcResponse::Objects { objects } => Ok(objects),
            IpcResponse::Error { error } => Err(anyhow::anyhow!(error.to_string())),
            IpcResponse::Ok { .. } => Err(anyhow::anyhow!("unexpected response")),
        }
    }

    pub async fn object(&self, path: &str) -> anyhow::Result<FacetMap> {
        match self
            .send(IpcRequest::GetObject {
                path: path.to_string(),
            })
            .await?
        {
            IpcResponse::Objects { mut objects } => objects
                .remove(path)
                .ok_or_else(|| anyhow::anyhow!("object missing from response")),
            IpcResponse::Error { error } => Err(anyhow::anyhow!(error.to_string())),
            IpcResponse::Ok { .. } => Err(anyhow::anyhow!("unexpected response")),
        }
    }

    /// Stream bus signals to the callback until the daemon goes away.
    pub async fn monitor(&self, mut on_signal: impl FnMut(Value)) -> anyhow::Result<()> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        let json = serde_json::to_string(&IpcRequest::Monitor)?;
        stream.write_all(json.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        // First line is the monitoring ack.
        reader.read_line(&mut line).await?;
        line.clear();
        while reader.read_line(&mut line).await? > 0 {
            if let Ok(value) = serde_json::from_str::<Value>(&line) {
                on_signal(value);
            }
            line.clear();
        }
        Ok(())
    }

    pub async fn op(&self, request: IpcRequest) -> anyhow::Result<Value> {
        match self.send(request).await? {
            IpcResponse::Ok { data } => Ok(data),
            IpcResponse::Error { error } => Err(anyhow::anyhow!(error.to_string())),
            IpcResponse::Objects { .. } => Err(anyhow::anyhow!("unexpected response")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let request = IpcRequest::Mount {
            path: "/barrow/block_devices/sda1".into(),
            options: json!({"options": "ro"}),
        };
        let text = serde_json::to_string(&request).unwrap();
        let back: IpcRequest = serde_json::from_str(&text).unwrap();
        assert!(matches!(back, IpcRequest::Mount { .. }));
    }

    #[test]
    fn test_error_response_carries_kind() {
        let response = IpcResponse::Error {
            error: Error::DeviceBusy("sda1".into()),
        };
        let text = serde_json::to_string(&response).unwrap();
        assert!(text.contains("DeviceBusy"));
        let back: IpcResponse = serde_json::from_str(&text).unwrap();
        assert!(matches!(
            back,
            IpcResponse::Error {
                error: Error::DeviceBusy(_)
            }
        ));
    }
}
