//! JSON-over-HTTP control-plane backend.
//!
//! Talks to a control-plane bridge that exposes the [`Hypervisor`] operations
//! as plain REST resources:
//!
//! ```text
//! GET    /vms                                  -> [VmInfo]
//! GET    /vms/{vm}                             -> VmInfo
//! POST   /vms/{vm}/power/on
//! POST   /vms/{vm}/power/off
//! POST   /vms/{vm}/guest/shutdown
//! GET    /vms/{vm}/snapshots                   -> [SnapshotNode]
//! POST   /vms/{vm}/snapshots                   <- SnapshotRequest, -> {"id": ...}
//! POST   /vms/{vm}/snapshots/{id}/revert
//! DELETE /vms/{vm}/snapshots/{id}?remove_children=false
//! POST   /vms/{vm}/guest/processes             <- ProgramSpec, -> {"pid": ...}
//! GET    /vms/{vm}/guest/processes?pids=1,2    -> [GuestProcess]
//! POST   /vms/{vm}/guest/files/upload          <- {guest_path, size, overwrite}, -> {"url": ...}
//! POST   /vms/{vm}/guest/files/download        <- {guest_path}, -> {"url": ..., "size": ...}
//! ```
//!
//! File transfers are two-step: the bridge hands out a short-lived URL on the
//! host that runs the VM, and the payload goes there with a plain PUT/GET.
//! Hosts sometimes answer with a wildcard host (`https://*:443/...`), which is
//! rewritten to the configured server before use.

use super::{
    GuestProcess, Hypervisor, ProgramSpec, SnapshotId, SnapshotNode, SnapshotRequest, VmId, VmInfo,
};
use crate::runtime::options::HypervisorOptions;
use reqwest::{Client, Method, RequestBuilder, Response, header};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::time::Duration;
use vmci_shared::errors::{VmciError, VmciResult};

const USER_AGENT: &str = concat!("vmci/", env!("CARGO_PKG_VERSION"));

/// Default connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct CreatedSnapshot {
    id: SnapshotId,
}

#[derive(Debug, Deserialize)]
struct StartedProgram {
    pid: i64,
}

#[derive(Debug, Serialize)]
struct UploadRequest<'a> {
    guest_path: &'a str,
    size: usize,
    overwrite: bool,
}

#[derive(Debug, Serialize)]
struct DownloadRequest<'a> {
    guest_path: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferTicket {
    url: String,
    #[serde(default)]
    size: Option<u64>,
}

/// [`Hypervisor`] backed by the HTTP control-plane bridge.
#[derive(Debug, Clone)]
pub struct HttpHypervisor {
    client: Client,
    base_url: String,
    server_host: String,
    token: Option<String>,
    task_timeout: Duration,
}

impl HttpHypervisor {
    pub fn new(options: &HypervisorOptions) -> VmciResult<Self> {
        let base_url = options.endpoint.trim_end_matches('/').to_string();
        let parsed = reqwest::Url::parse(&base_url).map_err(|e| {
            VmciError::Config(format!("invalid hypervisor endpoint '{}': {}", base_url, e))
        })?;
        let server_host = parsed
            .host_str()
            .ok_or_else(|| VmciError::Config(format!("endpoint '{}' has no host", base_url)))?
            .to_string();

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(options.request_timeout_secs))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| VmciError::Hypervisor(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            server_host,
            token: options.token.clone(),
            task_timeout: Duration::from_secs(options.task_timeout_secs),
        })
    }

    fn vm_url(&self, vm: &VmId, tail: &str) -> String {
        format!(
            "{}/vms/{}{}",
            self.base_url,
            urlencoding::encode(vm.as_str()),
            tail
        )
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, url)
            .header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => builder.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    /// Request for a call the bridge answers only when the host task is done.
    fn task_request(&self, method: Method, url: &str) -> RequestBuilder {
        self.request(method, url).timeout(self.task_timeout)
    }

    async fn send(&self, builder: RequestBuilder, what: &str) -> VmciResult<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| VmciError::Hypervisor(format!("{what}: request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VmciError::Hypervisor(format!(
                "{what}: control plane answered {status}: {}",
                body.trim()
            )));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        what: &str,
    ) -> VmciResult<T> {
        self.send(builder, what)
            .await?
            .json::<T>()
            .await
            .map_err(|e| VmciError::Hypervisor(format!("{what}: invalid response body: {e}")))
    }
}

/// Replace a wildcard host in a transfer URL with the real server.
pub(crate) fn resolve_transfer_url(url: &str, server_host: &str) -> String {
    match url.strip_prefix("https://*:") {
        Some(rest) => format!("https://{}:{}", server_host, rest),
        None => url.to_string(),
    }
}

#[async_trait::async_trait]
impl Hypervisor for HttpHypervisor {
    async fn list_vms(&self) -> VmciResult<Vec<VmInfo>> {
        let url = format!("{}/vms", self.base_url);
        self.send_json(self.request(Method::GET, &url), "list VMs")
            .await
    }

    async fn vm_info(&self, vm: &VmId) -> VmciResult<VmInfo> {
        let url = self.vm_url(vm, "");
        self.send_json(self.request(Method::GET, &url), "get VM")
            .await
    }

    async fn power_on(&self, vm: &VmId) -> VmciResult<()> {
        let url = self.vm_url(vm, "/power/on");
        self.send(self.task_request(Method::POST, &url), "power on")
            .await?;
        Ok(())
    }

    async fn power_off(&self, vm: &VmId) -> VmciResult<()> {
        let url = self.vm_url(vm, "/power/off");
        self.send(self.request(Method::POST, &url), "power off")
            .await?;
        Ok(())
    }

    async fn shutdown_guest(&self, vm: &VmId) -> VmciResult<()> {
        let url = self.vm_url(vm, "/guest/shutdown");
        self.send(self.request(Method::POST, &url), "shutdown guest")
            .await?;
        Ok(())
    }

    async fn snapshot_tree(&self, vm: &VmId) -> VmciResult<Vec<SnapshotNode>> {
        let url = self.vm_url(vm, "/snapshots");
        self.send_json(self.request(Method::GET, &url), "list snapshots")
            .await
    }

    async fn revert_to_snapshot(&self, vm: &VmId, snapshot: &SnapshotId) -> VmciResult<()> {
        let tail = format!("/snapshots/{}/revert", urlencoding::encode(snapshot.as_str()));
        let url = self.vm_url(vm, &tail);
        self.send(self.task_request(Method::POST, &url), "revert snapshot")
            .await?;
        Ok(())
    }

    async fn create_snapshot(
        &self,
        vm: &VmId,
        request: &SnapshotRequest,
    ) -> VmciResult<SnapshotId> {
        let url = self.vm_url(vm, "/snapshots");
        let created: CreatedSnapshot = self
            .send_json(
                self.task_request(Method::POST, &url).json(request),
                "create snapshot",
            )
            .await?;
        Ok(created.id)
    }

    async fn remove_snapshot(
        &self,
        vm: &VmId,
        snapshot: &SnapshotId,
        remove_children: bool,
    ) -> VmciResult<()> {
        let tail = format!(
            "/snapshots/{}?remove_children={}",
            urlencoding::encode(snapshot.as_str()),
            remove_children
        );
        let url = self.vm_url(vm, &tail);
        self.send(self.task_request(Method::DELETE, &url), "remove snapshot")
            .await?;
        Ok(())
    }

    async fn start_program(&self, vm: &VmId, spec: &ProgramSpec) -> VmciResult<i64> {
        let url = self.vm_url(vm, "/guest/processes");
        let started: StartedProgram = self
            .send_json(self.request(Method::POST, &url).json(spec), "start program")
            .await?;
        Ok(started.pid)
    }

    async fn list_processes(&self, vm: &VmId, pids: &[i64]) -> VmciResult<Vec<GuestProcess>> {
        let pids = pids
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let url = self.vm_url(vm, &format!("/guest/processes?pids={}", pids));
        self.send_json(self.request(Method::GET, &url), "list processes")
            .await
    }

    async fn upload_file(&self, vm: &VmId, guest_path: &str, data: Vec<u8>) -> VmciResult<()> {
        let url = self.vm_url(vm, "/guest/files/upload");
        let ticket: TransferTicket = self
            .send_json(
                self.request(Method::POST, &url).json(&UploadRequest {
                    guest_path,
                    size: data.len(),
                    overwrite: true,
                }),
                "initiate upload",
            )
            .await?;

        let target = resolve_transfer_url(&ticket.url, &self.server_host);
        let response = self
            .client
            .put(&target)
            .body(data)
            .send()
            .await
            .map_err(|e| VmciError::Transfer(format!("upload of {}: {}", guest_path, e)))?;
        if !response.status().is_success() {
            return Err(VmciError::Transfer(format!(
                "error while uploading file {}: {}",
                guest_path,
                response.status()
            )));
        }
        tracing::debug!(path = guest_path, "Uploaded file into guest");
        Ok(())
    }

    async fn download_file(&self, vm: &VmId, guest_path: &str) -> VmciResult<Vec<u8>> {
        let url = self.vm_url(vm, "/guest/files/download");
        let ticket: TransferTicket = self
            .send_json(
                self.request(Method::POST, &url)
                    .json(&DownloadRequest { guest_path }),
                "initiate download",
            )
            .await?;

        let source = resolve_transfer_url(&ticket.url, &self.server_host);
        let response = self
            .client
            .get(&source)
            .send()
            .await
            .map_err(|e| VmciError::Transfer(format!("download of {}: {}", guest_path, e)))?;
        if !response.status().is_success() {
            return Err(VmciError::Transfer(format!(
                "error while downloading file {}: {}",
                guest_path,
                response.status()
            )));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| VmciError::Transfer(format!("download of {}: {}", guest_path, e)))?;
        if let Some(expected) = ticket.size
            && expected != bytes.len() as u64
        {
            tracing::warn!(
                path = guest_path,
                expected,
                received = bytes.len(),
                "Guest file size changed during download"
            );
        }
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(endpoint: &str) -> HypervisorOptions {
        HypervisorOptions {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_wildcard_host_is_rewritten() {
        assert_eq!(
            resolve_transfer_url("https://*:443/guestFile?id=1", "esxi.example.org"),
            "https://esxi.example.org:443/guestFile?id=1"
        );
    }

    #[test]
    fn test_concrete_host_is_kept() {
        let url = "https://10.0.0.5:443/guestFile?id=1";
        assert_eq!(resolve_transfer_url(url, "esxi.example.org"), url);
    }

    #[test]
    fn test_vm_url_encodes_handle() {
        let hv = HttpHypervisor::new(&options("https://bridge.example.org/api/")).unwrap();
        assert_eq!(hv.server_host, "bridge.example.org");
        assert_eq!(
            hv.vm_url(&VmId::new("vm 42"), "/power/on"),
            "https://bridge.example.org/api/vms/vm%2042/power/on"
        );
    }

    #[test]
    fn test_host_tasks_outlive_request_timeout() {
        let hv = HttpHypervisor::new(&options("https://bridge.example.org")).unwrap();
        let url = hv.vm_url(&VmId::new("vm-1"), "/snapshots/snap-1/revert");

        let task = hv.task_request(Method::POST, &url).build().unwrap();
        assert_eq!(task.timeout(), Some(&Duration::from_secs(60 * 60)));

        // Polling keeps the client-wide timeout.
        let poll = hv.request(Method::GET, &url).build().unwrap();
        assert_eq!(poll.timeout(), None);
    }

    #[test]
    fn test_invalid_endpoint_is_config_error() {
        let err = HttpHypervisor::new(&options("not a url")).unwrap_err();
        assert_eq!(err.kind(), "config");
    }
}
