//! Streaming transfers against the bulk HTTP endpoints. Every transfer
//! runs under a hypervisor task: the task id rides on the URL, the task
//! completes when the stream ends, and a local error cancels it (best
//! effort) before the error propagates.

use std::path::Path;

use reqwest::Url;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error};

use crate::cancel::CancelToken;
use crate::client::XApiSession;
use crate::error::{TransferError, XApiError};
use crate::types::OpaqueRef;

pub const VDI_FORMAT: &str = "vhd";

impl XApiSession {
    /// GET `/export` into a file. The hypervisor compresses the stream.
    pub async fn export_vm_to_file(
        &self,
        vm: &OpaqueRef,
        dest: &Path,
        task_label: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        let task_ref = self
            .task()
            .create(
                &format!("{} export", task_label),
                &format!("Exporting full VM {}", task_label),
            )
            .await
            .map_err(TransferError::Api)?;

        let url = self.bulk_url(
            "export",
            &task_ref,
            &[
                ("ref", vm.as_str().to_string()),
                ("use_compression", "true".to_string()),
            ],
        )?;

        self.run_transfer(&task_ref, self.get_to_file(url, dest, cancel))
            .await
    }

    /// PUT an `.xva` file to `/import`.
    pub async fn import_vm_from_file(
        &self,
        src: &Path,
        sr_id: Option<&str>,
        preserve: bool,
        task_label: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        let task_ref = self
            .task()
            .create(
                &format!("{} VM import", task_label),
                &format!("Importing full VM {}", task_label),
            )
            .await
            .map_err(TransferError::Api)?;

        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(sr_id) = sr_id {
            query.push(("sr_id", sr_id.to_string()));
        }
        if preserve {
            query.push(("restore", "true".to_string()));
        }
        let url = self.bulk_url("import", &task_ref, &query)?;

        self.run_transfer(&task_ref, self.put_from_file(url, src, cancel))
            .await
    }

    /// GET `/export_raw_vdi` into a file; with `base` set the stream only
    /// contains the blocks changed since that VDI.
    pub async fn export_vdi_to_file(
        &self,
        vdi: &OpaqueRef,
        base: Option<&OpaqueRef>,
        dest: &Path,
        task_label: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        let export_type = if base.is_some() { "delta" } else { "full" };
        let task_ref = self
            .task()
            .create(
                &format!("{} export", task_label),
                &format!("Exporting {} VDI {}", export_type, task_label),
            )
            .await
            .map_err(TransferError::Api)?;

        let mut query = vec![
            ("format", VDI_FORMAT.to_string()),
            ("vdi", vdi.as_str().to_string()),
        ];
        if let Some(base) = base {
            query.push(("base", base.as_str().to_string()));
        }
        let url = self.bulk_url("export_raw_vdi", &task_ref, &query)?;

        self.run_transfer(&task_ref, self.get_to_file(url, dest, cancel))
            .await
    }

    /// PUT a `.vhd` file to `/import_raw_vdi`, filling an existing VDI.
    pub async fn import_vdi_from_file(
        &self,
        vdi: &OpaqueRef,
        src: &Path,
        task_label: &str,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        let task_ref = self
            .task()
            .create(
                &format!("{} import", task_label),
                &format!("Importing VDI {}", task_label),
            )
            .await
            .map_err(TransferError::Api)?;

        let url = self.bulk_url(
            "import_raw_vdi",
            &task_ref,
            &[
                ("format", VDI_FORMAT.to_string()),
                ("vdi", vdi.as_str().to_string()),
            ],
        )?;

        self.run_transfer(&task_ref, self.put_from_file(url, src, cancel))
            .await
    }

    fn bulk_url(
        &self,
        endpoint: &str,
        task_ref: &OpaqueRef,
        query: &[(&str, String)],
    ) -> Result<Url, TransferError> {
        let mut url = self
            .master_url()
            .join(endpoint)
            .map_err(|e| TransferError::Api(XApiError::Transport(e.to_string())))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("session_id", self.session_id().as_str());
            pairs.append_pair("task_id", task_ref.as_str());
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        Ok(url)
    }

    /// Drive the transfer future; cancel the task on any local failure.
    async fn run_transfer(
        &self,
        task_ref: &OpaqueRef,
        transfer: impl std::future::Future<Output = Result<(), TransferError>>,
    ) -> Result<(), TransferError> {
        match transfer.await {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Err(cancel_err) = self.task().cancel(task_ref).await {
                    error!("Error cancelling transfer task: {}", cancel_err);
                }
                Err(e)
            }
        }
    }

    async fn get_to_file(
        &self,
        url: Url,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        debug!("GET {} -> {}", url.path(), dest.display());
        let response = tokio::select! {
            r = self.http().get(url.clone()).send() => {
                r.map_err(|e| TransferError::Http(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http(format!(
                "{} returned status {}",
                url.path(),
                status
            )));
        }

        let mut response = response;
        let mut out = tokio::fs::File::create(dest).await?;
        loop {
            let chunk = tokio::select! {
                c = response.chunk() => c.map_err(|e| TransferError::Http(e.to_string()))?,
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            };
            match chunk {
                Some(bytes) => out.write_all(&bytes).await?,
                None => break,
            }
        }
        out.flush().await?;
        Ok(())
    }

    async fn put_from_file(
        &self,
        url: Url,
        src: &Path,
        cancel: &CancelToken,
    ) -> Result<(), TransferError> {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let file = tokio::fs::File::open(src).await?;
        let length = file.metadata().await?.len();

        debug!("PUT {} <- {} ({} bytes)", url.path(), src.display(), length);
        let request = self
            .http()
            .put(url.clone())
            .header(reqwest::header::CONTENT_LENGTH, length)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(reqwest::Body::from(file));

        let response = tokio::select! {
            r = request.send() => r.map_err(|e| TransferError::Http(e.to_string()))?,
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::Http(format!(
                "{} returned status {}",
                url.path(),
                status
            )));
        }
        Ok(())
    }
}
