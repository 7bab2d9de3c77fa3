use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, warn};
use xapi_client::{OpaqueRef, TransferError, XApiError, XApiSession};

pub mod clean;
pub mod delta_backup;
pub mod full_backup;
pub mod restore;
pub mod transfer;

/// Failure messages keyed by the VM's opaque reference, reported back to
/// the orchestrator instead of aborting the pool.
pub type FailedVms = BTreeMap<OpaqueRef, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    XenApi,
    Http,
    Storage,
    Generic,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::XenApi => "XenAPI",
            FailureKind::Http => "HTTP",
            FailureKind::Storage => "Storage",
            FailureKind::Generic => "Generic",
        }
    }
}

/// Fatal conditions that abort the whole pool loop. Everything else is
/// captured per VM.
#[derive(Debug, Error)]
pub enum PoolAbort {
    #[error("out of disk space: {0}")]
    OutOfSpace(String),
    #[error("terminated on external request")]
    Interrupted,
}

/// Any error a per-VM engine can hit.
#[derive(Debug, Error)]
pub enum VmError {
    #[error(transparent)]
    Api(#[from] XApiError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
    #[error("invalid backup definition: {0}")]
    Definition(String),
}

impl VmError {
    pub fn kind(&self) -> FailureKind {
        match self {
            VmError::Api(XApiError::Cancelled) => FailureKind::Generic,
            VmError::Api(_) => FailureKind::XenApi,
            VmError::Transfer(TransferError::Api(_)) => FailureKind::XenApi,
            VmError::Transfer(TransferError::Http(_)) => FailureKind::Http,
            VmError::Transfer(TransferError::Io(_)) => FailureKind::Storage,
            VmError::Transfer(TransferError::Cancelled) => FailureKind::Generic,
            VmError::Storage(_) => FailureKind::Storage,
            VmError::Definition(_) => FailureKind::Generic,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            VmError::Api(XApiError::Cancelled) | VmError::Transfer(TransferError::Cancelled)
        )
    }

    fn is_out_of_space(&self) -> bool {
        match self {
            VmError::Transfer(t) => t.is_out_of_space(),
            VmError::Storage(e) => {
                e.kind() == std::io::ErrorKind::StorageFull || e.raw_os_error() == Some(28)
            }
            _ => false,
        }
    }

    /// The condition that must stop the pool loop, if any.
    pub fn abort(&self) -> Option<PoolAbort> {
        if self.is_cancelled() {
            Some(PoolAbort::Interrupted)
        } else if self.is_out_of_space() {
            Some(PoolAbort::OutOfSpace(self.to_string()))
        } else {
            None
        }
    }
}

pub fn failure_message(
    what: &str,
    vm_label: &str,
    vm_uuid: &str,
    kind: FailureKind,
    detail: &str,
) -> String {
    format!(
        "Error exporting {} {} ({}). {} error: {}",
        what,
        vm_label,
        vm_uuid,
        kind.as_str(),
        detail
    )
}

/// Record a per-VM failure; fatal conditions become a pool abort after
/// being recorded.
pub fn capture_failure(
    failed_vms: &mut FailedVms,
    vm_ref: &OpaqueRef,
    what: &str,
    vm_label: &str,
    vm_uuid: &str,
    error: &VmError,
) -> Result<(), PoolAbort> {
    let detail = if error.is_cancelled() {
        "interrupt".to_string()
    } else {
        error.to_string()
    };
    let message = failure_message(what, vm_label, vm_uuid, error.kind(), &detail);
    error!("{} error: {}", error.kind().as_str(), detail);
    failed_vms.insert(vm_ref.clone(), message);

    match error.abort() {
        Some(abort) => Err(abort),
        None => Ok(()),
    }
}

/// Destroy a VM (usually a snapshot) along with its disk VDIs, except
/// the ones listed in `keep_vdis`. VDI destruction can race the
/// hypervisor's own teardown, so it is retried a few times and then
/// given up on.
pub async fn destroy_vm(
    session: &XApiSession,
    vm_ref: &OpaqueRef,
    keep_vdis: Option<&BTreeSet<OpaqueRef>>,
) -> Result<(), XApiError> {
    let label = session.vm().label(vm_ref).await?;
    let vdi_refs = session.vm().disk_vdis(vm_ref).await?;

    debug!("Destroying VM '{}'", label);
    session.vm().destroy(vm_ref).await?;

    for vdi_ref in vdi_refs {
        if keep_vdis.map_or(false, |keep| keep.contains(&vdi_ref)) {
            continue;
        }
        let mut retries = 3;
        loop {
            match session.vdi().destroy(&vdi_ref).await {
                Ok(()) => break,
                Err(_) => {
                    retries -= 1;
                    if retries == 0 {
                        warn!("Error destroying VDI");
                        break;
                    }
                    warn!("Error destroying VDI. Retrying in 5 seconds");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }
    Ok(())
}

/// The VMs a pool run operates on: an explicit uuid list (misses are
/// logged and skipped) or every real VM minus the exclusions.
pub async fn vms_to_backup(
    session: &XApiSession,
    excluded_vms: &[String],
    vm_uuid_list: Option<&[String]>,
) -> Result<Vec<OpaqueRef>, XApiError> {
    if let Some(uuids) = vm_uuid_list.filter(|list| !list.is_empty()) {
        let mut vms = Vec::new();
        for uuid in uuids {
            match session.vm().by_uuid(uuid).await {
                Ok(vm_ref) => vms.push(vm_ref),
                Err(XApiError::NotFound { .. }) => {
                    warn!("Cannot find VM with uuid {}", uuid);
                }
                Err(e) => return Err(e),
            }
        }
        return Ok(vms);
    }

    let mut vms = Vec::new();
    for vm_ref in session.vm().all_real().await? {
        let uuid = session.vm().uuid(&vm_ref).await?;
        let label = session.vm().label(&vm_ref).await?;
        if excluded_vms.iter().any(|x| *x == uuid || *x == label) {
            debug!("Skipping excluded VM '{}' [{}]", label, uuid);
            continue;
        }
        vms.push(vm_ref);
    }
    Ok(vms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_messages_name_the_vm_and_category() {
        let message = failure_message(
            "VDI of VM",
            "db01",
            "0a1b2c",
            FailureKind::Storage,
            "no space left on device",
        );
        assert_eq!(
            message,
            "Error exporting VDI of VM db01 (0a1b2c). Storage error: no space left on device"
        );
    }

    #[test]
    fn enospc_aborts_the_pool() {
        let error = VmError::Storage(std::io::Error::from_raw_os_error(28));
        assert_eq!(error.kind(), FailureKind::Storage);
        assert!(matches!(error.abort(), Some(PoolAbort::OutOfSpace(_))));

        let transfer = VmError::Transfer(TransferError::Io(std::io::Error::from_raw_os_error(28)));
        assert!(matches!(transfer.abort(), Some(PoolAbort::OutOfSpace(_))));
    }

    #[test]
    fn cancellation_aborts_the_pool() {
        let error = VmError::Transfer(TransferError::Cancelled);
        assert_eq!(error.kind(), FailureKind::Generic);
        assert!(matches!(error.abort(), Some(PoolAbort::Interrupted)));
    }

    #[test]
    fn plain_failures_are_captured_not_fatal() {
        let http = VmError::Transfer(TransferError::Http("status 500".into()));
        assert_eq!(http.kind(), FailureKind::Http);
        assert!(http.abort().is_none());

        let api = VmError::Api(XApiError::Failure {
            code: "SR_FULL".into(),
            details: vec![],
        });
        assert_eq!(api.kind(), FailureKind::XenApi);
        assert!(api.abort().is_none());

        let mut failed = FailedVms::new();
        let vm_ref = OpaqueRef::from("OpaqueRef:1");
        capture_failure(&mut failed, &vm_ref, "VDI of VM", "db01", "u1", &http).unwrap();
        assert!(failed[&vm_ref].contains("HTTP error"));
    }
}
