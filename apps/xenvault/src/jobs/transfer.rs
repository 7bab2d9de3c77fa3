use std::path::Path;

use tracing::{error, info, warn};
use xapi_client::{CancelToken, OpaqueRef, PowerState, XApiError, XApiSession};

use crate::storage;

use super::{destroy_vm, VmError};

/// Moves VMs between pools through an intermediate `.xva` export: export
/// from the source under a transfer tag, import into the destination,
/// then give the copy its original name and power state.
pub struct TransferJob<'a> {
    pub src: &'a XApiSession,
    pub dst: &'a XApiSession,
    pub backup_dir: &'a Path,
    pub preserve: bool,
    pub shutdown: bool,
    pub cancel: &'a CancelToken,
}

impl TransferJob<'_> {
    /// Transfer each VM in turn. Returns whether any of them failed.
    pub async fn run(&self, vm_uuids: &[String]) -> bool {
        info!("Transferring {} VMs", vm_uuids.len());

        let mut any_failed = false;
        for vm_uuid in vm_uuids {
            if self.cancel.is_cancelled() {
                info!("VM transfer aborted on user request");
                any_failed = true;
                break;
            }
            match self.transfer_vm(vm_uuid).await {
                Ok(()) => info!("VM transfer completed"),
                Err(e) if e.is_cancelled() => {
                    info!("VM transfer aborted on user request");
                    any_failed = true;
                    break;
                }
                Err(e) => {
                    error!("VM transfer failed: {}", e);
                    any_failed = true;
                }
            }
        }
        any_failed
    }

    async fn transfer_vm(&self, vm_uuid: &str) -> Result<(), VmError> {
        let vm_ref = match self.src.vm().by_uuid(vm_uuid).await {
            Ok(vm_ref) => vm_ref,
            Err(XApiError::NotFound { .. }) => {
                warn!("Cannot find VM with uuid {} on the source pool", vm_uuid);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let vm_name = self.src.vm().label(&vm_ref).await?;
        let power_state = self.src.vm().power_state(&vm_ref).await?;
        info!("Transferring VM {}", vm_name);

        let result = self.transfer_inner(&vm_ref, &vm_name, power_state).await;

        if let Err(e) = &result {
            error!("VM transfer of '{}' failed: {}", vm_name, e);
            info!("Restoring old VM power state");
            if let Err(power_err) = self.src.vm().set_power_state(&vm_ref, power_state).await {
                error!("Error restoring source power state: {}", power_err);
            }
        }
        result
    }

    async fn transfer_inner(
        &self,
        vm_ref: &OpaqueRef,
        vm_name: &str,
        power_state: PowerState,
    ) -> Result<(), VmError> {
        if self.shutdown && power_state != PowerState::Halted {
            if let Err(e) = self.src.vm().shutdown(vm_ref).await {
                warn!("Error shutting down VM: {}", e);
            }
        }

        // a live VM that cannot be exported is snapshotted instead
        let take_snapshot = !self.src.vm().can_export(vm_ref).await?;

        let vm_uuid = self.src.vm().uuid(vm_ref).await?;
        let export_name = format!("{}__{}__{}", vm_uuid, storage::now_basic(), vm_name);

        let export_ref = if take_snapshot {
            let snap_ref = self.src.vm().snapshot(vm_ref, &export_name).await?;
            self.src.vm().set_is_a_template(&snap_ref, false).await?;
            snap_ref
        } else {
            self.src.vm().set_label(vm_ref, &export_name).await?;
            vm_ref.clone()
        };

        let exported_file = self.backup_dir.join(format!("{}.xva", export_name));
        let export_result = self
            .src
            .export_vm_to_file(&export_ref, &exported_file, vm_name, self.cancel)
            .await;

        // tidy the source whatever the export did
        if take_snapshot {
            if let Err(e) = destroy_vm(self.src, &export_ref, None).await {
                error!("Error destroying transfer snapshot: {}", e);
            }
        } else if let Err(e) = self.src.vm().set_label(vm_ref, vm_name).await {
            error!("Error restoring VM label: {}", e);
        }

        if let Err(e) = export_result {
            if exported_file.exists() {
                let _ = tokio::fs::remove_file(&exported_file).await;
            }
            return Err(e.into());
        }

        let import_result = self.import_to_destination(&exported_file, &export_name, vm_name, power_state).await;

        if let Err(e) = tokio::fs::remove_file(&exported_file).await {
            error!(
                "Error deleting intermediate file {}: {}",
                exported_file.display(),
                e
            );
        }
        import_result
    }

    async fn import_to_destination(
        &self,
        exported_file: &Path,
        export_name: &str,
        vm_name: &str,
        power_state: PowerState,
    ) -> Result<(), VmError> {
        self.dst
            .import_vm_from_file(exported_file, None, self.preserve, vm_name, self.cancel)
            .await?;

        let dst_vm = self
            .dst
            .vm()
            .by_label(export_name)
            .await?
            .into_iter()
            .next()
            .ok_or(XApiError::NotFound {
                class: "VM",
                ident: export_name.to_string(),
            })?;

        self.dst.vm().set_label(&dst_vm, vm_name).await?;
        self.dst.vm().set_power_state(&dst_vm, power_state).await?;
        Ok(())
    }
}
