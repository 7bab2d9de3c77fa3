use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use xapi_client::{types, CancelToken, OpaqueRef, XApiError, XApiSession};

use crate::snapshot::{self, BackupSnapKind};
use crate::storage;

use super::{capture_failure, destroy_vm, FailedVms, PoolAbort, VmError};

const EXPORT_ATTEMPTS: u32 = 3;

/// Full `.xva` backup of single VMs: export the retained base snapshot,
/// or a transient `full_tmp` snapshot taken for this cycle.
pub struct FullBackup<'a> {
    pub session: &'a XApiSession,
    pub base_folder: &'a Path,
    pub backup_new_snap: bool,
    pub cancel: &'a CancelToken,
}

impl FullBackup<'_> {
    /// Back up one VM. Per-VM failures land in `failed_vms`; only fatal
    /// conditions surface as an error.
    pub async fn run(
        &self,
        vm_ref: &OpaqueRef,
        failed_vms: &mut FailedVms,
        num_vm: usize,
        num_vms: usize,
    ) -> Result<Option<PathBuf>, PoolAbort> {
        let (vm_uuid, vm_label) = match self.vm_meta(vm_ref).await {
            Ok(meta) => meta,
            Err(e) => {
                capture_failure(failed_vms, vm_ref, "VM", "?", "?", &e)?;
                return Ok(None);
            }
        };

        info!(
            "VM ({} of {}) '{}' --- Performing full backup",
            num_vm + 1,
            num_vms,
            vm_label
        );

        let setup = self.choose_snapshot(vm_ref, &vm_label).await;
        let (backup_ref, delete_snapshot, original_label) = match setup {
            Ok(chosen) => chosen,
            Err(e) => {
                let error = VmError::Api(e);
                capture_failure(failed_vms, vm_ref, "VM", &vm_label, &vm_uuid, &error)?;
                return Ok(None);
            }
        };

        let result = self.export(&backup_ref, &vm_uuid, &vm_label).await;

        // the transient snapshot never survives; a retained base gets its
        // backup label back
        if delete_snapshot {
            if let Err(e) = destroy_vm(self.session, &backup_ref, None).await {
                error!("Error destroying backup snapshot: {}", e);
            }
        } else if let Err(e) = self.session.vm().set_label(&backup_ref, &original_label).await {
            error!("Error restoring backup snapshot label: {}", e);
        }

        match result {
            Ok(path) => {
                info!("Full backup of VM {} successfully completed", vm_label);
                Ok(Some(path))
            }
            Err(e) => {
                capture_failure(failed_vms, vm_ref, "VDI of VM", &vm_label, &vm_uuid, &e)?;
                Ok(None)
            }
        }
    }

    async fn vm_meta(&self, vm_ref: &OpaqueRef) -> Result<(String, String), VmError> {
        let uuid = self.session.vm().uuid(vm_ref).await?;
        let label = self.session.vm().label(vm_ref).await?;
        Ok((uuid, label))
    }

    /// Reuse the retained base snapshot unless a fresh one is requested
    /// (or none exists). Returns the snapshot, whether it is transient,
    /// and the label to restore on a retained one.
    async fn choose_snapshot(
        &self,
        vm_ref: &OpaqueRef,
        vm_label: &str,
    ) -> Result<(OpaqueRef, bool, String), XApiError> {
        let base_snaps =
            snapshot::find_backup_snapshots(self.session, vm_ref, Some(BackupSnapKind::Base))
                .await?;

        let (backup_ref, delete_snapshot) = if base_snaps.is_empty() || self.backup_new_snap {
            let snap = snapshot::take_backup_snapshot(
                self.session,
                vm_ref,
                BackupSnapKind::FullTmp,
                vm_label,
            )
            .await?;
            (snap, true)
        } else {
            if base_snaps.len() > 1 {
                warn!("VM '{}' has more than one base backup snapshot", vm_label);
            }
            (base_snaps.into_iter().next().unwrap(), false)
        };

        let original_label =
            snapshot::prepare_for_export(self.session, &backup_ref, vm_label).await?;

        Ok((backup_ref, delete_snapshot, original_label))
    }

    /// Stream the `.xva`, retrying transient I/O failures. The partial
    /// file is deleted on every failed attempt.
    async fn export(
        &self,
        backup_ref: &OpaqueRef,
        vm_uuid: &str,
        vm_label: &str,
    ) -> Result<PathBuf, VmError> {
        let snap_time = self.session.vm().snapshot_time(backup_ref).await?;
        let timestamp = types::wire_to_basic(&snap_time).map_err(XApiError::from)?;

        let file_name = storage::xva_file_name(vm_uuid, &timestamp, vm_label);
        let full_path = self.base_folder.join(&file_name);

        let mut attempts = EXPORT_ATTEMPTS;
        loop {
            attempts -= 1;
            debug!("Exporting VM '{}' to '{}'", vm_label, full_path.display());

            match self
                .session
                .export_vm_to_file(backup_ref, &full_path, vm_label, self.cancel)
                .await
            {
                Ok(()) => {
                    debug!("VM {} export completed", vm_label);
                    return Ok(full_path);
                }
                Err(e) => {
                    if full_path.exists() {
                        if let Err(remove_err) = tokio::fs::remove_file(&full_path).await {
                            error!(
                                "Error deleting failed VM export file {}: {}",
                                full_path.display(),
                                remove_err
                            );
                        }
                    }
                    if e.is_retryable() && attempts > 0 {
                        warn!("Error exporting VM {} ({}). Retrying", vm_label, e);
                        continue;
                    }
                    error!("VM export failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}
