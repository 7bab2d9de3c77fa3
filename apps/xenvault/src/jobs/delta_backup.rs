use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};
use xapi_client::{types, CancelToken, OpaqueRef, RecordExt, XApiError, XApiSession};

use crate::snapshot::{self, BackupSnapKind};
use crate::storage::{self, ExportType, VmDefinition};

use super::{capture_failure, destroy_vm, FailedVms, PoolAbort, VmError};

const EXPORT_ATTEMPTS: u32 = 3;

/// Per-disk full-or-delta backup of single VMs.
///
/// The first cycle takes a `base` snapshot and exports every disk in
/// full; the snapshot is retained on the hypervisor as the diff anchor.
/// Later cycles take a transient `delta_tmp` snapshot and export each
/// disk as a delta against the matching base VDI. Disks that appeared
/// since the base was taken are exported in full and their snapshot VDIs
/// grafted onto the base through fresh VBDs, so the next cycle can diff
/// against them too.
pub struct DeltaBackup<'a> {
    pub session: &'a XApiSession,
    pub base_folder: &'a Path,
    pub cancel: &'a CancelToken,
}

impl DeltaBackup<'_> {
    /// Back up one VM; on success returns the path of the written VM
    /// definition file. Per-VM failures land in `failed_vms`; only fatal
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

        let setup = match self.locate_base_and_snapshot(vm_ref, &vm_label, num_vm, num_vms).await {
            Ok(setup) => setup,
            Err(e) => {
                let error = VmError::Api(e);
                capture_failure(failed_vms, vm_ref, "VM", &vm_label, &vm_uuid, &error)?;
                return Ok(None);
            }
        };

        let mut backup_vdis: BTreeMap<String, xapi_client::Record> = BTreeMap::new();
        let mut retain_vdis: BTreeMap<OpaqueRef, xapi_client::Record> = BTreeMap::new();

        let result = self
            .export_all(&setup, &vm_uuid, &vm_label, &mut backup_vdis, &mut retain_vdis)
            .await;

        if let Err(e) = &result {
            error!("Error during backup: {}", e);
            // nothing written this cycle may survive a failure
            for vdi_record in backup_vdis.values() {
                if let Some(backup_file) = vdi_record.str_field("backup_file") {
                    let path = self.base_folder.join(backup_file);
                    if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                        error!(
                            "Error removing VDI file {}: {}",
                            path.display(),
                            remove_err
                        );
                    }
                }
            }
            retain_vdis.clear();
        }

        // a delta_tmp snapshot never outlives the cycle; newly-full VDIs
        // are kept and re-attached to the base below
        if setup.is_delta_run() {
            let keep: BTreeSet<OpaqueRef> = retain_vdis.keys().cloned().collect();
            if let Err(e) = destroy_vm(self.session, &setup.backup_ref, Some(&keep)).await {
                error!("Error destroying delta snapshot: {}", e);
            }
            for vbd_record in retain_vdis.values() {
                if let Err(e) = self.session.vbd().create(vbd_record).await {
                    error!("Error creating new VBD for retained backup VDI: {}", e);
                }
            }
        }

        match result {
            Ok(def_path) => {
                info!("Backup of VM {} completed", vm_label);
                Ok(Some(def_path))
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

    /// Find the base snapshot and take this cycle's snapshot. Without a
    /// base this is a "base delta": the new snapshot is itself named
    /// `base` and every export is a full.
    async fn locate_base_and_snapshot(
        &self,
        vm_ref: &OpaqueRef,
        vm_label: &str,
        num_vm: usize,
        num_vms: usize,
    ) -> Result<RunSetup, XApiError> {
        let base_snaps =
            snapshot::find_backup_snapshots(self.session, vm_ref, Some(BackupSnapKind::Base))
                .await?;
        if base_snaps.len() > 1 {
            warn!("VM '{}' has more than one base backup snapshot", vm_label);
        }

        match base_snaps.into_iter().next() {
            Some(base_ref) => {
                info!(
                    "VM ({} of {}) '{}' --- Performing delta backup",
                    num_vm + 1,
                    num_vms,
                    vm_label
                );
                let backup_ref = snapshot::take_backup_snapshot(
                    self.session,
                    vm_ref,
                    BackupSnapKind::DeltaTmp,
                    vm_label,
                )
                .await?;

                // map each original disk to the base VDI that anchors its deltas
                let mut base_vdis = BTreeMap::new();
                for base_vdi in self.session.vm().disk_vdis(&base_ref).await? {
                    let original = self.session.vdi().snapshot_of(&base_vdi).await?;
                    base_vdis.insert(original, base_vdi);
                }

                Ok(RunSetup {
                    backup_ref,
                    base: Some((base_ref, base_vdis)),
                })
            }
            None => {
                info!(
                    "VM ({} of {}) '{}' --- Performing base delta (a.k.a. full) backup",
                    num_vm + 1,
                    num_vms,
                    vm_label
                );
                let backup_ref = snapshot::take_backup_snapshot(
                    self.session,
                    vm_ref,
                    BackupSnapKind::Base,
                    vm_label,
                )
                .await?;
                Ok(RunSetup {
                    backup_ref,
                    base: None,
                })
            }
        }
    }

    /// Export every disk, then persist the definition. Nothing is
    /// written to the definition file until all disks have succeeded.
    async fn export_all(
        &self,
        setup: &RunSetup,
        vm_uuid: &str,
        vm_label: &str,
        backup_vdis: &mut BTreeMap<String, xapi_client::Record>,
        retain_vdis: &mut BTreeMap<OpaqueRef, xapi_client::Record>,
    ) -> Result<PathBuf, VmError> {
        let vm_back_dir = storage::vm_backup_dir_name(vm_uuid);
        tokio::fs::create_dir_all(self.base_folder.join(&vm_back_dir)).await?;

        let snap_time = self.session.vm().snapshot_time(&setup.backup_ref).await?;
        let timestamp = types::wire_to_basic(&snap_time).map_err(XApiError::from)?;
        let human_time = types::wire_to_human(&snap_time).map_err(XApiError::from)?;

        let mut vm_record = self.session.vm().record(&setup.backup_ref).await?;
        vm_record.insert("is_a_template".into(), serde_json::Value::Bool(false));
        vm_record.set_str(
            "name_label",
            format!("{} - backup {}", vm_label, human_time),
        );

        let mut vbds = BTreeMap::new();
        for vbd_ref in self.session.vm().vbds(&setup.backup_ref).await? {
            let record = self.session.vbd().record(&vbd_ref).await?;
            vbds.insert(vbd_ref.to_string(), record);
        }

        let mut vifs = BTreeMap::new();
        for vif_ref in self.session.vm().vifs(&setup.backup_ref).await? {
            let mut record = self.session.vif().record(&vif_ref).await?;
            let network_ref = self.session.vif().network(&vif_ref).await?;
            let network_label = self.session.network().label(&network_ref).await?;
            record.set_str("network_label", network_label);
            vifs.insert(vif_ref.to_string(), record);
        }

        for (vdi_ref, vbd_ref) in self
            .session
            .vm()
            .disk_vdis_with_vbds(&setup.backup_ref)
            .await?
        {
            let record = self
                .backup_vdi(setup, &vdi_ref, &vbd_ref, &vm_back_dir, retain_vdis)
                .await?;
            backup_vdis.insert(vdi_ref.to_string(), record);
        }

        storage::write_label_marker(self.base_folder, &vm_back_dir, vm_label).await?;

        let definition = VmDefinition {
            vm: vm_record,
            vbds,
            vdis: backup_vdis.clone(),
            vifs,
        };
        let def_path =
            storage::write_vm_definition(self.base_folder, &vm_back_dir, &timestamp, &definition)
                .await?;
        Ok(def_path)
    }

    /// Export one disk as full or delta, and build its definition record
    /// (`SR_label`, `backup_file`, optionally `backup_base_file`).
    async fn backup_vdi(
        &self,
        setup: &RunSetup,
        vdi_ref: &OpaqueRef,
        vbd_ref: &OpaqueRef,
        vm_back_dir: &str,
        retain_vdis: &mut BTreeMap<OpaqueRef, xapi_client::Record>,
    ) -> Result<xapi_client::Record, VmError> {
        // the original disk this snapshot VDI was taken from
        let vm_vdi = self.session.vdi().snapshot_of(vdi_ref).await?;
        let vm_vdi_uuid = self.session.vdi().uuid(&vm_vdi).await?;
        let vdi_back_dir = format!(
            "{}/{}",
            vm_back_dir,
            storage::vdi_backup_dir_name(&vm_vdi_uuid)
        );

        let mut base_vdi = None;
        let mut base_file = None;

        if let Some((base_ref, base_vdis)) = &setup.base {
            match base_vdis.get(&vm_vdi) {
                Some(anchor) => {
                    // if the anchor's full export is missing, re-create it
                    base_file =
                        Some(self.export_vdi(anchor, &vdi_back_dir, None, false).await?);
                    base_vdi = Some(anchor.clone());
                }
                None => {
                    // disk is new in this cycle: full export now, and keep
                    // its snapshot VDI attached to the base for next time
                    let mut vbd_record = self.session.vbd().record(vbd_ref).await?;
                    vbd_record.set_str("VM", base_ref.as_str());
                    vbd_record.set_str("VDI", vdi_ref.as_str());
                    retain_vdis.insert(vdi_ref.clone(), vbd_record);
                }
            }
        }

        let backup_file = self
            .export_vdi(vdi_ref, &vdi_back_dir, base_vdi.as_ref(), true)
            .await?;

        let mut record = self.session.vdi().record(vdi_ref).await?;
        if let Some(sr_ref) = record.ref_field("SR") {
            let sr_label = self.session.sr().label(&sr_ref).await?;
            record.set_str("SR_label", sr_label);
        }
        record.set_str("backup_file", backup_file);
        if let Some(base_file) = base_file {
            record.set_str("backup_base_file", base_file);
        }
        Ok(record)
    }

    /// Stream one VDI export, retrying transient I/O failures. Returns
    /// the path of the file relative to the base folder. With
    /// `overwrite` unset an existing file is kept as-is.
    async fn export_vdi(
        &self,
        vdi_ref: &OpaqueRef,
        vdi_back_dir: &str,
        base_vdi: Option<&OpaqueRef>,
        overwrite: bool,
    ) -> Result<String, VmError> {
        let export_type = if base_vdi.is_some() {
            ExportType::Delta
        } else {
            ExportType::Full
        };

        let snap_time = self.session.vdi().snapshot_time(vdi_ref).await?;
        let timestamp = types::wire_to_basic(&snap_time).map_err(XApiError::from)?;
        let file_name = format!(
            "{}/{}",
            vdi_back_dir,
            storage::vdi_file_name(&timestamp, export_type)
        );
        let full_path = self.base_folder.join(&file_name);

        if !overwrite && full_path.exists() {
            return Ok(file_name);
        }

        tokio::fs::create_dir_all(self.base_folder.join(vdi_back_dir)).await?;
        let vdi_label = self.session.vdi().label(vdi_ref).await?;

        let mut attempts = EXPORT_ATTEMPTS;
        loop {
            attempts -= 1;
            debug!("Exporting VDI '{}' to '{}'", vdi_label, full_path.display());

            match self
                .session
                .export_vdi_to_file(vdi_ref, base_vdi, &full_path, &vdi_label, self.cancel)
                .await
            {
                Ok(()) => return Ok(file_name),
                Err(e) => {
                    if full_path.exists() {
                        if let Err(remove_err) = tokio::fs::remove_file(&full_path).await {
                            error!("Error deleting failed VDI export {}: {}", vdi_label, remove_err);
                        }
                    }
                    if e.is_retryable() && attempts > 0 {
                        warn!("Error exporting VDI {} ({}). Retrying", vdi_label, e);
                        continue;
                    }
                    error!("VDI export failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }
}

/// What a single cycle works against: the snapshot being exported and,
/// on delta runs, the base snapshot with its per-disk anchor map.
struct RunSetup {
    backup_ref: OpaqueRef,
    base: Option<(OpaqueRef, BTreeMap<OpaqueRef, OpaqueRef>)>,
}

impl RunSetup {
    fn is_delta_run(&self) -> bool {
        self.base.is_some()
    }
}
