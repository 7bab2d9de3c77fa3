use std::collections::BTreeMap;
use std::path::Path;

use rand::Rng;
use tracing::{debug, error, info, warn};
use xapi_client::{CancelToken, OpaqueRef, Record, RecordExt, XApiError, XApiSession};

use crate::storage::{self, VmDefinition};

use super::{destroy_vm, VmError};

/// Rebuilds VMs from backup artefacts: a single `.xva` stream for full
/// backups, or the definition file plus its disk chain for delta backups.
pub struct RestoreEngine<'a> {
    pub session: &'a XApiSession,
    pub base_folder: &'a Path,
    pub cancel: &'a CancelToken,
}

impl RestoreEngine<'_> {
    /// PUT an `.xva` archive to `/import`. The destination SR can be
    /// remapped per VM uuid; `preserve` keeps the original identity.
    pub async fn restore_xva(
        &self,
        file: &Path,
        sr_map: Option<&BTreeMap<String, String>>,
        preserve: bool,
    ) -> Result<(), VmError> {
        let file_stem = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let file_stem = file_stem.strip_suffix(".xva").unwrap_or(&file_stem);

        // archives are named `<uuid>__<ts>__<name>`; tolerate free-form names
        let mut parts = file_stem.splitn(3, "__");
        let (vm_uuid, vm_name) = match (parts.next(), parts.next(), parts.next()) {
            (Some(uuid), Some(_ts), Some(name)) => (Some(uuid), name.to_string()),
            _ => (None, file_stem.to_string()),
        };

        info!("Restoring VM {}", vm_name);

        let sr_id = vm_uuid.and_then(|uuid| sr_map.and_then(|map| map.get(uuid).cloned()));
        self.session
            .import_vm_from_file(file, sr_id.as_deref(), preserve, &vm_name, self.cancel)
            .await?;

        debug!("VM {} restore completed", vm_name);
        Ok(())
    }

    /// Recreate a VM from a definition file: the VM record first, then
    /// every disk (full, or full plus delta) and every interface. A
    /// partially restored VM is destroyed on failure.
    pub async fn restore_delta(
        &self,
        def_file: &Path,
        sr_map: Option<&BTreeMap<String, String>>,
        network_map: Option<&BTreeMap<String, String>>,
        preserve: bool,
        auto_start: bool,
    ) -> Result<OpaqueRef, VmError> {
        let definition = storage::read_vm_definition(def_file).await?;
        let vm_name = definition
            .vm
            .str_field("name_label")
            .unwrap_or("unknown")
            .to_string();

        info!("Restoring VM {}", vm_name);
        let vm_ref = self.session.vm().create(&definition.vm).await?;

        let result = self
            .restore_attachments(&definition, &vm_ref, sr_map, network_map, preserve)
            .await;

        if let Err(e) = result {
            error!("Error restoring VM '{}': {}", vm_name, e);
            if let Err(destroy_err) = destroy_vm(self.session, &vm_ref, None).await {
                error!("Error destroying partially restored VM: {}", destroy_err);
            }
            return Err(e);
        }

        if auto_start {
            self.session.vm().start(&vm_ref).await?;
        }

        info!("VM {} restore completed", vm_name);
        Ok(vm_ref)
    }

    async fn restore_attachments(
        &self,
        definition: &VmDefinition,
        vm_ref: &OpaqueRef,
        sr_map: Option<&BTreeMap<String, String>>,
        network_map: Option<&BTreeMap<String, String>>,
        preserve: bool,
    ) -> Result<(), VmError> {
        for vbd_record in definition.vbds.values() {
            let mut vbd_record = vbd_record.clone();

            // empty drives keep their null VDI
            if let Some(old_vdi) = vbd_record.ref_field("VDI") {
                let vdi_record = definition.vdis.get(old_vdi.as_str()).ok_or_else(|| {
                    VmError::Definition(format!("no VDI record for {}", old_vdi))
                })?;
                let new_vdi = self.restore_vdi(vdi_record, sr_map).await?;
                vbd_record.set_str("VDI", new_vdi.as_str());
            }

            vbd_record.set_str("VM", vm_ref.as_str());
            self.session.vbd().create(&vbd_record).await?;
        }

        for vif_record in definition.vifs.values() {
            let mut vif_record = vif_record.clone();
            vif_record.set_str("VM", vm_ref.as_str());
            self.restore_vif(&mut vif_record, network_map, preserve)
                .await?;
        }

        Ok(())
    }

    /// Create the VDI (on a remapped or fallback SR if the original is
    /// gone) and stream its contents back in.
    async fn restore_vdi(
        &self,
        vdi_record: &Record,
        sr_map: Option<&BTreeMap<String, String>>,
    ) -> Result<OpaqueRef, VmError> {
        let mut vdi_record = vdi_record.clone();

        let sr_exists = match vdi_record.ref_field("SR") {
            Some(sr_ref) => self.session.sr().exists(&sr_ref).await?,
            None => false,
        };
        if !sr_exists {
            let sr_ref = self.resolve_sr(&vdi_record, sr_map).await?;
            vdi_record.set_str("SR", sr_ref.as_str());
        }

        let delta_restore = vdi_record.contains_key("backup_base_file");

        let vdi_ref = self.session.vdi().create(&vdi_record).await?;
        let vdi_label = self.session.vdi().label(&vdi_ref).await?;

        let result = async {
            if delta_restore {
                let base_file = vdi_record
                    .str_field("backup_base_file")
                    .ok_or_else(|| VmError::Definition("missing backup_base_file".into()))?;
                self.import_vdi_data(&vdi_ref, &vdi_label, base_file).await?;
            }
            let backup_file = vdi_record
                .str_field("backup_file")
                .ok_or_else(|| VmError::Definition("missing backup_file".into()))?;
            self.import_vdi_data(&vdi_ref, &vdi_label, backup_file).await
        }
        .await;

        if let Err(e) = result {
            error!("Error importing VDI {}: {}", vdi_label, e);
            if let Err(destroy_err) = self.session.vdi().destroy(&vdi_ref).await {
                error!("Error destroying partially restored VDI: {}", destroy_err);
            }
            return Err(e);
        }

        Ok(vdi_ref)
    }

    async fn resolve_sr(
        &self,
        vdi_record: &Record,
        sr_map: Option<&BTreeMap<String, String>>,
    ) -> Result<OpaqueRef, XApiError> {
        if let Some(map) = sr_map {
            if let Some(target) = vdi_record.str_field("uuid").and_then(|uuid| map.get(uuid)) {
                return self.session.sr().by_uuid(target).await;
            }
            if let Some(target) = vdi_record
                .str_field("SR_label")
                .and_then(|label| map.get(label))
            {
                if let Some(sr_ref) = self.session.sr().by_label(target).await?.into_iter().next()
                {
                    return Ok(sr_ref);
                }
            }
        }
        self.session.pool().default_sr().await
    }

    async fn import_vdi_data(
        &self,
        vdi_ref: &OpaqueRef,
        vdi_label: &str,
        file: &str,
    ) -> Result<(), VmError> {
        debug!("Importing VDI data of {}", vdi_label);
        let path = self.base_folder.join(file);
        self.session
            .import_vdi_from_file(vdi_ref, &path, vdi_label, self.cancel)
            .await?;
        debug!("VDI data import completed");
        Ok(())
    }

    /// Attach the interface to a still-existing network, a mapped one,
    /// one matching the recorded label, or the pool default. The MAC is
    /// regenerated unless the restore preserves identity.
    async fn restore_vif(
        &self,
        vif_record: &mut Record,
        network_map: Option<&BTreeMap<String, String>>,
        preserve: bool,
    ) -> Result<OpaqueRef, VmError> {
        let network_exists = match vif_record.ref_field("network") {
            Some(network_ref) => self.session.network().exists(&network_ref).await?,
            None => false,
        };

        if !network_exists {
            let network_ref = self.resolve_network(vif_record, network_map).await?;
            vif_record.set_str("network", network_ref.as_str());
        }

        if !preserve {
            vif_record.set_str("MAC", random_xen_mac());
        }

        Ok(self.session.vif().create(vif_record).await?)
    }

    async fn resolve_network(
        &self,
        vif_record: &Record,
        network_map: Option<&BTreeMap<String, String>>,
    ) -> Result<OpaqueRef, XApiError> {
        if let Some(map) = network_map {
            if let Some(target) = vif_record.str_field("uuid").and_then(|uuid| map.get(uuid)) {
                return self.session.network().by_uuid(target).await;
            }
            if let Some(target) = vif_record
                .str_field("network_label")
                .and_then(|label| map.get(label))
            {
                if let Some(network_ref) = self
                    .session
                    .network()
                    .by_label(target)
                    .await?
                    .into_iter()
                    .next()
                {
                    return Ok(network_ref);
                }
            }
        }

        if let Some(label) = vif_record.str_field("network_label") {
            if let Some(network_ref) = self
                .session
                .network()
                .by_label(label)
                .await?
                .into_iter()
                .next()
            {
                return Ok(network_ref);
            }
        }

        let fallback = self.session.pool().default_network().await?;
        warn!(
            "Assigning default network to interface {}",
            vif_record.str_field("device").unwrap_or("?")
        );
        Ok(fallback)
    }
}

/// A fresh locally-administered unicast MAC in the Xen range: first byte
/// `(b & 0xfc) | 0x02`, fourth byte below `0x80`.
pub fn random_xen_mac() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes[0] = (bytes[0] & 0xfc) | 0x02;
    bytes[3] &= 0x7f;
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_macs_are_locally_administered_unicast() {
        for _ in 0..256 {
            let mac = random_xen_mac();
            let bytes: Vec<u8> = mac
                .split(':')
                .map(|part| u8::from_str_radix(part, 16).unwrap())
                .collect();
            assert_eq!(bytes.len(), 6);
            assert_eq!(bytes[0] & 0x03, 0x02);
            assert!(bytes[3] <= 0x7f);
        }
    }

    #[test]
    fn generated_macs_are_well_formed() {
        let re_colon_groups = |mac: &str| {
            let parts: Vec<&str> = mac.split(':').collect();
            parts.len() == 6
                && parts.iter().all(|p| {
                    p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase())
                })
        };
        for _ in 0..64 {
            assert!(re_colon_groups(&random_xen_mac()));
        }
    }
}
