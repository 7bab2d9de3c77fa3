//! On-disk layout of the backup tree.
//!
//! ```text
//! <base>/
//!   <vm_uuid>__<ts>__<sane-name>.xva      full backups
//!   vm_<vm_uuid>/
//!     <sane-name>                         human label marker
//!     <snap_ts>.json                      VM definition
//!     vdi_<vm_vdi_uuid>/
//!       <snap_ts>_full.vhd
//!       <snap_ts>_delta.vhd
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use xapi_client::types::basic_timestamp;
use xapi_client::Record;

pub mod pruner;

pub const VDI_FILE_FORMAT: &str = "vhd";
pub const XVA_EXTENSION: &str = "xva";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportType {
    Full,
    Delta,
}

impl ExportType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportType::Full => "full",
            ExportType::Delta => "delta",
        }
    }
}

/// Labels become path components; spaces and slashes are flattened.
pub fn sane_label(label: &str) -> String {
    label.replace(' ', "_").replace('/', "_")
}

pub fn vm_backup_dir_name(vm_uuid: &str) -> String {
    format!("vm_{}", vm_uuid)
}

pub fn vdi_backup_dir_name(vm_vdi_uuid: &str) -> String {
    format!("vdi_{}", vm_vdi_uuid)
}

pub fn xva_file_name(vm_uuid: &str, timestamp: &str, vm_label: &str) -> String {
    format!(
        "{}__{}__{}.{}",
        vm_uuid,
        timestamp,
        sane_label(vm_label),
        XVA_EXTENSION
    )
}

pub fn vdi_file_name(timestamp: &str, export_type: ExportType) -> String {
    format!(
        "{}_{}.{}",
        timestamp,
        export_type.as_str(),
        VDI_FILE_FORMAT
    )
}

pub fn now_basic() -> String {
    basic_timestamp(&chrono::Utc::now())
}

/// One delta-backup cycle of a VM: the snapshot's own record plus its
/// attachments, keyed by the opaque references they had at backup time.
/// Unknown fields ride along untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDefinition {
    pub vm: Record,
    pub vbds: BTreeMap<String, Record>,
    pub vdis: BTreeMap<String, Record>,
    pub vifs: BTreeMap<String, Record>,
}

/// Write the definition under `vm_back_dir`, named by the snapshot
/// timestamp. Returns the full path of the written file.
pub async fn write_vm_definition(
    base_folder: &Path,
    vm_back_dir: &str,
    timestamp: &str,
    definition: &VmDefinition,
) -> std::io::Result<PathBuf> {
    let path = base_folder
        .join(vm_back_dir)
        .join(format!("{}.json", timestamp));
    let body = serde_json::to_vec_pretty(definition)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(&path, body).await?;
    Ok(path)
}

pub async fn read_vm_definition(path: &Path) -> std::io::Result<VmDefinition> {
    let body = tokio::fs::read(path).await?;
    serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Human-readable marker beside the definition files.
pub async fn write_label_marker(
    base_folder: &Path,
    vm_back_dir: &str,
    vm_label: &str,
) -> std::io::Result<()> {
    let path = base_folder.join(vm_back_dir).join(sane_label(vm_label));
    tokio::fs::write(&path, vm_label).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use xapi_client::RecordExt;

    fn sample_definition() -> VmDefinition {
        let mut vm = Record::new();
        vm.set_str("uuid", "u1");
        vm.set_str("name_label", "db01 - backup 2024-03-18 09:30:05");
        vm.insert("is_a_template".into(), serde_json::Value::Bool(false));
        vm.insert(
            "other_config".into(),
            serde_json::json!({"import_task": "OpaqueRef:44", "folder": "/prod"}),
        );

        let mut vdi = Record::new();
        vdi.set_str("uuid", "d1");
        vdi.set_str("SR", "OpaqueRef:sr");
        vdi.set_str("SR_label", "Local storage");
        vdi.set_str("backup_file", "vm_u1/vdi_d1/20240318T093005_full.vhd");

        let mut vbd = Record::new();
        vbd.set_str("VDI", "OpaqueRef:vdi");
        vbd.set_str("type", "Disk");

        let mut vif = Record::new();
        vif.set_str("MAC", "aa:bb:cc:dd:ee:ff");
        vif.set_str("network_label", "int");

        VmDefinition {
            vm,
            vbds: BTreeMap::from([("OpaqueRef:vbd".to_string(), vbd)]),
            vdis: BTreeMap::from([("OpaqueRef:vdi".to_string(), vdi)]),
            vifs: BTreeMap::from([("OpaqueRef:vif".to_string(), vif)]),
        }
    }

    #[tokio::test]
    async fn definition_round_trip_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let vm_back_dir = vm_backup_dir_name("u1");
        tokio::fs::create_dir_all(dir.path().join(&vm_back_dir))
            .await
            .unwrap();

        let definition = sample_definition();
        let path = write_vm_definition(dir.path(), &vm_back_dir, "20240318T093005", &definition)
            .await
            .unwrap();
        assert!(path.ends_with("vm_u1/20240318T093005.json"));

        let read_back = read_vm_definition(&path).await.unwrap();
        assert_eq!(read_back, definition);
    }

    #[test]
    fn sane_labels_are_path_safe() {
        assert_eq!(sane_label("db server/prod 01"), "db_server_prod_01");
        assert_eq!(sane_label("plain"), "plain");
    }

    #[test]
    fn file_names_follow_the_layout() {
        assert_eq!(
            xva_file_name("u1", "20240318T093005", "db 01"),
            "u1__20240318T093005__db_01.xva"
        );
        assert_eq!(
            vdi_file_name("20240318T093005", ExportType::Full),
            "20240318T093005_full.vhd"
        );
        assert_eq!(
            vdi_file_name("20240318T093005", ExportType::Delta),
            "20240318T093005_delta.vhd"
        );
        assert_eq!(vm_backup_dir_name("u1"), "vm_u1");
        assert_eq!(vdi_backup_dir_name("d1"), "vdi_d1");
    }
}
