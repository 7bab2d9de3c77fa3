//! Retention pruning. Timestamps are ISO-basic, so a lexicographic sort
//! of file names is a chronological sort.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::{debug, error};
use xapi_client::RecordExt;

use super::{read_vm_definition, vm_backup_dir_name, VDI_FILE_FORMAT, XVA_EXTENSION};

/// Keep the newest `retain` `.xva` archives of a VM, delete the rest.
pub async fn prune_xva_archives(
    base_folder: &Path,
    vm_uuid: &str,
    retain: usize,
) -> std::io::Result<()> {
    let mut archives: Vec<String> = Vec::new();
    let mut entries = tokio::fs::read_dir(base_folder).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(vm_uuid) && name.ends_with(&format!(".{}", XVA_EXTENSION)) {
            archives.push(name);
        }
    }
    archives.sort();

    let discard = archives.len().saturating_sub(retain);
    for name in &archives[..discard] {
        match tokio::fs::remove_file(base_folder.join(name)).await {
            Ok(()) => debug!("VM archive {} deleted", name),
            Err(e) => error!("Error deleting VM archive {}: {}", name, e),
        }
    }
    Ok(())
}

/// Keep the newest `retain` definition files of a VM; drop the archived
/// disks of discarded definitions and sweep every `.vhd` no retained
/// definition references.
pub async fn prune_delta_backups(
    base_folder: &Path,
    vm_uuid: &str,
    retain: usize,
) -> std::io::Result<()> {
    let vm_dir = base_folder.join(vm_backup_dir_name(vm_uuid));

    let mut def_files: Vec<String> = Vec::new();
    let mut entries = tokio::fs::read_dir(&vm_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") {
            def_files.push(name);
        }
    }
    def_files.sort();

    let discard_count = def_files.len().saturating_sub(retain);
    let mut keep_files: HashSet<PathBuf> = HashSet::new();

    for (index, def_file) in def_files.iter().enumerate() {
        let discard = index < discard_count;
        let def_path = vm_dir.join(def_file);

        if discard {
            // discarded definitions contribute nothing to the keep set;
            // the sweep below collects their disk files
            match tokio::fs::remove_file(&def_path).await {
                Ok(()) => debug!("VM definition file '{}' deleted", def_file),
                Err(e) => error!("Error deleting VM definition file {}: {}", def_file, e),
            }
            continue;
        }

        let definition = read_vm_definition(&def_path).await?;
        for vdi_record in definition.vdis.values() {
            if let Some(backup_file) = vdi_record.str_field("backup_file") {
                keep_files.insert(base_folder.join(backup_file));
            }
            // a delta stays restorable only with the full it applies to
            if let Some(base_file) = vdi_record.str_field("backup_base_file") {
                keep_files.insert(base_folder.join(base_file));
            }
        }
    }

    sweep_unreferenced(&vm_dir, &keep_files).await
}

/// Delete every `.vhd` under the VM's backup tree that is not in the
/// keep set.
async fn sweep_unreferenced(
    vm_dir: &Path,
    keep_files: &HashSet<PathBuf>,
) -> std::io::Result<()> {
    let vhd_suffix = format!(".{}", VDI_FILE_FORMAT);

    let mut dirs = vec![vm_dir.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                dirs.push(path);
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(&vhd_suffix) && !keep_files.contains(&path) {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => debug!("VDI file {} deleted", path.display()),
                    Err(e) => error!("Error deleting VDI file {}: {}", path.display(), e),
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{vdi_backup_dir_name, VmDefinition};
    use std::collections::BTreeMap;
    use xapi_client::Record;

    async fn write_definition(
        base: &Path,
        vm_uuid: &str,
        ts: &str,
        disks: &[(&str, &str, Option<&str>)],
    ) {
        let vm_dir = base.join(vm_backup_dir_name(vm_uuid));
        tokio::fs::create_dir_all(&vm_dir).await.unwrap();

        let mut vdis = BTreeMap::new();
        for (vdi_uuid, backup_file, base_file) in disks {
            let vdi_dir = base.join(vm_backup_dir_name(vm_uuid)).join(vdi_backup_dir_name(vdi_uuid));
            tokio::fs::create_dir_all(&vdi_dir).await.unwrap();
            tokio::fs::write(base.join(backup_file), b"vhd").await.unwrap();
            if let Some(base_file) = base_file {
                tokio::fs::write(base.join(base_file), b"vhd").await.unwrap();
            }

            let mut record = Record::new();
            record.set_str("uuid", *vdi_uuid);
            record.set_str("backup_file", *backup_file);
            if let Some(base_file) = base_file {
                record.set_str("backup_base_file", *base_file);
            }
            vdis.insert(format!("OpaqueRef:{}", vdi_uuid), record);
        }

        let definition = VmDefinition {
            vm: Record::new(),
            vbds: BTreeMap::new(),
            vdis,
            vifs: BTreeMap::new(),
        };
        crate::storage::write_vm_definition(
            base,
            &vm_backup_dir_name(vm_uuid),
            ts,
            &definition,
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn keeps_the_newest_definitions_and_their_disks() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        // five cycles: one full then deltas against it
        let full = "vm_u1/vdi_d1/20240101T000000_full.vhd";
        write_definition(base, "u1", "20240101T000000", &[("d1", full, None)]).await;
        for day in 2..=5 {
            let delta = format!("vm_u1/vdi_d1/2024010{}T000000_delta.vhd", day);
            tokio::fs::write(base.join(&delta), b"vhd").await.unwrap();
            write_definition(
                base,
                "u1",
                &format!("2024010{}T000000", day),
                &[("d1", &delta, Some(full))],
            )
            .await;
        }

        prune_delta_backups(base, "u1", 2).await.unwrap();

        let mut defs: Vec<String> = std::fs::read_dir(base.join("vm_u1"))
            .unwrap()
            .filter_map(|e| {
                let name = e.unwrap().file_name().to_string_lossy().into_owned();
                name.ends_with(".json").then_some(name)
            })
            .collect();
        defs.sort();
        assert_eq!(
            defs,
            vec!["20240104T000000.json", "20240105T000000.json"]
        );

        // the two retained deltas and the full they apply to survive
        assert!(base.join(full).exists());
        assert!(base.join("vm_u1/vdi_d1/20240104T000000_delta.vhd").exists());
        assert!(base.join("vm_u1/vdi_d1/20240105T000000_delta.vhd").exists());
        assert!(!base.join("vm_u1/vdi_d1/20240102T000000_delta.vhd").exists());
        assert!(!base.join("vm_u1/vdi_d1/20240103T000000_delta.vhd").exists());
    }

    #[tokio::test]
    async fn sweeps_unreferenced_disk_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        let full = "vm_u1/vdi_d1/20240101T000000_full.vhd";
        write_definition(base, "u1", "20240101T000000", &[("d1", full, None)]).await;

        // an orphan no definition references
        let orphan = base.join("vm_u1/vdi_d1/20231225T000000_full.vhd");
        tokio::fs::write(&orphan, b"vhd").await.unwrap();

        prune_delta_backups(base, "u1", 5).await.unwrap();

        assert!(base.join(full).exists());
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn prunes_xva_archives_by_uuid_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        for ts in ["20240101T000000", "20240102T000000", "20240103T000000"] {
            tokio::fs::write(base.join(format!("u1__{}__db01.xva", ts)), b"xva")
                .await
                .unwrap();
        }
        // another VM's archive is untouched
        tokio::fs::write(base.join("u2__20240101T000000__web.xva"), b"xva")
            .await
            .unwrap();

        prune_xva_archives(base, "u1", 2).await.unwrap();

        assert!(!base.join("u1__20240101T000000__db01.xva").exists());
        assert!(base.join("u1__20240102T000000__db01.xva").exists());
        assert!(base.join("u1__20240103T000000__db01.xva").exists());
        assert!(base.join("u2__20240101T000000__web.xva").exists());
    }
}
