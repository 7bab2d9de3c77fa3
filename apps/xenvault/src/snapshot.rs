//! Naming, discovery and export preparation of backup snapshots.
//!
//! Backup snapshots are recognised by label prefix: `__backup__<kind>`,
//! optionally followed by `__<original label>`. The `base` kind is the
//! long-lived diff anchor; `delta_tmp` and `full_tmp` never outlive the
//! cycle that created them.

use tracing::debug;
use xapi_client::{types, OpaqueRef, XApiError, XApiSession};

pub const BACKUP_SNAP_PREFIX: &str = "__backup__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupSnapKind {
    Base,
    DeltaTmp,
    FullTmp,
}

impl BackupSnapKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupSnapKind::Base => "base",
            BackupSnapKind::DeltaTmp => "delta_tmp",
            BackupSnapKind::FullTmp => "full_tmp",
        }
    }
}

pub fn snapshot_label(kind: BackupSnapKind, vm_label: &str) -> String {
    if vm_label.is_empty() {
        format!("{}{}", BACKUP_SNAP_PREFIX, kind.as_str())
    } else {
        format!("{}{}__{}", BACKUP_SNAP_PREFIX, kind.as_str(), vm_label)
    }
}

pub fn is_backup_snapshot(label: &str) -> bool {
    label.starts_with(BACKUP_SNAP_PREFIX)
}

pub fn matches_kind(label: &str, kind: BackupSnapKind) -> bool {
    label
        .strip_prefix(BACKUP_SNAP_PREFIX)
        .map(|rest| rest.starts_with(kind.as_str()))
        .unwrap_or(false)
}

/// Backup snapshots of a VM, optionally narrowed to one kind.
pub async fn find_backup_snapshots(
    session: &XApiSession,
    vm: &OpaqueRef,
    kind: Option<BackupSnapKind>,
) -> Result<Vec<OpaqueRef>, XApiError> {
    let mut found = Vec::new();
    for snap_ref in session.vm().snapshots(vm).await? {
        let label = session.vm().label(&snap_ref).await?;
        let matched = match kind {
            Some(kind) => matches_kind(&label, kind),
            None => is_backup_snapshot(&label),
        };
        if matched {
            found.push(snap_ref);
        }
    }
    Ok(found)
}

pub async fn take_backup_snapshot(
    session: &XApiSession,
    vm: &OpaqueRef,
    kind: BackupSnapKind,
    vm_label: &str,
) -> Result<OpaqueRef, XApiError> {
    let label = snapshot_label(kind, vm_label);
    debug!("Taking snapshot '{}'", label);
    session.vm().snapshot(vm, &label).await
}

/// Rename a snapshot to its export name (`<label> - backup <timestamp>`)
/// and clear the template flag. Returns the label it carried before, so
/// a retained snapshot can be renamed back afterwards.
pub async fn prepare_for_export(
    session: &XApiSession,
    snapshot: &OpaqueRef,
    vm_label: &str,
) -> Result<String, XApiError> {
    let original_label = session.vm().label(snapshot).await?;
    let snap_time = session.vm().snapshot_time(snapshot).await?;
    let human_time = types::wire_to_human(&snap_time).map_err(XApiError::from)?;

    session.vm().set_is_a_template(snapshot, false).await?;
    session
        .vm()
        .set_label(snapshot, &format!("{} - backup {}", vm_label, human_time))
        .await?;

    Ok(original_label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_carry_kind_and_origin() {
        assert_eq!(
            snapshot_label(BackupSnapKind::Base, "db01"),
            "__backup__base__db01"
        );
        assert_eq!(
            snapshot_label(BackupSnapKind::DeltaTmp, ""),
            "__backup__delta_tmp"
        );
    }

    #[test]
    fn discovery_matches_by_prefix() {
        assert!(is_backup_snapshot("__backup__base__db01"));
        assert!(is_backup_snapshot("__backup__full_tmp"));
        assert!(!is_backup_snapshot("db01 - backup 2024-03-18 09:30:05"));

        assert!(matches_kind("__backup__base__db01", BackupSnapKind::Base));
        assert!(matches_kind("__backup__base", BackupSnapKind::Base));
        assert!(!matches_kind("__backup__delta_tmp__db01", BackupSnapKind::Base));
        assert!(!matches_kind("db01", BackupSnapKind::Base));
    }
}
