use tracing::{error, info};
use xapi_client::{XApiError, XApiSession};

use crate::snapshot;

use super::{destroy_vm, vms_to_backup};

/// Destroy every `__backup__*` snapshot in a pool: the full wipe behind
/// the `clean` subcommand.
pub async fn clean_pool(
    session: &XApiSession,
    pool_name: &str,
    excluded_vms: &[String],
) -> Result<(), XApiError> {
    info!("Cleaning backup snapshots in pool {}", pool_name);

    for vm_ref in vms_to_backup(session, excluded_vms, None).await? {
        for snap_ref in session.vm().snapshots(&vm_ref).await? {
            let label = session.vm().label(&snap_ref).await?;
            if !snapshot::is_backup_snapshot(&label) {
                continue;
            }
            if let Err(e) = destroy_vm(session, &snap_ref, None).await {
                error!("Error destroying backup snapshot '{}': {}", label, e);
            }
        }
    }
    Ok(())
}
