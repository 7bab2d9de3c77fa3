//! The command layer: per-pool fan-out for backup and clean, the
//! single-session drivers for restore and transfer, and the report
//! artefact handed to `send-report`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Context;
use thiserror::Error;
use tracing::{error, info, warn};
use xapi_client::{CancelToken, XApiError, XApiSession};

use crate::cli::{
    BackupSubCommand, BackupType, CleanSubCommand, RestoreSubCommand, TransferSubCommand,
};
use crate::config::{AppConfig, PoolConfig};
use crate::jobs::{
    clean::clean_pool, delta_backup::DeltaBackup, full_backup::FullBackup,
    restore::RestoreEngine, transfer::TransferJob, vms_to_backup, FailedVms, PoolAbort,
};
use crate::monitoring::{self, mail::MailService, PoolReport, Report};
use crate::storage::{self, pruner};

#[derive(Debug, Default)]
struct PoolStatus {
    error: Option<String>,
    failed_vms: FailedVms,
}

#[derive(Debug, Error)]
enum PoolError {
    #[error(transparent)]
    Abort(#[from] PoolAbort),
    #[error(transparent)]
    Api(#[from] XApiError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
struct BackupRunParams {
    base_dir: PathBuf,
    backup_type: BackupType,
    retain: usize,
    new_snap: bool,
    uuid_list: Vec<String>,
}

/// Back up every configured pool, bounded-parallel, and write the report
/// artefact. Returns whether any pool or VM failed.
pub async fn backup(
    config: &AppConfig,
    args: &BackupSubCommand,
    cancel: &CancelToken,
) -> eyre::Result<bool> {
    let pools = pools_for_run(config, &args.master, &args.username, &args.password)?;

    // a stale report must not survive into this run
    let report_path = PathBuf::from(&config.mail.content);
    if report_path.exists() {
        tokio::fs::remove_file(&report_path)
            .await
            .wrap_err("Error removing stale backup report")?;
    }

    let params = BackupRunParams {
        base_dir: PathBuf::from(
            args.base_dir
                .clone()
                .unwrap_or_else(|| config.backup_dir(args.backup_type).to_string()),
        ),
        backup_type: args.backup_type,
        retain: args
            .backups_to_retain
            .unwrap_or_else(|| config.backups_to_retain(args.backup_type)),
        new_snap: args.new_snapshot.unwrap_or(config.backup_new_snap),
        uuid_list: args.uuid.clone(),
    };

    info!("Backing up {} Xen pool(s)", pools.len());

    let permits = Arc::new(tokio::sync::Semaphore::new(config.max_parallel_pools.max(1)));
    let mut handles = Vec::new();
    for pool in pools {
        let permit = permits.clone().acquire_owned().await.unwrap();
        let params = params.clone();
        let cancel = cancel.clone();
        let name = pool.name.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            backup_pool(pool, params, cancel).await
        });
        handles.push((name, handle));
    }

    let mut any_failed = false;
    let mut report = Report {
        subject: report_subject(&config.mail.subject, args.backup_type),
        body: BTreeMap::new(),
    };

    for (pool_name, handle) in handles {
        let mut handle = handle;
        let mut pool_report = PoolReport::default();

        // a worker normally runs to completion; after a termination
        // request it gets a grace period to observe the token
        let joined = tokio::select! {
            result = &mut handle => result,
            _ = cancel.cancelled() => {
                match tokio::time::timeout(std::time::Duration::from_secs(10), &mut handle).await {
                    Ok(result) => result,
                    Err(_) => {
                        handle.abort();
                        error!("Backup process '{}' did not complete", pool_name);
                        any_failed = true;
                        pool_report
                            .errors
                            .push("backup process did not complete".to_string());
                        report.body.insert(pool_name, pool_report);
                        continue;
                    }
                }
            }
        };

        match joined {
            Ok(status) => {
                if let Some(pool_error) = status.error {
                    any_failed = true;
                    pool_report.errors.push(pool_error);
                }
                if !status.failed_vms.is_empty() {
                    any_failed = true;
                    pool_report.vms = status.failed_vms.into_values().collect();
                }
            }
            Err(e) => {
                error!("Backup process '{}' aborted", pool_name);
                any_failed = true;
                pool_report
                    .errors
                    .push(format!("backup process aborted: {}", e));
            }
        }
        report.body.insert(pool_name, pool_report);
    }

    monitoring::write_report(&report_path, &report)
        .await
        .wrap_err("Error writing backup report")?;

    Ok(any_failed)
}

async fn backup_pool(
    pool: PoolConfig,
    params: BackupRunParams,
    cancel: CancelToken,
) -> PoolStatus {
    let mut status = PoolStatus::default();

    let session = match XApiSession::login(&pool.master, &pool.username, &pool.password).await {
        Ok(session) => session,
        Err(e) => {
            error!("Error logging in Xen host: {}", e);
            status.error = Some(e.to_string());
            return status;
        }
    };

    if let Err(e) = run_pool_backup(&session, &pool, &params, &mut status, &cancel).await {
        warn!("Backup of pool {} aborted. Error: {}", pool.name, e);
        status.error = Some(e.to_string());
    }

    if let Err(e) = session.logout().await {
        error!("Xen logout failed: {}", e);
    }
    status
}

/// Sequential VM loop inside one pool; a fatal condition (out of space,
/// termination) stops it, everything else is captured per VM.
async fn run_pool_backup(
    session: &XApiSession,
    pool: &PoolConfig,
    params: &BackupRunParams,
    status: &mut PoolStatus,
    cancel: &CancelToken,
) -> Result<(), PoolError> {
    let pool_label = session
        .pool()
        .label()
        .await
        .unwrap_or_else(|_| pool.name.clone());

    let uuid_list = (!params.uuid_list.is_empty()).then_some(params.uuid_list.as_slice());
    let vms = vms_to_backup(session, &pool.excluded_vms, uuid_list).await?;
    let num_vms = vms.len();
    info!("Backing up {} VMs in pool {}", num_vms, pool_label);

    for (num_vm, vm_ref) in vms.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(PoolAbort::Interrupted.into());
        }

        let vm_uuid = session.vm().uuid(vm_ref).await?;
        match params.backup_type {
            BackupType::Delta => {
                let engine = DeltaBackup {
                    session,
                    base_folder: &params.base_dir,
                    cancel,
                };
                engine
                    .run(vm_ref, &mut status.failed_vms, num_vm, num_vms)
                    .await?;
                if params
                    .base_dir
                    .join(storage::vm_backup_dir_name(&vm_uuid))
                    .exists()
                {
                    pruner::prune_delta_backups(&params.base_dir, &vm_uuid, params.retain).await?;
                }
            }
            BackupType::Full => {
                let engine = FullBackup {
                    session,
                    base_folder: &params.base_dir,
                    backup_new_snap: params.new_snap,
                    cancel,
                };
                engine
                    .run(vm_ref, &mut status.failed_vms, num_vm, num_vms)
                    .await?;
                if params.base_dir.exists() {
                    pruner::prune_xva_archives(&params.base_dir, &vm_uuid, params.retain).await?;
                }
            }
        }
    }

    if status.failed_vms.is_empty() {
        info!("Backup of {} VMs in pool {} completed", num_vms, pool_label);
    } else {
        error!(
            "Backup of {} VMs in pool {} completed with errors:",
            num_vms, pool_label
        );
        for vm_error in status.failed_vms.values() {
            error!("{}", vm_error);
        }
    }
    Ok(())
}

pub async fn restore(args: &RestoreSubCommand, cancel: &CancelToken) -> eyre::Result<()> {
    let network_map = parse_mappings(&args.network_map)?;
    let storage_map = parse_mappings(&args.storage_map)?;

    let session = XApiSession::login(&args.master, &args.username, &args.password)
        .await
        .wrap_err("Error logging in Xen host")?;

    let engine = RestoreEngine {
        session: &session,
        base_folder: Path::new(&args.base_dir),
        cancel,
    };

    let result = match args.backup_type {
        BackupType::Delta => engine
            .restore_delta(
                Path::new(&args.file),
                storage_map.as_ref(),
                network_map.as_ref(),
                args.restore,
                args.start,
            )
            .await
            .map(|_| ()),
        BackupType::Full => {
            engine
                .restore_xva(Path::new(&args.file), storage_map.as_ref(), args.restore)
                .await
        }
    };

    if let Err(e) = session.logout().await {
        error!("Xen logout failed: {}", e);
    }
    result?;
    Ok(())
}

pub async fn transfer(args: &TransferSubCommand, cancel: &CancelToken) -> eyre::Result<bool> {
    let src = XApiSession::login(&args.src_master, &args.username, &args.password)
        .await
        .wrap_err("Error logging in source Xen host")?;
    let dst = match XApiSession::login(&args.dst_master, &args.username, &args.password).await {
        Ok(session) => session,
        Err(e) => {
            if let Err(logout_err) = src.logout().await {
                error!("Xen logout failed: {}", logout_err);
            }
            return Err(e).wrap_err("Error logging in destination Xen host");
        }
    };

    let job = TransferJob {
        src: &src,
        dst: &dst,
        backup_dir: Path::new(&args.base_dir),
        preserve: args.restore,
        shutdown: args.shutdown,
        cancel,
    };
    let any_failed = job.run(&args.uuid).await;

    for session in [&src, &dst] {
        if let Err(e) = session.logout().await {
            error!("Xen logout failed: {}", e);
        }
    }
    Ok(any_failed)
}

pub async fn clean(
    config: &AppConfig,
    args: &CleanSubCommand,
    cancel: &CancelToken,
) -> eyre::Result<bool> {
    let pools = pools_for_run(config, &args.master, &args.username, &args.password)?;
    info!("Cleaning {} Xen pool(s)", pools.len());

    let permits = Arc::new(tokio::sync::Semaphore::new(config.max_parallel_pools.max(1)));
    let mut handles = Vec::new();
    for pool in pools {
        let permit = permits.clone().acquire_owned().await.unwrap();
        let cancel = cancel.clone();
        let name = pool.name.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            if cancel.is_cancelled() {
                return Err(format!("clean of pool {} aborted", pool.name));
            }
            let session = XApiSession::login(&pool.master, &pool.username, &pool.password)
                .await
                .map_err(|e| format!("Error logging in Xen host: {}", e))?;
            let result = clean_pool(&session, &pool.name, &pool.excluded_vms)
                .await
                .map_err(|e| e.to_string());
            if let Err(e) = session.logout().await {
                error!("Xen logout failed: {}", e);
            }
            result
        });
        handles.push((name, handle));
    }

    let mut any_failed = false;
    for (pool_name, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Clean of pool '{}' failed: {}", pool_name, e);
                any_failed = true;
            }
            Err(e) => {
                error!("Clean process '{}' aborted: {}", pool_name, e);
                any_failed = true;
            }
        }
    }
    Ok(any_failed)
}

pub async fn send_report(config: &AppConfig) -> eyre::Result<()> {
    let report = monitoring::read_report(Path::new(&config.mail.content))
        .await
        .wrap_err("Error reading backup report")?;
    let mail_service = MailService::from_config(&config.mail).await?;
    mail_service.send_report(&report).await
}

/// CLI-provided credentials replace the configured pool list.
fn pools_for_run(
    config: &AppConfig,
    master: &Option<String>,
    username: &Option<String>,
    password: &Option<String>,
) -> eyre::Result<Vec<PoolConfig>> {
    let pools = match (master, username, password) {
        (Some(master), Some(username), Some(password)) => vec![PoolConfig {
            name: "Main pool".into(),
            master: master.clone(),
            username: username.clone(),
            password: password.clone(),
            ..PoolConfig::default()
        }],
        _ => config.pools.clone(),
    };
    eyre::ensure!(!pools.is_empty(), "No pools configured");
    Ok(pools)
}

/// `{}` in the configured subject becomes the capitalised backup type.
fn report_subject(template: &str, backup_type: BackupType) -> String {
    let type_name = match backup_type {
        BackupType::Full => "Full",
        BackupType::Delta => "Delta",
    };
    template.replacen("{}", type_name, 1)
}

/// Parse repeated `source=destination` flags into a map.
fn parse_mappings(raw: &[String]) -> eyre::Result<Option<BTreeMap<String, String>>> {
    if raw.is_empty() {
        return Ok(None);
    }
    let mut mappings = BTreeMap::new();
    for entry in raw {
        let (source, destination) = entry
            .split_once('=')
            .ok_or_else(|| eyre::eyre!("Invalid mapping '{}', expected source=destination", entry))?;
        mappings.insert(source.to_string(), destination.to_string());
    }
    Ok(Some(mappings))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mappings_parse_key_value_pairs() {
        let parsed = parse_mappings(&["int=prod".into(), "dmz=edge".into()])
            .unwrap()
            .unwrap();
        assert_eq!(parsed["int"], "prod");
        assert_eq!(parsed["dmz"], "edge");

        assert!(parse_mappings(&[]).unwrap().is_none());
        assert!(parse_mappings(&["broken".into()]).is_err());
    }

    #[test]
    fn subject_carries_the_backup_type() {
        assert_eq!(
            report_subject("{} backup report", BackupType::Delta),
            "Delta backup report"
        );
        assert_eq!(
            report_subject("{} backup report", BackupType::Full),
            "Full backup report"
        );
        assert_eq!(report_subject("plain subject", BackupType::Full), "plain subject");
    }
}
