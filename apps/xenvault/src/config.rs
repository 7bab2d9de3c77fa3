#![allow(dead_code)]
use serde::{Deserialize, Serialize};

use crate::cli::BackupType;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolConfig {
    pub name: String,
    pub master: String,
    pub username: String,
    pub password: String,
    /// VMs to skip, by uuid or label.
    #[serde(default)]
    pub excluded_vms: Vec<String>,
    #[serde(default)]
    pub test_vm_uuid: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            name: String::default(),
            master: String::default(),
            username: "root".into(),
            password: String::default(),
            excluded_vms: vec![],
            test_vm_uuid: None,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub from: String,
    pub to: String,
    /// Subject template; `{}` is replaced with the backup type.
    pub subject: String,
    /// Path of the JSON report artefact.
    pub content: String,
}

impl Default for MailConfig {
    fn default() -> MailConfig {
        MailConfig {
            host: String::default(),
            port: 587,
            user: String::default(),
            password: String::default(),
            from: String::default(),
            to: String::default(),
            subject: "{} backup report".into(),
            content: "backup-report.json".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    pub log_level: String,
    pub max_parallel_pools: usize,
    pub pools: Vec<PoolConfig>,
    pub delta_backup_dir: String,
    pub full_backup_dir: String,
    pub delta_backups_to_retain: usize,
    pub full_backups_to_retain: usize,
    pub backup_new_snap: bool,
    pub mail: MailConfig,
}

impl Default for AppConfig {
    fn default() -> AppConfig {
        AppConfig {
            log_level: "info".into(),
            max_parallel_pools: 2,
            pools: vec![],
            delta_backup_dir: ".".into(),
            full_backup_dir: ".".into(),
            delta_backups_to_retain: 1,
            full_backups_to_retain: 1,
            backup_new_snap: true,
            mail: MailConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn backup_dir(&self, backup_type: BackupType) -> &str {
        match backup_type {
            BackupType::Full => &self.full_backup_dir,
            BackupType::Delta => &self.delta_backup_dir,
        }
    }

    pub fn backups_to_retain(&self, backup_type: BackupType) -> usize {
        match backup_type {
            BackupType::Full => self.full_backups_to_retain,
            BackupType::Delta => self.delta_backups_to_retain,
        }
    }
}
