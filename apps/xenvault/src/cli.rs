use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about)]
pub struct XenvaultCli {
    /// Sets a custom config file
    #[clap(short, long, default_value = "config.yml")]
    pub config: String,
    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    #[clap(name = "backup", about = "Backs up VMs across the configured pools")]
    Backup(BackupSubCommand),
    #[clap(name = "restore", about = "Restores a VM from a backup")]
    Restore(RestoreSubCommand),
    #[clap(name = "transfer", about = "Transfers VMs from one pool to another")]
    Transfer(TransferSubCommand),
    #[clap(name = "clean", about = "Destroys every backup snapshot in the configured pools")]
    Clean(CleanSubCommand),
    #[clap(name = "send-report", about = "Mails the report written by the last backup run")]
    SendReport(SendReportSubCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackupType {
    Full,
    Delta,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Delta => "delta",
        }
    }
}

#[derive(Parser)]
pub struct BackupSubCommand {
    /// Master host, overriding the configured pools
    #[clap(short = 'M', long)]
    pub master: Option<String>,
    #[clap(short = 'U', long)]
    pub username: Option<String>,
    #[clap(short = 'P', long)]
    pub password: Option<String>,
    /// Backups directory
    #[clap(short = 'd', long)]
    pub base_dir: Option<String>,
    /// Type of backup to perform
    #[clap(short = 't', long = "type", value_enum, default_value = "delta")]
    pub backup_type: BackupType,
    /// Always take a new snapshot instead of exporting the retained base
    #[clap(short = 'n', long)]
    pub new_snapshot: Option<bool>,
    /// UUIDs of the VMs to back up
    #[clap(short = 'u', long = "uuid")]
    pub uuid: Vec<String>,
    /// Number of backups to retain
    #[clap(short = 'b', long)]
    pub backups_to_retain: Option<usize>,
}

#[derive(Parser)]
pub struct RestoreSubCommand {
    #[clap(short = 'M', long)]
    pub master: String,
    #[clap(short = 'U', long)]
    pub username: String,
    #[clap(short = 'P', long)]
    pub password: String,
    /// Backups directory
    #[clap(short = 'd', long, default_value = ".")]
    pub base_dir: String,
    /// Backup XVA file or VM definition
    #[clap(short = 'f', long)]
    pub file: String,
    #[clap(short = 't', long = "type", value_enum, default_value = "delta")]
    pub backup_type: BackupType,
    /// Preserve identity (uuids, MACs) instead of creating a copy
    #[clap(short = 'r', long)]
    pub restore: bool,
    /// Power the VM on after restoring
    #[clap(long)]
    pub start: bool,
    /// Network mapping, `source=destination` by uuid or label
    #[clap(long = "network-map")]
    pub network_map: Vec<String>,
    /// Storage mapping, `source=destination` by uuid or label
    #[clap(long = "storage-map")]
    pub storage_map: Vec<String>,
}

#[derive(Parser)]
pub struct TransferSubCommand {
    /// Source master host
    #[clap(long)]
    pub src_master: String,
    /// Destination master host
    #[clap(long)]
    pub dst_master: String,
    #[clap(short = 'U', long)]
    pub username: String,
    #[clap(short = 'P', long)]
    pub password: String,
    /// Directory holding the intermediate export
    #[clap(short = 'd', long, default_value = ".")]
    pub base_dir: String,
    /// UUIDs of the VMs to transfer
    #[clap(short = 'u', long = "uuid", required = true)]
    pub uuid: Vec<String>,
    /// Preserve identity on the destination pool
    #[clap(short = 'r', long)]
    pub restore: bool,
    /// Shut the VM down before exporting
    #[clap(short = 's', long)]
    pub shutdown: bool,
}

#[derive(Parser)]
pub struct CleanSubCommand {
    /// Master host, overriding the configured pools
    #[clap(short = 'M', long)]
    pub master: Option<String>,
    #[clap(short = 'U', long)]
    pub username: Option<String>,
    #[clap(short = 'P', long)]
    pub password: Option<String>,
}

#[derive(Parser)]
pub struct SendReportSubCommand {}
