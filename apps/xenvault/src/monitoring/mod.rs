use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub mod mail;

/// The notification artefact a backup run leaves behind. A separate
/// invocation (`send-report`) turns it into an e-mail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub subject: String,
    pub body: BTreeMap<String, PoolReport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolReport {
    pub errors: Vec<String>,
    pub vms: Vec<String>,
}

impl Report {
    pub fn has_failures(&self) -> bool {
        self.body
            .values()
            .any(|pool| !pool.errors.is_empty() || !pool.vms.is_empty())
    }
}

pub async fn write_report(path: &Path, report: &Report) -> std::io::Result<()> {
    let body = serde_json::to_vec(report)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    tokio::fs::write(path, body).await
}

pub async fn read_report(path: &Path) -> std::io::Result<Report> {
    let body = tokio::fs::read(path).await?;
    serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn report_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let report = Report {
            subject: "Delta backup report".into(),
            body: BTreeMap::from([(
                "Main pool".to_string(),
                PoolReport {
                    errors: vec!["login failed".into()],
                    vms: vec![],
                },
            )]),
        };
        write_report(&path, &report).await.unwrap();
        assert_eq!(read_report(&path).await.unwrap(), report);
        assert!(report.has_failures());
    }

    #[test]
    fn empty_report_has_no_failures() {
        let report = Report {
            subject: "Full backup report".into(),
            body: BTreeMap::from([("Main pool".to_string(), PoolReport::default())]),
        };
        assert!(!report.has_failures());
    }
}
