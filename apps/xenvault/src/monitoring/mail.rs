use eyre::Context;
use lettre::{AsyncSmtpTransport, AsyncTransport};

use crate::config::MailConfig;

use super::Report;

#[derive(Debug, Clone)]
pub struct MailService {
    from: String,
    to: String,
    mailer: lettre::AsyncSmtpTransport<lettre::Tokio1Executor>,
}

impl MailService {
    pub async fn from_config(config: &MailConfig) -> eyre::Result<Self> {
        // create mailer; STARTTLS the way the relay expects it
        let mut mailer =
            AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&config.host)?
                .port(config.port);
        match (config.user.as_str(), config.password.as_str()) {
            ("", "") => (),
            (user, pass) => {
                mailer =
                    mailer.credentials(lettre::transport::smtp::authentication::Credentials::new(
                        user.to_string(),
                        pass.to_string(),
                    ))
            }
        };
        let mailer = mailer.build();

        let mail_service = MailService {
            mailer,
            from: config.from.clone(),
            to: config.to.clone(),
        };

        // test connection
        mail_service.test_conn().await?;

        Ok(mail_service)
    }

    pub async fn test_conn(&self) -> eyre::Result<()> {
        match self.mailer.test_connection().await {
            Ok(_) => Ok(()),
            Err(e) => Err(eyre::eyre!("Failed to connect to SMTP server: {}", e)),
        }
    }

    pub async fn send_report(&self, report: &Report) -> eyre::Result<()> {
        let email = lettre::Message::builder()
            .from(self.from.parse()?)
            .to(self.to.parse()?)
            .subject(report.subject.as_str())
            .body(format_report_body(report))
            .wrap_err("Failed to build report mail")?;

        match self.mailer.send(email).await {
            Ok(_) => Ok(()),
            Err(e) => Err(eyre::eyre!("Failed to send email: {}", e)),
        }
    }
}

/// Plain-text rendering: one section per pool, backup errors first, then
/// the per-VM export failures.
pub fn format_report_body(report: &Report) -> String {
    let mut body = String::new();
    for (pool_name, pool_report) in &report.body {
        body.push_str(pool_name);
        body.push_str("\n\n");
        body.push_str("Backup errors:\n\t");
        body.push_str(&pool_report.errors.join("\n\t"));
        body.push('\n');
        body.push_str("VMs export errors:\n\t");
        body.push_str(&pool_report.vms.join("\n\t"));
        body.push('\n');
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::PoolReport;
    use std::collections::BTreeMap;

    #[test]
    fn body_lists_pools_in_sections() {
        let report = Report {
            subject: "Delta backup report".into(),
            body: BTreeMap::from([
                (
                    "lab".to_string(),
                    PoolReport {
                        errors: vec![],
                        vms: vec!["Error exporting VDI of VM db01 (u1). HTTP error: 500".into()],
                    },
                ),
                (
                    "prod".to_string(),
                    PoolReport {
                        errors: vec!["login failed".into()],
                        vms: vec![],
                    },
                ),
            ]),
        };

        let body = format_report_body(&report);
        assert!(body.contains("lab\n\n"));
        assert!(body.contains("prod\n\n"));
        assert!(body.contains("Backup errors:\n\tlogin failed"));
        assert!(body.contains("VMs export errors:\n\tError exporting VDI of VM db01"));
    }
}
