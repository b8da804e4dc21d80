//! Mail composition.
//!
//! [`Emailer`] turns each [`Notification`] into zero or more [`Mail`]s and
//! hands them to a [`MailTransport`]. Addressing rules:
//!
//! - the operator is mailed at `<operator>@<domain>` unless they are the
//!   schedule or a local user
//! - the script's success or fail list is added to `to`
//! - QA is copied on build mail, engine leads on QA changes and IT on
//!   publish failures
//! - the oversight list is blind-copied on everything

use async_trait::async_trait;
use buildfarm_config::MailConfig;
use buildfarm_core::{AUTO_TIMER, Error, Notification, Notifier, Result, RunSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Operator recorded for builds started from the agent's own console.
pub const LOCAL_USER: &str = "LocalUser";

const SUBJECT_PREFIX: &str = "[BUILDER]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MailPriority {
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mail {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
    pub priority: MailPriority,
}

/// Delivers composed mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<()>;
}

pub struct Emailer {
    mail: MailConfig,
    transport: Arc<dyn MailTransport>,
}

/// Add each `;` or `,` separated address once, keeping order.
fn add_addresses(list: &mut Vec<String>, addresses: &str) {
    for address in addresses.split([';', ',']).map(str::trim).filter(|a| !a.is_empty()) {
        if !list.iter().any(|a| a.eq_ignore_ascii_case(address)) {
            list.push(address.to_string());
        }
    }
}

fn add_all(list: &mut Vec<String>, addresses: &[String]) {
    for address in addresses {
        add_addresses(list, address);
    }
}

fn plural(count: i64, unit: &str) -> String {
    format!("{count} {unit}(s)")
}

/// `'<desc>' started at X and ended at Y taking [H hour(s) ][M minute(s) ]S second(s)`.
pub fn build_time(description: &str, started: DateTime<Utc>, ended: DateTime<Utc>) -> String {
    let total = (ended - started).num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, total / 60 % 60, total % 60);

    let mut taking = String::new();
    if hours > 0 {
        taking.push_str(&plural(hours, "hour"));
        taking.push(' ');
    }
    if hours > 0 || minutes > 0 {
        taking.push_str(&plural(minutes, "minute"));
        taking.push(' ');
    }
    taking.push_str(&plural(seconds, "second"));

    format!(
        "'{description}' started at {} and ended at {} taking {taking}",
        started.format("%Y-%m-%d %H:%M:%S"),
        ended.format("%Y-%m-%d %H:%M:%S"),
    )
}

impl Emailer {
    pub fn new(mail: MailConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self { mail, transport }
    }

    fn operator_address(&self, operator: &str) -> Option<String> {
        let operator = operator.trim();
        if operator.is_empty()
            || operator.eq_ignore_ascii_case(AUTO_TIMER)
            || operator.eq_ignore_ascii_case(LOCAL_USER)
        {
            return None;
        }
        if operator.contains('@') || self.mail.domain.is_empty() {
            Some(operator.to_string())
        } else {
            Some(format!("{operator}@{}", self.mail.domain))
        }
    }

    fn mail(&self, subject: String, body: String) -> Mail {
        let mut bcc = Vec::new();
        add_all(&mut bcc, &self.mail.oversight);
        Mail {
            from: self.mail.sender.clone(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc,
            subject: format!("{SUBJECT_PREFIX} {subject}"),
            body,
            priority: MailPriority::Normal,
        }
    }

    /// Mail about a run, addressed to its operator and `list`.
    fn run_mail(&self, run: &RunSummary, list: &str, subject: String, body: String) -> Mail {
        let mut mail = self.mail(subject, body);
        if let Some(operator) = self.operator_address(&run.operator) {
            mail.to.push(operator);
        }
        add_addresses(&mut mail.to, list);
        mail
    }

    fn with_time(run: &RunSummary, mut body: String) -> String {
        let ended = run.ended_at.unwrap_or_else(Utc::now);
        if !body.is_empty() {
            body.push_str("\n\n");
        }
        body.push_str(&build_time(&run.description, run.started_at, ended));
        body
    }

    /// Build mail with the label, folder and changes.
    fn build_mail(&self, run: &RunSummary, subject: String, headline: String) -> Mail {
        let mut body = headline;
        body.push_str(&format!("\n\nChangelist: {}", run.changelist));
        if !run.label.is_empty() {
            body.push_str(&format!("\nLabel: {}", run.label));
        }
        if !run.folder.is_empty() {
            body.push_str(&format!("\nFolder: {}", run.folder));
        }
        body.push_str(&format!("\nBuilt on: {}", run.machine));
        if !run.changes.is_empty() {
            body.push_str("\n\n");
            body.push_str(run.changes.trim_end());
        }
        let mut mail = self.run_mail(run, &run.success_address, subject, Self::with_time(run, body));
        add_all(&mut mail.cc, &self.mail.qa);
        mail
    }

    pub fn compose(&self, notification: &Notification) -> Vec<Mail> {
        let mail = match notification {
            Notification::Triggered(run) => {
                let body = format!("'{}' was triggered by {} and is building on {}", run.description, run.operator, run.machine);
                self.run_mail(
                    run,
                    &run.trigger_address,
                    format!("'{}' triggered", run.description),
                    body,
                )
            }
            Notification::Killed(run) => {
                let body = format!("'{}' was killed by {} on {}", run.description, run.killer, run.machine);
                let mut mail = self.run_mail(
                    run,
                    &run.fail_address,
                    format!("'{}' KIA", run.description),
                    Self::with_time(run, body),
                );
                if let Some(killer) = self.operator_address(&run.killer) {
                    add_addresses(&mut mail.to, &killer);
                }
                mail
            }
            Notification::Failed { run, message, cc_it } => {
                let body = format!(
                    "'{}' failed on {} at changelist {}\n\n{}",
                    run.description,
                    run.machine,
                    run.changelist,
                    message.trim_end()
                );
                let mut mail = self.run_mail(
                    run,
                    &run.fail_address,
                    format!("'{}' failed", run.description),
                    Self::with_time(run, body),
                );
                if *cc_it {
                    add_all(&mut mail.cc, &self.mail.it);
                }
                mail.priority = MailPriority::High;
                mail
            }
            Notification::Succeeded(run) => self.build_mail(
                run,
                format!("New build: '{}'", run.description),
                format!("'{}' built successfully", run.description),
            ),
            Notification::Promoted(run) => self.build_mail(
                run,
                format!("Build promoted: '{}'", run.description),
                format!("'{}' promoted {} successfully", run.description, run.label),
            ),
            Notification::Published(run) => self.build_mail(
                run,
                format!("Build published: '{}'", run.description),
                format!("'{}' published {} successfully", run.description, run.folder),
            ),
            Notification::InstallMade(run) => self.build_mail(
                run,
                format!("Installable build made: '{}'", run.description),
                format!("'{}' made an installable build of {}", run.description, run.folder),
            ),
            Notification::UpToDate(run) => {
                let body = format!(
                    "'{}' is already up to date at changelist {}; nothing new was submitted",
                    run.description, run.changelist
                );
                self.run_mail(
                    run,
                    &run.success_address,
                    format!("'{}' up to date", run.description),
                    Self::with_time(run, body),
                )
            }
            Notification::QaChanges { run, submitters } => {
                let mut mail = self.mail(
                    format!("Changes in QA build '{}'", run.description),
                    format!(
                        "The following changes are in QA build {} (changelist {})\n\n{}",
                        run.label,
                        run.changelist,
                        run.changes.trim_end()
                    ),
                );
                for submitter in submitters {
                    if let Some(address) = self.operator_address(submitter) {
                        add_addresses(&mut mail.to, &address);
                    }
                }
                add_all(&mut mail.cc, &self.mail.engine_leads);
                mail
            }
            Notification::AlreadyInProgress { operator, description } => {
                let mut mail = self.mail(
                    format!("'{description}' already in progress"),
                    format!("'{description}' is already building; the retrigger was ignored"),
                );
                if let Some(address) = self.operator_address(operator) {
                    mail.to.push(address);
                }
                mail
            }
            Notification::Status { run, report } => self.run_mail(
                run,
                &run.success_address,
                format!("Storage status from {}", run.machine),
                report.clone(),
            ),
            Notification::Glitch { machine, line } => {
                let mut mail = self.mail(format!("Network glitch on {machine}"), line.clone());
                mail.to = std::mem::take(&mut mail.bcc);
                mail
            }
            Notification::RedFlash { run, sms } => {
                let mut mail = self.mail(
                    format!("'{}' failed", run.description),
                    format!("'{}' failed on {}", run.description, run.machine),
                );
                add_addresses(&mut mail.to, sms);
                mail.priority = MailPriority::High;
                mail
            }
        };

        if mail.to.is_empty() && mail.cc.is_empty() && mail.bcc.is_empty() {
            return Vec::new();
        }
        vec![mail]
    }
}

#[async_trait]
impl Notifier for Emailer {
    async fn notify(&self, notification: Notification) -> Result<()> {
        for mail in self.compose(&notification) {
            info!(subject = %mail.subject, to = ?mail.to, "Sending mail");
            self.transport
                .send(&mail)
                .await
                .map_err(|e| Error::Notification(format!("failed to send '{}': {e}", mail.subject)))?;
        }
        Ok(())
    }
}
