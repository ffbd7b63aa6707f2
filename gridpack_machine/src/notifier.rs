//! Email notifications for state transitions of interest. Message
//! composition is a pure function; delivery goes through a [`Mailer`] and
//! its failures are logged without affecting the transition.

use std::sync::Arc;

use camino::Utf8PathBuf;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info};

use crate::gridpack::Gridpack;
use crate::MachineConf;

const SENDER: &str = "PdmV Service Account <pdmvserv@cern.ch>";
const CC_LIST: [&str; 1] = ["pdmvserv@cern.ch"];
const RECIPIENT_DOMAIN: &str = "cern.ch";
const SIGNATURE: &str = "Sincerely,\nGridpack Machine";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    Submitted,
    Done,
    Failed,
    Reused,
    ReuseFailed,
    InvalidOutput,
}

#[derive(Debug, Clone)]
pub struct Email {
    pub subject: String,
    pub body: String,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub attachments: Vec<Utf8PathBuf>,
}

pub trait Mailer: Send + Sync {
    fn send(&self, email: &Email) -> anyhow::Result<()>;
}

/// Compose the notification for one state transition.
pub fn compose(
    kind: Notification,
    gridpack: &Gridpack,
    attachments: Vec<Utf8PathBuf>,
    service_url: &str,
    production: bool,
) -> Email {
    let gridpack_id = gridpack.id();
    let name = format!(
        "{} {} {}",
        gridpack.data.campaign, gridpack.data.dataset, gridpack.data.generator
    );
    let (subject, event) = match kind {
        Notification::Submitted => (
            format!("Gridpack {name} was submitted"),
            "job was submitted".to_string(),
        ),
        Notification::Done => (
            format!("Gridpack {name} is done"),
            "job has finished running".to_string(),
        ),
        Notification::Failed => (
            format!("Gridpack {name} job failed"),
            "job has failed".to_string(),
        ),
        Notification::Reused => (
            format!("Gridpack {name} reused an existing gridpack"),
            format!(
                "reused an existing gridpack archive {}",
                gridpack.data.archive
            ),
        ),
        Notification::ReuseFailed => (
            format!("Gridpack {name} reuse failed"),
            "could not find a gridpack archive to reuse".to_string(),
        ),
        Notification::InvalidOutput => (
            format!("Gridpack {name} has no valid output"),
            "has no valid archive to create a request from".to_string(),
        ),
    };

    let tag = if production {
        "[Gridpack]"
    } else {
        "[Gridpack-DEV]"
    };
    let mut body = format!("Hello,\n\nGridpack {name} ({gridpack_id}) {event}.\n");
    body.push_str(&format!(
        "Gridpack job: {service_url}?_id={gridpack_id}\n"
    ));
    if !attachments.is_empty() {
        body.push_str("You can find job files as an attachment.\n");
    }
    body.push_str(&format!("\n{SIGNATURE}"));

    Email {
        subject: format!("{tag} {subject}"),
        body,
        recipients: gridpack
            .users()
            .into_iter()
            .map(|user| format!("{user}@{RECIPIENT_DOMAIN}"))
            .collect(),
        cc: CC_LIST.iter().map(|cc| cc.to_string()).collect(),
        attachments,
    }
}

pub struct Notifier {
    mailer: Arc<dyn Mailer>,
    service_url: String,
    production: bool,
}

impl Notifier {
    pub fn new(mailer: Arc<dyn Mailer>, conf: &MachineConf) -> Self {
        Notifier {
            mailer,
            service_url: conf.service_url.clone(),
            production: conf.production,
        }
    }

    /// Compose and deliver; a delivery failure never fails the caller.
    pub async fn notify(
        &self,
        kind: Notification,
        gridpack: &Gridpack,
        attachments: Vec<Utf8PathBuf>,
    ) {
        let email = compose(
            kind,
            gridpack,
            attachments,
            &self.service_url,
            self.production,
        );
        info!(
            "will send \"{}\" to {}",
            email.subject,
            email.recipients.join(", ")
        );
        let mailer = self.mailer.clone();
        match tokio::task::spawn_blocking(move || mailer.send(&email)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("error sending notification: {e:#}"),
            Err(e) => error!("notification delivery task panicked: {e}"),
        }
    }
}

/// Delivery over SMTP with STARTTLS; authenticates with the service
/// account when the deployment requires it.
pub struct SmtpMailer {
    transport: SmtpTransport,
}

impl SmtpMailer {
    pub fn new(conf: &MachineConf) -> anyhow::Result<Self> {
        let mut builder = SmtpTransport::starttls_relay(&conf.smtp_host)?.port(conf.smtp_port);
        if conf.email_auth {
            builder = builder.credentials(Credentials::new(
                conf.ssh_credentials.username.clone(),
                conf.ssh_credentials.password.clone(),
            ));
        } else {
            builder = builder.authentication(Vec::new());
        }
        Ok(SmtpMailer {
            transport: builder.build(),
        })
    }
}

impl Mailer for SmtpMailer {
    fn send(&self, email: &Email) -> anyhow::Result<()> {
        let mut builder = Message::builder()
            .from(SENDER.parse::<Mailbox>()?)
            .subject(&email.subject);
        for recipient in &email.recipients {
            builder = builder.to(recipient.parse::<Mailbox>()?);
        }
        for cc in &email.cc {
            builder = builder.cc(cc.parse::<Mailbox>()?);
        }

        let message = if email.attachments.is_empty() {
            builder.body(email.body.clone())?
        } else {
            let mut multipart = MultiPart::mixed().singlepart(SinglePart::plain(email.body.clone()));
            for path in &email.attachments {
                let file_name = path.file_name().unwrap_or("attachment").to_string();
                let content = std::fs::read(path)?;
                multipart = multipart.singlepart(
                    Attachment::new(file_name)
                        .body(content, ContentType::parse("application/octet-stream")?),
                );
            }
            builder.multipart(multipart)?
        };

        self.transport.send(&message)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gridpack::tests::test_data;
    use crate::gridpack::AUTOMATIC_USER;

    fn gridpack_with_history() -> Gridpack {
        let mut gridpack = Gridpack::make(test_data("1700000000001")).unwrap();
        gridpack.add_history_entry("walter", "created");
        gridpack.add_history_entry(AUTOMATIC_USER, "submitted");
        gridpack
    }

    #[test]
    fn composition_addresses_history_users_and_cc() {
        let email = compose(
            Notification::Done,
            &gridpack_with_history(),
            Vec::new(),
            "https://gridpacks.example.org/gridpack",
            true,
        );
        assert_eq!(email.subject, "[Gridpack] Gridpack C1 D_NLO MadGraph5_aMCatNLO is done");
        assert_eq!(email.recipients, vec!["walter@cern.ch"]);
        assert_eq!(email.cc, vec!["pdmvserv@cern.ch"]);
        assert!(email
            .body
            .contains("https://gridpacks.example.org/gridpack?_id=1700000000001"));
        assert!(!email.body.contains("attachment"));
    }

    #[test]
    fn dev_deployments_tag_the_subject() {
        let email = compose(
            Notification::Failed,
            &gridpack_with_history(),
            Vec::new(),
            "https://dev.example.org",
            false,
        );
        assert!(email.subject.starts_with("[Gridpack-DEV] "));
    }

    #[test]
    fn attachments_are_mentioned_in_the_body() {
        let email = compose(
            Notification::Submitted,
            &gridpack_with_history(),
            vec![Utf8PathBuf::from("/tmp/bundle.zip")],
            "https://dev.example.org",
            false,
        );
        assert!(email.body.contains("You can find job files as an attachment."));
    }
}
