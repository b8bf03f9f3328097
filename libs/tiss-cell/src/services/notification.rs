use quick_xml::escape::escape;
use reqwest::Client;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use shared_config::AppConfig;

use crate::models::{format_money, Clinic, InsuranceOperator, TissBatch};

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Mail service not configured")]
    NotConfigured,

    #[error("Mail HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mail API error ({status}): {message}")]
    Api { status: u16, message: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html: String,
}

/// Transactional mail API client (`POST {base}/emails`, bearer key).
pub struct MailClient {
    client: Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl MailClient {
    pub fn new(config: &AppConfig) -> Result<Self, MailError> {
        if !config.is_mail_configured() {
            return Err(MailError::NotConfigured);
        }

        Ok(Self {
            client: Client::new(),
            api_url: config.mail_api_url.trim_end_matches('/').to_string(),
            api_key: config.mail_api_key.clone(),
            from: config.mail_from.clone(),
        })
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub async fn send_mail(&self, message: &MailMessage) -> Result<(), MailError> {
        let url = format!("{}/emails", self.api_url);
        debug!("Sending mail '{}' to {:?}", message.subject, message.to);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(message)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("Mail API rejected message: {} - {}", status, body);
            return Err(MailError::Api { status: status.as_u16(), message: body });
        }

        Ok(())
    }
}

pub fn batch_created_message(
    from: &str,
    clinic: &Clinic,
    operator: &InsuranceOperator,
    batch: &TissBatch,
) -> Option<MailMessage> {
    let to = clinic.email.as_deref().map(str::trim).filter(|email| !email.is_empty())?;

    let html = format!(
        "<p>Olá, equipe {clinic}.</p>\
         <p>O lote TISS <strong>{number}</strong> da operadora {operator} referente a {month:02}/{year} foi gerado.</p>\
         <p>Guias: {guides}<br/>Valor total: R$ {total}</p>\
         <p>Revise o lote e gere o XML para envio à operadora.</p>",
        clinic = escape(clinic.name.as_str()),
        number = escape(batch.batch_number.as_str()),
        operator = escape(operator.name.as_str()),
        month = batch.reference_month,
        year = batch.reference_year,
        guides = batch.total_guides,
        total = format_brl(&format_money(batch.total_value)),
    );

    Some(MailMessage {
        from: from.to_string(),
        to: vec![to.to_string()],
        subject: format!("Lote TISS {} gerado - {}", batch.batch_number, operator.name),
        html,
    })
}

/// `1234.50` -> `1234,50`
fn format_brl(amount: &str) -> String {
    amount.replace('.', ",")
}

/// Best-effort clinic notifications for the monthly batching job.
pub struct BatchNotifier {
    mail: Option<MailClient>,
}

impl BatchNotifier {
    pub fn new(config: &AppConfig) -> Self {
        let mail = match MailClient::new(config) {
            Ok(client) => Some(client),
            Err(_) => {
                warn!("Mail service not configured; batch notifications are disabled");
                None
            }
        };
        Self { mail }
    }

    pub async fn notify_batch_created(
        &self,
        clinic: &Clinic,
        operator: &InsuranceOperator,
        batch: &TissBatch,
    ) -> Result<(), MailError> {
        let Some(mail) = &self.mail else {
            return Ok(());
        };

        let Some(message) = batch_created_message(mail.sender(), clinic, operator, batch) else {
            warn!("Clinic {} has no e-mail; skipping notification for batch {}", clinic.id, batch.batch_number);
            return Ok(());
        };

        mail.send_mail(&message).await?;
        info!("Notified clinic {} about batch {}", clinic.id, batch.batch_number);
        Ok(())
    }
}
