//! Notification sink boundary and the SMTP email notifier.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;
use tracing::info;
use vacmon_core::VacancyRecord;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("email notifier is not configured (EMAIL_FROM, EMAIL_PASSWORD, EMAIL_TO)")]
    NotConfigured,
    #[error("invalid email address")]
    Address(#[from] lettre::address::AddressError),
    #[error("building email message")]
    Message(#[from] lettre::error::Error),
    #[error("smtp delivery failed")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// Where a batch of new-and-eligible vacancies is handed off. The engine
/// commits their ids to the dedup store only after `deliver` returns Ok,
/// so a sink must not report success for mail it did not hand to the relay.
#[async_trait]
pub trait VacancySink: Send + Sync {
    async fn deliver(&self, vacancies: &[VacancyRecord]) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub from_address: String,
    /// App password for the SMTP account, not the account password.
    pub password: String,
    pub to_address: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            smtp_host: "smtp.gmail.com".to_string(),
            smtp_port: 587,
            from_address: String::new(),
            password: String::new(),
            to_address: String::new(),
        }
    }
}

/// Sends one multipart (plain + HTML) email per batch over STARTTLS.
pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.smtp_host.is_empty()
            && !self.config.from_address.is_empty()
            && !self.config.to_address.is_empty()
    }

    /// Delivers a fixed probe vacancy so the user can verify SMTP settings.
    pub async fn send_test(&self) -> Result<(), NotifyError> {
        self.deliver(&[probe_vacancy()]).await
    }

    async fn send_message(&self, subject: &str, text: String, html: String) -> Result<(), NotifyError> {
        let message = Message::builder()
            .from(self.config.from_address.parse::<Mailbox>()?)
            .to(self.config.to_address.parse::<Mailbox>()?)
            .subject(subject)
            .multipart(MultiPart::alternative_plain_html(text, html))?;

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.smtp_host)?
            .port(self.config.smtp_port)
            .credentials(Credentials::new(
                self.config.from_address.clone(),
                self.config.password.clone(),
            ))
            .build();

        mailer.send(message).await?;
        Ok(())
    }
}

#[async_trait]
impl VacancySink for EmailNotifier {
    async fn deliver(&self, vacancies: &[VacancyRecord]) -> Result<(), NotifyError> {
        if vacancies.is_empty() {
            return Ok(());
        }
        if !self.is_configured() {
            return Err(NotifyError::NotConfigured);
        }

        let now = Utc::now();
        let subject = subject_line(vacancies.len());
        let text = render_text(vacancies, now);
        let html = render_html(vacancies, now);
        self.send_message(&subject, text, html).await?;

        info!(
            count = vacancies.len(),
            to = %self.config.to_address,
            "notification email delivered"
        );
        Ok(())
    }
}

pub fn subject_line(count: usize) -> String {
    format!("[ABC] {count} nuevas vacantes docentes")
}

pub fn render_text(vacancies: &[VacancyRecord], generated_at: DateTime<Utc>) -> String {
    let mut out = format!(
        "Se encontraron {} nuevas vacantes que coinciden con tu perfil:\n\n",
        vacancies.len()
    );
    for v in vacancies {
        out.push_str(&format!(
            "- {} ({}) | nivel: {} | escuela: {} | cierre: {}\n",
            v.position,
            v.area_codes.iter().cloned().collect::<Vec<_>>().join(", "),
            v.level,
            v.school,
            v.offer_closes.as_deref().unwrap_or("no especificado"),
        ));
    }
    out.push_str(&format!(
        "\nConsulta realizada: {}\n",
        generated_at.format("%d/%m/%Y %H:%M")
    ));
    out
}

pub fn render_html(vacancies: &[VacancyRecord], generated_at: DateTime<Utc>) -> String {
    let body = vacancies
        .iter()
        .map(render_vacancy_html)
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <style>
        body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; line-height: 1.5; color: #333; max-width: 800px; margin: 0 auto; padding: 20px; }}
        h1 {{ color: #2c5282; border-bottom: 2px solid #2c5282; padding-bottom: 10px; }}
        .footer {{ margin-top: 30px; padding-top: 20px; border-top: 1px solid #ddd; color: #666; font-size: 0.9em; }}
    </style>
</head>
<body>
    <h1>Nuevas Vacantes Docentes</h1>
    <p>Se encontraron <strong>{}</strong> nuevas vacantes que coinciden con tu perfil:</p>

    {}

    <div class="footer">
        <p><a href="https://servicios.abc.gob.ar/servaddo/">Ver todas las ofertas en el portal ABC</a></p>
        <p>Consulta realizada: {}</p>
    </div>
</body>
</html>"#,
        vacancies.len(),
        body,
        generated_at.format("%d/%m/%Y %H:%M")
    )
}

fn render_vacancy_html(vacancy: &VacancyRecord) -> String {
    let schedule = if vacancy.schedule.is_empty() {
        "No especificado".to_string()
    } else {
        let items = vacancy
            .schedule
            .iter()
            .map(|(day, hours)| format!("<li><strong>{}:</strong> {}</li>", capitalize(day), hours))
            .collect::<String>();
        format!("<ul>{items}</ul>")
    };

    let replacement = match (&vacancy.replaced_teacher, &vacancy.replacement_reason) {
        (Some(teacher), Some(reason)) => format!(
            r#"<p style="color: #666; font-size: 0.9em;">Reemplazo de: {teacher} ({reason})</p>"#
        ),
        (Some(teacher), None) => {
            format!(r#"<p style="color: #666; font-size: 0.9em;">Reemplazo de: {teacher}</p>"#)
        }
        _ => String::new(),
    };

    let row = |label: &str, value: &str| {
        format!(
            r#"<tr><td style="padding: 5px 10px 5px 0; font-weight: bold; width: 150px;">{label}:</td><td style="padding: 5px 0;">{value}</td></tr>"#
        )
    };

    format!(
        r#"<div style="border: 1px solid #ddd; border-radius: 8px; padding: 15px; margin: 10px 0; background: #f9f9f9;">
    <h3 style="color: #2c5282; margin-top: 0;">{}</h3>
    <table style="width: 100%; border-collapse: collapse;">
        {}
        {}
        {}
        {}
        {}
        {}
        {}
    </table>
    <div style="margin-top: 10px;"><strong>Horarios:</strong> {}</div>
    {}
</div>"#,
        vacancy.position,
        row("Nivel", &vacancy.level.to_uppercase()),
        row(
            "Área/Código",
            &vacancy.area_codes.iter().cloned().collect::<Vec<_>>().join(", ")
        ),
        row("Escuela", &vacancy.school),
        row("Domicilio", &vacancy.address),
        row("Turno", &format!("{} - {}", vacancy.shift, vacancy.workload)),
        row(
            "Toma posesión",
            vacancy.start_date.as_deref().unwrap_or("No especificado")
        ),
        row(
            "Cierre oferta",
            vacancy.offer_closes.as_deref().unwrap_or("No especificado")
        ),
        schedule,
        replacement,
    )
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// The vacancy sent by `send_test`.
pub fn probe_vacancy() -> VacancyRecord {
    VacancyRecord {
        id: "TEST-001".to_string(),
        position: "PROFESOR/A DE EDUCACION PRIMARIA (TEST)".to_string(),
        position_description: "Cargo de prueba".to_string(),
        area_codes: ["MAT".to_string()].into_iter().collect(),
        level: "primaria".to_string(),
        district: "patagones".to_string(),
        school: "E.P. N 1 - TEST".to_string(),
        address: "Calle Falsa 123, Carmen de Patagones".to_string(),
        shift: "M".to_string(),
        workload: "JS".to_string(),
        start_date: Some("2026-03-01".to_string()),
        offer_closes: Some("2026-02-28".to_string()),
        schedule: [
            ("lunes".to_string(), "08:00-12:00".to_string()),
            ("martes".to_string(), "08:00-12:00".to_string()),
        ]
        .into_iter()
        .collect(),
        replaced_teacher: Some("García, María".to_string()),
        replacement_reason: Some("Licencia médica".to_string()),
    }
}
