//! Outbound mail for quay services.
//!
//! Mail is queued onto a dedicated work queue and sent over SMTP using the
//! `[mail]` configuration section. Senders normally use [`enqueue_std`],
//! which fills in the standard headers (From, Reply-To, Message-ID, Date)
//! and queues the message with retries.

use std::sync::Arc;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use quay_core::Context;
use quay_work::{Queue, Task, WorkError};

/// Errors building or sending mail.
#[derive(Debug, Error)]
pub enum EmailError {
    #[error("expected [{0}] {1} in config")]
    MissingConfig(&'static str, &'static str),

    #[error("invalid address {0:?}")]
    InvalidAddress(String),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// The mail work queue handle carried by the request context.
#[derive(Clone)]
pub struct EmailQueue(Arc<Queue>);

impl EmailQueue {
    /// The underlying work queue, for registration with the server.
    #[must_use]
    pub fn queue(&self) -> &Arc<Queue> {
        &self.0
    }
}

/// Create the mail processing queue.
#[must_use]
pub fn new_queue() -> EmailQueue {
    EmailQueue(Arc::new(Queue::new("email")))
}

/// Attach a mail queue to a context.
#[must_use]
pub fn context(ctx: &Context, queue: EmailQueue) -> Context {
    ctx.with(queue)
}

/// Returns the mail queue for this context.
#[must_use]
pub fn for_context(ctx: &Context) -> &EmailQueue {
    ctx.expect::<EmailQueue>("email queue")
}

/// Send a message now, blocking until the SMTP dialog completes.
pub async fn send(ctx: &Context, message: Message) -> Result<(), EmailError> {
    let conf = quay_config::for_context(ctx);
    let host = conf
        .get("mail", "smtp-host")
        .ok_or(EmailError::MissingConfig("mail", "smtp-host"))?;
    let port: u16 = conf
        .get("mail", "smtp-port")
        .and_then(|p| p.parse().ok())
        .ok_or(EmailError::MissingConfig("mail", "smtp-port"))?;

    let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?.port(port);
    if let Some(user) = conf.get("mail", "smtp-user") {
        let password = conf.get("mail", "smtp-password").unwrap_or("");
        builder = builder.credentials(Credentials::new(user.to_string(), password.to_string()));
    }
    let transport = builder.build();

    transport.send(message).await?;
    Ok(())
}

/// Queue a message for delivery with the default retry policy.
pub fn enqueue(ctx: &Context, message: Message) {
    for_context(ctx).0.enqueue(new_task(message));
}

/// Build a queue task which sends `message`.
#[must_use]
pub fn new_task(message: Message) -> Task {
    Task::new(move |ctx| {
        let message = message.clone();
        async move {
            send(&ctx, message).await.map_err(|e| {
                tracing::error!(target: "email", error = %e, "error sending mail");
                match e {
                    EmailError::Smtp(_) => WorkError::transient(e),
                    _ => WorkError::permanent(e),
                }
            })
        }
    })
    .retries(10)
    .after(|_ctx, status| match &status.result {
        Ok(()) => {
            tracing::info!(target: "email", attempts = status.attempts, "mail sent");
        }
        Err(err) => {
            tracing::error!(
                target: "email",
                attempts = status.attempts,
                error = %err,
                "mail delivery failed"
            );
        }
    })
}

/// Build a message with the fleet's standard headers and queue it.
///
/// The sender address comes from `[mail] smtp-from`; replies are directed
/// to the site owner from `[sr.ht] owner-name` / `owner-email`.
pub fn enqueue_std(ctx: &Context, to: &str, subject: &str, body: String) -> Result<(), EmailError> {
    let conf = quay_config::for_context(ctx);
    let from = conf
        .get("mail", "smtp-from")
        .ok_or(EmailError::MissingConfig("mail", "smtp-from"))?;
    let owner_name = conf
        .get("sr.ht", "owner-name")
        .ok_or(EmailError::MissingConfig("sr.ht", "owner-name"))?;
    let owner_email = conf
        .get("sr.ht", "owner-email")
        .ok_or(EmailError::MissingConfig("sr.ht", "owner-email"))?;

    let from: Mailbox = from
        .parse()
        .map_err(|_| EmailError::InvalidAddress(from.to_string()))?;
    let to: Mailbox = to
        .parse()
        .map_err(|_| EmailError::InvalidAddress(to.to_string()))?;
    let reply_to: Mailbox = format!("{owner_name} <{owner_email}>")
        .parse()
        .map_err(|_| EmailError::InvalidAddress(owner_email.to_string()))?;

    let message = Message::builder()
        .from(from)
        .reply_to(reply_to)
        .to(to)
        .subject(subject)
        .message_id(None)
        .date_now()
        .header(ContentType::TEXT_PLAIN)
        .body(body)?;

    enqueue(ctx, message);
    Ok(())
}
