//! Throttled new-listing alerts.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::error::NotifyError;
use super::types::Listing;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailMessage {
    pub from: String,
    pub subject: String,
    pub html: String,
}

/// The outbound `send(message, recipient)` capability.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage, recipient: &str) -> Result<(), NotifyError>;
}

#[async_trait]
impl<T: MailTransport + ?Sized> MailTransport for Box<T> {
    async fn send(&self, message: &MailMessage, recipient: &str) -> Result<(), NotifyError> {
        (**self).send(message, recipient).await
    }
}

/// Posts messages as JSON to an HTTP mail relay.
pub struct HttpMailRelay {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct RelayPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

impl HttpMailRelay {
    pub fn new(client: reqwest::Client, endpoint: String, token: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            token,
        }
    }
}

#[async_trait]
impl MailTransport for HttpMailRelay {
    async fn send(&self, message: &MailMessage, recipient: &str) -> Result<(), NotifyError> {
        let payload = RelayPayload {
            from: &message.from,
            to: recipient,
            subject: &message.subject,
            html: &message.html,
        };
        let mut req = self.client.post(&self.endpoint).json(&payload);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let res = req.send().await?;
        let status = res.status();
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

/// Logs the rendered message instead of sending it.
pub struct LogMailer;

#[async_trait]
impl MailTransport for LogMailer {
    async fn send(&self, message: &MailMessage, recipient: &str) -> Result<(), NotifyError> {
        info!(to = recipient, subject = %message.subject, "dry run mail:\n{}", message.html);
        Ok(())
    }
}

/// When the last alert went out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationState {
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl NotificationState {
    /// Nothing sent yet; the first batch is never throttled.
    pub fn never_sent() -> Self {
        Self::default()
    }

    /// Treats `at` as the last send, throttling anything inside the first window.
    pub fn sent_at(at: DateTime<Utc>) -> Self {
        Self {
            last_sent_at: Some(at),
        }
    }
}

pub struct Notifier<M> {
    transport: M,
    sender: String,
    recipient: String,
    throttle: Duration,
    state: NotificationState,
}

impl<M: MailTransport> Notifier<M> {
    pub fn new(
        transport: M,
        sender: String,
        recipient: String,
        throttle: Duration,
        state: NotificationState,
    ) -> Self {
        Self {
            transport,
            sender,
            recipient,
            throttle,
            state,
        }
    }

    pub fn state(&self) -> NotificationState {
        self.state
    }

    /// Sends one alert for `listings` unless there is nothing to report or
    /// the throttle window since the last successful send is still open.
    ///
    /// `last_sent_at` only moves on a successful dispatch.
    pub async fn maybe_notify(&mut self, listings: &[Listing], now: DateTime<Utc>) -> bool {
        if listings.is_empty() {
            info!("no new listings to notify");
            return false;
        }
        if let Some(last) = self.state.last_sent_at {
            if now - last < self.throttle {
                warn!(
                    pending = listings.len(),
                    "email notification throttled, try again later"
                );
                return false;
            }
        }

        let message = render_message(&self.sender, listings);
        match self.transport.send(&message, &self.recipient).await {
            Ok(()) => {
                self.state.last_sent_at = Some(now);
                info!(count = listings.len(), "notification sent successfully");
                true
            }
            Err(err) => {
                error!("failed to send notification: {err}");
                false
            }
        }
    }
}

pub fn render_message(sender: &str, listings: &[Listing]) -> MailMessage {
    let mut html = String::from("<h3>New Listings Found:</h3><ul>");
    for listing in listings {
        let title = escape_html(&listing.title);
        let link = escape_html(&listing.link);
        html.push_str(&format!(
            "<li>Title: {title}<br>Link: <a href='{link}'>{link}</a><br>Price: {}</li>",
            listing.price
        ));
    }
    html.push_str("</ul>");

    MailMessage {
        from: sender.to_string(),
        subject: format!("New listings found ({})", listings.len()),
        html,
    }
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorder {
        sent: Arc<Mutex<Vec<(MailMessage, String)>>>,
        fail: bool,
    }

    #[async_trait]
    impl MailTransport for Recorder {
        async fn send(&self, message: &MailMessage, recipient: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Rejected {
                    status: 503,
                    body: "relay down".to_string(),
                });
            }
            self.sent
                .lock()
                .unwrap()
                .push((message.clone(), recipient.to_string()));
            Ok(())
        }
    }

    fn listing(title: &str) -> Listing {
        Listing {
            title: title.to_string(),
            link: format!("https://a.example/{title}"),
            price: 1500,
        }
    }

    fn notifier(recorder: Recorder, state: NotificationState) -> Notifier<Recorder> {
        Notifier::new(
            recorder,
            "watch@example.com".to_string(),
            "me@example.com".to_string(),
            Duration::hours(1),
            state,
        )
    }

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-01-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[tokio::test]
    async fn second_send_inside_window_is_throttled() {
        let recorder = Recorder::default();
        let mut n = notifier(recorder.clone(), NotificationState::never_sent());

        assert!(n.maybe_notify(&[listing("a")], t0()).await);
        assert!(!n.maybe_notify(&[listing("b")], t0() + Duration::minutes(59)).await);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
        assert_eq!(n.state().last_sent_at, Some(t0()));
    }

    #[tokio::test]
    async fn sends_again_after_window() {
        let recorder = Recorder::default();
        let mut n = notifier(recorder.clone(), NotificationState::never_sent());

        assert!(n.maybe_notify(&[listing("a")], t0()).await);
        assert!(n.maybe_notify(&[listing("b")], t0() + Duration::minutes(61)).await);
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn empty_batch_never_sends_or_touches_state() {
        let recorder = Recorder::default();
        let mut n = notifier(recorder.clone(), NotificationState::never_sent());

        assert!(!n.maybe_notify(&[], t0()).await);
        assert_eq!(n.state(), NotificationState::never_sent());
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_dispatch_leaves_window_unconsumed() {
        let mut n = notifier(
            Recorder {
                fail: true,
                ..Recorder::default()
            },
            NotificationState::never_sent(),
        );
        assert!(!n.maybe_notify(&[listing("a")], t0()).await);
        assert_eq!(n.state().last_sent_at, None);
    }

    #[tokio::test]
    async fn run_start_state_suppresses_first_window() {
        let recorder = Recorder::default();
        let mut n = notifier(recorder.clone(), NotificationState::sent_at(t0()));

        assert!(!n.maybe_notify(&[listing("a")], t0() + Duration::minutes(5)).await);
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn message_lists_every_listing_escaped() {
        let msg = render_message(
            "watch@example.com",
            &[
                listing("loft"),
                Listing {
                    title: "a <b> & c".to_string(),
                    link: "https://a.example/q?a=1&b=2".to_string(),
                    price: 1999,
                },
            ],
        );

        assert_eq!(msg.subject, "New listings found (2)");
        assert!(msg.html.starts_with("<h3>New Listings Found:</h3><ul>"));
        assert!(msg.html.contains(
            "<li>Title: loft<br>Link: <a href='https://a.example/loft'>https://a.example/loft</a><br>Price: 1500</li>"
        ));
        assert!(msg.html.contains("Title: a &lt;b&gt; &amp; c"));
        assert!(msg.html.contains("href='https://a.example/q?a=1&amp;b=2'"));
        assert!(msg.html.ends_with("</ul>"));
    }
}
