//! Notification sinks.
//!
//! `LogNotifier` writes alerts to the process log and never fails; it is the
//! fallback when no remote endpoint is configured. `TelegramNotifier` posts
//! to the Telegram Bot API.

pub mod telegram;

use std::time::Duration;

use crate::dispatch::{DeliveryError, Notification, NotificationSink};

pub use telegram::{TelegramNotifier, DEFAULT_API_BASE};

#[derive(Debug, Default)]
pub struct LogNotifier;

impl NotificationSink for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    fn deliver(&self, notification: &Notification, _timeout: Duration) -> Result<(), DeliveryError> {
        log::warn!(
            "[alert -> {}] {}{}",
            notification.destination,
            notification.text.replace('\n', " | "),
            if notification.image.is_some() {
                " (snapshot attached)"
            } else {
                ""
            }
        );
        Ok(())
    }
}
