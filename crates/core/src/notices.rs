use std::fmt;

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Info => "info",
            Self::Success => "ok",
            Self::Warning => "warn",
            Self::Error => "error",
        })
    }
}

/// Transient user-facing message (a toast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
    /// Set when the notice offers an undo for a pending mutation.
    pub undoable: bool,
}

#[derive(Debug, Clone)]
pub struct Notifier {
    sender: mpsc::UnboundedSender<Notice>,
}

#[derive(Debug)]
pub struct NoticeFeed {
    receiver: mpsc::UnboundedReceiver<Notice>,
}

#[must_use]
pub fn notice_channel() -> (Notifier, NoticeFeed) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Notifier { sender }, NoticeFeed { receiver })
}

impl Notifier {
    pub fn push(&self, level: NoticeLevel, message: impl Into<String>) {
        self.send(Notice {
            level,
            message: message.into(),
            undoable: false,
        });
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Info, message);
    }

    pub fn success(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Success, message);
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Warning, message);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(NoticeLevel::Error, message);
    }

    pub fn undoable(&self, message: impl Into<String>) {
        self.send(Notice {
            level: NoticeLevel::Info,
            message: message.into(),
            undoable: true,
        });
    }

    fn send(&self, notice: Notice) {
        if self.sender.send(notice).is_err() {
            tracing::debug!("notice dropped, no receiver attached");
        }
    }
}

impl NoticeFeed {
    pub async fn recv(&mut self) -> Option<Notice> {
        self.receiver.recv().await
    }

    /// Everything queued so far, without waiting.
    pub fn drain(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        while let Ok(notice) = self.receiver.try_recv() {
            notices.push(notice);
        }
        notices
    }
}

#[cfg(test)]
mod tests {
    use super::{notice_channel, NoticeLevel};

    #[test]
    fn drain_returns_notices_in_send_order() {
        let (notifier, mut feed) = notice_channel();
        notifier.success("saved");
        notifier.undoable("3 reports deleted");
        notifier.error("boom");

        let notices = feed.drain();
        assert_eq!(notices.len(), 3);
        assert_eq!(notices[0].level, NoticeLevel::Success);
        assert!(notices[1].undoable);
        assert_eq!(notices[2].message, "boom");
        assert!(feed.drain().is_empty());
    }

    #[test]
    fn sending_without_receiver_is_harmless() {
        let (notifier, feed) = notice_channel();
        drop(feed);
        notifier.info("nobody listening");
    }
}
