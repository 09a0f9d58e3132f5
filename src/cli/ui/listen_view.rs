use std::fmt::{self, Display, Formatter};

use crate::cli::listen::{ListenNotification, ListenStopReason, ListenSummary};
use crate::gatt::AttributeHandle;
use crate::utils::format_hex;

use super::painter::Painter;
use super::table::Table;

/// Renders the line printed once notifications are enabled.
pub(crate) struct ListenReadyView<'a> {
    handle: AttributeHandle,
    max_notifications: Option<usize>,
    painter: &'a Painter,
}

impl<'a> ListenReadyView<'a> {
    pub(crate) fn new(
        handle: AttributeHandle,
        max_notifications: Option<usize>,
        painter: &'a Painter,
    ) -> Self {
        Self {
            handle,
            max_notifications,
            painter,
        }
    }
}

impl Display for ListenReadyView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let until = match self.max_notifications {
            Some(limit) => format!("(up to {limit} notifications)"),
            None => "(Ctrl+C to stop)".to_string(),
        };
        write!(
            f,
            "{} {} {}",
            self.painter.heading("Listening on"),
            self.painter.handle(self.handle),
            self.painter.muted(until)
        )
    }
}

/// Renders a single notification line.
pub(crate) struct ListenNotificationView<'a> {
    notification: &'a ListenNotification,
    painter: &'a Painter,
}

impl<'a> ListenNotificationView<'a> {
    pub(crate) fn new(notification: &'a ListenNotification, painter: &'a Painter) -> Self {
        Self {
            notification,
            painter,
        }
    }
}

impl Display for ListenNotificationView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let index_label = self
            .painter
            .muted(format!("[{:04}]", self.notification.index()));
        write!(
            f,
            "{index_label} {}",
            self.painter.value(format_hex(self.notification.value()))
        )
    }
}

/// Renders the listen run summary.
pub(crate) struct ListenSummaryView<'a> {
    summary: &'a ListenSummary,
    painter: &'a Painter,
}

impl<'a> ListenSummaryView<'a> {
    pub(crate) fn new(summary: &'a ListenSummary, painter: &'a Painter) -> Self {
        Self { summary, painter }
    }
}

impl Display for ListenSummaryView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let stop_reason = self.summary.stop_reason();
        let stop_reason_value = match stop_reason {
            ListenStopReason::LinkLost => self.painter.warning(stop_reason.to_string()),
            _ => self.painter.value(stop_reason.to_string()),
        };
        let table = Table::key_value(
            self.painter,
            vec![
                ("handle", self.painter.handle(self.summary.handle())),
                (
                    "received",
                    self.painter.value(self.summary.received().to_string()),
                ),
                ("stopped", stop_reason_value),
            ],
        );
        write!(f, "{}", self.painter.heading("Listen summary:"))?;
        write!(f, "\n{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;
    use rstest::rstest;

    use crate::gatt::CharacteristicNotification;

    use super::*;

    #[rstest]
    #[case::bounded(Some(2), "Listening on 0x0003 (up to 2 notifications)")]
    #[case::unbounded(None, "Listening on 0x0003 (Ctrl+C to stop)")]
    fn ready_line_describes_stop_condition(
        #[case] max_notifications: Option<usize>,
        #[case] expected: &str,
    ) {
        let painter = Painter::new(false);
        let view = ListenReadyView::new(AttributeHandle::new(3), max_notifications, &painter);
        pretty_assertions::assert_eq!(expected, view.to_string());
    }

    #[test]
    fn notification_line_is_numbered() {
        let painter = Painter::new(false);
        let notification = ListenNotification::new(
            12,
            CharacteristicNotification {
                handle: AttributeHandle::new(3),
                value: vec![0x05, 0x00, 0x01],
            },
        );
        assert_snapshot!(
            ListenNotificationView::new(&notification, &painter).to_string(),
            @"[0012] 05 00 01"
        );
    }

    #[rstest]
    #[case::reached_limit(ListenStopReason::ReachedLimit(10), "reached max notifications (10)")]
    #[case::interrupted(ListenStopReason::Interrupted, "interrupted by user")]
    #[case::link_lost(ListenStopReason::LinkLost, "link lost")]
    fn summary_renders_stop_reason(#[case] stop_reason: ListenStopReason, #[case] expected: &str) {
        let summary = ListenSummary::new(AttributeHandle::new(3), 5, stop_reason);
        let painter = Painter::new(false);
        let rendered = ListenSummaryView::new(&summary, &painter).to_string();
        assert!(rendered.contains(expected), "missing {expected} in\n{rendered}");
        assert!(rendered.contains("received"));
    }
}
