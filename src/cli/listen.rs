use std::io;
use std::pin::pin;

use anyhow::Result;
use clap::Args;
use serde::Serialize;
use serde_with::{hex::Hex, serde_as};
use tokio_stream::StreamExt;
use tracing::{debug, instrument};

use crate::cli::OutputFormat;
use crate::error::CommandError;
use crate::gatt::{AttributeHandle, CharacteristicNotification, GattSession, SessionState};
use crate::link::parse_handle;

use super::ui::{ListenNotificationView, ListenReadyView, ListenSummaryView, Painter};

/// Arguments for the `listen` command.
#[derive(Debug, Args)]
pub struct ListenArgs {
    /// Characteristic value handle to subscribe to, in hex.
    #[arg(long, value_parser = parse_handle)]
    handle: AttributeHandle,
    /// Stop after this many notifications. If omitted, listen until Ctrl+C or link loss.
    #[arg(long)]
    max_notifications: Option<usize>,
}

impl ListenArgs {
    /// Creates listen arguments with an optional notification limit.
    #[must_use]
    pub fn new(handle: AttributeHandle, max_notifications: Option<usize>) -> Self {
        Self {
            handle,
            max_notifications,
        }
    }

    pub(crate) fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub(crate) fn max_notifications(&self) -> Option<usize> {
        self.max_notifications
    }
}

/// Why a listening run ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(tag = "reason", content = "limit", rename_all = "snake_case")]
pub(crate) enum ListenStopReason {
    #[display("reached max notifications ({_0})")]
    ReachedLimit(usize),
    #[display("interrupted by user")]
    Interrupted,
    #[display("link lost")]
    LinkLost,
}

/// One received notification, numbered from 1.
#[serde_as]
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct ListenNotification {
    index: usize,
    handle: AttributeHandle,
    #[serde_as(as = "Hex")]
    value: Vec<u8>,
}

impl ListenNotification {
    pub(crate) fn new(index: usize, notification: CharacteristicNotification) -> Self {
        Self {
            index,
            handle: notification.handle,
            value: notification.value,
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn value(&self) -> &[u8] {
        &self.value
    }
}

/// Summary printed once listening stops.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub(crate) struct ListenSummary {
    handle: AttributeHandle,
    received: usize,
    stop_reason: ListenStopReason,
}

impl ListenSummary {
    pub(crate) fn new(handle: AttributeHandle, received: usize, stop_reason: ListenStopReason) -> Self {
        Self {
            handle,
            received,
            stop_reason,
        }
    }

    pub(crate) fn handle(&self) -> AttributeHandle {
        self.handle
    }

    pub(crate) fn received(&self) -> usize {
        self.received
    }

    pub(crate) fn stop_reason(&self) -> ListenStopReason {
        self.stop_reason
    }
}

/// Executes the `listen` command against a ready session.
#[instrument(skip(session, out, painter), level = "info", fields(handle = %args.handle()))]
pub(crate) async fn run<W>(
    session: &GattSession,
    args: &ListenArgs,
    out: &mut W,
    painter: &Painter,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let handle = args.handle();
    let mut notifications = pin!(session.notifications());
    session.set_characteristic_notification(handle, true)?.await?;
    if output_format == OutputFormat::Pretty {
        writeln!(
            out,
            "{}",
            ListenReadyView::new(handle, args.max_notifications(), painter)
        )?;
    }

    let mut ctrl_c = pin!(tokio::signal::ctrl_c());
    let mut link_lost = pin!(session.wait_for_state(SessionState::Disconnected));
    let mut received = 0_usize;
    let stop_reason = loop {
        if let Some(limit) = args.max_notifications()
            && received >= limit
        {
            break ListenStopReason::ReachedLimit(limit);
        }

        tokio::select! {
            biased;
            signal = &mut ctrl_c => {
                signal.map_err(|source| CommandError::CtrlC { source })?;
                break ListenStopReason::Interrupted;
            }
            next = notifications.next() => {
                let Some(notification) = next else {
                    break ListenStopReason::LinkLost;
                };
                if notification.handle != handle {
                    continue;
                }
                received += 1;
                let record = ListenNotification::new(received, notification);
                match output_format {
                    OutputFormat::Pretty => {
                        writeln!(out, "{}", ListenNotificationView::new(&record, painter))?;
                    }
                    OutputFormat::Json => {
                        serde_json::to_writer(&mut *out, &record)?;
                        writeln!(out)?;
                    }
                }
            }
            _state = &mut link_lost => break ListenStopReason::LinkLost,
        }
    };

    if session.state() == SessionState::Ready {
        match session.set_characteristic_notification(handle, false) {
            Ok(pending) => {
                if let Err(error) = pending.await {
                    debug!(%error, "failed to disable notifications cleanly");
                }
            }
            Err(error) => debug!(%error, "failed to disable notifications cleanly"),
        }
    }

    let summary = ListenSummary::new(handle, received, stop_reason);
    match output_format {
        OutputFormat::Pretty => {
            writeln!(out)?;
            writeln!(out, "{}", ListenSummaryView::new(&summary, painter))?;
        }
        OutputFormat::Json => {
            serde_json::to_writer(&mut *out, &summary)?;
            writeln!(out)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    #[rstest]
    #[case::limit(
        ListenStopReason::ReachedLimit(2),
        json!({ "reason": "reached_limit", "limit": 2 })
    )]
    #[case::interrupted(ListenStopReason::Interrupted, json!({ "reason": "interrupted" }))]
    #[case::link_lost(ListenStopReason::LinkLost, json!({ "reason": "link_lost" }))]
    fn stop_reason_serialises_with_reason_tag(
        #[case] reason: ListenStopReason,
        #[case] expected: serde_json::Value,
    ) {
        assert_eq!(
            expected,
            serde_json::to_value(reason).expect("stop reason should serialise")
        );
    }

    #[test]
    fn notification_record_carries_hex_value() {
        let record = ListenNotification::new(
            1,
            CharacteristicNotification {
                handle: AttributeHandle::new(3),
                value: vec![0x10, 0xFF],
            },
        );
        assert_eq!(
            json!({ "index": 1, "handle": "0x0003", "value": "10ff" }),
            serde_json::to_value(&record).expect("record should serialise")
        );
    }
}
