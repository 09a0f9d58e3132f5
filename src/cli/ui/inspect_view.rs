use std::fmt::{self, Display, Formatter};

use crate::cli::inspect::InspectReport;
use crate::gatt::{AttributeKind, Service};
use crate::utils::{format_hex, format_rssi};

use super::painter::Painter;
use super::table::Table;

/// Renders an inspect report: link parameters, then one row per attribute.
pub(crate) struct InspectView<'a> {
    report: &'a InspectReport,
    painter: &'a Painter,
}

impl<'a> InspectView<'a> {
    pub(crate) fn new(report: &'a InspectReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }

    fn attribute_rows(&self, services: &[Service]) -> Vec<Vec<String>> {
        let painter = self.painter;
        let value = |value: Option<&[u8]>| match value {
            Some(bytes) => painter.value(format_hex(bytes)),
            None => painter.muted("-"),
        };

        let mut rows = Vec::new();
        for service in services {
            let kind = if service.is_primary() {
                "primary service".to_string()
            } else {
                "secondary service".to_string()
            };
            rows.push(vec![
                painter.handle(service.handle()),
                painter.heading(kind),
                service.uuid().to_string(),
                String::new(),
                String::new(),
            ]);
            for characteristic in service.characteristics() {
                rows.push(vec![
                    painter.handle(characteristic.handle()),
                    AttributeKind::Characteristic.to_string(),
                    characteristic.uuid().to_string(),
                    characteristic.properties().labels().join(","),
                    value(characteristic.value()),
                ]);
                for descriptor in characteristic.descriptors() {
                    rows.push(vec![
                        painter.handle(descriptor.handle()),
                        painter.muted(AttributeKind::Descriptor.to_string()),
                        descriptor.uuid().to_string(),
                        String::new(),
                        value(descriptor.value()),
                    ]);
                }
            }
        }
        rows
    }
}

impl Display for InspectView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let session = self.report.session();
        let session_table = Table::key_value(
            self.painter,
            vec![
                ("session", self.painter.value(session.id().to_string())),
                ("state", self.painter.value(session.state().to_string())),
                ("mtu", self.painter.value(session.mtu().to_string())),
                ("priority", self.painter.value(session.priority().to_string())),
                ("rssi", self.painter.value(format_rssi(self.report.rssi()))),
            ],
        );

        write!(f, "{}", self.painter.heading("Session:"))?;
        write!(f, "\n{session_table}")?;
        writeln!(f)?;

        let services = self.report.services();
        if services.is_empty() {
            return write!(f, "\n{}", self.painter.warning("No services discovered."));
        }
        let attributes = Table::grid(
            ["handle", "kind", "uuid", "properties", "value"],
            self.attribute_rows(services),
        );
        write!(f, "\n{}", self.painter.heading("Attributes:"))?;
        write!(f, "\n{attributes}")
    }
}
