use std::fmt::{self, Display, Formatter};

use crate::cli::read::ReadReport;
use crate::cli::write::WriteReport;
use crate::utils::{format_hex, printable_text};

use super::painter::Painter;
use super::table::Table;

/// Renders the value returned by `read`.
pub(crate) struct ReadView<'a> {
    report: &'a ReadReport,
    painter: &'a Painter,
}

impl<'a> ReadView<'a> {
    pub(crate) fn new(report: &'a ReadReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for ReadView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut rows = vec![
            ("handle", self.painter.handle(self.report.handle())),
            ("kind", self.painter.value(self.report.kind().to_string())),
            ("value", self.painter.value(format_hex(self.report.value()))),
        ];
        if let Some(text) = printable_text(self.report.value()) {
            rows.push(("text", self.painter.muted(format!("{text:?}"))));
        }

        write!(f, "{}", self.painter.heading("Read:"))?;
        write!(f, "\n{}", Table::key_value(self.painter, rows))
    }
}

/// Renders the acknowledgement returned by `write`.
pub(crate) struct WriteView<'a> {
    report: &'a WriteReport,
    painter: &'a Painter,
}

impl<'a> WriteView<'a> {
    pub(crate) fn new(report: &'a WriteReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for WriteView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut rows = vec![
            ("handle", self.painter.handle(self.report.handle())),
            ("kind", self.painter.value(self.report.kind().to_string())),
        ];
        if let Some(write_type) = self.report.write_type() {
            rows.push(("write_type", self.painter.value(write_type.to_string())));
        }
        rows.push(("bytes", self.painter.value(self.report.bytes().to_string())));
        rows.push(("status", self.painter.status(self.report.status())));

        write!(f, "{}", self.painter.heading("Write:"))?;
        write!(f, "\n{}", Table::key_value(self.painter, rows))
    }
}

#[cfg(test)]
mod tests {
    use crate::gatt::{AttributeHandle, AttributeKind};

    use super::*;

    #[test]
    fn read_view_shows_text_for_printable_values() {
        let report = ReadReport::new(
            AttributeHandle::new(7),
            AttributeKind::Characteristic,
            b"gattctl".to_vec(),
        );
        let painter = Painter::new(false);
        let rendered = ReadView::new(&report, &painter).to_string();
        for expected in ["Read:", "0x0007", "characteristic", "67 61 74", "\"gattctl\""] {
            assert!(rendered.contains(expected), "missing {expected} in\n{rendered}");
        }
    }

    #[test]
    fn read_view_omits_text_for_binary_values() {
        let report = ReadReport::new(
            AttributeHandle::new(3),
            AttributeKind::Characteristic,
            vec![0x00, 0x64],
        );
        let painter = Painter::new(false);
        let rendered = ReadView::new(&report, &painter).to_string();
        assert!(rendered.contains("00 64"));
        assert!(!rendered.contains("text"));
    }
}
