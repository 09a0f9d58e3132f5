use std::fmt::{self, Display, Formatter};

use tabled::{builder::Builder, settings::Style as TableStyle};

use super::painter::Painter;

/// A table that renders via `Display`.
#[derive(Debug)]
pub(crate) struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl Table {
    pub(crate) fn grid(
        headers: impl IntoIterator<Item = impl Into<String>>,
        rows: Vec<Vec<String>>,
    ) -> Self {
        Self {
            headers: headers.into_iter().map(Into::into).collect(),
            rows,
        }
    }

    /// Two columns, field names muted.
    pub(crate) fn key_value(painter: &Painter, rows: Vec<(&str, String)>) -> Self {
        let records = rows
            .into_iter()
            .map(|(field, value)| vec![painter.muted(field), value])
            .collect();
        Self::grid(["field", "value"], records)
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        builder.push_record(&self.headers);
        for row in &self.rows {
            builder.push_record(row);
        }
        let mut table = builder.build();
        table.with(TableStyle::rounded());
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_table_contains_headers_and_cells() {
        let table = Table::grid(
            ["handle", "uuid"],
            vec![vec!["0x0003".into(), "2a19".into()]],
        )
        .to_string();
        for expected in ["handle", "uuid", "0x0003", "2a19"] {
            assert!(table.contains(expected), "missing {expected} in\n{table}");
        }
    }

    #[test]
    fn key_value_table_uses_field_and_value_headers() {
        let painter = Painter::new(false);
        let table = Table::key_value(&painter, vec![("mtu", "23".into())]).to_string();
        assert!(table.contains("field"));
        assert!(table.contains("mtu"));
        assert!(table.contains("23"));
    }
}
