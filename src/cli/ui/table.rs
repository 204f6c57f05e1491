use std::fmt::{self, Display, Formatter};

use tabled::{builder::Builder, settings::Style as TableStyle};

use super::painter::Painter;

/// A two-column field/value table that renders via `Display`.
#[derive(Debug)]
pub(crate) struct Table {
    rows: Vec<[String; 2]>,
}

impl Table {
    /// Creates a field/value table with muted field names.
    pub(crate) fn key_value(painter: &Painter, rows: Vec<(&str, String)>) -> Self {
        let rows = rows
            .into_iter()
            .map(|(field, value)| [painter.muted(field), value])
            .collect();
        Self { rows }
    }
}

impl Display for Table {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut builder = Builder::default();
        builder.push_record(["field", "value"]);
        for row in &self.rows {
            builder.push_record(row.clone());
        }
        let mut table = builder.build();
        table.with(TableStyle::rounded());
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn key_value_table_renders_field_value_pairs() {
        let painter = Painter::new(false);
        let table = Table::key_value(
            &painter,
            vec![("status", "9000".into()), ("data", "<empty>".into())],
        );
        assert_snapshot!(table.to_string(), @r"
        ╭────────┬─────────╮
        │ field  │ value   │
        ├────────┼─────────┤
        │ status │ 9000    │
        │ data   │ <empty> │
        ╰────────┴─────────╯
        ");
    }
}
