use std::fmt::{self, Display, Formatter};

use crate::apdu::{ApduResponse, AppAndVersion};
use crate::utils::format_hex;

use super::painter::Painter;
use super::table::Table;

/// Renders an APDU response as status word and data.
pub(crate) struct ResponseView<'a> {
    response: &'a ApduResponse,
    painter: &'a Painter,
}

impl<'a> ResponseView<'a> {
    pub(crate) fn new(response: &'a ApduResponse, painter: &'a Painter) -> Self {
        Self { response, painter }
    }
}

impl Display for ResponseView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let table = Table::key_value(
            self.painter,
            vec![
                (
                    "status",
                    self.painter
                        .status_word(self.response.status_word(), self.response.is_success()),
                ),
                ("data", self.painter.value(format_hex(self.response.data()))),
            ],
        );
        write!(f, "{table}")
    }
}

/// Renders the decoded open application.
pub(crate) struct AppVersionView<'a> {
    app: &'a AppAndVersion,
    painter: &'a Painter,
}

impl<'a> AppVersionView<'a> {
    pub(crate) fn new(app: &'a AppAndVersion, painter: &'a Painter) -> Self {
        Self { app, painter }
    }
}

impl Display for AppVersionView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.painter.heading("Open application"))?;
        let table = Table::key_value(
            self.painter,
            vec![
                ("name", self.painter.value(self.app.name())),
                ("version", self.painter.value(self.app.version())),
                ("flags", self.painter.muted(format_hex(self.app.flags()))),
            ],
        );
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use insta::assert_snapshot;

    use super::*;

    #[test]
    fn response_view_renders_status_and_data() {
        let response = ApduResponse::new([0x6e, 0x00], vec![0x01, 0x02]);
        let painter = Painter::new(false);

        assert_snapshot!(ResponseView::new(&response, &painter).to_string(), @r"
        ╭────────┬───────╮
        │ field  │ value │
        ├────────┼───────┤
        │ status │ 6e00  │
        │ data   │ 01 02 │
        ╰────────┴───────╯
        ");
    }
}
