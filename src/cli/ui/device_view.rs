use std::fmt::{self, Display, Formatter};

use crate::hw::FoundDevice;
use crate::utils::format_rssi;

use super::painter::Painter;
use super::table::Table;

/// Renders a `FoundDevice` as a key-value table.
pub(crate) struct DeviceView<'a> {
    device: &'a FoundDevice,
    painter: &'a Painter,
}

impl<'a> DeviceView<'a> {
    pub(crate) fn new(device: &'a FoundDevice, painter: &'a Painter) -> Self {
        Self { device, painter }
    }
}

impl Display for DeviceView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = self.device.local_name().unwrap_or("<unknown>");
        let family = self
            .device
            .family()
            .map_or_else(|| "<unknown>".to_string(), |family| family.to_string());
        let table = Table::key_value(
            self.painter,
            vec![
                ("adapter", self.painter.value(self.device.adapter_name())),
                ("device_id", self.painter.value(self.device.device_id())),
                ("name", self.painter.value(name)),
                ("family", self.painter.value(family)),
                ("rssi", self.painter.value(format_rssi(self.device.rssi()))),
            ],
        );
        write!(f, "{table}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeviceFamily;

    #[test]
    fn device_view_lists_family_and_placeholders() {
        let device = FoundDevice::new("hci0".into(), "AA:BB:CC".into(), None, None)
            .with_family(DeviceFamily::Stax);
        let painter = Painter::new(false);

        let rendered = DeviceView::new(&device, &painter).to_string();

        assert!(rendered.contains("stax"));
        assert!(rendered.contains("<unknown>"));
        assert!(rendered.contains("AA:BB:CC"));
    }
}
