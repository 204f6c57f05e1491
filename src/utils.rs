/// Formats bytes as space-separated lowercase hexadecimal pairs for logs.
pub(crate) fn format_hex(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return "<empty>".to_string();
    }

    bytes
        .chunks(1)
        .map(hex::encode)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Formats an optional RSSI for terminal output.
pub(crate) fn format_rssi(rssi: Option<i16>) -> String {
    match rssi {
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn format_hex_handles_empty_payload() {
        assert_eq!("<empty>", format_hex(&[]));
    }

    #[test]
    fn format_hex_formats_lowercase_pairs() {
        assert_eq!("b0 01 00 ff", format_hex(&[0xb0, 0x01, 0x00, 0xff]));
    }

    #[test]
    fn format_rssi_renders_missing_value_as_dash() {
        assert_eq!("-", format_rssi(None));
        assert_eq!("-61", format_rssi(Some(-61)));
    }
}
