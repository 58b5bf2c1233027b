/// Serials handled by the bridge's own emulator transport need no `connect`.
const EMULATOR_MARKER: &str = "emulator";

/// Rewrites loopback spellings so the bridge sees one stable serial.
pub(crate) fn canonicalize_serial(serial: &str) -> String {
    let serial = serial.trim();
    let lower = serial.to_ascii_lowercase();
    for prefix in ["localhost:", "0.0.0.0:", "[::1]:", "[::]:"] {
        if let Some(rest) = lower.strip_prefix(prefix) {
            return format!("127.0.0.1:{rest}");
        }
    }
    serial.to_string()
}

pub(crate) fn is_embedded_emulator(serial: &str) -> bool {
    serial.contains(EMULATOR_MARKER)
}

pub(crate) fn parse_tcp_spec(spec: &str) -> Option<u16> {
    spec.strip_prefix("tcp:")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalizes_loopback_aliases() {
        assert_eq!(canonicalize_serial("localhost:5555"), "127.0.0.1:5555");
        assert_eq!(canonicalize_serial(" [::1]:7555 "), "127.0.0.1:7555");
        assert_eq!(canonicalize_serial("emulator-5554"), "emulator-5554");
    }

    #[test]
    fn parses_tcp_specs_only() {
        assert_eq!(parse_tcp_spec("tcp:20001"), Some(20001));
        assert_eq!(parse_tcp_spec("localabstract:minitouch"), None);
    }
}
