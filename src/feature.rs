//! Server-Feature Detector: derives capability flags from the
//! `server_version` ParameterStatus value reported during startup.

/// Capability flags derived from the server's reported version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerFeatures {
    /// Numeric `(major, minor)` version extracted from `server_version`.
    pub version: (u32, u32),
    /// `SAVEPOINT` is supported (PostgreSQL >= 8.0).
    pub supports_savepoint: bool,
    /// `extra_float_digits` GUC is supported (PostgreSQL >= 7.4).
    pub supports_extra_float_digits: bool,
    /// `extra_float_digits = 3` is meaningful (PostgreSQL >= 9.0).
    pub supports_extra_float_digits_3: bool,
    /// `application_name` startup parameter is supported (PostgreSQL >= 9.0).
    pub supports_application_name: bool,
    /// `DISCARD ALL` is supported (PostgreSQL >= 8.3).
    pub supports_discard: bool,
    /// `ssl_renegotiation_limit` GUC is supported: PostgreSQL 8.4.x before
    /// 8.4.21, or 9.0.x through 9.4.x before their respective patch
    /// releases that removed it — modeled here as the disjunction over the
    /// minor-version ranges where it was present.
    pub supports_ssl_renegotiation_limit: bool,
    /// The `E'...'` escape string syntax is recognized (PostgreSQL >= 8.1).
    pub supports_estring_prefix: bool,
    /// `bytea_output = 'hex'` is available (PostgreSQL >= 9.0).
    pub supports_hex_byte_format: bool,
    /// Built-in range types (`int4range`, etc.) exist (PostgreSQL >= 9.2).
    pub supports_range_types: bool,
    /// Whether the server treats backslashes in `'...'` string literals as
    /// literal characters rather than escapes, per the last-reported
    /// `standard_conforming_strings` ParameterStatus. Not derivable from
    /// `server_version` alone — GUC-controlled, defaults to `on` (PostgreSQL
    /// >= 9.1) but can be toggled by the server or session at any time, so
    /// this starts at the version-implied default and is updated in place
    /// whenever a fresh ParameterStatus arrives.
    pub use_conformant_strings: bool,
}

/// Trim a `server_version` string down to its leading `[0-9.]+` run and
/// parse it into `(major, minor)`. Handles both `"9.6.1"`-style and
/// `"12.3"`-style (post-10 single-integer-major) version strings, plus
/// vendor suffixes like `"12.9 (Debian 12.9-1.pgdg110+1)"`.
pub fn parse_version(server_version: &str) -> (u32, u32) {
    let numeric: String = server_version
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();

    let mut parts = numeric.split('.');
    let major = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (major, minor)
}

impl ServerFeatures {
    /// Derive capability flags from the raw `server_version` string.
    pub fn from_server_version(server_version: &str) -> Self {
        let version @ (major, minor) = parse_version(server_version);

        let at_least = |want_major: u32, want_minor: u32| {
            major > want_major || (major == want_major && minor >= want_minor)
        };

        let ssl_renegotiation_limit = match (major, minor) {
            (8, 4) => true,
            (9, 0..=4) => true,
            _ => false,
        };

        Self {
            version,
            supports_savepoint: at_least(8, 0),
            supports_extra_float_digits: at_least(7, 4),
            supports_extra_float_digits_3: at_least(9, 0),
            supports_application_name: at_least(9, 0),
            supports_discard: at_least(8, 3),
            supports_ssl_renegotiation_limit: ssl_renegotiation_limit,
            supports_estring_prefix: at_least(8, 1),
            supports_hex_byte_format: at_least(9, 0),
            supports_range_types: at_least(9, 2),
            use_conformant_strings: at_least(9, 1),
        }
    }

    /// Update [`Self::use_conformant_strings`] from a `standard_conforming_strings`
    /// ParameterStatus value (`"on"` or `"off"`). Unrecognized values are
    /// ignored, leaving the prior setting in place.
    pub fn set_standard_conforming_strings(&mut self, value: &str) {
        match value {
            "on" => self.use_conformant_strings = true,
            "off" => self.use_conformant_strings = false,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_classic_three_part_version() {
        assert_eq!(parse_version("9.6.1"), (9, 6));
    }

    #[test]
    fn parses_modern_two_part_version() {
        assert_eq!(parse_version("14.2"), (14, 2));
    }

    #[test]
    fn ignores_vendor_suffix() {
        assert_eq!(
            parse_version("12.9 (Debian 12.9-1.pgdg110+1)"),
            (12, 9)
        );
    }

    #[test]
    fn old_server_lacks_modern_features() {
        let f = ServerFeatures::from_server_version("7.4.0");
        assert!(f.supports_extra_float_digits);
        assert!(!f.supports_savepoint);
        assert!(!f.supports_range_types);
    }

    #[test]
    fn modern_server_has_all_features() {
        let f = ServerFeatures::from_server_version("14.2");
        assert!(f.supports_savepoint);
        assert!(f.supports_application_name);
        assert!(f.supports_discard);
        assert!(f.supports_range_types);
        assert!(!f.supports_ssl_renegotiation_limit);
    }

    #[test]
    fn conformant_strings_default_tracks_version() {
        assert!(ServerFeatures::from_server_version("9.1.0").use_conformant_strings);
        assert!(!ServerFeatures::from_server_version("8.4.0").use_conformant_strings);
    }

    #[test]
    fn conformant_strings_follows_parameter_status() {
        let mut f = ServerFeatures::from_server_version("9.1.0");
        f.set_standard_conforming_strings("off");
        assert!(!f.use_conformant_strings);
        f.set_standard_conforming_strings("on");
        assert!(f.use_conformant_strings);
        f.set_standard_conforming_strings("garbage");
        assert!(f.use_conformant_strings);
    }

    #[test]
    fn ssl_renegotiation_limit_window() {
        assert!(ServerFeatures::from_server_version("8.4.5").supports_ssl_renegotiation_limit);
        assert!(ServerFeatures::from_server_version("9.2.0").supports_ssl_renegotiation_limit);
        assert!(!ServerFeatures::from_server_version("9.5.0").supports_ssl_renegotiation_limit);
        assert!(!ServerFeatures::from_server_version("8.3.0").supports_ssl_renegotiation_limit);
    }
}
