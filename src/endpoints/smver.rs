//! `smver` endpoint: the server's semantic version.

use super::Producer;
use serde_json::{json, Map, Value};

/// Semantic version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Smver {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Smver {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The version this crate was built as.
    pub fn from_crate() -> Self {
        Self {
            major: env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
            minor: env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            patch: env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
        }
    }
}

impl Producer for Smver {
    fn name(&self) -> &'static str {
        "smver"
    }

    fn emit(&self, out: &mut Map<String, Value>) {
        out.insert("major".into(), json!(self.major));
        out.insert("minor".into(), json!(self.minor));
        out.insert("patch".into(), json!(self.patch));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_crate_matches_version() {
        let v = Smver::from_crate();
        assert_eq!(format!("{}.{}.{}", v.major, v.minor, v.patch), crate::VERSION);
    }

    #[test]
    fn test_emit_order() {
        let mut out = Map::new();
        Smver::new(1, 2, 3).emit(&mut out);
        assert_eq!(
            serde_json::to_string(&out).unwrap(),
            r#"{"major":1,"minor":2,"patch":3}"#
        );
    }
}
