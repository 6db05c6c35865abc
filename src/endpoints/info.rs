//! `info` endpoint: how and for what this binary was built.

use super::Producer;
use serde_json::{json, Map, Value};
use std::env::consts;

#[derive(Debug, Clone, Default)]
pub struct Info;

impl Info {
    pub fn new() -> Self {
        Self
    }

    fn profile() -> &'static str {
        if cfg!(debug_assertions) {
            "debug"
        } else {
            "release"
        }
    }
}

impl Producer for Info {
    fn name(&self) -> &'static str {
        "info"
    }

    fn emit(&self, out: &mut Map<String, Value>) {
        out.insert("build_compiler".into(), json!("rustc"));
        out.insert("targetArch".into(), json!(consts::ARCH));
        out.insert("targetOs".into(), json!(consts::OS));
        out.insert("targetFamily".into(), json!(consts::FAMILY));
        out.insert("buildProfile".into(), json!(Self::profile()));
        out.insert(
            "package".into(),
            json!(format!("{}/{}", env!("CARGO_PKG_NAME"), crate::VERSION)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_fields() {
        let mut out = Map::new();
        Info::new().emit(&mut out);
        assert_eq!(out["targetOs"], consts::OS);
        assert_eq!(out["build_compiler"], "rustc");
        assert!(out["package"].as_str().unwrap().starts_with("sysmon/"));
    }
}
