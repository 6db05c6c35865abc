//! `uname` endpoint: kernel and machine identity from `uname(2)`.

use super::Producer;
use serde_json::{json, Map, Value};
use std::ffi::CStr;
use std::io;
use std::mem;
use tracing::warn;

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uname {
    pub sysname: String,
    pub nodename: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

fn field(raw: &[libc::c_char]) -> String {
    // SAFETY: uname() NUL-terminates every field within its array.
    unsafe { CStr::from_ptr(raw.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

impl Uname {
    /// Reads the current system identity, falling back to "unknown" fields.
    pub fn new() -> Self {
        Self::read().unwrap_or_else(|e| {
            warn!(error = %e, "uname failed");
            Self {
                sysname: UNKNOWN.into(),
                nodename: UNKNOWN.into(),
                release: UNKNOWN.into(),
                version: UNKNOWN.into(),
                machine: UNKNOWN.into(),
            }
        })
    }

    pub fn read() -> io::Result<Self> {
        // SAFETY: utsname is plain old data; uname fills it in.
        let mut name: libc::utsname = unsafe { mem::zeroed() };
        if unsafe { libc::uname(&mut name) } != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            sysname: field(&name.sysname),
            nodename: field(&name.nodename),
            release: field(&name.release),
            version: field(&name.version),
            machine: field(&name.machine),
        })
    }
}

impl Default for Uname {
    fn default() -> Self {
        Self::new()
    }
}

impl Producer for Uname {
    fn name(&self) -> &'static str {
        "uname"
    }

    fn emit(&self, out: &mut Map<String, Value>) {
        out.insert("sysname".into(), json!(self.sysname));
        out.insert("nodename".into(), json!(self.nodename));
        out.insert("release".into(), json!(self.release));
        out.insert("version".into(), json!(self.version));
        out.insert("machine".into(), json!(self.machine));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uname_reads_sysname() {
        let u = Uname::read().unwrap();
        assert!(!u.sysname.is_empty());
        assert!(!u.machine.is_empty());
    }

    #[test]
    fn test_emit_keys() {
        let mut out = Map::new();
        Uname::new().emit(&mut out);
        let keys: Vec<&str> = out.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["sysname", "nodename", "release", "version", "machine"]);
    }
}
