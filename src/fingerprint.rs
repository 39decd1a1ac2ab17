//! Canonical request fingerprints.
//!
//! A fingerprint is the identity of a request: the resource kind plus its
//! parameters in a normalized form. Two semantically identical requests must
//! produce byte-identical fingerprints, so parameters are kept in a sorted
//! map and separator characters are escaped before joining.

use std::collections::BTreeMap;
use std::fmt;

/// Request parameters. A `BTreeMap` keeps keys sorted, which makes the
/// rendering order-independent with respect to how callers insert them.
pub type Params = BTreeMap<String, String>;

/// Canonical identity of a request; used as cache key and coalescing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(kind: &str, params: &Params) -> Self {
        let mut out = escape(kind);
        for (key, value) in params {
            out.push('|');
            out.push_str(&escape(key));
            out.push('=');
            out.push_str(&escape(value));
        }
        Self(out)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Escape the separator characters so parameter content can never collide
// with the structure of the rendered fingerprint.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' | '|' | '=' => {
                out.push('\\');
                out.push(c);
            }
            _ => out.push(c),
        }
    }
    out
}
