//! Outbound connection policy and the auto-SSL decision.
//!
//! The node keeps its outbound connection settings as a keyword/value
//! connection string (`sslmode=require connect_timeout=30`). When those
//! settings require SSL towards the other nodes, it is assumed the rest of
//! the cluster is configured the same way and expects this node to accept
//! encrypted connections too.

use std::collections::BTreeMap;

/// Connection keyword that controls transport encryption.
pub const SSLMODE_KEYWORD: &str = "sslmode";

/// The only `sslmode` that turns automatic SSL setup on.
pub const AUTO_SSL_SSLMODE: &str = "require";

/// `sslmode` assumed by clients when the keyword is absent.
pub const DEFAULT_SSLMODE: &str = "prefer";

/// Parsed outbound connection settings of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionPolicy {
    params: BTreeMap<String, String>,
}

impl ConnectionPolicy {
    /// Parse a keyword/value connection string.
    ///
    /// Values may be single quoted; inside quotes and in bare values a
    /// backslash escapes the following character. Fragments without a
    /// value and unterminated quotes are dropped. A keyword given twice
    /// keeps its last value.
    pub fn parse(conninfo: &str) -> Self {
        let mut params = BTreeMap::new();
        let mut chars = conninfo.chars().peekable();

        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.peek().is_none() {
                break;
            }

            let mut keyword = String::new();
            while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
                keyword.push(c);
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            if chars.next_if_eq(&'=').is_none() {
                // keyword without '=': skip it
                continue;
            }
            while chars.next_if(|c| c.is_whitespace()).is_some() {}

            let mut value = String::new();
            if chars.next_if_eq(&'\'').is_some() {
                let mut terminated = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => {
                            if let Some(escaped) = chars.next() {
                                value.push(escaped);
                            }
                        }
                        '\'' => {
                            terminated = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !terminated {
                    break;
                }
            } else {
                while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                    if c == '\\' {
                        if let Some(escaped) = chars.next() {
                            value.push(escaped);
                        }
                    } else {
                        value.push(c);
                    }
                }
            }

            if !keyword.is_empty() {
                params.insert(keyword, value);
            }
        }

        Self { params }
    }

    /// A policy holding only the given `sslmode`.
    pub fn with_sslmode(sslmode: &str) -> Self {
        let mut params = BTreeMap::new();
        params.insert(SSLMODE_KEYWORD.to_string(), sslmode.to_string());
        Self { params }
    }

    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.params.get(keyword).map(String::as_str)
    }

    /// The configured `sslmode`, if the keyword is present.
    pub fn sslmode(&self) -> Option<&str> {
        self.get(SSLMODE_KEYWORD)
    }

    /// The `sslmode` clients will actually use.
    pub fn effective_sslmode(&self) -> &str {
        self.sslmode().unwrap_or(DEFAULT_SSLMODE)
    }
}

/// Decide whether SSL should be turned on automatically.
///
/// True only when `sslmode` is exactly `require`. The comparison is case
/// sensitive and an absent `sslmode` never triggers.
pub fn should_auto_enable(policy: &ConnectionPolicy) -> bool {
    policy.sslmode() == Some(AUTO_SSL_SSLMODE)
}
