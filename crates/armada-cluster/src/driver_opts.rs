//! `key=value` option parsing for volume and network driver requests.

use crate::error::{ClusterError, Result};
use std::collections::HashMap;

/// Parsed driver options.
///
/// Options arrive as `key=value` strings on volume/network create requests.
/// An entry without `=` is treated as a key with an empty value.
#[derive(Debug, Clone, Default)]
pub struct DriverOpts {
    opts: HashMap<String, String>,
}

impl DriverOpts {
    /// Parses a slice of `key=value` strings.
    #[must_use]
    pub fn parse(raw: &[String]) -> Self {
        let mut opts = HashMap::new();
        for entry in raw {
            match entry.split_once('=') {
                Some((key, value)) => opts.insert(key.to_string(), value.to_string()),
                None => opts.insert(entry.clone(), String::new()),
            };
        }
        Self { opts }
    }

    /// Returns the raw value for `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.opts.get(key).map(String::as_str)
    }

    /// Returns the value for `key` parsed as an integer.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is present but not a valid integer.
    pub fn get_int(&self, key: &str) -> Result<Option<i64>> {
        match self.opts.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse()
                .map(Some)
                .map_err(|_| ClusterError::InvalidArgument(format!("{key}={v} is not an integer"))),
        }
    }

    /// Returns the value for `key` parsed as a boolean (`true`/`false`/`1`/`0`).
    ///
    /// # Errors
    ///
    /// Returns an error if the value is present but not a valid boolean.
    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.opts.get(key).map(String::as_str) {
            None => Ok(None),
            Some("true" | "1") => Ok(Some(true)),
            Some("false" | "0") => Ok(Some(false)),
            Some(v) => Err(ClusterError::InvalidArgument(format!(
                "{key}={v} is not a boolean"
            ))),
        }
    }

    /// Iterates over all parsed options.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.opts.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of parsed options.
    #[must_use]
    pub fn len(&self) -> usize {
        self.opts.len()
    }

    /// Returns whether no options were parsed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.opts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(raw: &[&str]) -> DriverOpts {
        DriverOpts::parse(&raw.iter().map(|s| (*s).to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn parses_key_value_pairs() {
        let o = opts(&["size=10", "device=/dev/sda1", "flag"]);
        assert_eq!(o.get("size"), Some("10"));
        assert_eq!(o.get("device"), Some("/dev/sda1"));
        assert_eq!(o.get("flag"), Some(""));
        assert_eq!(o.get("missing"), None);
        assert_eq!(o.len(), 3);
    }

    #[test]
    fn value_may_contain_equals() {
        let o = opts(&["o=uid=1000,gid=1000"]);
        assert_eq!(o.get("o"), Some("uid=1000,gid=1000"));
    }

    #[test]
    fn typed_getters() {
        let o = opts(&["size=42", "ro=true", "rw=0", "bad=xyz"]);
        assert_eq!(o.get_int("size").unwrap(), Some(42));
        assert_eq!(o.get_bool("ro").unwrap(), Some(true));
        assert_eq!(o.get_bool("rw").unwrap(), Some(false));
        assert_eq!(o.get_int("missing").unwrap(), None);
        assert!(o.get_int("bad").is_err());
        assert!(o.get_bool("bad").is_err());
    }
}
