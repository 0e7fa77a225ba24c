//! Flat `key=value` property strings with a configurable entry separator,
//! e.g. `ssl.trust-store=classpath:ca.pem, connect-timeout=PT2S`.

use std::collections::BTreeMap;

/// Parsed property set. Later duplicates win.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `props`, splitting entries on `separator` (surrounding whitespace is dropped).
    /// With a newline separator the input is read line by line as-is.
    /// Each entry is `key=value` or `key:value`; blank entries and `#`/`!` comments are skipped.
    pub fn parse(props: &str, separator: &str) -> Self {
        let entries: Vec<&str> = if separator == "\n" || separator == "\r\n" || separator.is_empty() {
            props.lines().collect()
        } else {
            props.split(separator).collect()
        };
        let mut map = BTreeMap::new();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') || entry.starts_with('!') {
                continue;
            }
            let (key, value) = match entry.find(['=', ':']) {
                Some(idx) => (entry[..idx].trim(), entry[idx + 1..].trim()),
                None => (entry, ""),
            };
            map.insert(key.to_string(), value.to_string());
        }
        Properties(map)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comma_separated() {
        let p = Properties::parse("a=1 , b = two,c:3", ",");
        assert_eq!(p.get("a"), Some("1"));
        assert_eq!(p.get("b"), Some("two"));
        assert_eq!(p.get("c"), Some("3"));
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn value_keeps_later_separators() {
        let p = Properties::parse("ssl.trust-store=file:///etc/ca.pem;x=y", ";");
        assert_eq!(p.get("ssl.trust-store"), Some("file:///etc/ca.pem"));
        assert_eq!(p.get("x"), Some("y"));
    }

    #[test]
    fn newline_separator_and_comments() {
        let p = Properties::parse("# comment\nk=v\n\n! other\nflag", "\n");
        assert_eq!(p.get("k"), Some("v"));
        assert_eq!(p.get("flag"), Some(""));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn later_duplicate_wins() {
        let p = Properties::parse("k=1|k=2", "|");
        assert_eq!(p.get("k"), Some("2"));
    }
}
