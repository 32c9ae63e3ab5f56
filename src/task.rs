/*!
 * Transfer tasks and the metadata they carry
 */

use crate::error::{EnumerationError, FerryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Storage class of the written object
pub const STORAGE_CLASS_HEADER: &str = "X-Amz-Storage-Class";
/// Object lock retention mode
pub const LOCK_MODE_HEADER: &str = "X-Amz-Object-Lock-Mode";
/// Object lock retention deadline (RFC 3339)
pub const LOCK_RETAIN_UNTIL_HEADER: &str = "X-Amz-Object-Lock-Retain-Until-Date";
/// Object lock legal hold (`ON`/`OFF`)
pub const LEGAL_HOLD_HEADER: &str = "X-Amz-Object-Lock-Legal-Hold";
/// Server-side encryption algorithm
pub const ENCRYPTION_HEADER: &str = "X-Amz-Server-Side-Encryption";
/// User metadata key holding preserved source attributes
pub const PRESERVED_ATTRS_KEY: &str = "Ferry-Attrs";

/// One source object and the target it is copied to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    pub source_alias: String,
    pub source_url: String,
    pub source_size: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_version_id: Option<String>,

    pub source_mod_time: DateTime<Utc>,

    pub target_alias: String,
    pub target_url: String,

    /// Objects in the whole invocation
    pub total_count: u64,

    /// Bytes in the whole invocation
    pub total_size: u64,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub target_user_metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub disable_multipart: bool,

    #[serde(default)]
    pub force_checksum: bool,

    /// Enumeration failure; such tasks are reported, never executed or logged
    #[serde(skip)]
    pub error: Option<EnumerationError>,
}

impl TransferTask {
    /// A task that only carries an enumeration failure
    pub fn failed(source_url: impl Into<String>, error: EnumerationError) -> Self {
        Self {
            source_alias: String::new(),
            source_url: source_url.into(),
            source_size: 0,
            source_version_id: None,
            source_mod_time: DateTime::<Utc>::UNIX_EPOCH,
            target_alias: String::new(),
            target_url: String::new(),
            total_count: 0,
            total_size: 0,
            target_metadata: BTreeMap::new(),
            target_user_metadata: BTreeMap::new(),
            disable_multipart: false,
            force_checksum: false,
            error: Some(error),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

/// Canonical form of a header name: `content-type` becomes `Content-Type`.
///
/// Names containing characters that are not valid in a header token are
/// returned unchanged.
pub fn canonical_header_key(key: &str) -> String {
    const TOKEN_PUNCTUATION: &str = "!#$%&'*+-.^_`|~";
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || TOKEN_PUNCTUATION.contains(c))
    {
        return key.to_string();
    }

    let mut upper = true;
    key.chars()
        .map(|c| {
            let mapped = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            mapped
        })
        .collect()
}

#[derive(Clone, Copy, PartialEq)]
enum Token {
    Key,
    Value,
}

#[derive(Clone, Copy, PartialEq)]
enum Quote {
    None,
    Single,
    Double,
}

/// Parse `key=value;key2=value2` attribute strings.
///
/// Values (and keys) may be quoted with `'` or `"` to include `=` or `;`.
/// Keys are canonicalized with [`canonical_header_key`].
///
/// ```
/// use ferry::task::parse_attributes;
///
/// let attrs = parse_attributes("owner=ops;note='a=b;c'").unwrap();
/// assert_eq!(attrs["Owner"], "ops");
/// assert_eq!(attrs["Note"], "a=b;c");
/// ```
pub fn parse_attributes(input: &str) -> Result<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    if input.trim().is_empty() {
        return Ok(attrs);
    }

    let invalid = || FerryError::Config(format!("invalid metadata attributes: {}", input));
    let mut key = String::new();
    let mut value = String::new();
    let mut token = Token::Key;
    let mut quote = Quote::None;

    for ch in input.chars() {
        match (ch, quote) {
            ('"', Quote::Double) | ('\'', Quote::Single) => quote = Quote::None,
            ('"', Quote::None) => quote = Quote::Double,
            ('\'', Quote::None) => quote = Quote::Single,
            ('=', Quote::None) if token == Token::Key => token = Token::Value,
            (';', Quote::None) => {
                if token == Token::Key {
                    return Err(invalid());
                }
                attrs.insert(canonical_header_key(&key), std::mem::take(&mut value));
                key.clear();
                token = Token::Key;
            }
            _ => match token {
                Token::Key => key.push(ch),
                Token::Value => value.push(ch),
            },
        }
    }

    if quote != Quote::None || token == Token::Key {
        return Err(invalid());
    }
    attrs.insert(canonical_header_key(&key), value);
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("key1"), "Key1");
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("X-AMZ-META-color"), "X-Amz-Meta-Color");
        assert_eq!(canonical_header_key("has space"), "has space");
    }

    #[test]
    fn test_parse_simple_pairs() {
        let attrs = parse_attributes("k1=v1;k2=v2").unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs["K1"], "v1");
        assert_eq!(attrs["K2"], "v2");
    }

    #[test]
    fn test_parse_quoted_values() {
        let attrs = parse_attributes(r#"a="x;y=z";b='it"s'"#).unwrap();
        assert_eq!(attrs["A"], "x;y=z");
        assert_eq!(attrs["B"], r#"it"s"#);
    }

    #[test]
    fn test_equals_inside_value() {
        let attrs = parse_attributes("expr=a=b").unwrap();
        assert_eq!(attrs["Expr"], "a=b");
    }

    #[test]
    fn test_empty_value_allowed() {
        let attrs = parse_attributes("flag=").unwrap();
        assert_eq!(attrs["Flag"], "");
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(parse_attributes("novalue").is_err());
        assert!(parse_attributes("k=v;broken").is_err());
        assert!(parse_attributes("k='unterminated").is_err());
        assert!(parse_attributes(";k=v").is_err());
    }

    #[test]
    fn test_empty_input_is_empty_map() {
        assert!(parse_attributes("").unwrap().is_empty());
    }

    #[test]
    fn test_failed_task_is_not_serialized_with_error() {
        let task = TransferTask::failed(
            "/data/dir",
            EnumerationError::SourceIsFolder {
                url: "/data/dir".into(),
            },
        );
        assert!(task.is_failed());
        let json = serde_json::to_string(&task).unwrap();
        let back: TransferTask = serde_json::from_str(&json).unwrap();
        assert!(back.error.is_none());
        assert_eq!(back.source_url, "/data/dir");
    }
}
