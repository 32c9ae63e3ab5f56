/*!
 * Per-invocation transfer options
 *
 * [`TransferOptions`] mirrors the command-line flags as entered. It is
 * validated once before any work starts, stored verbatim in a session so a
 * resumed run behaves like the original one, and turned into the
 * enumeration and decoration settings the engine consumes.
 */

use crate::duration::parse_duration;
use crate::enumerate::EnumerateOptions;
use crate::error::{FerryError, Result};
use crate::task::parse_attributes;
use crate::transfer::Decoration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Which command created a batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    #[default]
    Cp,
    Mv,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Cp => "cp",
            CommandType::Mv => "mv",
        }
    }

    /// Whether sources are removed after a successful transfer
    pub fn removes_source(&self) -> bool {
        matches!(self, CommandType::Mv)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Object lock retention mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionMode {
    Governance,
    Compliance,
}

impl RetentionMode {
    pub fn as_header(&self) -> &'static str {
        match self {
            RetentionMode::Governance => "GOVERNANCE",
            RetentionMode::Compliance => "COMPLIANCE",
        }
    }
}

impl FromStr for RetentionMode {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "governance" => Ok(RetentionMode::Governance),
            "compliance" => Ok(RetentionMode::Compliance),
            _ => Err(FerryError::Config(format!(
                "invalid retention mode '{}', expected governance or compliance",
                s
            ))),
        }
    }
}

/// Object lock legal hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegalHold {
    On,
    Off,
}

impl LegalHold {
    pub fn as_header(&self) -> &'static str {
        match self {
            LegalHold::On => "ON",
            LegalHold::Off => "OFF",
        }
    }
}

impl FromStr for LegalHold {
    type Err = FerryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "on" => Ok(LegalHold::On),
            "off" => Ok(LegalHold::Off),
            _ => Err(FerryError::Config(format!(
                "invalid legal hold '{}', expected on or off",
                s
            ))),
        }
    }
}

/// Parse a rewind point: an RFC 3339 timestamp or a duration before `now`
pub fn parse_rewind(value: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Ok(time) = DateTime::parse_from_rfc3339(value) {
        return Ok(time.with_timezone(&Utc));
    }
    let ago = parse_duration(value).map_err(|e| {
        FerryError::Config(format!(
            "invalid rewind '{}': not a timestamp and {}",
            value, e
        ))
    })?;
    let ago = chrono::Duration::from_std(ago)
        .map_err(|_| FerryError::Config(format!("rewind '{}' is out of range", value)))?;
    now.checked_sub_signed(ago)
        .ok_or_else(|| FerryError::Config(format!("rewind '{}' is out of range", value)))
}

// Session flag names
const FLAG_RECURSIVE: &str = "recursive";
const FLAG_PRESERVE: &str = "preserve";
const FLAG_DISABLE_MULTIPART: &str = "disable-multipart";
const FLAG_MD5: &str = "md5";
const FLAG_OLDER_THAN: &str = "older-than";
const FLAG_NEWER_THAN: &str = "newer-than";
const FLAG_REWIND: &str = "rewind";
const FLAG_VERSION_ID: &str = "version-id";
const FLAG_STORAGE_CLASS: &str = "storage-class";
const FLAG_RETENTION_MODE: &str = "retention-mode";
const FLAG_RETENTION_DURATION: &str = "retention-duration";
const FLAG_LEGAL_HOLD: &str = "legal-hold";
const FLAG_ATTR: &str = "attr";
const FLAG_ENCRYPT: &str = "encrypt";

/// Transfer flags exactly as the user supplied them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub recursive: bool,
    pub older_than: Option<String>,
    pub newer_than: Option<String>,
    pub rewind: Option<String>,
    pub version_id: Option<String>,
    pub storage_class: Option<String>,
    pub retention_mode: Option<String>,
    pub retention_duration: Option<String>,
    pub legal_hold: Option<String>,
    pub attr: Option<String>,
    pub preserve: bool,
    pub disable_multipart: bool,
    pub md5: bool,
    /// Target prefixes whose objects are encrypted server-side
    pub encrypt: Vec<String>,
}

impl TransferOptions {
    /// Check flag values and combinations for `source_count` sources
    pub fn validate(&self, source_count: usize) -> Result<()> {
        if source_count == 0 {
            return Err(FerryError::Config("at least one source is required".into()));
        }

        for value in [&self.older_than, &self.newer_than].into_iter().flatten() {
            parse_duration(value)?;
        }

        if let Some(rewind) = &self.rewind {
            parse_rewind(rewind, Utc::now())?;
        }

        if self.version_id.is_some() {
            if self.rewind.is_some() {
                return Err(FerryError::Config(
                    "--version-id cannot be combined with --rewind".into(),
                ));
            }
            if self.recursive {
                return Err(FerryError::Config(
                    "--version-id cannot be combined with --recursive".into(),
                ));
            }
            if source_count > 1 {
                return Err(FerryError::Config(
                    "--version-id requires exactly one source".into(),
                ));
            }
        }

        match (&self.retention_mode, &self.retention_duration) {
            (Some(mode), Some(duration)) => {
                mode.parse::<RetentionMode>()?;
                parse_duration(duration)?;
            }
            (None, None) => {}
            _ => {
                return Err(FerryError::Config(
                    "--retention-mode and --retention-duration must be used together".into(),
                ))
            }
        }

        if let Some(hold) = &self.legal_hold {
            hold.parse::<LegalHold>()?;
        }

        if let Some(class) = &self.storage_class {
            if class.trim().is_empty() {
                return Err(FerryError::Config("--storage-class cannot be empty".into()));
            }
        }

        if let Some(attr) = &self.attr {
            parse_attributes(attr)?;
        }

        Ok(())
    }

    /// Enumeration settings relative to the invocation time `now`
    pub fn enumerate_options(&self, now: DateTime<Utc>) -> Result<EnumerateOptions> {
        Ok(EnumerateOptions {
            recursive: self.recursive,
            older_than: self.older_than.as_deref().map(parse_duration).transpose()?,
            newer_than: self.newer_than.as_deref().map(parse_duration).transpose()?,
            time_ref: self
                .rewind
                .as_deref()
                .map(|r| parse_rewind(r, now))
                .transpose()?,
            version_id: self.version_id.clone(),
            reference_time: now,
        })
    }

    /// Metadata decoration for every task in the run.
    ///
    /// The retention deadline is computed once, from `now`.
    pub fn decoration(&self, now: DateTime<Utc>, target_locked: bool) -> Result<Decoration> {
        let retention = match (&self.retention_mode, &self.retention_duration) {
            (Some(mode), Some(duration)) => {
                let mode = mode.parse::<RetentionMode>()?;
                let duration = chrono::Duration::from_std(parse_duration(duration)?)
                    .map_err(|_| FerryError::Config("retention duration out of range".into()))?;
                let until = now
                    .checked_add_signed(duration)
                    .ok_or_else(|| FerryError::Config("retention duration out of range".into()))?;
                Some((mode, until))
            }
            _ => None,
        };

        Ok(Decoration {
            storage_class: self.storage_class.clone(),
            retention,
            legal_hold: self.legal_hold.as_deref().map(str::parse).transpose()?,
            encrypt_prefixes: self.encrypt.clone(),
            user_metadata: self
                .attr
                .as_deref()
                .map(parse_attributes)
                .transpose()?
                .unwrap_or_default(),
            preserve: self.preserve,
            disable_multipart: self.disable_multipart,
            force_checksum: self.md5 || target_locked,
        })
    }

    /// Boolean flags as stored in a session header
    pub fn bool_flags(&self) -> BTreeMap<String, bool> {
        [
            (FLAG_RECURSIVE, self.recursive),
            (FLAG_PRESERVE, self.preserve),
            (FLAG_DISABLE_MULTIPART, self.disable_multipart),
            (FLAG_MD5, self.md5),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// String flags as stored in a session header; unset flags are omitted
    pub fn string_flags(&self) -> BTreeMap<String, String> {
        let encrypt = (!self.encrypt.is_empty()).then(|| self.encrypt.join(","));
        [
            (FLAG_OLDER_THAN, &self.older_than),
            (FLAG_NEWER_THAN, &self.newer_than),
            (FLAG_REWIND, &self.rewind),
            (FLAG_VERSION_ID, &self.version_id),
            (FLAG_STORAGE_CLASS, &self.storage_class),
            (FLAG_RETENTION_MODE, &self.retention_mode),
            (FLAG_RETENTION_DURATION, &self.retention_duration),
            (FLAG_LEGAL_HOLD, &self.legal_hold),
            (FLAG_ATTR, &self.attr),
            (FLAG_ENCRYPT, &encrypt),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.as_ref().map(|v| (k.to_string(), v.clone())))
        .collect()
    }

    /// Rebuild options from the flags saved in a session header
    pub fn from_session_flags(
        bool_flags: &BTreeMap<String, bool>,
        string_flags: &BTreeMap<String, String>,
    ) -> Self {
        let flag = |name: &str| bool_flags.get(name).copied().unwrap_or(false);
        let value = |name: &str| string_flags.get(name).cloned();

        Self {
            recursive: flag(FLAG_RECURSIVE),
            older_than: value(FLAG_OLDER_THAN),
            newer_than: value(FLAG_NEWER_THAN),
            rewind: value(FLAG_REWIND),
            version_id: value(FLAG_VERSION_ID),
            storage_class: value(FLAG_STORAGE_CLASS),
            retention_mode: value(FLAG_RETENTION_MODE),
            retention_duration: value(FLAG_RETENTION_DURATION),
            legal_hold: value(FLAG_LEGAL_HOLD),
            attr: value(FLAG_ATTR),
            preserve: flag(FLAG_PRESERVE),
            disable_multipart: flag(FLAG_DISABLE_MULTIPART),
            md5: flag(FLAG_MD5),
            encrypt: value(FLAG_ENCRYPT)
                .map(|v| {
                    v.split(',')
                        .filter(|p| !p.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_version_id_conflicts() {
        let mut opts = TransferOptions {
            version_id: Some("v1".into()),
            ..Default::default()
        };
        assert!(opts.validate(1).is_ok());
        assert!(opts.validate(2).is_err());

        opts.recursive = true;
        assert!(opts.validate(1).is_err());

        opts.recursive = false;
        opts.rewind = Some("1d".into());
        assert!(opts.validate(1).is_err());
    }

    #[test]
    fn test_retention_requires_both_flags() {
        let opts = TransferOptions {
            retention_mode: Some("governance".into()),
            ..Default::default()
        };
        assert!(opts.validate(1).is_err());

        let opts = TransferOptions {
            retention_mode: Some("sideways".into()),
            retention_duration: Some("1d".into()),
            ..Default::default()
        };
        assert!(opts.validate(1).is_err());
    }

    #[test]
    fn test_invalid_values_are_config_errors() {
        for opts in [
            TransferOptions {
                older_than: Some("7x".into()),
                ..Default::default()
            },
            TransferOptions {
                legal_hold: Some("maybe".into()),
                ..Default::default()
            },
            TransferOptions {
                attr: Some("novalue".into()),
                ..Default::default()
            },
        ] {
            assert!(matches!(opts.validate(1), Err(FerryError::Config(_))));
        }
    }

    #[test]
    fn test_parse_rewind() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 12, 0, 0).unwrap();
        assert_eq!(
            parse_rewind("2024-05-01T00:00:00Z", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            parse_rewind("1d", now).unwrap(),
            Utc.with_ymd_and_hms(2024, 5, 9, 12, 0, 0).unwrap()
        );
        assert!(parse_rewind("yesterday", now).is_err());
    }

    #[test]
    fn test_decoration_values() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let opts = TransferOptions {
            retention_mode: Some("compliance".into()),
            retention_duration: Some("30d".into()),
            legal_hold: Some("on".into()),
            attr: Some("k1=v1".into()),
            ..Default::default()
        };

        let decoration = opts.decoration(now, false).unwrap();
        let (mode, until) = decoration.retention.unwrap();
        assert_eq!(mode.as_header(), "COMPLIANCE");
        assert_eq!(until, Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap());
        assert_eq!(decoration.legal_hold.unwrap().as_header(), "ON");
        assert_eq!(decoration.user_metadata["K1"], "v1");
        assert!(!decoration.force_checksum);

        assert!(opts.decoration(now, true).unwrap().force_checksum);
    }

    #[test]
    fn test_session_flags_restore_options() {
        let opts = TransferOptions {
            recursive: true,
            older_than: Some("7d".into()),
            storage_class: Some("STANDARD_IA".into()),
            md5: true,
            encrypt: vec!["s3/secure".into(), "s3/vault".into()],
            ..Default::default()
        };

        let restored = TransferOptions::from_session_flags(&opts.bool_flags(), &opts.string_flags());
        assert_eq!(restored, opts);
        assert!(!opts.string_flags().contains_key("rewind"));
    }
}
