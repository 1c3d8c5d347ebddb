//! Compatibility dates and flags
//!
//! A feature is enabled by its enable flag, disabled by its disable flag, and
//! otherwise enabled once the compatibility date reaches its default date.

use chrono::{NaiveDate, Utc};
use std::collections::BTreeSet;
use thiserror::Error;

/// Date used when none is configured
pub const DEFAULT_COMPATIBILITY_DATE: &str = "1970-01-01";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompatibilityError {
    #[error(
        "Invalid compatibility date \"{0}\": compatibility dates must be formatted as YYYY-MM-DD"
    )]
    InvalidDate(String),

    #[error("Compatibility date \"{0}\" is in the future and unsupported")]
    FutureDate(String),
}

struct Feature {
    enable: &'static str,
    disable: Option<&'static str>,
    default_on: Option<&'static str>,
}

const FEATURES: &[Feature] = &[
    Feature {
        enable: "formdata_parser_supports_files",
        disable: Some("formdata_parser_converts_files_to_strings"),
        default_on: Some("2021-11-03"),
    },
    Feature {
        enable: "fetch_refuses_unknown_protocols",
        disable: Some("fetch_treats_unknown_protocols_as_http"),
        default_on: Some("2021-11-10"),
    },
    Feature {
        enable: "durable_object_fetch_requires_full_url",
        disable: Some("durable_object_fetch_allows_relative_url"),
        default_on: Some("2021-11-10"),
    },
    Feature {
        enable: "global_navigator",
        disable: Some("no_global_navigator"),
        default_on: Some("2022-03-21"),
    },
    Feature {
        enable: "export_commonjs_default",
        disable: Some("export_commonjs_namespace"),
        default_on: Some("2022-10-31"),
    },
    Feature {
        enable: "streams_enable_constructors",
        disable: Some("streams_disable_constructors"),
        default_on: None,
    },
    Feature {
        enable: "transformstream_enable_standard_constructor",
        disable: Some("transformstream_disable_standard_constructor"),
        default_on: None,
    },
];

/// Resolved compatibility settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compatibility {
    date: String,
    flags: Vec<String>,
    enabled: BTreeSet<&'static str>,
}

impl Compatibility {
    pub fn new(
        date: Option<&str>,
        flags: Option<&[String]>,
    ) -> Result<Self, CompatibilityError> {
        let date = date.unwrap_or(DEFAULT_COMPATIBILITY_DATE).to_string();
        validate_date(&date)?;
        let flags = flags.map(<[String]>::to_vec).unwrap_or_default();
        let enabled = resolve_enabled(&date, &flags);
        Ok(Self {
            date,
            flags,
            enabled,
        })
    }

    /// Applies new settings, returning whether the enabled feature set changed
    pub fn update(
        &mut self,
        date: Option<&str>,
        flags: Option<&[String]>,
    ) -> Result<bool, CompatibilityError> {
        let next = Self::new(date, flags)?;
        let changed = next.enabled != self.enabled;
        *self = next;
        Ok(changed)
    }

    pub fn is_enabled(&self, flag: &str) -> bool {
        self.enabled.contains(flag)
    }

    pub fn enabled(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.enabled.iter().copied()
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn flags(&self) -> &[String] {
        &self.flags
    }
}

impl Default for Compatibility {
    fn default() -> Self {
        Self {
            date: DEFAULT_COMPATIBILITY_DATE.to_string(),
            flags: Vec::new(),
            enabled: resolve_enabled(DEFAULT_COMPATIBILITY_DATE, &[]),
        }
    }
}

fn validate_date(date: &str) -> Result<(), CompatibilityError> {
    let parsed = NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map_err(|_| CompatibilityError::InvalidDate(date.to_string()))?;
    if date.len() != 10 {
        return Err(CompatibilityError::InvalidDate(date.to_string()));
    }
    if parsed > Utc::now().date_naive() {
        return Err(CompatibilityError::FutureDate(date.to_string()));
    }
    Ok(())
}

fn resolve_enabled(date: &str, flags: &[String]) -> BTreeSet<&'static str> {
    FEATURES
        .iter()
        .filter(|feature| {
            if flags.iter().any(|flag| flag == feature.enable) {
                return true;
            }
            if let Some(disable) = feature.disable {
                if flags.iter().any(|flag| flag == disable) {
                    return false;
                }
            }
            // Dates are validated as YYYY-MM-DD, so they compare as strings
            feature.default_on.is_some_and(|on| date >= on)
        })
        .map(|feature| feature.enable)
        .collect()
}
