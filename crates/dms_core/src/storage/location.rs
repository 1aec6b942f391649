//! Storage location placeholder substitution.
//!
//! Locations may embed `%name%` placeholders (`%projDir%`, `%configName%`,
//! and any user-defined entries). They are resolved once, at bind time.
//!
//! # Invariants
//! - Placeholder names are ASCII identifiers; `%%` is not an escape.
//! - Any `%` left after substitution makes the location malformed.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// Placeholder for the project directory.
pub const PLACEHOLDER_PROJECT_DIR: &str = "projDir";
/// Placeholder for the active configuration name.
pub const PLACEHOLDER_CONFIG_NAME: &str = "configName";

static PLACEHOLDER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"%([A-Za-z][A-Za-z0-9_]*)%").expect("placeholder pattern is a valid regex")
});

/// Location resolution errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationError {
    EmptyLocation,
    UnknownPlaceholder { location: String, name: String },
    Malformed(String),
}

impl Display for LocationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyLocation => write!(f, "storage location must not be empty"),
            Self::UnknownPlaceholder { location, name } => {
                write!(f, "unknown placeholder `%{name}%` in location `{location}`")
            }
            Self::Malformed(location) => {
                write!(f, "malformed storage location `{location}`")
            }
        }
    }
}

impl Error for LocationError {}

/// Resolved placeholder values for one engine session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlaceholderTable {
    values: BTreeMap<String, String>,
}

impl PlaceholderTable {
    pub fn new(project_dir: &Path, config_name: &str) -> Self {
        let mut table = Self::default();
        table.insert(
            PLACEHOLDER_PROJECT_DIR,
            project_dir.to_string_lossy().into_owned(),
        );
        table.insert(PLACEHOLDER_CONFIG_NAME, config_name);
        table
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Substitutes every placeholder in `location`.
    ///
    /// # Errors
    /// - `EmptyLocation` for blank input.
    /// - `UnknownPlaceholder` for names missing from the table.
    /// - `Malformed` when a stray `%` remains.
    pub fn resolve(&self, location: &str) -> Result<PathBuf, LocationError> {
        let trimmed = location.trim();
        if trimmed.is_empty() {
            return Err(LocationError::EmptyLocation);
        }

        let mut resolved = String::with_capacity(trimmed.len());
        let mut last = 0;
        for captures in PLACEHOLDER_PATTERN.captures_iter(trimmed) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let Some(value) = self.get(name.as_str()) else {
                return Err(LocationError::UnknownPlaceholder {
                    location: trimmed.to_string(),
                    name: name.as_str().to_string(),
                });
            };
            push_literal(&mut resolved, &trimmed[last..whole.start()], trimmed)?;
            resolved.push_str(value);
            last = whole.end();
        }
        push_literal(&mut resolved, &trimmed[last..], trimmed)?;
        Ok(PathBuf::from(resolved))
    }
}

fn push_literal(out: &mut String, literal: &str, location: &str) -> Result<(), LocationError> {
    if literal.contains('%') {
        return Err(LocationError::Malformed(location.to_string()));
    }
    out.push_str(literal);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{LocationError, PlaceholderTable};
    use std::path::{Path, PathBuf};

    fn table() -> PlaceholderTable {
        PlaceholderTable::new(Path::new("/data/project"), "demo")
    }

    #[test]
    fn resolves_builtin_placeholders() {
        let resolved = table()
            .resolve("%projDir%/out/%configName%.json")
            .expect("location should resolve");
        assert_eq!(resolved, PathBuf::from("/data/project/out/demo.json"));
    }

    #[test]
    fn resolves_user_placeholders_and_plain_paths() {
        let mut table = table();
        table.insert("dataDir", "/mnt/data");
        assert_eq!(
            table.resolve(" %dataDir%/a.db ").expect("resolve"),
            PathBuf::from("/mnt/data/a.db")
        );
        assert_eq!(
            table.resolve("/abs/b.db").expect("resolve"),
            PathBuf::from("/abs/b.db")
        );
    }

    #[test]
    fn rejects_unknown_and_malformed_placeholders() {
        let err = table()
            .resolve("%nope%/a.json")
            .expect_err("unknown placeholder must fail");
        assert!(matches!(err, LocationError::UnknownPlaceholder { ref name, .. } if name == "nope"));

        let err = table()
            .resolve("%projDir/a.json")
            .expect_err("unbalanced placeholder must fail");
        assert!(matches!(err, LocationError::Malformed(_)));

        assert_eq!(
            table().resolve("   ").expect_err("blank must fail"),
            LocationError::EmptyLocation
        );
    }
}
