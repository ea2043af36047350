//! Specifier Parsing
//!
//! Pure parsing of the textual forms the runtime accepts: library
//! identifiers (`@owner/name`), versioned library tags
//! (`@owner/name#1.2.3`), and module resolution targets
//! (`[library:]module` where `library` is an alias or a tag).

use crate::error::{Error, Result};
use crate::version::Version;

/// A parsed `@owner/name` identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub owner: String,
    pub name: String,
}

impl Identifier {
    /// Parse an `@owner/name` string.
    pub fn parse(text: &str) -> Result<Self> {
        let body = text
            .strip_prefix('@')
            .ok_or_else(|| Error::parse(format!("Invalid identifier: {} (expected @owner/name)", text)))?;

        let (owner, name) = body
            .split_once('/')
            .ok_or_else(|| Error::parse(format!("Invalid identifier: {} (expected @owner/name)", text)))?;

        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return Err(Error::parse(format!(
                "Invalid identifier: {} (expected @owner/name)",
                text
            )));
        }

        Ok(Identifier {
            owner: owner.to_string(),
            name: name.to_string(),
        })
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}/{}", self.owner, self.name)
    }
}

/// A parsed library tag: an identifier plus an optional pinned version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryTag {
    pub identifier: Identifier,
    pub version: Option<Version>,
}

impl LibraryTag {
    /// Parse `@owner/name` or `@owner/name#1.2.3`.
    pub fn parse(text: &str) -> Result<Self> {
        match text.split_once('#') {
            Some((head, tail)) => Ok(LibraryTag {
                identifier: Identifier::parse(head)?,
                version: Some(Version::parse(tail)?),
            }),
            None => Ok(LibraryTag {
                identifier: Identifier::parse(text)?,
                version: None,
            }),
        }
    }
}

impl std::fmt::Display for LibraryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.version {
            Some(version) => write!(f, "{}#{}", self.identifier, version),
            None => write!(f, "{}", self.identifier),
        }
    }
}

/// A parsed `[library:]module` resolution target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Alias or tag text naming the library; `None` for unqualified targets.
    pub library: Option<String>,
    /// Module name within the library.
    pub module: String,
}

impl Target {
    /// Split a resolution target on its first `:`.
    pub fn parse(text: &str) -> Result<Self> {
        let (library, module) = match text.split_once(':') {
            Some((head, tail)) => (Some(head.to_string()), tail),
            None => (None, text),
        };

        if module.is_empty() || module.contains(':') {
            return Err(Error::parse(format!(
                "Invalid resolution target: {} (expected [library:]module)",
                text
            )));
        }
        if let Some(library) = &library {
            if library.is_empty() {
                return Err(Error::parse(format!(
                    "Invalid resolution target: {} (empty library specifier)",
                    text
                )));
            }
        }

        Ok(Target {
            library,
            module: module.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_parse() {
        let id = Identifier::parse("@acme/widgets").unwrap();
        assert_eq!(id.owner, "acme");
        assert_eq!(id.name, "widgets");
        assert_eq!(id.to_string(), "@acme/widgets");
    }

    #[test]
    fn test_identifier_rejects_malformed() {
        assert!(Identifier::parse("acme/widgets").is_err());
        assert!(Identifier::parse("@acme").is_err());
        assert!(Identifier::parse("@/widgets").is_err());
        assert!(Identifier::parse("@acme/a/b").is_err());
    }

    #[test]
    fn test_tag_parse() {
        let tag = LibraryTag::parse("@acme/widgets#1.2.3").unwrap();
        assert_eq!(tag.identifier.to_string(), "@acme/widgets");
        assert_eq!(tag.version, Some(Version::new(1, 2, 3)));

        let bare = LibraryTag::parse("@acme/widgets").unwrap();
        assert_eq!(bare.version, None);
    }

    #[test]
    fn test_target_parse() {
        let qualified = Target::parse("ui:button").unwrap();
        assert_eq!(qualified.library.as_deref(), Some("ui"));
        assert_eq!(qualified.module, "button");

        let unqualified = Target::parse("button").unwrap();
        assert_eq!(unqualified.library, None);

        let tagged = Target::parse("@acme/widgets#1.2.3:button").unwrap();
        assert_eq!(tagged.library.as_deref(), Some("@acme/widgets#1.2.3"));
    }

    #[test]
    fn test_target_rejects_malformed() {
        assert!(Target::parse("lib:").is_err());
        assert!(Target::parse(":mod").is_err());
        assert!(Target::parse("a:b:c").is_err());
    }
}
