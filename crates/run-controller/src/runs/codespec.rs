//! Codespec reference parsing and resolution.

use crate::error::{Error, Result};
use crate::model::Codespec;
use crate::store::CodespecResolver;

const VERSION_SEPARATOR: &str = "/versions/";

/// A parsed `name` or `name/versions/N` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodespecRef<'a> {
    Latest(&'a str),
    Version(&'a str, i32),
}

impl<'a> CodespecRef<'a> {
    pub fn parse(reference: &'a str) -> Result<Self> {
        let parts: Vec<&str> = reference.split(VERSION_SEPARATOR).collect();
        match parts.as_slice() {
            [name] => Ok(CodespecRef::Latest(*name)),
            [name, version] => {
                let version = version.parse::<i32>().map_err(|_| {
                    Error::validation(format!("'{version}' is not a valid codespec version"))
                })?;
                Ok(CodespecRef::Version(*name, version))
            }
            _ => Err(Error::validation(format!(
                "The codespec '{reference}' is invalid. The value should be in the form \
                 '<codespec_name>' or '<codespec_name>/versions/<version_number>'."
            ))),
        }
    }
}

/// Resolve `reference` to a concrete codespec. Unknown names and versions are validation errors.
pub async fn resolve_codespec(
    resolver: &dyn CodespecResolver,
    reference: &str,
) -> Result<Codespec> {
    match CodespecRef::parse(reference)? {
        CodespecRef::Latest(name) => resolver
            .get_latest_codespec(name)
            .await?
            .ok_or_else(|| Error::validation(format!("The codespec '{name}' was not found"))),
        CodespecRef::Version(name, version) => {
            if let Some(codespec) = resolver.get_codespec_at_version(name, version).await? {
                return Ok(codespec);
            }
            match resolver.get_latest_codespec(name).await? {
                Some(latest) => Err(Error::validation(format!(
                    "The version '{version}' of codespec '{name}' was not found. \
                     The latest version is '{}'.",
                    latest.version
                ))),
                None => Err(Error::validation(format!("The codespec '{name}' was not found"))),
            }
        }
    }
}
