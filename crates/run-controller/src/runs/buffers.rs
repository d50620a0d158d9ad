//! Binds a codespec's buffer parameters to the buffers named by a run.

use crate::error::{Error, Result};
use crate::metadata::env_var_fragment;
use crate::model::BufferParameters;
use crate::store::BufferBinder;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    /// The main container reads from the buffer.
    Input,
    /// The main container writes to the buffer.
    Output,
}

impl BufferDirection {
    #[must_use]
    pub fn is_writable(self) -> bool {
        matches!(self, BufferDirection::Output)
    }
}

/// A buffer parameter resolved to an access URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundBuffer {
    /// Parameter name as declared by the codespec.
    pub name: String,
    pub direction: BufferDirection,
    pub access_uri: String,
}

/// Match every declared parameter with exactly one argument, case-insensitively,
/// and resolve each to a direction-scoped access URI.
pub async fn bind_buffers(
    binder: &dyn BufferBinder,
    parameters: Option<&BufferParameters>,
    arguments: &BTreeMap<String, String>,
) -> Result<Vec<BoundBuffer>> {
    let mut unmatched: HashMap<String, (&str, &str)> = HashMap::with_capacity(arguments.len());
    for (name, id) in arguments {
        if unmatched
            .insert(name.to_lowercase(), (name.as_str(), id.as_str()))
            .is_some()
        {
            return Err(Error::validation(format!(
                "Buffer argument '{name}' is specified more than once"
            )));
        }
    }

    let declared = parameters
        .map(|p| {
            p.inputs
                .iter()
                .map(|name| (name, BufferDirection::Input))
                .chain(p.outputs.iter().map(|name| (name, BufferDirection::Output)))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    check_derived_names(&declared)?;

    let mut bound = Vec::with_capacity(declared.len());
    for (name, direction) in declared {
        let Some((_, buffer_id)) = unmatched.remove(&name.to_lowercase()) else {
            return Err(Error::validation(format!(
                "The run is missing required buffer argument '{name}'"
            )));
        };

        let access_uri = binder
            .resolve_access(buffer_id, direction.is_writable())
            .await?
            .ok_or_else(|| Error::validation(format!("The buffer '{buffer_id}' was not found")))?;

        bound.push(BoundBuffer {
            name: name.clone(),
            direction,
            access_uri,
        });
    }

    if let Some(extra) = unmatched.values().map(|(name, _)| *name).min() {
        return Err(Error::validation(format!(
            "Buffer argument '{extra}' does not correspond to a buffer parameter on the codespec"
        )));
    }

    Ok(bound)
}

/// Container and environment variable names are derived from parameter names
/// by folding case and punctuation; two parameters must not derive the same one.
fn check_derived_names(declared: &[(&String, BufferDirection)]) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::with_capacity(declared.len());
    for (name, _) in declared {
        let derived = env_var_fragment(name);
        if let Some(other) = seen.insert(derived.clone(), name.as_str()) {
            return Err(Error::validation(format!(
                "Buffer parameters '{other}' and '{name}' both map to '{derived}'"
            )));
        }
    }
    Ok(())
}
