//! Container identity: a name plus a clone generation

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Separator between a name and its clone index in the LXC name
const GENERATION_SEPARATOR: char = '.';

/// Unique handle for a container.
///
/// Generation 0 maps to the bare LXC name (`t1`); later generations append
/// the index (`t1.3`) so that a re-created container never aliases the
/// directory of an earlier one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerIdentity {
    name: String,
    clone_index: u32,
}

impl ContainerIdentity {
    pub fn new(name: impl Into<String>, clone_index: u32) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        Ok(Self { name, clone_index })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clone_index(&self) -> u32 {
        self.clone_index
    }

    /// Name of the container as the LXC tools know it
    pub fn lxc_name(&self) -> String {
        if self.clone_index == 0 {
            self.name.clone()
        } else {
            format!("{}{}{}", self.name, GENERATION_SEPARATOR, self.clone_index)
        }
    }

    /// Reverse of [`lxc_name`](Self::lxc_name)
    pub fn from_lxc_name(lxc_name: &str) -> Result<Self> {
        match lxc_name.rsplit_once(GENERATION_SEPARATOR) {
            Some((name, index)) => {
                let clone_index = index.parse::<u32>().map_err(|_| {
                    CoreError::InvalidName(format!("bad clone index in '{}'", lxc_name))
                })?;
                if clone_index == 0 {
                    return Err(CoreError::InvalidName(format!(
                        "generation 0 has no suffix: '{}'",
                        lxc_name
                    )));
                }
                Self::new(name, clone_index)
            }
            None => Self::new(lxc_name, 0),
        }
    }
}

impl std::fmt::Display for ContainerIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.lxc_name())
    }
}

/// Names become directory names and hostnames, so keep them boring.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::InvalidName("name is empty".to_string()));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
    {
        return Err(CoreError::InvalidName(format!(
            "'{}' contains '{}'",
            name, bad
        )));
    }
    Ok(())
}
