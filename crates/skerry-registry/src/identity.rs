//! Object identities and descriptors
//!
//! TigerStyle: Validated identifiers with explicit limits.

use crate::error::{RegistryError, RegistryResult};
use serde::{Deserialize, Serialize};
use skerry_core::constants::{
    ADAPTER_ID_LENGTH_BYTES_MAX, IDENTITY_CATEGORY_LENGTH_BYTES_MAX,
    IDENTITY_NAME_LENGTH_BYTES_MAX, TYPE_ID_LENGTH_BYTES_MAX,
};
use std::fmt;

/// Unique key of a published object
///
/// Ordered by name, then category. The registry relies on this order for
/// deterministic iteration and for the sorted per-type member lists.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "IdentityParts")]
pub struct Identity {
    name: String,
    category: String,
}

/// Unvalidated wire form of an [`Identity`]
#[derive(Deserialize)]
struct IdentityParts {
    name: String,
    category: String,
}

impl TryFrom<IdentityParts> for Identity {
    type Error = RegistryError;

    fn try_from(parts: IdentityParts) -> RegistryResult<Self> {
        Self::with_category(parts.category, parts.name)
    }
}

impl Identity {
    /// Create an identity without a category
    pub fn new(name: impl Into<String>) -> RegistryResult<Self> {
        Self::with_category("", name)
    }

    /// Create an identity with a category
    ///
    /// # Errors
    /// Returns error if the name is empty, a part is too long, or the category
    /// contains a `/`.
    pub fn with_category(
        category: impl Into<String>,
        name: impl Into<String>,
    ) -> RegistryResult<Self> {
        let category = category.into();
        let name = name.into();

        if name.is_empty() {
            return Err(RegistryError::InvalidIdentity {
                id: format!("{}/", category),
                reason: "identity name cannot be empty".into(),
            });
        }

        if name.len() > IDENTITY_NAME_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidIdentity {
                id: name.clone(),
                reason: format!(
                    "name length {} exceeds limit {}",
                    name.len(),
                    IDENTITY_NAME_LENGTH_BYTES_MAX
                ),
            });
        }

        if category.len() > IDENTITY_CATEGORY_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidIdentity {
                id: name.clone(),
                reason: format!(
                    "category length {} exceeds limit {}",
                    category.len(),
                    IDENTITY_CATEGORY_LENGTH_BYTES_MAX
                ),
            });
        }

        if category.contains('/') {
            return Err(RegistryError::InvalidIdentity {
                id: format!("{}/{}", category, name),
                reason: "category cannot contain '/'".into(),
            });
        }

        Ok(Self { name, category })
    }

    /// Parse the `category/name` (or bare `name`) form
    ///
    /// The first unescaped `/` separates the category from the name. `\/`
    /// and `\\` stand for a literal slash and backslash, as printed by
    /// `Display`.
    pub fn parse(s: &str) -> RegistryResult<Self> {
        let mut category = None;
        let mut current = String::with_capacity(s.len());
        let mut chars = s.chars();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some(escaped @ ('\\' | '/')) => current.push(escaped),
                    _ => {
                        return Err(RegistryError::InvalidIdentity {
                            id: s.to_string(),
                            reason: "invalid escape sequence".into(),
                        })
                    }
                },
                '/' if category.is_none() => {
                    category = Some(std::mem::take(&mut current));
                }
                '/' => {
                    return Err(RegistryError::InvalidIdentity {
                        id: s.to_string(),
                        reason: "unescaped '/' in name".into(),
                    })
                }
                c => current.push(c),
            }
        }

        match category {
            Some(category) => Self::with_category(category, current),
            None => Self::new(current),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }
}

fn write_escaped(f: &mut fmt::Formatter<'_>, part: &str) -> fmt::Result {
    for c in part.chars() {
        if c == '\\' || c == '/' {
            f.write_str("\\")?;
        }
        write!(f, "{}", c)?;
    }
    Ok(())
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.category.is_empty() {
            write_escaped(f, &self.category)?;
            f.write_str("/")?;
        }
        write_escaped(f, &self.name)
    }
}

/// Reference to a remote endpoint
///
/// An indirect proxy names the adapter that serves the object; the load cache
/// resolves that adapter to the nodes hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectProxy {
    identity: Identity,
    adapter_id: Option<String>,
}

impl ObjectProxy {
    /// Proxy not bound to an adapter
    pub fn direct(identity: Identity) -> Self {
        Self {
            identity,
            adapter_id: None,
        }
    }

    /// Proxy served through an adapter
    pub fn indirect(identity: Identity, adapter_id: impl Into<String>) -> RegistryResult<Self> {
        let adapter_id = adapter_id.into();
        if adapter_id.is_empty() || adapter_id.len() > ADAPTER_ID_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidIdentity {
                id: identity.to_string(),
                reason: format!(
                    "adapter id length {} not in 1..={}",
                    adapter_id.len(),
                    ADAPTER_ID_LENGTH_BYTES_MAX
                ),
            });
        }
        Ok(Self {
            identity,
            adapter_id: Some(adapter_id),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn adapter_id(&self) -> Option<&str> {
        self.adapter_id.as_deref()
    }
}

impl fmt::Display for ObjectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.adapter_id {
            Some(adapter) => write!(f, "{} @ {}", self.identity, adapter),
            None => write!(f, "{}", self.identity),
        }
    }
}

/// Descriptor of a published object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub proxy: ObjectProxy,
    pub type_id: String,
}

impl ObjectInfo {
    pub fn new(proxy: ObjectProxy, type_id: impl Into<String>) -> RegistryResult<Self> {
        let type_id = type_id.into();
        if type_id.len() > TYPE_ID_LENGTH_BYTES_MAX {
            return Err(RegistryError::InvalidIdentity {
                id: proxy.identity().to_string(),
                reason: format!(
                    "type id length {} exceeds limit {}",
                    type_id.len(),
                    TYPE_ID_LENGTH_BYTES_MAX
                ),
            });
        }
        Ok(Self { proxy, type_id })
    }

    pub fn identity(&self) -> &Identity {
        self.proxy.identity()
    }
}
