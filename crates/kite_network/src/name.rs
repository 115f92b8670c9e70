//! Hierarchical names: the addressing unit of the fabric.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A hierarchical name such as `/rv/mobile-1`.
///
/// Components are stored without separators. The empty name is the root
/// (`/`) and is a prefix of every other name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name {
    components: Vec<String>,
}

impl Name {
    /// The root name `/`.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated URI. Empty components are dropped, so
    /// `"//a//b/"` and `"/a/b"` are the same name.
    pub fn parse(uri: &str) -> Self {
        Self {
            components: uri
                .split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    /// Build a name from individual components.
    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            components: components
                .into_iter()
                .map(Into::<String>::into)
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }

    /// Append a single component in place.
    pub fn push(&mut self, component: impl Into<String>) -> &mut Self {
        let component = component.into();
        if !component.is_empty() {
            self.components.push(component);
        }
        self
    }

    /// Return a new name with a single component appended.
    pub fn append(&self, component: impl Into<String>) -> Self {
        let mut name = self.clone();
        name.push(component);
        name
    }

    /// Concatenate two names: `self ⧺ suffix`.
    pub fn join(&self, suffix: &Name) -> Self {
        let mut components = self.components.clone();
        components.extend(suffix.components.iter().cloned());
        Self { components }
    }

    /// Whether `self` is a (non-strict) prefix of `other`.
    pub fn is_prefix_of(&self, other: &Name) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(&other.components)
                .all(|(a, b)| a == b)
    }

    /// The first `n` components.
    pub fn prefix(&self, n: usize) -> Self {
        Self {
            components: self.components.iter().take(n).cloned().collect(),
        }
    }

    /// Components after the first `n`.
    pub fn suffix_after(&self, n: usize) -> Self {
        Self {
            components: self.components.iter().skip(n).cloned().collect(),
        }
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Canonical URI form, always starting with `/`.
    pub fn to_uri(&self) -> String {
        if self.components.is_empty() {
            return "/".to_string();
        }
        let mut uri = String::new();
        for component in &self.components {
            uri.push('/');
            uri.push_str(component);
        }
        uri
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

impl FromStr for Name {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for Name {
    fn from(s: &str) -> Self {
        Self::parse(s)
    }
}

impl Serialize for Name {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_uri())
    }
}

impl<'de> Deserialize<'de> for Name {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let uri = String::deserialize(d)?;
        Ok(Self::parse(&uri))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
