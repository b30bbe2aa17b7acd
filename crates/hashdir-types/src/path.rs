use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Logical location of a leaf directory inside an index.
///
/// Components are stored unmangled, ordered from the index root downward.
/// Each component usually names a hash-prefix bucket chosen by the layout.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DirPath(Vec<String>);

impl DirPath {
    /// The index root.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Build a path from components, rejecting empty ones.
    pub fn from_components<I, S>(components: I) -> Result<Self, TypeError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut out = Vec::new();
        for component in components {
            let component = component.into();
            if component.is_empty() {
                return Err(TypeError::InvalidComponent {
                    component,
                    reason: "component must not be empty".into(),
                });
            }
            out.push(component);
        }
        Ok(Self(out))
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Path of the child directory `component`.
    pub fn child(&self, component: impl Into<String>) -> Self {
        let mut out = self.0.clone();
        out.push(component.into());
        Self(out)
    }

    /// Parent path and last component, `None` at the root.
    pub fn split_last(&self) -> Option<(DirPath, &str)> {
        let (last, rest) = self.0.split_last()?;
        Some((Self(rest.to_vec()), last.as_str()))
    }

    /// Returns `true` if `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &DirPath) -> bool {
        self.0.starts_with(&other.0)
    }
}

impl fmt::Display for DirPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for component in &self.0 {
            write!(f, "/{component}")?;
        }
        Ok(())
    }
}
