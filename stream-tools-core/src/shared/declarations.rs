use std::fmt;

use serde::Deserialize;

use crate::{Error, Result};

/// Ordered, non-empty list of `(field, parameter)` pairs, e.g. `(field, window size)` for the
/// moving average or `(field, threshold)` for the sum bar.
///
/// Accepts a single pair `["x", 3]` or a list of pairs `[["x", 3], ["y", 2]]`. Anything else,
/// an empty list, or the same field declared twice is a [Error::Config].
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "DeclarationShape<T>")]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub struct FieldDeclarations<T>(Vec<(String, T)>);

#[derive(Deserialize)]
#[serde(untagged)]
enum DeclarationShape<T> {
    Pair(String, T),
    Pairs(Vec<(String, T)>),
}

impl<T> TryFrom<DeclarationShape<T>> for FieldDeclarations<T> {
    type Error = Error;

    fn try_from(shape: DeclarationShape<T>) -> Result<Self> {
        match shape {
            DeclarationShape::Pair(field, param) => Ok(Self::single(field, param)),
            DeclarationShape::Pairs(pairs) => Self::new(pairs),
        }
    }
}

impl<T> FieldDeclarations<T> {
    pub fn single(field: impl Into<String>, param: T) -> Self {
        Self(vec![(field.into(), param)])
    }

    pub fn new<F: Into<String>>(pairs: impl IntoIterator<Item = (F, T)>) -> Result<Self> {
        let mut declarations: Vec<(String, T)> = Vec::new();
        for (field, param) in pairs {
            let field = field.into();
            if declarations.iter().any(|(f, _)| *f == field) {
                return Err(Error::Config(format!("field {field:?} is declared twice")));
            }
            declarations.push((field, param));
        }
        if declarations.is_empty() {
            return Err(Error::Config("no field declared".to_string()));
        }
        Ok(Self(declarations))
    }

    /// Parses a JSON argument, reporting any shape mismatch as [Error::Config].
    pub fn from_value(value: serde_json::Value) -> Result<Self>
    where
        T: for<'de> Deserialize<'de>,
    {
        serde_json::from_value(value).map_err(|e| {
            Error::Config(format!(
                "field declarations must be a (field, value) pair or a list of pairs: {e}"
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(f, p)| (f.as_str(), p))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks every parameter, naming the offending field on failure.
    pub(crate) fn validate(&self, check: impl Fn(&T) -> bool, expectation: &str) -> Result<()> {
        match self.0.iter().find(|(_, p)| !check(p)) {
            Some((field, _)) => Err(Error::Config(format!(
                "declaration of field {field:?} {expectation}"
            ))),
            None => Ok(()),
        }
    }
}

/// Renders as `[(x, 5), (y, 2)]`.
impl<T: fmt::Display> fmt::Display for FieldDeclarations<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (field, param)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "({field}, {param})")?;
        }
        f.write_str("]")
    }
}
