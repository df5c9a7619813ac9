//! Tri-state manifest fields
//!
//! A desired-state document must tell apart a field the user did not
//! mention (leave the live value alone) from a field the user explicitly
//! cleared (reset the live value). A plain `Option<T>` collapses the two.
//!
//! With serde, combine `#[serde(default, skip_serializing_if = "Field::is_unset")]`
//! on the struct field:
//! - key missing  -> [`Field::Unset`]
//! - key `null`   -> [`Field::Clear`]
//! - key present  -> [`Field::Value`]

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An optional manifest field that remembers whether it was specified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field<T> {
    /// Not specified: never touch the live value
    Unset,
    /// Explicitly cleared: reset the live value
    Clear,
    /// Explicit desired value
    Value(T),
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::Unset
    }
}

impl<T> Field<T> {
    /// True when the field was not specified.
    pub fn is_unset(&self) -> bool {
        matches!(self, Self::Unset)
    }

    /// True when the field was specified, either as a value or as a clear.
    pub fn is_specified(&self) -> bool {
        !self.is_unset()
    }

    /// True when the field was explicitly cleared.
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Clear)
    }

    /// The explicit value, if any.
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Consume into the explicit value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrowing view.
    pub fn as_ref(&self) -> Field<&T> {
        match self {
            Self::Unset => Field::Unset,
            Self::Clear => Field::Clear,
            Self::Value(v) => Field::Value(v),
        }
    }

    /// Transform the explicit value, keeping unset/clear as they are.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Field<U> {
        match self {
            Self::Unset => Field::Unset,
            Self::Clear => Field::Clear,
            Self::Value(v) => Field::Value(f(v)),
        }
    }

    /// Fill an unset field from a default; specified fields are kept.
    ///
    /// Filling is idempotent: a filled field is specified, so a second
    /// fill leaves it alone.
    pub fn or_default_from(self, default: Option<T>) -> Self {
        match (self, default) {
            (Self::Unset, Some(d)) => Self::Value(d),
            (field, _) => field,
        }
    }
}

impl<T> From<Option<T>> for Field<T> {
    /// `Some` becomes a value and `None` an explicit clear.
    fn from(value: Option<T>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Clear,
        }
    }
}

impl<T: Serialize> Serialize for Field<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Value(v) => v.serialize(serializer),
            Self::Unset | Self::Clear => serializer.serialize_none(),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Field<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Option::<T>::deserialize(deserializer).map(Field::from)
    }
}

/// Outcome of comparing one desired field against its actual value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange<T> {
    /// Nothing to do
    Unchanged,
    /// Set the live value
    Set(T),
    /// Reset the live value
    Clear,
}

impl<T> FieldChange<T> {
    /// True when some change is required.
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Compare a desired field with the actual value.
///
/// Unset never produces a change; clear produces one only when the
/// actual value is present.
pub fn compare<T: PartialEq + Clone>(desired: &Field<T>, actual: Option<&T>) -> FieldChange<T> {
    match desired {
        Field::Unset => FieldChange::Unchanged,
        Field::Clear if actual.is_some() => FieldChange::Clear,
        Field::Clear => FieldChange::Unchanged,
        Field::Value(v) if actual == Some(v) => FieldChange::Unchanged,
        Field::Value(v) => FieldChange::Set(v.clone()),
    }
}
