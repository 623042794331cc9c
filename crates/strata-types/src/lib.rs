//! Semantic references for the strata backend.
//!
//! A [`Reference`] pairs a [`Kind`] with an [`Ownership`] mode. The backend
//! never looks at surface syntax; everything it needs to decide how a value
//! is laid out, whether it crosses the host boundary flattened, and whether
//! it must be released is derived from the reference.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Kinds and ownership
// ---------------------------------------------------------------------------

/// The shape of a value, independent of who owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Kind {
    Int32,
    Int64,
    Float,
    Bool,
    Str,
    Void,
    /// The type of an expression that never produces a value.
    Never,
    Struct(String),
}

impl Kind {
    /// Register-resident scalars. These never live in a region.
    pub fn is_primitive(&self) -> bool {
        matches!(self, Kind::Int32 | Kind::Int64 | Kind::Float | Kind::Bool)
    }

    /// Kinds whose size is only known at run time.
    pub fn is_dynamically_sized(&self) -> bool {
        matches!(self, Kind::Str)
    }

    /// Kinds that are represented by a pointer to a heap object.
    pub fn is_heap_object(&self) -> bool {
        matches!(self, Kind::Str | Kind::Struct(_))
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Int32 => write!(f, "Int32"),
            Kind::Int64 => write!(f, "Int64"),
            Kind::Float => write!(f, "Float"),
            Kind::Bool => write!(f, "Bool"),
            Kind::Str => write!(f, "Str"),
            Kind::Void => write!(f, "Void"),
            Kind::Never => write!(f, "Never"),
            Kind::Struct(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Ownership {
    Own,
    Borrow,
    Share,
}

impl fmt::Display for Ownership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ownership::Own => write!(f, "own"),
            Ownership::Borrow => write!(f, "borrow"),
            Ownership::Share => write!(f, "share"),
        }
    }
}

// ---------------------------------------------------------------------------
// References
// ---------------------------------------------------------------------------

/// The semantic type of a value handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub ownership: Ownership,
    pub kind: Kind,
}

/// How a reference crosses the host boundary. Computed once per argument
/// or return value and dispatched on, instead of re-testing ownership at
/// every step of marshaling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crossing {
    /// Passed in its native in-region form.
    Owning,
    /// Flattened into the linear layout before crossing.
    Shared,
    /// No data.
    Void,
    /// Never returns.
    Divergent,
}

impl Reference {
    pub fn new(ownership: Ownership, kind: Kind) -> Self {
        Self { ownership, kind }
    }

    pub fn int32() -> Self {
        Self::new(Ownership::Share, Kind::Int32)
    }

    pub fn int64() -> Self {
        Self::new(Ownership::Share, Kind::Int64)
    }

    pub fn float() -> Self {
        Self::new(Ownership::Share, Kind::Float)
    }

    pub fn bool() -> Self {
        Self::new(Ownership::Share, Kind::Bool)
    }

    pub fn void() -> Self {
        Self::new(Ownership::Share, Kind::Void)
    }

    pub fn never() -> Self {
        Self::new(Ownership::Share, Kind::Never)
    }

    pub fn shared_str() -> Self {
        Self::new(Ownership::Share, Kind::Str)
    }

    pub fn owned_str() -> Self {
        Self::new(Ownership::Own, Kind::Str)
    }

    pub fn shared_struct(name: impl Into<String>) -> Self {
        Self::new(Ownership::Share, Kind::Struct(name.into()))
    }

    pub fn owned_struct(name: impl Into<String>) -> Self {
        Self::new(Ownership::Own, Kind::Struct(name.into()))
    }

    pub fn borrowed_struct(name: impl Into<String>) -> Self {
        Self::new(Ownership::Borrow, Kind::Struct(name.into()))
    }

    pub fn is_primitive(&self) -> bool {
        self.kind.is_primitive()
    }

    pub fn is_void(&self) -> bool {
        self.kind == Kind::Void
    }

    pub fn is_never(&self) -> bool {
        self.kind == Kind::Never
    }

    pub fn struct_name(&self) -> Option<&str> {
        match &self.kind {
            Kind::Struct(name) => Some(name.as_str()),
            _ => None,
        }
    }

    pub fn crossing(&self) -> Crossing {
        match (&self.kind, self.ownership) {
            (Kind::Void, _) => Crossing::Void,
            (Kind::Never, _) => Crossing::Divergent,
            (_, Ownership::Share) => Crossing::Shared,
            (_, Ownership::Own | Ownership::Borrow) => Crossing::Owning,
        }
    }

    /// The same value seen through a borrow.
    pub fn as_borrow(&self) -> Self {
        if self.kind.is_heap_object() {
            Self::new(Ownership::Borrow, self.kind.clone())
        } else {
            self.clone()
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind.is_heap_object() {
            write!(f, "{} {}", self.ownership, self.kind)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

// ---------------------------------------------------------------------------
// Struct definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mutability {
    Mutable,
    Immutable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub reference: Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructDef {
    pub name: String,
    pub mutability: Mutability,
    pub fields: Vec<FieldDef>,
}

impl StructDef {
    pub fn immutable(name: impl Into<String>, fields: Vec<(&str, Reference)>) -> Self {
        Self::with_mutability(name, Mutability::Immutable, fields)
    }

    pub fn mutable(name: impl Into<String>, fields: Vec<(&str, Reference)>) -> Self {
        Self::with_mutability(name, Mutability::Mutable, fields)
    }

    fn with_mutability(
        name: impl Into<String>,
        mutability: Mutability,
        fields: Vec<(&str, Reference)>,
    ) -> Self {
        Self {
            name: name.into(),
            mutability,
            fields: fields
                .into_iter()
                .map(|(name, reference)| FieldDef {
                    name: name.to_string(),
                    reference,
                })
                .collect(),
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|field| field.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crossing_is_derived_from_kind_before_ownership() {
        assert_eq!(Reference::void().crossing(), Crossing::Void);
        assert_eq!(Reference::never().crossing(), Crossing::Divergent);
        assert_eq!(Reference::shared_str().crossing(), Crossing::Shared);
        assert_eq!(Reference::int64().crossing(), Crossing::Shared);
        assert_eq!(Reference::owned_struct("Ship").crossing(), Crossing::Owning);
        assert_eq!(
            Reference::borrowed_struct("Ship").crossing(),
            Crossing::Owning
        );
    }

    #[test]
    fn display_omits_ownership_for_primitives() {
        assert_eq!(Reference::int32().to_string(), "Int32");
        assert_eq!(Reference::shared_str().to_string(), "share Str");
        assert_eq!(Reference::owned_struct("Ship").to_string(), "own Ship");
    }

    #[test]
    fn borrow_view_keeps_primitives_unchanged() {
        assert_eq!(Reference::int64().as_borrow(), Reference::int64());
        assert_eq!(
            Reference::owned_struct("Ship").as_borrow(),
            Reference::borrowed_struct("Ship")
        );
    }

    #[test]
    fn field_index_finds_declared_fields() {
        let def = StructDef::immutable(
            "Seaship",
            vec![("leftFuel", Reference::int64()), ("rightFuel", Reference::int64())],
        );
        assert_eq!(def.field_index("rightFuel"), Some(1));
        assert_eq!(def.field_index("fuel"), None);
    }
}
