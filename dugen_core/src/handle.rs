use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Qualified name of a type that declares fields and methods.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeclaringType(String);

impl DeclaringType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeclaringType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeclaringType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A field whose declaring type has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldHandle {
    name: String,
    declaring_type: DeclaringType,
}

impl FieldHandle {
    pub fn new(name: impl Into<String>, declaring_type: DeclaringType) -> Self {
        Self {
            name: name.into(),
            declaring_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaring_type(&self) -> &DeclaringType {
        &self.declaring_type
    }
}

/// A method whose declaring type has been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodHandle {
    name: String,
    declaring_type: DeclaringType,
}

impl MethodHandle {
    pub fn new(name: impl Into<String>, declaring_type: DeclaringType) -> Self {
        Self {
            name: name.into(),
            declaring_type,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn declaring_type(&self) -> &DeclaringType {
        &self.declaring_type
    }
}

/// The three handles of a candidate pair do not share one declaring type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "declaring types differ: field on '{field_type}', definition on '{def_type}', use on '{use_type}'"
)]
pub struct DeclaringTypeMismatch {
    pub field_type: DeclaringType,
    pub def_type: DeclaringType,
    pub use_type: DeclaringType,
}

/// A definition-use pair: `def_method` writes `field`, `use_method` reads it.
///
/// All three handles are guaranteed to share a declaring type; the only way to
/// obtain a `DuPair` is through [`DuPair::new`], which checks this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DuPair {
    field: FieldHandle,
    def_method: MethodHandle,
    use_method: MethodHandle,
}

impl DuPair {
    pub fn new(
        field: FieldHandle,
        def_method: MethodHandle,
        use_method: MethodHandle,
    ) -> Result<Self, DeclaringTypeMismatch> {
        if field.declaring_type() != def_method.declaring_type()
            || field.declaring_type() != use_method.declaring_type()
        {
            return Err(DeclaringTypeMismatch {
                field_type: field.declaring_type().clone(),
                def_type: def_method.declaring_type().clone(),
                use_type: use_method.declaring_type().clone(),
            });
        }
        Ok(Self {
            field,
            def_method,
            use_method,
        })
    }

    pub fn field(&self) -> &FieldHandle {
        &self.field
    }

    pub fn def_method(&self) -> &MethodHandle {
        &self.def_method
    }

    pub fn use_method(&self) -> &MethodHandle {
        &self.use_method
    }

    pub fn declaring_type(&self) -> &DeclaringType {
        self.field.declaring_type()
    }

    /// The unresolved triple this pair was built from.
    pub fn to_candidate(&self) -> Candidate {
        Candidate::new(
            self.field.name(),
            self.def_method.name(),
            self.use_method.name(),
        )
    }
}

impl fmt::Display for DuPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{} -> {}]",
            self.field.name(),
            self.def_method.name(),
            self.use_method.name()
        )
    }
}

/// Status of a registered pair. Only ever moves from `Uncovered` to `Covered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CoverageStatus {
    #[default]
    Uncovered,
    Covered,
}

/// An unresolved (field, definition, use) triple of qualified names, as
/// enumerated from metadata or reported back by the test engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Candidate {
    pub field: String,
    pub def_method: String,
    pub use_method: String,
}

impl Candidate {
    pub fn new(
        field: impl Into<String>,
        def_method: impl Into<String>,
        use_method: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            def_method: def_method.into(),
            use_method: use_method.into(),
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.field, self.def_method, self.use_method)
    }
}

/// A generated parameterized test stub for one declaring type.
///
/// Two records are duplicates when their `(declaring_type, body)` match; the
/// targeted pair is carried along for reporting only.
#[derive(Debug, Clone)]
pub struct PutRecord {
    pub declaring_type: DeclaringType,
    pub body: String,
    pub pair: DuPair,
}

impl PutRecord {
    pub fn dedup_key(&self) -> (&DeclaringType, &str) {
        (&self.declaring_type, &self.body)
    }
}
