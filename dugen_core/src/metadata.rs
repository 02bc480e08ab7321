use crate::handle::{Candidate, DeclaringType};
use indexmap::{IndexMap, IndexSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by metadata backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    /// The entity is unknown to every queried view. Callers treat this as
    /// non-fatal and skip whatever they were resolving.
    #[error("{kind} '{name}' not found in metadata")]
    NotFound { kind: EntityKind, name: String },

    /// The metadata file could not be read or parsed.
    #[error("Metadata load error: {0}")]
    Load(String),

    /// The metadata file describes a different assembly than the one configured.
    #[error("Metadata describes assembly '{found}', expected '{expected}'")]
    AssemblyMismatch { expected: String, found: String },
}

/// Namespace of a metadata entity. Fields and methods are resolved separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Field,
    Method,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Field => f.write_str("field"),
            EntityKind::Method => f.write_str("method"),
        }
    }
}

/// A reference to a field or method by qualified name, not yet resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef<'a> {
    Field(&'a str),
    Method(&'a str),
}

impl EntityRef<'_> {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRef::Field(_) => EntityKind::Field,
            EntityRef::Method(_) => EntityKind::Method,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            EntityRef::Field(name) | EntityRef::Method(name) => name,
        }
    }

    fn not_found(&self) -> MetadataError {
        MetadataError::NotFound {
            kind: self.kind(),
            name: self.name().to_string(),
        }
    }
}

/// Which data source a metadata database represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataView {
    /// Produced by analysis before any execution.
    Static,
    /// Observed at runtime by prior executions of generated tests.
    Dynamic,
}

impl MetadataView {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetadataView::Static => "static",
            MetadataView::Dynamic => "dynamic",
        }
    }
}

/// A `MetadataDatabase` answers one question: which type declares a given
/// field or method.
///
/// The static and dynamic views implement the same contract, so everything
/// that resolves handles (the extractor in particular) is agnostic of where
/// the answer comes from.
pub trait MetadataDatabase: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &'static str;

    /// Resolves the declaring type of `entity`.
    ///
    /// # Returns
    /// The declaring type, or `MetadataError::NotFound` if this database has
    /// no record of the entity.
    fn resolve_declaring_type(&self, entity: EntityRef<'_>) -> Result<DeclaringType, MetadataError>;
}

/// Capability of a metadata database to enumerate def/use candidate triples.
pub trait CandidateSource: MetadataDatabase {
    /// Every type this source knows about, in a deterministic order.
    fn known_types(&self) -> Vec<DeclaringType>;

    /// For each field declared by one of `types`, the cross product of the
    /// methods defining it and the methods using it.
    ///
    /// Methods are taken from all known types, not just the field's own type;
    /// combinations that cross types are returned and left to the extractor
    /// to reject.
    fn candidates(&self, types: &[DeclaringType]) -> Vec<Candidate>;
}

#[derive(Debug, Clone)]
struct MethodInfo {
    declaring_type: DeclaringType,
    defines: IndexSet<String>,
    uses: IndexSet<String>,
}

#[derive(Debug, Default)]
struct MetadataTables {
    types: IndexSet<DeclaringType>,
    fields: IndexMap<String, DeclaringType>,
    methods: IndexMap<String, MethodInfo>,
}

/// An in-memory, append-only metadata database.
///
/// Entries can be added at any time but are never removed, and an entity keeps
/// the declaring type it was first recorded with.
#[derive(Debug)]
pub struct InMemoryMetadata {
    view: MetadataView,
    tables: RwLock<MetadataTables>,
}

impl InMemoryMetadata {
    pub fn new(view: MetadataView) -> Self {
        Self {
            view,
            tables: RwLock::new(MetadataTables::default()),
        }
    }

    pub fn view(&self) -> MetadataView {
        self.view
    }

    /// Records that `declaring_type` declares the field `name`.
    ///
    /// Returns `true` if the field was new. A field already recorded under a
    /// different type is left untouched.
    pub fn declare_field(&self, declaring_type: DeclaringType, name: &str) -> bool {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.fields.get(name) {
            if *existing != declaring_type {
                warn!(
                    view = self.view.as_str(),
                    field = name,
                    recorded = %existing,
                    ignored = %declaring_type,
                    "Field already declared on another type, ignoring redeclaration"
                );
            }
            return false;
        }
        tables.types.insert(declaring_type.clone());
        tables.fields.insert(name.to_string(), declaring_type);
        true
    }

    /// Records a method of `declaring_type` together with the fields it
    /// defines (writes) and uses (reads).
    ///
    /// Redeclaring a known method on the same type extends its def/use sets.
    /// Returns `true` if the method was new.
    pub fn declare_method(
        &self,
        declaring_type: DeclaringType,
        name: &str,
        defines: &[String],
        uses: &[String],
    ) -> bool {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.methods.get_mut(name) {
            if existing.declaring_type != declaring_type {
                warn!(
                    view = self.view.as_str(),
                    method = name,
                    recorded = %existing.declaring_type,
                    ignored = %declaring_type,
                    "Method already declared on another type, ignoring redeclaration"
                );
                return false;
            }
            existing.defines.extend(defines.iter().cloned());
            existing.uses.extend(uses.iter().cloned());
            return false;
        }
        tables.types.insert(declaring_type.clone());
        tables.methods.insert(
            name.to_string(),
            MethodInfo {
                declaring_type,
                defines: defines.iter().cloned().collect(),
                uses: uses.iter().cloned().collect(),
            },
        );
        true
    }

    /// Records an entity reported by an execution. Only meaningful for the
    /// dynamic view, but accepted on either.
    pub fn observe(&self, observed: &ObservedEntity) -> bool {
        let declaring_type = DeclaringType::new(observed.declaring_type.as_str());
        match observed.kind {
            EntityKind::Field => self.declare_field(declaring_type, &observed.name),
            EntityKind::Method => self.declare_method(declaring_type, &observed.name, &[], &[]),
        }
    }

    /// Appends every type described by `file` to this database.
    pub fn extend_from(&self, file: &MetadataFile) {
        for ty in &file.types {
            let declaring_type = DeclaringType::new(ty.name.as_str());
            self.tables.write().types.insert(declaring_type.clone());
            for field in &ty.fields {
                self.declare_field(declaring_type.clone(), field);
            }
            for method in &ty.methods {
                self.declare_method(
                    declaring_type.clone(),
                    &method.name,
                    &method.defines,
                    &method.uses,
                );
            }
        }
    }

    /// Loads a metadata file into a new database for `view`.
    ///
    /// If `expected_assembly` is given, the file's `assembly` must match it.
    pub fn load_from_file(
        path: &Path,
        view: MetadataView,
        expected_assembly: Option<&str>,
    ) -> Result<Self, MetadataError> {
        let file = MetadataFile::load(path)?;
        if let Some(expected) = expected_assembly {
            if file.assembly != expected {
                return Err(MetadataError::AssemblyMismatch {
                    expected: expected.to_string(),
                    found: file.assembly,
                });
            }
        }
        let db = Self::new(view);
        db.extend_from(&file);
        debug!(
            view = view.as_str(),
            path = ?path,
            types = file.types.len(),
            "Loaded metadata"
        );
        Ok(db)
    }

    pub fn len_types(&self) -> usize {
        self.tables.read().types.len()
    }
}

impl MetadataDatabase for InMemoryMetadata {
    fn name(&self) -> &'static str {
        self.view.as_str()
    }

    fn resolve_declaring_type(
        &self,
        entity: EntityRef<'_>,
    ) -> Result<DeclaringType, MetadataError> {
        let tables = self.tables.read();
        let found = match entity {
            EntityRef::Field(name) => tables.fields.get(name).cloned(),
            EntityRef::Method(name) => tables.methods.get(name).map(|m| m.declaring_type.clone()),
        };
        found.ok_or_else(|| entity.not_found())
    }
}

impl CandidateSource for InMemoryMetadata {
    fn known_types(&self) -> Vec<DeclaringType> {
        self.tables.read().types.iter().cloned().collect()
    }

    fn candidates(&self, types: &[DeclaringType]) -> Vec<Candidate> {
        let tables = self.tables.read();
        let mut out = Vec::new();
        for ty in types {
            for (field, _) in tables.fields.iter().filter(|(_, owner)| *owner == ty) {
                let writers = tables
                    .methods
                    .iter()
                    .filter(|(_, m)| m.defines.contains(field));
                for (def, _) in writers {
                    let readers = tables
                        .methods
                        .iter()
                        .filter(|(_, m)| m.uses.contains(field));
                    for (use_method, _) in readers {
                        out.push(Candidate::new(field, def, use_method));
                    }
                }
            }
        }
        out
    }
}

/// Order in which the static and dynamic views are consulted.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ViewPolicy {
    Static,
    Dynamic,
    #[default]
    StaticThenDynamic,
}

/// The static and dynamic views composed under a [`ViewPolicy`].
///
/// Resolution returns the first view's answer; enumeration concatenates the
/// views in order and drops repeated triples.
pub struct MetadataViews {
    static_view: Arc<dyn CandidateSource>,
    dynamic_view: Arc<InMemoryMetadata>,
    policy: ViewPolicy,
}

impl MetadataViews {
    pub fn new(
        static_view: Arc<dyn CandidateSource>,
        dynamic_view: Arc<InMemoryMetadata>,
        policy: ViewPolicy,
    ) -> Self {
        Self {
            static_view,
            dynamic_view,
            policy,
        }
    }

    pub fn policy(&self) -> ViewPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: ViewPolicy) {
        self.policy = policy;
    }

    /// The append-only runtime view.
    pub fn dynamic_view(&self) -> &Arc<InMemoryMetadata> {
        &self.dynamic_view
    }

    fn ordered(&self) -> Vec<&dyn CandidateSource> {
        let dynamic: &dyn CandidateSource = self.dynamic_view.as_ref();
        match self.policy {
            ViewPolicy::Static => vec![self.static_view.as_ref()],
            ViewPolicy::Dynamic => vec![dynamic],
            ViewPolicy::StaticThenDynamic => vec![self.static_view.as_ref(), dynamic],
        }
    }
}

impl MetadataDatabase for MetadataViews {
    fn name(&self) -> &'static str {
        "views"
    }

    fn resolve_declaring_type(
        &self,
        entity: EntityRef<'_>,
    ) -> Result<DeclaringType, MetadataError> {
        for view in self.ordered() {
            if let Ok(found) = view.resolve_declaring_type(entity) {
                return Ok(found);
            }
        }
        Err(entity.not_found())
    }
}

impl CandidateSource for MetadataViews {
    fn known_types(&self) -> Vec<DeclaringType> {
        let mut seen = IndexSet::new();
        for view in self.ordered() {
            seen.extend(view.known_types());
        }
        seen.into_iter().collect()
    }

    fn candidates(&self, types: &[DeclaringType]) -> Vec<Candidate> {
        let mut seen = IndexSet::new();
        for view in self.ordered() {
            seen.extend(view.candidates(types));
        }
        seen.into_iter().collect()
    }
}

/// An entity reported as observed by an execution of generated tests.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ObservedEntity {
    pub kind: EntityKind,
    pub name: String,
    pub declaring_type: String,
}

/// On-disk description of an assembly's types, fields and methods.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MetadataFile {
    pub assembly: String,
    #[serde(default)]
    pub types: Vec<TypeEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TypeEntry {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub methods: Vec<MethodEntry>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct MethodEntry {
    pub name: String,
    #[serde(default)]
    pub defines: Vec<String>,
    #[serde(default)]
    pub uses: Vec<String>,
}

impl MetadataFile {
    pub fn load(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MetadataError::Load(format!("Failed to read metadata file {:?}: {}", path, e))
        })?;
        Self::parse(&content)
            .map_err(|e| MetadataError::Load(format!("In metadata file {:?}: {}", path, e)))
    }

    pub fn parse(content: &str) -> Result<Self, MetadataError> {
        toml::from_str(content)
            .map_err(|e| MetadataError::Load(format!("Failed to parse metadata TOML: {}", e)))
    }
}
