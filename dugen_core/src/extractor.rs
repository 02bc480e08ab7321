use crate::handle::{
    Candidate, DeclaringType, DeclaringTypeMismatch, DuPair, FieldHandle, MethodHandle,
};
use crate::metadata::{EntityRef, MetadataDatabase, MetadataError};
use thiserror::Error;

/// Why a candidate triple did not become a [`DuPair`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectionReason {
    #[error("Unresolved declaring type: {0}")]
    UnresolvedType(MetadataError),
    #[error("Type mismatch: {0}")]
    TypeMismatch(#[from] DeclaringTypeMismatch),
}

/// Turns raw (field, definition, use) observations into DU pairs.
///
/// Extraction is pure: it only reads metadata. Registering the result is left
/// to the caller.
pub struct DuPairExtractor<'a> {
    metadata: &'a dyn MetadataDatabase,
}

impl<'a> DuPairExtractor<'a> {
    pub fn new(metadata: &'a dyn MetadataDatabase) -> Self {
        Self { metadata }
    }

    pub fn extract(
        &self,
        field: &str,
        def_method: &str,
        use_method: &str,
    ) -> Result<DuPair, RejectionReason> {
        let field_type = self.resolve(EntityRef::Field(field))?;
        let def_type = self.resolve(EntityRef::Method(def_method))?;
        let use_type = self.resolve(EntityRef::Method(use_method))?;

        let pair = DuPair::new(
            FieldHandle::new(field, field_type),
            MethodHandle::new(def_method, def_type),
            MethodHandle::new(use_method, use_type),
        )?;
        Ok(pair)
    }

    fn resolve(&self, entity: EntityRef<'_>) -> Result<DeclaringType, RejectionReason> {
        self.metadata
            .resolve_declaring_type(entity)
            .map_err(RejectionReason::UnresolvedType)
    }

    pub fn extract_candidate(&self, candidate: &Candidate) -> Result<DuPair, RejectionReason> {
        self.extract(
            &candidate.field,
            &candidate.def_method,
            &candidate.use_method,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{EntityKind, InMemoryMetadata, MetadataView};
    use proptest::prelude::*;

    fn metadata() -> InMemoryMetadata {
        let db = InMemoryMetadata::new(MetadataView::Static);
        db.declare_field("T".into(), "T.F");
        db.declare_method("T".into(), "T.Set", &["T.F".to_string()], &[]);
        db.declare_method("T".into(), "T.Get", &[], &["T.F".to_string()]);
        db.declare_field("A".into(), "A.F");
        db.declare_method("A".into(), "A.Set", &["A.F".to_string()], &[]);
        db.declare_method("B".into(), "B.Get", &[], &["A.F".to_string()]);
        db
    }

    #[test]
    fn same_type_triple_is_accepted() {
        let db = metadata();
        let extractor = DuPairExtractor::new(&db);
        let pair = extractor.extract("T.F", "T.Set", "T.Get").unwrap();
        assert_eq!(pair.declaring_type(), &DeclaringType::from("T"));
        assert_eq!(pair.field().name(), "T.F");
        assert_eq!(pair.def_method().name(), "T.Set");
        assert_eq!(pair.use_method().name(), "T.Get");
    }

    #[test]
    fn cross_type_triple_is_rejected_as_mismatch() {
        let db = metadata();
        let extractor = DuPairExtractor::new(&db);
        match extractor.extract("A.F", "A.Set", "B.Get") {
            Err(RejectionReason::TypeMismatch(mismatch)) => {
                assert_eq!(mismatch.use_type, DeclaringType::from("B"));
            }
            other => panic!("Expected TypeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn unknown_entity_is_rejected_as_unresolved() {
        let db = metadata();
        let extractor = DuPairExtractor::new(&db);
        let candidate = Candidate::new("T.F", "T.Set", "T.Missing");
        assert_eq!(
            extractor.extract_candidate(&candidate),
            Err(RejectionReason::UnresolvedType(MetadataError::NotFound {
                kind: EntityKind::Method,
                name: "T.Missing".to_string(),
            }))
        );
    }

    proptest! {
        #[test]
        fn differing_declaring_types_never_yield_a_pair(
            field_ty in 0usize..3,
            def_ty in 0usize..3,
            use_ty in 0usize..3,
        ) {
            let names = ["A", "B", "C"];
            let db = InMemoryMetadata::new(MetadataView::Static);
            db.declare_field(names[field_ty].into(), "f");
            db.declare_method(names[def_ty].into(), "def", &[], &[]);
            db.declare_method(names[use_ty].into(), "use", &[], &[]);
            let result = DuPairExtractor::new(&db).extract("f", "def", "use");

            if field_ty == def_ty && def_ty == use_ty {
                prop_assert!(result.is_ok());
            } else {
                prop_assert!(
                    matches!(result, Err(RejectionReason::TypeMismatch(_))),
                    "expected TypeMismatch, got {:?}",
                    result
                );
            }
        }
    }
}
