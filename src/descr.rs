//! Index descriptors: the shape an index imposes on its tuples and keys.

use std::cmp::Ordering;

use crate::error::{EngineError, Result};
use crate::tuple::{
    form_tuple, FieldInit, FieldValue, FixedFormatSpec, Tuple, TupleDescriptor, TupleReader,
};
use crate::types::{ColumnKind, Datum, RelOids};

/// Default collation oid used where no collation is relevant.
pub const DEFAULT_COLLATION: u32 = 100;

/// Default page fill target for bulk builds, in percent.
pub const DEFAULT_FILLFACTOR: u8 = 90;

/// What role an index plays for its table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IndexKind {
    /// The table's primary index; leaf tuples are full rows.
    Primary,
    /// A secondary index; leaf tuples are key plus primary-key columns.
    Secondary,
    /// The table's TOAST tree holding out-of-line values.
    Toast,
    /// The bridge index mapping heap pointers for bridged indexes.
    Bridge,
}

/// Durability class of the relation backing an index.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StorageKind {
    /// Checkpointed and WAL-protected.
    Persistent,
    /// Survives clean shutdown only.
    Unlogged,
    /// Session-local; never reaches the checkpoint file.
    Temporary,
}

/// One indexed column.
#[derive(Clone, Copy, Debug)]
pub struct IndexField {
    /// Column datatype.
    pub kind: ColumnKind,
    /// Collation oid; only meaningful for collatable types.
    pub collation: u32,
    /// Ascending sort order.
    pub ascending: bool,
    /// Nulls sort before non-nulls.
    pub nulls_first: bool,
}

impl IndexField {
    /// Ascending, nulls-last field of the given kind.
    pub fn new(kind: ColumnKind) -> Self {
        Self {
            kind,
            collation: DEFAULT_COLLATION,
            ascending: true,
            nulls_first: false,
        }
    }
}

/// Applies one field's sort options to a pair of `(datum, isnull)` values.
///
/// Mirrors the standard sort-support comparator: null placement is governed
/// by `nulls_first`, and a descending field flips the datum comparison only.
pub fn apply_sort_comparator(
    field: &IndexField,
    a: (Datum, bool),
    b: (Datum, bool),
) -> Ordering {
    match (a.1, b.1) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if field.nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if field.nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let cmp = field.kind.compare_datums(a.0, b.0);
            if field.ascending {
                cmp
            } else {
                cmp.reverse()
            }
        }
    }
}

/// Everything the storage layer needs to know about one index.
///
/// Key fields are the leading leaf-tuple fields; the non-leaf tuple shape is
/// exactly that prefix. Constructed once per index and shared read-only.
#[derive(Clone, Debug)]
pub struct IndexDescriptor {
    /// Index name, used in error reports.
    pub name: String,
    /// Owning relation identity.
    pub oids: RelOids,
    /// Role of the index.
    pub kind: IndexKind,
    /// Durability class.
    pub storage: StorageKind,
    /// Whether duplicate keys are rejected.
    pub unique: bool,
    /// Whether the primary key is the row's physical address.
    pub primary_is_ctid: bool,
    /// Whether the table maintains a bridge index.
    pub bridging: bool,
    /// Bulk-build page fill target in percent.
    pub fillfactor: u8,
    /// Leaf tuple columns; the key prefix comes first.
    pub fields: Vec<IndexField>,
    /// Number of leading fields forming the search key.
    pub n_key_fields: usize,
    /// Number of leading fields subject to the uniqueness constraint.
    pub n_unique_fields: usize,
    /// Leaf tuple column layout.
    pub leaf_tupdesc: TupleDescriptor,
    /// Non-leaf (key-only) tuple column layout.
    pub nonleaf_tupdesc: TupleDescriptor,
    /// Fixed-format spec for leaf tuples.
    pub leaf_spec: FixedFormatSpec,
    /// Fixed-format spec for non-leaf tuples.
    pub nonleaf_spec: FixedFormatSpec,
}

impl IndexDescriptor {
    /// Builds a descriptor for an index whose leaf tuples have `fields`
    /// columns, the first `n_key_fields` of which form the key.
    pub fn new(
        name: impl Into<String>,
        oids: RelOids,
        kind: IndexKind,
        fields: Vec<IndexField>,
        n_key_fields: usize,
    ) -> Result<Self> {
        if n_key_fields == 0 || n_key_fields > fields.len() {
            return Err(EngineError::InvalidArgument(
                "key field count out of range".into(),
            ));
        }
        for field in &fields[..n_key_fields] {
            if field.kind == ColumnKind::Bytes {
                return Err(EngineError::InvalidArgument(
                    "variable-width columns cannot be key fields".into(),
                ));
            }
        }
        let leaf_kinds: Vec<ColumnKind> = fields.iter().map(|f| f.kind).collect();
        let nonleaf_kinds = &leaf_kinds[..n_key_fields];
        let leaf_tupdesc = TupleDescriptor::new(&leaf_kinds);
        let nonleaf_tupdesc = TupleDescriptor::new(nonleaf_kinds);
        let leaf_spec = spec_for(&leaf_tupdesc);
        let nonleaf_spec = spec_for(&nonleaf_tupdesc);
        Ok(Self {
            name: name.into(),
            oids,
            kind,
            storage: StorageKind::Persistent,
            unique: false,
            primary_is_ctid: false,
            bridging: false,
            fillfactor: DEFAULT_FILLFACTOR,
            fields,
            n_key_fields,
            n_unique_fields: n_key_fields,
            leaf_tupdesc,
            nonleaf_tupdesc,
            leaf_spec,
            nonleaf_spec,
        })
    }

    /// Marks the index unique.
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Overrides the storage class.
    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    /// Overrides the fill target.
    pub fn with_fillfactor(mut self, fillfactor: u8) -> Self {
        debug_assert!((10..=100).contains(&fillfactor));
        self.fillfactor = fillfactor;
        self
    }

    /// Total number of leaf columns.
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    /// True when every non-leaf tuple is pure fixed format.
    pub fn nonleaf_fixed(&self) -> bool {
        self.nonleaf_spec.natts as usize == self.nonleaf_tupdesc.natts()
    }

    /// Extracts the key prefix of a leaf tuple as a non-leaf tuple.
    ///
    /// A fixed-format leaf tuple shares its leading bytes with the key, so
    /// the common case is a cheap slice; tuples with nulls or variable
    /// prefixes are re-formed field by field.
    pub fn make_key(&self, tuple: &Tuple) -> Result<Tuple> {
        if tuple.is_fixed() {
            let len = self.nonleaf_spec.len as usize;
            if tuple.data.len() < len {
                return Err(EngineError::Corruption(
                    "leaf tuple shorter than its key prefix".into(),
                ));
            }
            return Ok(Tuple::new(tuple.flags, tuple.data.slice(0..len)));
        }
        let mut reader = TupleReader::new(tuple, &self.leaf_tupdesc, &self.leaf_spec)?;
        let mut inits: Vec<Option<FieldInit<'_>>> = Vec::with_capacity(self.n_key_fields);
        for _ in 0..self.n_key_fields {
            match reader.next_field()? {
                FieldValue::Null => inits.push(None),
                FieldValue::Datum(d) => inits.push(Some(FieldInit::Datum(d))),
                FieldValue::Bytes(_) | FieldValue::Toast(_) => {
                    return Err(EngineError::Corruption(
                        "variable-width value in key prefix".into(),
                    ))
                }
            }
        }
        form_tuple(
            &self.nonleaf_tupdesc,
            &self.nonleaf_spec,
            crate::tuple::tuple_version(tuple),
            &inits,
        )
    }

    /// Forms a fixed-format leaf tuple from datums, for loaders and tests.
    pub fn form_leaf_tuple(&self, datums: &[Datum]) -> Result<Tuple> {
        let inits: Vec<Option<FieldInit<'_>>> =
            datums.iter().map(|&d| Some(FieldInit::Datum(d))).collect();
        form_tuple(&self.leaf_tupdesc, &self.leaf_spec, 0, &inits)
    }
}

/// Computes the fixed-format spec covering a descriptor's fixed prefix.
fn spec_for(desc: &TupleDescriptor) -> FixedFormatSpec {
    let mut natts = 0usize;
    for col in desc.columns() {
        if col.kind.fixed_len().is_none() {
            break;
        }
        natts += 1;
    }
    let len = desc.fixed_len(natts).unwrap_or(0);
    FixedFormatSpec {
        natts: natts as u16,
        len: len as u16,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::read_datum;

    fn two_col_index() -> IndexDescriptor {
        IndexDescriptor::new(
            "idx_pair",
            RelOids {
                datoid: 1,
                relnode: 2,
            },
            IndexKind::Primary,
            vec![
                IndexField::new(ColumnKind::Int64),
                IndexField::new(ColumnKind::Int32),
            ],
            1,
        )
        .expect("descriptor")
    }

    #[test]
    fn specs_cover_fixed_columns() {
        let idx = two_col_index();
        assert_eq!(idx.leaf_spec.natts, 2);
        assert_eq!(idx.leaf_spec.len, 16);
        assert_eq!(idx.nonleaf_spec.natts, 1);
        assert_eq!(idx.nonleaf_spec.len, 8);
        assert!(idx.nonleaf_fixed());
    }

    #[test]
    fn make_key_slices_fixed_tuples() {
        let idx = two_col_index();
        let tuple = idx
            .form_leaf_tuple(&[Datum::from_i64(44), Datum::from_i32(-1)])
            .expect("leaf tuple");
        let key = idx.make_key(&tuple).expect("key");
        assert!(key.is_fixed());
        assert_eq!(key.data.len(), 8);
        let (d, isnull) =
            read_datum(&key, 1, &idx.nonleaf_tupdesc, &idx.nonleaf_spec).expect("key attr");
        assert!(!isnull);
        assert_eq!(d.as_i64(), 44);
    }

    #[test]
    fn bytes_key_field_is_rejected() {
        let err = IndexDescriptor::new(
            "idx_bad",
            RelOids {
                datoid: 1,
                relnode: 3,
            },
            IndexKind::Secondary,
            vec![IndexField::new(ColumnKind::Bytes)],
            1,
        )
        .expect_err("bytes key must be rejected");
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn descending_comparator_flips_datums_not_nulls() {
        let field = IndexField {
            kind: ColumnKind::Int32,
            collation: DEFAULT_COLLATION,
            ascending: false,
            nulls_first: false,
        };
        let lo = (Datum::from_i32(1), false);
        let hi = (Datum::from_i32(2), false);
        let null = (Datum::default(), true);
        assert_eq!(apply_sort_comparator(&field, lo, hi), Ordering::Greater);
        assert_eq!(apply_sort_comparator(&field, null, hi), Ordering::Greater);
    }
}
