//! Tuple sorting for index builds.
//!
//! Three flavors share one external sorter: plain index-build sorts over
//! leaf tuples, primary-key rebuild sorts over `(new key, old key, location
//! hint)` triples, and TOAST sorts over `(primary key, attnum, chunk)`
//! records. Uniqueness, when an index demands it, is enforced inside the
//! comparator: two fully equal non-null keys record a violation that the
//! sorter raises before handing out any tuple, so a failing build never
//! reaches page I/O.

pub mod external;

use std::cell::Cell;
use std::cmp::Ordering;

use bytes::Bytes;

use crate::descr::{apply_sort_comparator, IndexDescriptor, IndexField};
use crate::error::{EngineError, Result};
use crate::sort::external::{ExternalSorter, SortCodec, SortEntry};
use crate::tuple::{
    read_datum_raw, tuple_size, tuple_size_raw, FixedFormatSpec, Tuple, TupleDescriptor,
};
use crate::types::{max_align, ColumnKind, Datum, MAX_ALIGN};

/// Default in-memory budget for sorts.
pub const DEFAULT_SORT_WORK_MEM: usize = 4 * 1024 * 1024;

const RECORD_HEADER: usize = MAX_ALIGN;

#[derive(Clone)]
struct SortKey {
    attnum: u16,
    field: IndexField,
}

fn pack_tuple_record(tuple: &Tuple, spec: &FixedFormatSpec) -> Vec<u8> {
    let size = tuple_size(tuple, spec);
    let mut payload = vec![0u8; RECORD_HEADER + size];
    payload[0] = tuple.flags;
    payload[RECORD_HEADER..].copy_from_slice(&tuple.data[..size]);
    payload
}

fn unpack_tuple_record(payload: &[u8]) -> (&[u8], u8) {
    (&payload[RECORD_HEADER..], payload[0])
}

/// Codec for leaf-tuple sorts (index build and TOAST flavors).
pub struct IndexBuildCodec {
    tupdesc: TupleDescriptor,
    spec: FixedFormatSpec,
    keys: Vec<SortKey>,
    enforce_unique: bool,
    index_name: String,
    violated: Cell<bool>,
}

impl SortCodec for IndexBuildCodec {
    fn compare(&self, a: &SortEntry, b: &SortEntry) -> Ordering {
        let cmp = apply_sort_comparator(
            &self.keys[0].field,
            (a.datum1, a.isnull1),
            (b.datum1, b.isnull1),
        );
        if cmp != Ordering::Equal {
            return cmp;
        }
        let mut equal_hasnull = a.isnull1;
        let (a_data, a_flags) = unpack_tuple_record(&a.payload);
        let (b_data, b_flags) = unpack_tuple_record(&b.payload);
        for key in &self.keys[1..] {
            let (da, na) = read_datum_raw(a_data, a_flags, key.attnum, &self.tupdesc, &self.spec)
                .expect("sorter-packed tuple is readable");
            let (db, nb) = read_datum_raw(b_data, b_flags, key.attnum, &self.tupdesc, &self.spec)
                .expect("sorter-packed tuple is readable");
            let cmp = apply_sort_comparator(&key.field, (da, na), (db, nb));
            if cmp != Ordering::Equal {
                return cmp;
            }
            if na {
                equal_hasnull = true;
            }
        }
        // Fully equal keys without a null violate a unique index.
        if self.enforce_unique && !equal_hasnull {
            self.violated.set(true);
        }
        Ordering::Equal
    }

    fn leading(&self, payload: &[u8]) -> Result<(Datum, bool)> {
        let (data, flags) = unpack_tuple_record(payload);
        read_datum_raw(data, flags, self.keys[0].attnum, &self.tupdesc, &self.spec)
    }

    fn take_violation(&self) -> Option<EngineError> {
        if self.violated.replace(false) {
            Some(EngineError::UniqueViolation {
                index: self.index_name.clone(),
            })
        } else {
            None
        }
    }
}

/// Sorter producing leaf tuples in index order.
pub struct IndexBuildSorter {
    inner: ExternalSorter<IndexBuildCodec>,
}

impl IndexBuildSorter {
    /// Sort for building `desc`. Unique indexes sort (and deduplicate-check)
    /// on the key columns only; others sort on every leaf column.
    pub fn begin(desc: &IndexDescriptor, work_mem: usize) -> Self {
        let sort_fields = if desc.unique {
            desc.n_key_fields
        } else {
            desc.n_fields()
        };
        let keys = (0..sort_fields)
            .map(|i| SortKey {
                attnum: (i + 1) as u16,
                field: desc.fields[i],
            })
            .collect();
        let codec = IndexBuildCodec {
            tupdesc: desc.leaf_tupdesc.clone(),
            spec: desc.leaf_spec,
            keys,
            enforce_unique: desc.unique,
            index_name: desc.name.clone(),
            violated: Cell::new(false),
        };
        Self {
            inner: ExternalSorter::new(codec, work_mem),
        }
    }

    /// Sort for rebuilding `toast`'s tree: the table's primary key columns
    /// followed by synthesized `(attnum, chunk number)` sort keys with
    /// fixed comparator resolution. TOAST trees are always unique.
    pub fn begin_toast(
        toast: &IndexDescriptor,
        primary: &IndexDescriptor,
        work_mem: usize,
    ) -> Self {
        let key_fields = primary.n_key_fields;
        let mut keys: Vec<SortKey> = (0..key_fields)
            .map(|i| SortKey {
                attnum: (i + 1) as u16,
                field: primary.fields[i],
            })
            .collect();
        keys.push(SortKey {
            attnum: (key_fields + 1) as u16,
            field: IndexField::new(ColumnKind::Int16),
        });
        keys.push(SortKey {
            attnum: (key_fields + 2) as u16,
            field: IndexField::new(ColumnKind::Int32),
        });
        let codec = IndexBuildCodec {
            tupdesc: toast.leaf_tupdesc.clone(),
            spec: toast.leaf_spec,
            keys,
            enforce_unique: true,
            index_name: toast.name.clone(),
            violated: Cell::new(false),
        };
        Self {
            inner: ExternalSorter::new(codec, work_mem),
        }
    }

    /// Feeds one leaf tuple.
    pub fn put_tuple(&mut self, tuple: &Tuple) -> Result<()> {
        let payload = pack_tuple_record(tuple, &self.inner.codec().spec);
        self.inner.put(payload)
    }

    /// Finishes the fill phase; optional, the first `get_tuple` does it too.
    pub fn perform_sort(&mut self) -> Result<()> {
        self.inner.perform_sort()
    }

    /// Returns the next tuple in index order.
    pub fn get_tuple(&mut self) -> Result<Option<Tuple>> {
        let Some(mut payload) = self.inner.next()? else {
            return Ok(None);
        };
        let data = payload.split_off(RECORD_HEADER);
        Ok(Some(Tuple::new(payload[0], Bytes::from(data))))
    }
}

/// Row address hint carried through a primary-key rebuild.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LocationHint {
    /// In-memory block the row was last seen on.
    pub blkno: u32,
    /// That page's change count at the time.
    pub page_change_count: u32,
}

const HINT_LEN: usize = 8;

/// Codec for primary-key rebuild records.
///
/// Records sort by the new primary key; fully equal new keys tie-break on
/// the old primary key so rows keep a stable relative order.
pub struct PkRebuildCodec {
    new_tupdesc: TupleDescriptor,
    new_spec: FixedFormatSpec,
    old_tupdesc: TupleDescriptor,
    old_spec: FixedFormatSpec,
    new_keys: Vec<SortKey>,
    old_keys: Vec<SortKey>,
    enforce_unique: bool,
    index_name: String,
    violated: Cell<bool>,
}

struct RebuildEntry<'a> {
    new_data: &'a [u8],
    new_flags: u8,
    old_data: &'a [u8],
    old_flags: u8,
    hint: LocationHint,
}

impl PkRebuildCodec {
    /// Packed layout: `[flags|pad][new key][pad][old_len|flags|pad][old key][pad][hint]`.
    fn pack(&self, new_key: &Tuple, old_pk: &Tuple, hint: LocationHint) -> Vec<u8> {
        let new_len = tuple_size(new_key, &self.new_spec);
        let old_len = tuple_size(old_pk, &self.old_spec);
        let old_off = RECORD_HEADER + max_align(new_len);
        let hint_off = old_off + 8 + max_align(old_len);
        let mut payload = vec![0u8; hint_off + HINT_LEN];
        payload[0] = new_key.flags;
        payload[RECORD_HEADER..RECORD_HEADER + new_len].copy_from_slice(&new_key.data[..new_len]);
        payload[old_off..old_off + 4].copy_from_slice(&(old_len as u32).to_le_bytes());
        payload[old_off + 4] = old_pk.flags;
        payload[old_off + 8..old_off + 8 + old_len].copy_from_slice(&old_pk.data[..old_len]);
        payload[hint_off..hint_off + 4].copy_from_slice(&hint.blkno.to_le_bytes());
        payload[hint_off + 4..hint_off + 8]
            .copy_from_slice(&hint.page_change_count.to_le_bytes());
        payload
    }

    fn parse<'a>(&self, payload: &'a [u8]) -> Result<RebuildEntry<'a>> {
        if payload.len() < RECORD_HEADER {
            return Err(EngineError::Corruption("rebuild record truncated".into()));
        }
        let new_flags = payload[0];
        let new_data = &payload[RECORD_HEADER..];
        let new_len = tuple_size_raw(new_data, new_flags, &self.new_spec);
        let old_off = RECORD_HEADER + max_align(new_len);
        if payload.len() < old_off + 8 {
            return Err(EngineError::Corruption("rebuild record truncated".into()));
        }
        let old_len =
            u32::from_le_bytes(payload[old_off..old_off + 4].try_into().expect("4 bytes"))
                as usize;
        let old_flags = payload[old_off + 4];
        let old_start = old_off + 8;
        let hint_off = old_start + max_align(old_len);
        if payload.len() < hint_off + HINT_LEN {
            return Err(EngineError::Corruption("rebuild record truncated".into()));
        }
        let hint = LocationHint {
            blkno: u32::from_le_bytes(
                payload[hint_off..hint_off + 4].try_into().expect("4 bytes"),
            ),
            page_change_count: u32::from_le_bytes(
                payload[hint_off + 4..hint_off + 8]
                    .try_into()
                    .expect("4 bytes"),
            ),
        };
        Ok(RebuildEntry {
            new_data: &new_data[..new_len],
            new_flags,
            old_data: &payload[old_start..old_start + old_len],
            old_flags,
            hint,
        })
    }
}

impl SortCodec for PkRebuildCodec {
    fn compare(&self, a: &SortEntry, b: &SortEntry) -> Ordering {
        let cmp = apply_sort_comparator(
            &self.new_keys[0].field,
            (a.datum1, a.isnull1),
            (b.datum1, b.isnull1),
        );
        if cmp != Ordering::Equal {
            return cmp;
        }
        let ea = self.parse(&a.payload).expect("sorter-packed record is readable");
        let eb = self.parse(&b.payload).expect("sorter-packed record is readable");
        let mut equal_hasnull = a.isnull1;
        for key in &self.new_keys[1..] {
            let (da, na) = read_datum_raw(
                ea.new_data,
                ea.new_flags,
                key.attnum,
                &self.new_tupdesc,
                &self.new_spec,
            )
            .expect("sorter-packed record is readable");
            let (db, nb) = read_datum_raw(
                eb.new_data,
                eb.new_flags,
                key.attnum,
                &self.new_tupdesc,
                &self.new_spec,
            )
            .expect("sorter-packed record is readable");
            let cmp = apply_sort_comparator(&key.field, (da, na), (db, nb));
            if cmp != Ordering::Equal {
                return cmp;
            }
            if na {
                equal_hasnull = true;
            }
        }
        if self.enforce_unique && !equal_hasnull {
            self.violated.set(true);
        }
        // Tie-break on the old primary key to keep positions stable.
        for key in &self.old_keys {
            let (da, na) = read_datum_raw(
                ea.old_data,
                ea.old_flags,
                key.attnum,
                &self.old_tupdesc,
                &self.old_spec,
            )
            .expect("sorter-packed record is readable");
            let (db, nb) = read_datum_raw(
                eb.old_data,
                eb.old_flags,
                key.attnum,
                &self.old_tupdesc,
                &self.old_spec,
            )
            .expect("sorter-packed record is readable");
            let cmp = apply_sort_comparator(&key.field, (da, na), (db, nb));
            if cmp != Ordering::Equal {
                return cmp;
            }
        }
        Ordering::Equal
    }

    fn leading(&self, payload: &[u8]) -> Result<(Datum, bool)> {
        let entry = self.parse(payload)?;
        read_datum_raw(
            entry.new_data,
            entry.new_flags,
            self.new_keys[0].attnum,
            &self.new_tupdesc,
            &self.new_spec,
        )
    }

    fn take_violation(&self) -> Option<EngineError> {
        if self.violated.replace(false) {
            Some(EngineError::UniqueViolation {
                index: self.index_name.clone(),
            })
        } else {
            None
        }
    }
}

/// Sorter for rebuilding a table around a new primary key.
pub struct PkRebuildSorter {
    inner: ExternalSorter<PkRebuildCodec>,
}

impl PkRebuildSorter {
    /// Sort for replacing `old_primary` with `new_primary`.
    pub fn begin(
        new_primary: &IndexDescriptor,
        old_primary: &IndexDescriptor,
        work_mem: usize,
    ) -> Self {
        let new_keys = (0..new_primary.n_key_fields)
            .map(|i| SortKey {
                attnum: (i + 1) as u16,
                field: new_primary.fields[i],
            })
            .collect();
        let old_keys = (0..old_primary.n_key_fields)
            .map(|i| SortKey {
                attnum: (i + 1) as u16,
                field: old_primary.fields[i],
            })
            .collect();
        let codec = PkRebuildCodec {
            new_tupdesc: new_primary.nonleaf_tupdesc.clone(),
            new_spec: new_primary.nonleaf_spec,
            old_tupdesc: old_primary.nonleaf_tupdesc.clone(),
            old_spec: old_primary.nonleaf_spec,
            new_keys,
            old_keys,
            enforce_unique: new_primary.unique,
            index_name: new_primary.name.clone(),
            violated: Cell::new(false),
        };
        Self {
            inner: ExternalSorter::new(codec, work_mem),
        }
    }

    /// Feeds one `(new key, old key, hint)` triple.
    pub fn put_entry(
        &mut self,
        new_key: &Tuple,
        old_pk: &Tuple,
        hint: LocationHint,
    ) -> Result<()> {
        let payload = self.inner.codec().pack(new_key, old_pk, hint);
        self.inner.put(payload)
    }

    /// Returns the next triple in new-key order.
    pub fn get_entry(&mut self) -> Result<Option<(Tuple, Tuple, LocationHint)>> {
        let Some(payload) = self.inner.next()? else {
            return Ok(None);
        };
        let entry = self.inner.codec().parse(&payload)?;
        let new_key = Tuple::new(entry.new_flags, Bytes::copy_from_slice(entry.new_data));
        let old_pk = Tuple::new(entry.old_flags, Bytes::copy_from_slice(entry.old_data));
        Ok(Some((new_key, old_pk, entry.hint)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descr::IndexKind;
    use crate::tuple::{form_tuple, read_datum, FieldInit};
    use crate::types::RelOids;

    fn index(kinds: &[ColumnKind], n_keys: usize, unique: bool) -> IndexDescriptor {
        IndexDescriptor::new(
            "idx_sort",
            RelOids {
                datoid: 5,
                relnode: 6,
            },
            IndexKind::Secondary,
            kinds.iter().map(|&k| IndexField::new(k)).collect(),
            n_keys,
        )
        .expect("descriptor")
        .with_unique(unique)
    }

    fn key_i64(desc: &IndexDescriptor, tuple: &Tuple) -> i64 {
        read_datum(tuple, 1, &desc.leaf_tupdesc, &desc.leaf_spec)
            .expect("attr 1")
            .0
            .as_i64()
    }

    #[test]
    fn shuffled_input_comes_out_ordered() {
        let desc = index(&[ColumnKind::Int64, ColumnKind::Int32], 1, false);
        let mut sorter = IndexBuildSorter::begin(&desc, DEFAULT_SORT_WORK_MEM);
        for value in [44i64, -3, 17, 0, 99, -80, 5] {
            let tuple = desc
                .form_leaf_tuple(&[Datum::from_i64(value), Datum::from_i32(1)])
                .expect("tuple");
            sorter.put_tuple(&tuple).expect("put");
        }
        let mut seen = Vec::new();
        while let Some(tuple) = sorter.get_tuple().expect("get") {
            seen.push(key_i64(&desc, &tuple));
        }
        assert_eq!(seen, vec![-80, -3, 0, 5, 17, 44, 99]);
    }

    #[test]
    fn duplicate_keys_fail_unique_builds() {
        let desc = index(&[ColumnKind::Int64], 1, true);
        let mut sorter = IndexBuildSorter::begin(&desc, DEFAULT_SORT_WORK_MEM);
        for _ in 0..3 {
            let tuple = desc
                .form_leaf_tuple(&[Datum::from_i64(7)])
                .expect("tuple");
            sorter.put_tuple(&tuple).expect("put");
        }
        let err = sorter.get_tuple().expect_err("duplicates must fail");
        match err {
            EngineError::UniqueViolation { index } => assert_eq!(index, "idx_sort"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn null_keys_do_not_trip_uniqueness() {
        let desc = index(&[ColumnKind::Int64, ColumnKind::Int32], 1, true);
        let mut sorter = IndexBuildSorter::begin(&desc, DEFAULT_SORT_WORK_MEM);
        for payload in 0..3i32 {
            let tuple = form_tuple(
                &desc.leaf_tupdesc,
                &desc.leaf_spec,
                0,
                &[None, Some(FieldInit::Datum(Datum::from_i32(payload)))],
            )
            .expect("tuple");
            sorter.put_tuple(&tuple).expect("put");
        }
        let mut count = 0;
        while sorter.get_tuple().expect("get").is_some() {
            count += 1;
        }
        assert_eq!(count, 3);
    }

    #[test]
    fn descending_key_reverses_order() {
        let mut fields = vec![IndexField::new(ColumnKind::Int32)];
        fields[0].ascending = false;
        let desc = IndexDescriptor::new(
            "idx_desc",
            RelOids {
                datoid: 5,
                relnode: 7,
            },
            IndexKind::Secondary,
            fields,
            1,
        )
        .expect("descriptor");
        let mut sorter = IndexBuildSorter::begin(&desc, DEFAULT_SORT_WORK_MEM);
        for value in [1i32, 3, 2] {
            let tuple = desc
                .form_leaf_tuple(&[Datum::from_i32(value)])
                .expect("tuple");
            sorter.put_tuple(&tuple).expect("put");
        }
        let mut seen = Vec::new();
        while let Some(tuple) = sorter.get_tuple().expect("get") {
            let (d, _) =
                read_datum(&tuple, 1, &desc.leaf_tupdesc, &desc.leaf_spec).expect("attr 1");
            seen.push(d.as_i32());
        }
        assert_eq!(seen, vec![3, 2, 1]);
    }

    #[test]
    fn toast_sort_orders_by_key_attnum_chunk() {
        let primary = index(&[ColumnKind::Int64], 1, true);
        let toast = IndexDescriptor::new(
            "idx_toast",
            RelOids {
                datoid: 5,
                relnode: 8,
            },
            IndexKind::Toast,
            vec![
                IndexField::new(ColumnKind::Int64),
                IndexField::new(ColumnKind::Int16),
                IndexField::new(ColumnKind::Int32),
                IndexField::new(ColumnKind::Bytes),
            ],
            3,
        )
        .expect("descriptor");
        let mut sorter = IndexBuildSorter::begin_toast(&toast, &primary, DEFAULT_SORT_WORK_MEM);
        let mut put = |pk: i64, attnum: i16, chunk: i32| {
            let tuple = form_tuple(
                &toast.leaf_tupdesc,
                &toast.leaf_spec,
                0,
                &[
                    Some(FieldInit::Datum(Datum::from_i64(pk))),
                    Some(FieldInit::Datum(Datum::from_i16(attnum))),
                    Some(FieldInit::Datum(Datum::from_i32(chunk))),
                    Some(FieldInit::Bytes(b"chunk-data")),
                ],
            )
            .expect("tuple");
            sorter.put_tuple(&tuple).expect("put");
        };
        put(2, 1, 0);
        put(1, 2, 1);
        put(1, 1, 1);
        put(1, 2, 0);
        put(1, 1, 0);

        let mut seen = Vec::new();
        while let Some(tuple) = sorter.get_tuple().expect("get") {
            let pk = read_datum(&tuple, 1, &toast.leaf_tupdesc, &toast.leaf_spec)
                .expect("pk")
                .0
                .as_i64();
            let attnum = read_datum(&tuple, 2, &toast.leaf_tupdesc, &toast.leaf_spec)
                .expect("attnum")
                .0
                .as_i16();
            let chunk = read_datum(&tuple, 3, &toast.leaf_tupdesc, &toast.leaf_spec)
                .expect("chunk")
                .0
                .as_i32();
            seen.push((pk, attnum, chunk));
        }
        assert_eq!(
            seen,
            vec![(1, 1, 0), (1, 1, 1), (1, 2, 0), (1, 2, 1), (2, 1, 0)]
        );
    }

    #[test]
    fn pk_rebuild_ties_break_on_old_key() {
        let new_pk = index(&[ColumnKind::Int32], 1, false);
        let old_pk = index(&[ColumnKind::Int64], 1, true);
        let mut sorter = PkRebuildSorter::begin(&new_pk, &old_pk, DEFAULT_SORT_WORK_MEM);

        let new_key = |v: i32| {
            new_pk
                .make_key(&new_pk.form_leaf_tuple(&[Datum::from_i32(v)]).expect("tuple"))
                .expect("key")
        };
        let old_key = |v: i64| {
            old_pk
                .make_key(&old_pk.form_leaf_tuple(&[Datum::from_i64(v)]).expect("tuple"))
                .expect("key")
        };
        let hint = |n: u32| LocationHint {
            blkno: n,
            page_change_count: n * 10,
        };

        sorter
            .put_entry(&new_key(5), &old_key(30), hint(3))
            .expect("put");
        sorter
            .put_entry(&new_key(5), &old_key(10), hint(1))
            .expect("put");
        sorter
            .put_entry(&new_key(2), &old_key(20), hint(2))
            .expect("put");

        let mut seen = Vec::new();
        while let Some((new_key, old_key, hint)) = sorter.get_entry().expect("get") {
            let n = read_datum(&new_key, 1, &new_pk.nonleaf_tupdesc, &new_pk.nonleaf_spec)
                .expect("new")
                .0
                .as_i32();
            let o = read_datum(&old_key, 1, &old_pk.nonleaf_tupdesc, &old_pk.nonleaf_spec)
                .expect("old")
                .0
                .as_i64();
            seen.push((n, o, hint.blkno));
        }
        assert_eq!(seen, vec![(2, 20, 2), (5, 10, 1), (5, 30, 3)]);
    }
}
