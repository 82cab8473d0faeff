//! Sorter flavors under spill pressure: large shuffled loads that must
//! spill to disk and merge back in order.

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use tanager::descr::{IndexDescriptor, IndexField, IndexKind};
use tanager::error::EngineError;
use tanager::sort::{IndexBuildSorter, LocationHint, PkRebuildSorter};
use tanager::tuple::read_datum;
use tanager::types::{ColumnKind, Datum, RelOids};

fn index(name: &str, relnode: u64, unique: bool) -> IndexDescriptor {
    IndexDescriptor::new(
        name,
        RelOids {
            datoid: 2,
            relnode,
        },
        IndexKind::Primary,
        vec![
            IndexField::new(ColumnKind::Int64),
            IndexField::new(ColumnKind::Int32),
        ],
        1,
    )
    .expect("descriptor")
    .with_unique(unique)
}

#[test]
fn spilled_index_sort_restores_order() {
    let desc = index("idx_spill", 1, false);
    // Tiny work_mem (clamped to 64 KiB) forces several spill runs.
    let mut sorter = IndexBuildSorter::begin(&desc, 1);

    let mut keys: Vec<i64> = (0..50_000).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    keys.shuffle(&mut rng);
    for &key in &keys {
        let tuple = desc
            .form_leaf_tuple(&[Datum::from_i64(key), Datum::from_i32((key % 7) as i32)])
            .expect("tuple");
        sorter.put_tuple(&tuple).expect("put");
    }

    let mut previous = i64::MIN;
    let mut count = 0u64;
    while let Some(tuple) = sorter.get_tuple().expect("get") {
        let key = read_datum(&tuple, 1, &desc.leaf_tupdesc, &desc.leaf_spec)
            .expect("key")
            .0
            .as_i64();
        assert!(key > previous, "keys must come out strictly ascending");
        previous = key;
        count += 1;
    }
    assert_eq!(count, 50_000);
}

#[test]
fn duplicates_in_different_runs_still_violate_uniqueness() {
    let desc = index("idx_spill_unique", 2, true);
    let mut sorter = IndexBuildSorter::begin(&desc, 1);

    // Two batches large enough that each spills separately; the duplicate
    // pair only meets during the merge.
    for key in 0..20_000i64 {
        let tuple = desc
            .form_leaf_tuple(&[Datum::from_i64(key), Datum::from_i32(0)])
            .expect("tuple");
        sorter.put_tuple(&tuple).expect("put");
    }
    let dup = desc
        .form_leaf_tuple(&[Datum::from_i64(10_000), Datum::from_i32(1)])
        .expect("tuple");
    sorter.put_tuple(&dup).expect("put");

    let mut result = Ok(());
    loop {
        match sorter.get_tuple() {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(err) => {
                result = Err(err);
                break;
            }
        }
    }
    match result {
        Err(EngineError::UniqueViolation { index }) => {
            assert_eq!(index, "idx_spill_unique");
        }
        other => panic!("expected a uniqueness violation, got {other:?}"),
    }
}

#[test]
fn pk_rebuild_spills_and_keeps_hints_attached() {
    let new_pk = index("idx_new_pk", 3, false);
    let old_pk = index("idx_old_pk", 4, true);
    let mut sorter = PkRebuildSorter::begin(&new_pk, &old_pk, 1);

    let mut rows: Vec<i64> = (0..20_000).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    rows.shuffle(&mut rng);
    for &row in &rows {
        // New key reverses the old order so the sort has real work to do.
        let new_key = new_pk
            .make_key(
                &new_pk
                    .form_leaf_tuple(&[Datum::from_i64(-row), Datum::from_i32(0)])
                    .expect("tuple"),
            )
            .expect("new key");
        let old_key = old_pk
            .make_key(
                &old_pk
                    .form_leaf_tuple(&[Datum::from_i64(row), Datum::from_i32(0)])
                    .expect("tuple"),
            )
            .expect("old key");
        let hint = LocationHint {
            blkno: row as u32,
            page_change_count: (row * 2) as u32,
        };
        sorter.put_entry(&new_key, &old_key, hint).expect("put");
    }

    let mut previous = i64::MIN;
    let mut count = 0u64;
    while let Some((new_key, old_key, hint)) = sorter.get_entry().expect("get") {
        let n = read_datum(&new_key, 1, &new_pk.nonleaf_tupdesc, &new_pk.nonleaf_spec)
            .expect("new key")
            .0
            .as_i64();
        let o = read_datum(&old_key, 1, &old_pk.nonleaf_tupdesc, &old_pk.nonleaf_spec)
            .expect("old key")
            .0
            .as_i64();
        assert!(n > previous);
        previous = n;
        // The triple stays associated: new = -old, hint derived from old.
        assert_eq!(n, -o);
        assert_eq!(hint.blkno, o as u32);
        assert_eq!(hint.page_change_count, (o * 2) as u32);
        count += 1;
    }
    assert_eq!(count, 20_000);
}
