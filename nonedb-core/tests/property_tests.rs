use nonedb_core::geo::ops::haversine_distance;
use nonedb_core::geo::{Geometry, Mbr};
use nonedb_core::record::encode_value;
use nonedb_core::{Database, DatabaseConfig, Filter, Record};
use proptest::prelude::*;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_db(shard_size: usize) -> (Database, PathBuf) {
    let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    let root = std::env::temp_dir()
        .join("nonedb_test_props")
        .join(format!("root_{}_{}", std::process::id(), id));
    std::fs::create_dir_all(&root).unwrap();
    let config = DatabaseConfig::new(&root, "secret").with_shard_size(shard_size);
    (Database::open(config), root)
}

fn lon() -> impl Strategy<Value = f64> {
    -180.0f64..180.0f64
}

fn lat() -> impl Strategy<Value = f64> {
    -90.0f64..90.0f64
}

fn mbr() -> impl Strategy<Value = Mbr> {
    (lon(), lat(), lon(), lat()).prop_map(|(a, b, c, d)| {
        Mbr::new(a.min(c), b.min(d), a.max(c), b.max(d))
    })
}

proptest! {
    #[test]
    fn test_mbr_contains_every_coordinate(
        points in proptest::collection::vec((lon(), lat()), 2..40)
    ) {
        let coords: Vec<_> = points.iter().map(|(x, y)| json!([x, y])).collect();
        let geometry = Geometry::from_value(&json!({
            "type": "LineString",
            "coordinates": coords,
        })).unwrap();

        let mbr = geometry.mbr();
        for (x, y) in &points {
            prop_assert!(mbr.contains_point(*x, *y));
        }
    }

    #[test]
    fn test_mbr_overlaps_symmetric(a in mbr(), b in mbr()) {
        prop_assert_eq!(a.overlaps(&b), b.overlaps(&a));
    }

    #[test]
    fn test_mbr_union_contains_both(a in mbr(), b in mbr()) {
        let u = a.union(&b);
        prop_assert!(u.contains_point(a.min_lon, a.min_lat));
        prop_assert!(u.contains_point(a.max_lon, a.max_lat));
        prop_assert!(u.contains_point(b.min_lon, b.min_lat));
        prop_assert!(u.contains_point(b.max_lon, b.max_lat));
    }

    #[test]
    fn test_haversine_identity_and_symmetry(
        x1 in lon(), y1 in lat(), x2 in lon(), y2 in lat()
    ) {
        prop_assert_eq!(haversine_distance(x1, y1, x1, y1), 0.0);

        let ab = haversine_distance(x1, y1, x2, y2);
        let ba = haversine_distance(x2, y2, x1, y1);
        prop_assert!(ab >= 0.0);
        prop_assert!((ab - ba).abs() < 1e-9);
    }

    #[test]
    fn test_haversine_triangle_inequality(
        x1 in lon(), y1 in lat(),
        x2 in lon(), y2 in lat(),
        x3 in lon(), y3 in lat()
    ) {
        let ab = haversine_distance(x1, y1, x2, y2);
        let bc = haversine_distance(x2, y2, x3, y3);
        let ac = haversine_distance(x1, y1, x3, y3);
        // Small slack for floating point accumulation.
        prop_assert!(ac <= ab + bc + 1e-6);
    }

    #[test]
    fn test_encoded_values_stay_distinct(n in proptest::num::i64::ANY) {
        prop_assert_ne!(encode_value(&json!(n)), encode_value(&json!(n.to_string())));
        prop_assert_ne!(encode_value(&json!(n)), encode_value(&json!(null)));
    }
}

proptest! {
    // Filesystem-backed properties run fewer cases.
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// An indexed equality lookup returns exactly what a full scan does,
    /// for any data distribution and any deletion pattern.
    #[test]
    fn test_indexed_find_matches_scan(
        cities in proptest::collection::vec(0usize..4, 1..60),
        deletions in proptest::collection::vec(proptest::num::usize::ANY, 0..10)
    ) {
        let names = ["Istanbul", "Ankara", "Izmir", "Bursa"];
        let (db, root) = temp_db(10);

        let records: Vec<Record> = cities
            .iter()
            .map(|c| {
                // Duplicate the value in an unindexed field for comparison.
                Record::new()
                    .with_field("city", names[*c])
                    .with_field("shadow", names[*c])
            })
            .collect();
        let total = records.len();
        db.insert_many("t", records).unwrap();
        db.create_field_index("t", "city").unwrap();

        for d in &deletions {
            let _ = db.delete("t", &Filter::new().with_key(d % total));
        }

        for name in names {
            let indexed = db.find("t", &Filter::new().with_field("city", name)).unwrap();
            let scanned = db.find("t", &Filter::new().with_field("shadow", name)).unwrap();

            let indexed_keys: Vec<i64> =
                indexed.iter().map(|r| r.get_i64("key").unwrap()).collect();
            let scanned_keys: Vec<i64> =
                scanned.iter().map(|r| r.get_i64("key").unwrap()).collect();
            prop_assert_eq!(indexed_keys, scanned_keys);
        }

        std::fs::remove_dir_all(root).unwrap();
    }

    /// After any mutation sequence the global shard map holds exactly the
    /// shards with a live match, never a superset.
    #[test]
    fn test_shard_map_membership_is_exact(
        cities in proptest::collection::vec(0usize..3, 12..40),
        deletions in proptest::collection::vec(proptest::num::usize::ANY, 0..15)
    ) {
        let names = ["Istanbul", "Ankara", "Izmir"];
        let (db, root) = temp_db(5);

        let records: Vec<Record> = cities
            .iter()
            .map(|c| Record::new().with_field("city", names[*c]))
            .collect();
        let total = records.len();
        db.insert_many("t", records).unwrap();
        db.create_field_index("t", "city").unwrap();

        for d in &deletions {
            let _ = db.delete("t", &Filter::new().with_key(d % total));
        }

        // Recompute live shard membership from the records themselves.
        let shard_size = 5;
        for name in names {
            let live = db.find("t", &Filter::new().with_field("city", name)).unwrap();
            let mut expected: Vec<usize> = live
                .iter()
                .map(|r| r.get_i64("key").unwrap() as usize / shard_size)
                .collect();
            expected.sort_unstable();
            expected.dedup();

            // A fresh rebuild must agree with the incrementally maintained map.
            let before = std::fs::read_to_string(
                root.join(format!(
                    "{}-t.nonedb.gfidx.city",
                    nonedb_core::naming::file_prefix("secret")
                )),
            )
            .unwrap();
            db.rebuild_field_index("t", "city").unwrap();
            let after = std::fs::read_to_string(
                root.join(format!(
                    "{}-t.nonedb.gfidx.city",
                    nonedb_core::naming::file_prefix("secret")
                )),
            )
            .unwrap();
            prop_assert_eq!(&before, &after);

            let map: serde_json::Value = serde_json::from_str(&after).unwrap();
            let entry = map["shardMap"].get(encode_value(&json!(name)));
            let actual: Vec<usize> = entry
                .and_then(|v| v.as_array())
                .map(|a| a.iter().map(|s| s.as_u64().unwrap() as usize).collect())
                .unwrap_or_default();
            prop_assert_eq!(actual, expected);
        }

        std::fs::remove_dir_all(root).unwrap();
    }

    /// Compaction frees exactly the tombstoned slots and preserves the
    /// surviving records' field values in order.
    #[test]
    fn test_compact_preserves_live_records(
        values in proptest::collection::vec(proptest::num::i64::ANY, 1..50),
        deletions in proptest::collection::vec(proptest::num::usize::ANY, 0..12)
    ) {
        let (db, root) = temp_db(8);

        let records: Vec<Record> = values
            .iter()
            .map(|v| Record::new().with_field("v", *v))
            .collect();
        let total = records.len();
        db.insert_many("t", records).unwrap();

        for d in &deletions {
            let _ = db.delete("t", &Filter::new().with_key(d % total));
        }

        let survivors: Vec<i64> = db
            .find("t", &Filter::new())
            .unwrap()
            .iter()
            .map(|r| r.get_i64("v").unwrap())
            .collect();

        let before = db.shard_info("t").unwrap();
        let report = db.compact("t").unwrap();
        prop_assert_eq!(
            report.total_records,
            before.total_records - before.deleted_count
        );

        let after: Vec<i64> = db
            .find("t", &Filter::new())
            .unwrap()
            .iter()
            .map(|r| r.get_i64("v").unwrap())
            .collect();
        prop_assert_eq!(survivors, after);

        let info = db.shard_info("t").unwrap();
        prop_assert_eq!(info.deleted_count, 0);

        std::fs::remove_dir_all(root).unwrap();
    }
}
