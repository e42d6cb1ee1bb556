use std::sync::Arc;

use strata_common::config::{CompressionMethod, StorageConfig, ROW_GROUP_CAPACITY};
use strata_common::datum::{Datum, OwnedRow};
use strata_common::schema::{ColumnDef, TableSchema};
use strata_common::types::{DataType, TableId, TxnId};
use strata_storage::delta::ScanDirection;
use strata_storage::mvcc::TxnManager;
use strata_storage::pruner::{ScanKey, Strategy};
use strata_storage::{ColumnarTable, MergeOutcome, ScanOptions};

fn schema() -> TableSchema {
    TableSchema::new(
        TableId(1),
        "measurements",
        vec![
            ColumnDef::new("id", DataType::Int64).not_null(),
            ColumnDef::new("reading", DataType::Int32),
            ColumnDef::new("site", DataType::Text),
        ],
    )
}

fn row(i: i64) -> OwnedRow {
    OwnedRow::new(vec![
        Datum::Int64(i),
        Datum::Int32((i % 1000) as i32),
        Datum::Text(format!("site-{}", i % 17)),
    ])
}

fn count(table: &ColumnarTable) -> u64 {
    table
        .begin_scan(ScanOptions::new(table.latest_snapshot()))
        .count()
        .unwrap()
}

#[test]
fn housekeeping_merges_full_groups_and_keeps_remainder() {
    let config = StorageConfig {
        delta_max_rows: 300_000,
        delta_merge_threshold: 0.5,
        compression: CompressionMethod::Fast,
        ..StorageConfig::default()
    };
    let txns = Arc::new(TxnManager::new());
    let table = ColumnarTable::new(schema(), config, Arc::clone(&txns));

    let loader = txns.begin();
    for i in 0..200_000 {
        table.insert(loader, row(i)).unwrap();
    }
    txns.commit(loader);
    let open = txns.begin();
    for i in 0..10 {
        table.insert(open, row(1_000_000 + i)).unwrap();
    }

    let before = count(&table);
    assert_eq!(before, 200_000);
    assert!(table.needs_merge());

    let report = match table.housekeeping().unwrap() {
        MergeOutcome::Merged(r) => r,
        other => panic!("expected a merge, got {:?}", other),
    };
    assert!(report.row_groups.len() >= 3);
    assert_eq!(report.rows_moved, 3 * ROW_GROUP_CAPACITY as u64);
    assert_eq!(table.catalog().row_group_count(), 3);
    assert_eq!(
        table.delta().live_tuples(),
        200_000 % ROW_GROUP_CAPACITY + 10
    );
    assert_eq!(count(&table), before);

    txns.commit(open);
    assert_eq!(count(&table), before + 10);
}

#[test]
fn deleted_columnar_row_leaves_single_bit() {
    let config = StorageConfig {
        row_group_capacity: 100,
        delta_max_rows: 10_000,
        merge_drain_all: true,
        ..StorageConfig::default()
    };
    let table = ColumnarTable::new(schema(), config, Arc::new(TxnManager::new()));
    for i in 0..250 {
        table.insert(TxnId::FROZEN, row(i)).unwrap();
    }
    table.merge().unwrap();
    assert_eq!(table.delta().live_tuples(), 0);

    let victim = table.id_space().columnar(1, 42).unwrap();
    let snapshot = table.latest_snapshot();
    let doomed = table.fetch(victim, &snapshot).unwrap().unwrap();
    table.delete(TxnId::FROZEN, victim).unwrap();

    let bitmap = table.catalog().read_delete_bitmap(1).unwrap().unwrap();
    assert_eq!(bitmap.count_ones(), 1);
    assert!(bitmap.get(42));
    assert!(table.catalog().read_delete_bitmap(0).unwrap().is_none());

    let mut scan = table.begin_scan(ScanOptions::new(table.latest_snapshot()));
    let mut seen = 0;
    while let Some((id, r)) = scan.next_row().unwrap() {
        assert_ne!(id, victim);
        assert_ne!(r, doomed);
        seen += 1;
    }
    assert_eq!(seen, 249);

    // later deletes in the same group never clear the first bit
    table
        .delete(TxnId::FROZEN, table.id_space().columnar(1, 7).unwrap())
        .unwrap();
    let bitmap = table.catalog().read_delete_bitmap(1).unwrap().unwrap();
    assert!(bitmap.get(42) && bitmap.get(7));
    assert_eq!(bitmap.count_ones(), 2);
}

#[test]
fn zone_maps_prune_disjoint_group_without_decoding() {
    let schema = TableSchema::new(
        TableId(2),
        "narrow",
        vec![ColumnDef::new("v", DataType::Int64)],
    );
    let config = StorageConfig {
        row_group_capacity: 1024,
        delta_max_rows: 10_000,
        merge_drain_all: true,
        ..StorageConfig::default()
    };
    let table = ColumnarTable::new(schema, config, Arc::new(TxnManager::new()));
    for v in 50..=90 {
        table
            .insert(TxnId::FROZEN, OwnedRow::new(vec![Datum::Int64(v)]))
            .unwrap();
    }
    table.merge().unwrap();
    for v in 50..=150 {
        table
            .insert(TxnId::FROZEN, OwnedRow::new(vec![Datum::Int64(v)]))
            .unwrap();
    }
    table.merge().unwrap();
    assert_eq!(table.catalog().row_group_count(), 2);

    let key = ScanKey::new(0, Strategy::Gt, Datum::Int64(100));
    let mut scan = table.begin_scan(ScanOptions::new(table.latest_snapshot()).with_keys(vec![key]));
    let mut values = Vec::new();
    while let Some(b) = scan.next_batch().unwrap() {
        values.extend(b.active_rows(None).map(|r| b.value(0, r).as_i64().unwrap()));
    }
    assert_eq!(values, (101..=150).collect::<Vec<_>>());
    let stats = scan.stats();
    assert_eq!(stats.row_groups_pruned, 1);
    assert_eq!(stats.row_groups_read, 1);
    assert_eq!(stats.rows_skipped_by_key, 51);
    // one column of one group decoded
    assert_eq!(scan.cache_stats().misses, 1);
}

#[test]
fn merge_conserves_rows_below_capacity() {
    let config = StorageConfig {
        row_group_capacity: 64,
        delta_max_rows: 10_000,
        merge_drain_all: true,
        ..StorageConfig::default()
    };
    let table = ColumnarTable::new(schema(), config, Arc::new(TxnManager::new()));
    for i in 0..40 {
        table.insert(TxnId::FROZEN, row(i)).unwrap();
    }
    table.merge().unwrap();
    let mut ids = Vec::new();
    let mut scan = table.begin_scan(
        ScanOptions::new(table.latest_snapshot()).with_direction(ScanDirection::Backward),
    );
    while let Some((_, r)) = scan.next_row().unwrap() {
        ids.push(r.values[0].as_i64().unwrap());
    }
    ids.sort();
    assert_eq!(ids, (0..40).collect::<Vec<_>>());
}

#[test]
fn merge_skips_while_table_is_scanned() {
    let config = StorageConfig {
        row_group_capacity: 8,
        delta_max_rows: 64,
        delta_merge_threshold: 0.1,
        ..StorageConfig::default()
    };
    let table = ColumnarTable::new(schema(), config, Arc::new(TxnManager::new()));
    for i in 0..16 {
        table.insert(TxnId::FROZEN, row(i)).unwrap();
    }
    {
        let _scan = table.begin_scan(ScanOptions::new(table.latest_snapshot()));
        assert_eq!(table.housekeeping().unwrap(), MergeOutcome::Skipped);
    }
    let outcome = table.housekeeping().unwrap();
    assert_eq!(outcome.report().unwrap().row_groups.len(), 2);
}
