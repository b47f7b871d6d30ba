//! Property-based tests: codec round-trips and the flush-time merge.

use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tidemark::gorilla::{GorillaDecoder, GorillaEncoder};
use tidemark::memory::MemoryPartition;
use tidemark::partition::Partition;
use tidemark::wal::NopWal;
use tidemark::{DataPoint, Row, TimestampPrecision};

/// Strictly ascending timestamps with bounded deltas, paired with finite
/// values.
fn points_strategy() -> impl Strategy<Value = Vec<DataPoint>> {
    (
        0i64..1_700_000_000i64,
        prop::collection::vec((1i64..100_000, -1.0e9f64..1.0e9), 1..200),
    )
        .prop_map(|(base, steps)| {
            let mut timestamp = base;
            steps
                .into_iter()
                .map(|(delta, value)| {
                    timestamp += delta;
                    DataPoint::new(timestamp, value)
                })
                .collect()
        })
}

fn encode(points: &[DataPoint]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut encoder = GorillaEncoder::new(&mut buf);
    for point in points {
        encoder.encode_point(point).unwrap();
    }
    encoder.flush().unwrap();
    buf
}

proptest! {
    /// decode(encode(L)) == L, bit-for-bit on the float payload.
    #[test]
    fn prop_codec_roundtrip(points in points_strategy()) {
        let buf = encode(&points);
        let mut decoder = GorillaDecoder::new(&buf);
        for expected in &points {
            let decoded = decoder.decode_point().unwrap();
            prop_assert_eq!(decoded.timestamp, expected.timestamp);
            prop_assert_eq!(decoded.value.to_bits(), expected.value.to_bits());
        }
    }

    /// Repeated timestamps and repeated values stay exact.
    #[test]
    fn prop_codec_handles_flat_series(
        base in 0i64..1_700_000_000i64,
        value in -1.0e12f64..1.0e12,
        count in 1usize..300,
    ) {
        let points: Vec<DataPoint> = (0..count as i64)
            .map(|i| DataPoint::new(base + i * 60, value))
            .collect();
        let buf = encode(&points);
        let mut decoder = GorillaDecoder::new(&buf);
        for expected in &points {
            let decoded = decoder.decode_point().unwrap();
            prop_assert_eq!(decoded.timestamp, expected.timestamp);
            prop_assert_eq!(decoded.value.to_bits(), expected.value.to_bits());
        }
    }

    /// Flushing a memory partition emits the sorted union of in-order and
    /// out-of-order points, ties resolved to the in-order point first.
    #[test]
    fn prop_flush_merges_to_sorted_union(
        mut timestamps in prop::collection::vec(1i64..10_000, 2..120),
    ) {
        timestamps.sort_unstable();
        timestamps.dedup();
        let min_ts = timestamps[0];
        let anchor = *timestamps.last().unwrap();

        let partition = MemoryPartition::new(
            Arc::new(NopWal),
            Duration::from_secs(36_000),
            TimestampPrecision::Seconds,
        );

        // The first batch carries both extremes: the minimum latches the
        // partition floor, the maximum parks the series cursor so every
        // later row lands in the out-of-order buffer.
        let mut first_batch = vec![Row::new("m", DataPoint::new(min_ts, min_ts as f64))];
        if anchor != min_ts {
            first_batch.push(Row::new("m", DataPoint::new(anchor, anchor as f64)));
        }
        partition.insert_rows(&first_batch).unwrap();

        let mut rest: Vec<i64> = if timestamps.len() > 2 {
            timestamps[1..timestamps.len() - 1].to_vec()
        } else {
            Vec::new()
        };
        // A scrambled but deterministic insertion order.
        rest.reverse();
        for ts in &rest {
            partition
                .insert_rows(&[Row::new("m", DataPoint::new(*ts, *ts as f64))])
                .unwrap();
        }

        let (data, meta) = partition.flush_to_disk().unwrap().unwrap();
        let entry = meta.metrics.values().next().unwrap();
        prop_assert_eq!(entry.num_data_points, timestamps.len());
        prop_assert_eq!(entry.min_timestamp, timestamps[0]);
        prop_assert_eq!(entry.max_timestamp, anchor);

        let mut decoder = GorillaDecoder::new(&data);
        let decoded: Vec<i64> = (0..timestamps.len())
            .map(|_| decoder.decode_point().unwrap().timestamp)
            .collect();
        prop_assert_eq!(decoded, timestamps);
    }
}

#[test]
fn test_flush_merge_tie_breaks_to_in_order_point() {
    let partition = MemoryPartition::new(
        Arc::new(NopWal),
        Duration::from_secs(3600),
        TimestampPrecision::Seconds,
    );
    // In-order: 10, 30. Out-of-order: 30 (duplicate timestamp), 20.
    partition
        .insert_rows(&[
            Row::new("m", DataPoint::new(10, 1.0)),
            Row::new("m", DataPoint::new(30, 3.0)),
            Row::new("m", DataPoint::new(30, 33.0)),
            Row::new("m", DataPoint::new(20, 2.0)),
        ])
        .unwrap();

    let (data, _meta) = partition.flush_to_disk().unwrap().unwrap();
    let mut decoder = GorillaDecoder::new(&data);
    let decoded: Vec<DataPoint> = (0..4).map(|_| decoder.decode_point().unwrap()).collect();

    assert_eq!(
        decoded.iter().map(|p| p.timestamp).collect::<Vec<_>>(),
        vec![10, 20, 30, 30]
    );
    // The in-order 30 comes before the late duplicate.
    assert_eq!(decoded[2].value, 3.0);
    assert_eq!(decoded[3].value, 33.0);
}
