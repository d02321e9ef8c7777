use bytes::BytesMut;
use proptest::prelude::*;
use tesseradb::core::cell::{CellKey, decode_cell, decode_table_prefix, encode_cell, encode_table_prefix};
use tesseradb::core::commitlog::block::{BlockHeader, HeaderDecode, MAGIC_DATA, MAGIC_LINK};
use tesseradb::core::types::{Location, QualifiedRange, RangeSpec, RangeState, TableId};

proptest! {
    #[test]
    fn cell_encoding_roundtrips(
        rows in proptest::collection::vec(("[a-z0-9]{1,32}", any::<i64>(), any::<bool>(), proptest::collection::vec(any::<u8>(), 0..256)), 0..16),
        table_id in "[a-z0-9/]{1,16}",
        generation in any::<u32>(),
    ) {
        let table = TableId::new(table_id, generation);
        let mut buf = BytesMut::new();
        encode_table_prefix(&mut buf, &table);
        for (row, revision, delete, value) in &rows {
            encode_cell(&mut buf, &CellKey::new(row.clone(), *revision, *delete), value);
        }

        let mut bytes = buf.freeze();
        let decoded_table = decode_table_prefix(&mut bytes).unwrap();
        prop_assert_eq!(decoded_table, table);
        for (row, revision, delete, value) in &rows {
            let (key, decoded_value) = decode_cell(&mut bytes).unwrap().unwrap();
            prop_assert_eq!(&key.row, row);
            prop_assert_eq!(key.revision, *revision);
            prop_assert_eq!(key.delete, *delete);
            prop_assert_eq!(&decoded_value[..], &value[..]);
        }
        prop_assert!(decode_cell(&mut bytes).unwrap().is_none());
    }

    #[test]
    fn block_headers_roundtrip(
        compression in 0u8..2,
        data_checksum in any::<u32>(),
        data_len in any::<u32>(),
        data_zlen in any::<u32>(),
        revision in any::<i64>(),
        cluster_id in any::<u64>(),
        link in any::<bool>(),
    ) {
        let magic = if link { MAGIC_LINK } else { MAGIC_DATA };
        let mut header = BlockHeader::new(magic, revision, cluster_id);
        header.compression = compression;
        header.data_checksum = data_checksum;
        header.data_len = data_len;
        header.data_zlen = data_zlen;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        match BlockHeader::decode(&buf).unwrap() {
            HeaderDecode::Header(decoded, len) => {
                prop_assert_eq!(decoded, header);
                prop_assert_eq!(len, buf.len());
            }
            HeaderDecode::Truncated => prop_assert!(false, "complete header reported truncated"),
        }
    }

    #[test]
    fn receiver_plan_routes_rows_to_their_range(
        bounds in proptest::collection::btree_set("[b-y]{1,8}", 1..8),
        row in "[a-z]{1,8}",
    ) {
        use tesseradb::core::balance::ReceiverPlan;

        // Build contiguous ranges out of the sorted boundary set.
        let table = TableId::new("u1", 1);
        let mut plan = ReceiverPlan::default();
        let mut start = String::new();
        let mut idx = 0;
        for end in &bounds {
            plan.insert(
                QualifiedRange::new(table.clone(), RangeSpec::new(start.clone(), end.clone())),
                Location::new(format!("rs-{idx}")),
                RangeState::steady(),
            );
            start = end.clone();
            idx += 1;
        }
        plan.insert(
            QualifiedRange::new(table.clone(), RangeSpec::new(start, "")),
            Location::new(format!("rs-{idx}")),
            RangeState::steady(),
        );

        // Every non-empty row lands in exactly one range of the partition.
        let location = plan.location_of_row(&table, &row);
        prop_assert!(location.is_some());
        let matching = plan
            .iter()
            .filter(|(range, _)| range.range.contains(&row))
            .count();
        prop_assert_eq!(matching, 1);
    }
}
