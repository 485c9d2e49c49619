use lodestore::codec::{self, LogOp, LogRecord, Value};
use proptest::prelude::*;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i32>().prop_map(Value::I32),
        any::<i64>().prop_map(Value::I64),
        // NaN breaks equality, not the codec; keep the property honest.
        prop::num::f64::NORMAL.prop_map(Value::F64),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::DateTime),
        ".*".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..256).prop_map(Value::Bytes),
    ]
}

proptest! {
    #[test]
    fn value_round_trip(value in value_strategy()) {
        let bytes = codec::serialize(&value);
        let decoded = codec::deserialize(&bytes).unwrap();
        prop_assert_eq!(&decoded, &value);
        prop_assert_eq!(codec::serialized_type(&bytes).unwrap(), value.type_tag());
    }

    #[test]
    fn log_record_round_trip(
        lsn in 1i64..1_000_000,
        tx in "[a-z0-9]{1,32}",
        op_byte in 0u8..=5,
        page_id in -1i64..10_000,
        before in prop::collection::vec(any::<u8>(), 0..512),
        after in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let mut record = LogRecord::new(
            LogOp::from_u8(op_byte).unwrap(),
            tx.as_str(),
            page_id,
            before.clone(),
            after.clone(),
        );
        record.lsn = lsn;
        let decoded = LogRecord::decode(&record.encode()).unwrap();
        prop_assert!(decoded.is_valid());
        prop_assert_eq!(decoded.lsn, lsn);
        prop_assert_eq!(decoded.tx_id, tx);
        prop_assert_eq!(decoded.before_image, before);
        prop_assert_eq!(decoded.after_image, after);
    }

    #[test]
    fn log_record_rejects_any_single_bit_flip(
        flip_at_fraction in 0.0f64..1.0,
        payload in prop::collection::vec(any::<u8>(), 1..128),
    ) {
        let record = LogRecord::new(LogOp::Insert, "tx-prop", 7, Vec::new(), payload);
        let mut bytes = record.encode();
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let idx = ((bytes.len() - 1) as f64 * flip_at_fraction) as usize;
        bytes[idx] ^= 0x01;
        // Either the checksum catches it, or (for flips inside the type
        // tag or length prefix) framing fails; a silent success would mean
        // a corrupt record went unnoticed.
        prop_assert!(LogRecord::decode(&bytes).is_err());
    }
}
