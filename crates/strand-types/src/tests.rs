use super::*;
use proptest::prelude::*;
use test_case::test_case;

// ============================================================================
// Key Encoding
// ============================================================================

#[test]
fn key_encoding_keeps_partition_and_counter_apart() {
    let key = Key::encode(PartitionId::new(1), 1);

    assert_eq!(key.as_i64(), (1_i64 << 51) + 1);
    assert_eq!(key.partition_id(), PartitionId::new(1));
    assert_eq!(key.local_key(), 1);
}

#[test]
fn unset_key_and_position_are_not_set() {
    assert!(!Key::UNSET.is_set());
    assert!(!Position::UNSET.is_set());
    assert_eq!(Key::default(), Key::UNSET);
    assert_eq!(Position::default(), Position::UNSET);
}

proptest! {
    #[test]
    fn encoded_keys_decode_to_their_parts(
        partition in 0..=PartitionId::MAX,
        local in 0..(1_i64 << Key::KEY_BITS),
    ) {
        let key = Key::encode(PartitionId::new(partition), local);
        prop_assert_eq!(key.partition_id(), PartitionId::new(partition));
        prop_assert_eq!(key.local_key(), local);
        prop_assert!(key.is_set());
    }

    #[test]
    fn keys_of_different_partitions_never_collide(
        a in 0..=PartitionId::MAX,
        b in 0..=PartitionId::MAX,
        local in 0..(1_i64 << Key::KEY_BITS),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(
            Key::encode(PartitionId::new(a), local),
            Key::encode(PartitionId::new(b), local)
        );
    }

    #[test]
    fn key_order_follows_counter_within_a_partition(
        partition in 0..=PartitionId::MAX,
        x in 0..(1_i64 << Key::KEY_BITS),
        y in 0..(1_i64 << Key::KEY_BITS),
    ) {
        let p = PartitionId::new(partition);
        prop_assert_eq!(Key::encode(p, x) < Key::encode(p, y), x < y);
    }
}

// ============================================================================
// Classification
// ============================================================================

#[test]
fn ordinals_are_dense() {
    for (i, record_type) in RecordType::ALL.iter().enumerate() {
        assert_eq!(record_type.ordinal(), i);
    }
    for (i, value_type) in ValueType::ALL.iter().enumerate() {
        assert_eq!(value_type.ordinal(), i);
    }
}

#[test_case(RecordType::Command, "COMMAND")]
#[test_case(RecordType::Event, "EVENT")]
#[test_case(RecordType::CommandRejection, "COMMAND_REJECTION")]
fn record_type_display(record_type: RecordType, expected: &str) {
    assert_eq!(record_type.to_string(), expected);
}

#[test]
fn value_types_use_kebab_case_names() {
    let json = serde_json::to_string(&ValueType::ProcessInstanceCreation).unwrap();
    assert_eq!(json, "\"process-instance-creation\"");

    let parsed: ValueType = serde_json::from_str("\"message-subscription\"").unwrap();
    assert_eq!(parsed, ValueType::MessageSubscription);
}

#[test]
fn rejection_metadata_carries_reason() {
    let metadata = RecordMetadata::rejection(
        ValueType::Job,
        Intent::new(2),
        RejectionType::NotFound,
        "no such job",
    );

    assert_eq!(metadata.record_type, RecordType::CommandRejection);
    assert_eq!(metadata.rejection_type, RejectionType::NotFound);
    assert_eq!(metadata.rejection_reason, "no such job");
    assert!(metadata.request.is_none());
}

// ============================================================================
// Record Values
// ============================================================================

#[test]
fn error_record_survives_value_encoding() {
    let error = ErrorRecord::new(Position::new(7), "boom", Key::new(3));

    let value = RecordValue::encode(&error).unwrap();
    let decoded: ErrorRecord = value.decode().unwrap();

    assert_eq!(decoded, error);
}

#[test]
fn decoding_garbage_is_an_error() {
    let value = RecordValue::from_bytes(vec![0xff, 0xff, 0xff]);
    let result: Result<ErrorRecord, _> = value.decode();

    assert!(matches!(result, Err(ValueError::Decode(_))));
}

#[test]
fn empty_value_is_empty() {
    assert!(RecordValue::empty().is_empty());
    assert_eq!(RecordValue::from_bytes(vec![1, 2]).len(), 2);
}
