use proptest::prelude::*;

use dog_uploader::{
    AddOutcome, BlobCollection, BlobPatch, BlobRecord, BlobState, Checksum, RecordStore,
    SelectedFile, UploaderConfig, UploaderError,
};

fn file_for(key: u8) -> SelectedFile {
    SelectedFile::new(format!("file-{}.bin", key), "application/octet-stream", vec![key; 4])
}

fn filled(count: usize) -> BlobCollection {
    let mut collection = BlobCollection::new(UploaderConfig::default().with_max_items(count));
    for key in 0..count as u8 {
        collection
            .add_from_file(file_for(key), Checksum::from_string(format!("c{}", key)))
            .unwrap();
    }
    collection
}

fn order(collection: &BlobCollection) -> Vec<String> {
    collection
        .records()
        .iter()
        .map(|r| r.checksum.as_str().to_string())
        .collect()
}

proptest! {
    #[test]
    fn adds_never_duplicate_or_overflow(
        max_items in 1usize..8,
        keys in proptest::collection::vec(0u8..12, 0..40),
    ) {
        let mut collection = BlobCollection::new(UploaderConfig::default().with_max_items(max_items));

        for key in keys {
            let before = collection.len();
            let outcome = collection
                .add_from_file(file_for(key), Checksum::from_string(format!("c{}", key)))
                .unwrap();
            match outcome {
                AddOutcome::Added => {
                    prop_assert_eq!(collection.len(), before + 1);
                }
                AddOutcome::Duplicate | AddOutcome::AtCapacity => {
                    prop_assert_eq!(collection.len(), before);
                }
            }
            prop_assert!(collection.len() <= max_items);
        }

        let mut checksums = order(&collection);
        let total = checksums.len();
        checksums.sort();
        checksums.dedup();
        prop_assert_eq!(checksums.len(), total);
    }

    #[test]
    fn reorder_moves_one_record_and_keeps_the_rest(
        count in 2usize..9,
        from in 0usize..9,
        to in 0usize..9,
    ) {
        let from = from % count;
        let to = to % count;
        let mut collection = filled(count);
        let before = order(&collection);

        collection
            .reorder(
                &Checksum::from_string(before[from].clone()),
                &Checksum::from_string(before[to].clone()),
            )
            .unwrap();
        let after = order(&collection);

        let mut sorted_before = before.clone();
        let mut sorted_after = after.clone();
        sorted_before.sort();
        sorted_after.sort();
        prop_assert_eq!(sorted_before, sorted_after);

        prop_assert_eq!(&after[to], &before[from]);

        let moved = &before[from];
        let others_before: Vec<_> = before.iter().filter(|c| *c != moved).collect();
        let others_after: Vec<_> = after.iter().filter(|c| *c != moved).collect();
        prop_assert_eq!(others_before, others_after);
    }

    #[test]
    fn retry_count_never_increases(
        start in 0u32..6,
        updates in proptest::collection::vec(0u32..10, 1..20),
    ) {
        let record = BlobRecord::linked(Checksum::from("c"), "b".into(), "a".into(), start);
        let mut collection = BlobCollection::with_records(UploaderConfig::default(), vec![record]);
        let checksum = Checksum::from("c");

        let mut last = start;
        for retry_count in updates {
            collection.apply_update(&checksum, BlobPatch::new().with_retry_count(retry_count));
            let current = collection.get(&checksum).unwrap().retry_count;
            prop_assert!(current <= last);
            last = current;
        }
    }

    #[test]
    fn set_primary_on_missing_checksum_changes_nothing(
        count in 1usize..6,
        missing in 10u8..20,
    ) {
        let mut collection = filled(count);
        let records_before = collection.records().to_vec();
        let primary_before = collection.primary().cloned();

        let target = Checksum::from_string(format!("c{}", missing));
        let err = collection.set_primary(&target).unwrap_err();
        prop_assert_eq!(err, UploaderError::not_found(&target));
        prop_assert_eq!(collection.records(), records_before.as_slice());
        prop_assert_eq!(collection.primary().cloned(), primary_before);
    }
}

#[test]
fn reorder_with_unknown_checksum_is_rejected() {
    let mut collection = filled(3);
    let before = order(&collection);

    let err = collection
        .reorder(&Checksum::from("c0"), &Checksum::from("missing"))
        .unwrap_err();
    assert!(matches!(err, UploaderError::NotFound { .. }));
    assert_eq!(order(&collection), before);
}

#[test]
fn pending_results_after_removal_never_reinsert() {
    let mut collection = filled(2);
    let checksum = Checksum::from("c0");

    collection.apply_update(&checksum, BlobPatch::state(BlobState::RequestingSlot));
    collection.remove(&checksum).unwrap();

    let landed = collection.apply_update(
        &checksum,
        BlobPatch::state(BlobState::SlotReady).with_upload_url("memory://upload/c0"),
    );
    assert!(!landed);
    assert_eq!(order(&collection), vec!["c1".to_string()]);
}
