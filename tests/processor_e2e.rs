mod support;

use kbshard::model::{
    BrokerMessage, FieldErrorCode, FieldId, GeneratedField, KbId, MessageSource, MessageType,
    Resource, ResourceId, ResourceStatus, ShardId, WriteType,
};
use kbshard::notify::NotificationAction;
use kbshard::store::{self, keys, KvStore, Transaction};
use kbshard::{CoordError, ProcessOutcome};
use support::{test_config, Harness};

fn create_r1(kbid: &str) -> BrokerMessage {
    BrokerMessage::autocommit(KbId::from(kbid), ResourceId::from("r1"), MessageSource::Writer)
        .with_text_field("body", "hello")
}

async fn stored_resource(h: &Harness, kbid: &str, rid: &str) -> Option<Resource> {
    h.store
        .read(&keys::resource(&KbId::from(kbid), &ResourceId::from(rid)))
        .await
        .unwrap()
        .map(|bytes| store::decode(&bytes).unwrap())
}

#[tokio::test]
async fn commit_then_redelivery_is_rejected_without_side_effects() {
    let h = Harness::new(1, test_config(1));
    let shard = h.create_kb("t1").await;
    assert_eq!(shard.replicas.len(), 1);
    assert_eq!(shard.replicas[0].node.as_str(), "n1");

    let outcome = h
        .coordinator
        .process(create_r1("t1"), Some(1), "p0")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Committed {
            write_type: WriteType::Created
        }
    );
    assert_eq!(
        h.coordinator.processor().ledger().last_seqid("p0").await.unwrap(),
        Some(1)
    );
    let n1 = h.node("n1");
    assert_eq!(n1.write_calls(), 1);
    let indexed = n1
        .document(&shard.replicas[0].replica, &ResourceId::from("r1"))
        .expect("r1 indexed on n1");
    assert_eq!(indexed.paragraphs.len(), 1);
    assert_eq!(indexed.paragraphs[0].text, "hello");
    assert_eq!(indexed.shard.as_ref(), Some(&shard.shard));

    let notifications = h.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].action, NotificationAction::Commit);
    assert_eq!(notifications[0].write_type, WriteType::Created);
    assert_eq!(notifications[0].seqid, Some(1));

    let txns_before = h.store.transactions_started();
    let snapshot_before = h.store.snapshot();
    let err = h
        .coordinator
        .process(create_r1("t1"), Some(1), "p0")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordError::SequenceOrderViolation { last_seqid: 1 }
    ));
    assert_eq!(n1.write_calls(), 1);
    assert_eq!(h.notifications().len(), 1);
    assert_eq!(h.store.transactions_started(), txns_before);
    assert_eq!(h.store.snapshot(), snapshot_before);
}

#[tokio::test]
async fn out_of_order_delivery_is_rejected() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    h.coordinator.process(create_r1("t1"), Some(5), "p0").await.unwrap();

    let err = h
        .coordinator
        .process(create_r1("t1"), Some(3), "p0")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::SequenceOrderViolation { last_seqid: 5 }));

    // Other partitions keep their own ledger.
    h.coordinator.process(create_r1("t1"), Some(3), "p1").await.unwrap();
}

#[tokio::test]
async fn failed_write_is_deadlettered_and_resource_marked_error() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    h.coordinator.process(create_r1("t1"), Some(1), "p0").await.unwrap();

    h.node("n1").fail_writes(true);
    let update = BrokerMessage::autocommit(KbId::from("t1"), ResourceId::from("r1"), MessageSource::Writer)
        .with_text_field("body", "hello again");
    let err = h
        .coordinator
        .process(update, Some(2), "p0")
        .await
        .unwrap_err();
    match &err {
        CoordError::Deadlettered {
            partition,
            seqid,
            source,
        } => {
            assert_eq!(partition, "p0");
            assert_eq!(*seqid, 2);
            assert!(matches!(**source, CoordError::Rpc { .. }));
        }
        other => panic!("expected deadlettered error, got {other:?}"),
    }

    let entry = h
        .coordinator
        .processor()
        .deadletter()
        .get("p0", 2)
        .await
        .unwrap()
        .expect("deadletter entry");
    assert_eq!(entry.messages.len(), 1);
    assert_eq!(entry.error_code, "RPC_ERROR");

    // The ledger only moves with a successful commit.
    assert_eq!(
        h.coordinator.processor().ledger().last_seqid("p0").await.unwrap(),
        Some(1)
    );
    let last = h.notifications().pop().expect("abort notification");
    assert_eq!(last.action, NotificationAction::Abort);
    assert!(last.audit.error.is_some());

    let resource = stored_resource(&h, "t1", "r1").await.expect("resource kept");
    assert_eq!(resource.basic.status, ResourceStatus::Error);
}

#[tokio::test]
async fn unpartitioned_failure_surfaces_original_error() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    h.node("n1").fail_writes(true);

    let err = h
        .coordinator
        .process(create_r1("t1"), None, "p0")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordError::Rpc { .. }));
    assert!(h
        .coordinator
        .processor()
        .deadletter()
        .list("p0")
        .await
        .unwrap()
        .is_empty());
    assert!(stored_resource(&h, "t1", "r1").await.is_none());
    assert_eq!(h.notifications().len(), 1);
    assert_eq!(h.notifications()[0].action, NotificationAction::Abort);
}

#[tokio::test]
async fn unsynchronized_replica_is_retried() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    h.node("n1").unsynchronized_for(2);

    h.coordinator.process(create_r1("t1"), Some(1), "p0").await.unwrap();
    assert_eq!(h.node("n1").write_calls(), 3);
}

#[tokio::test]
async fn oversized_fields_are_left_out_and_resource_flagged() {
    let mut config = test_config(1);
    config.processor.max_paragraphs_per_resource = 2;
    let h = Harness::new(1, config);
    let shard = h.create_kb("t1").await;

    let message = BrokerMessage::autocommit(KbId::from("t1"), ResourceId::from("r1"), MessageSource::Writer)
        .with_text_field("body", "one\ntwo\nthree")
        .with_text_field("note", "short");
    let outcome = h.coordinator.process(message, Some(1), "p0").await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Committed {
            write_type: WriteType::Created
        }
    );

    let indexed = h
        .node("n1")
        .document(&shard.replicas[0].replica, &ResourceId::from("r1"))
        .expect("indexed");
    assert_eq!(indexed.paragraph_count(), 1);
    assert!(indexed.texts.contains_key("t/note"));
    assert!(!indexed.texts.contains_key("t/body"));
    let status: Vec<&str> = indexed.status_labels().collect();
    assert_eq!(status, vec!["/n/s/ERROR"]);

    let resource = stored_resource(&h, "t1", "r1").await.unwrap();
    assert_eq!(resource.basic.status, ResourceStatus::Error);
    let errors = resource.field_errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, FieldId::text("body"));
    assert_eq!(errors[0].1.code, FieldErrorCode::Index);
}

#[tokio::test]
async fn multi_phase_messages_are_unsupported() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    let txns_before = h.store.transactions_started();

    let mut message = create_r1("t1");
    message.message_type = MessageType::Multi;
    let err = h.coordinator.process(message, Some(1), "p0").await.unwrap_err();
    assert!(matches!(err, CoordError::Unsupported(_)));
    assert_eq!(h.store.transactions_started(), txns_before);
    assert!(h.notifications().is_empty());
}

#[tokio::test]
async fn delete_with_stale_assignment_clears_every_shard() {
    let h = Harness::new(1, test_config(1));
    let shard = h.create_kb("t1").await;
    h.coordinator
        .process(create_r1("t1"), Some(1), "p0")
        .await
        .unwrap();

    let kbid = KbId::from("t1");
    let mut txn = h.store.begin().await.unwrap();
    store::set_value(
        txn.as_mut(),
        &keys::resource_shard(&kbid, &ResourceId::from("r1")),
        &ShardId::from("retired"),
    )
    .await
    .unwrap();
    txn.commit().await.unwrap();

    h.coordinator
        .process(BrokerMessage::delete(kbid.clone(), ResourceId::from("r1")), Some(2), "p0")
        .await
        .unwrap();
    assert!(h
        .node("n1")
        .document(&shard.replicas[0].replica, &ResourceId::from("r1"))
        .is_none());
    assert!(h
        .store
        .read(&keys::resource_shard(&kbid, &ResourceId::from("r1")))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn delete_removes_resource_everywhere() {
    let h = Harness::new(1, test_config(1));
    let shard = h.create_kb("t1").await;
    h.coordinator
        .process(create_r1("t1").with_slug("greeting"), Some(1), "p0")
        .await
        .unwrap();

    let outcome = h
        .coordinator
        .process(
            BrokerMessage::delete(KbId::from("t1"), ResourceId::from("r1")),
            Some(2),
            "p0",
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Committed {
            write_type: WriteType::Deleted
        }
    );
    assert!(h
        .node("n1")
        .document(&shard.replicas[0].replica, &ResourceId::from("r1"))
        .is_none());
    assert!(stored_resource(&h, "t1", "r1").await.is_none());
    assert!(h
        .store
        .read(&keys::slug(&KbId::from("t1"), "greeting"))
        .await
        .unwrap()
        .is_none());
    let last = h.notifications().pop().unwrap();
    assert_eq!(last.action, NotificationAction::Commit);
    assert_eq!(last.write_type, WriteType::Deleted);
}

#[tokio::test]
async fn unknown_knowledge_box_is_dropped_and_ledger_advanced() {
    let h = Harness::new(1, test_config(1));
    let outcome = h
        .coordinator
        .process(create_r1("missing"), Some(7), "p0")
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Skipped);
    assert_eq!(
        h.coordinator.processor().ledger().last_seqid("p0").await.unwrap(),
        Some(7)
    );
    assert_eq!(h.total_writes(), 0);
}

#[tokio::test]
async fn taken_slug_does_not_fail_the_write() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    h.coordinator
        .process(create_r1("t1").with_slug("shared"), Some(1), "p0")
        .await
        .unwrap();
    let second = BrokerMessage::autocommit(KbId::from("t1"), ResourceId::from("r2"), MessageSource::Writer)
        .with_text_field("body", "other")
        .with_slug("shared");
    h.coordinator.process(second, Some(2), "p0").await.unwrap();

    let owner: ResourceId = h
        .store
        .read(&keys::slug(&KbId::from("t1"), "shared"))
        .await
        .unwrap()
        .map(|bytes| store::decode(&bytes).unwrap())
        .unwrap();
    assert_eq!(owner, ResourceId::from("r1"));
}

#[tokio::test]
async fn processor_results_mark_processed_and_queue_generated_fields() {
    let h = Harness::new(1, test_config(1));
    h.create_kb("t1").await;
    h.coordinator.process(create_r1("t1"), Some(1), "p0").await.unwrap();

    let mut processed = BrokerMessage::autocommit(
        KbId::from("t1"),
        ResourceId::from("r1"),
        MessageSource::Processor,
    )
    .with_extracted_text(FieldId::text("body"), "hello\nworld");
    processed.generated.push(GeneratedField {
        name: "summary".to_string(),
        text: "a greeting".to_string(),
    });
    let outcome = h.coordinator.process(processed, Some(2), "p0").await.unwrap();
    assert_eq!(
        outcome,
        ProcessOutcome::Committed {
            write_type: WriteType::Modified
        }
    );

    let resource = stored_resource(&h, "t1", "r1").await.unwrap();
    assert_eq!(resource.basic.status, ResourceStatus::Processed);
    let sent = h.queue.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].uuid, ResourceId::from("r1"));
    assert_eq!(sent[0].fields.len(), 1);
}
