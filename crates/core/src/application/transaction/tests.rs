use super::*;
use crate::domain::document::into_document;
use crate::port::document_store::mocks::InMemoryDocumentStore;
use crate::port::id_provider::mocks::SequentialIdProvider;
use serde_json::{json, Value};
use std::time::Duration;

fn doc(value: Value) -> Document {
    into_document(value).unwrap()
}

fn setup() -> (Arc<InMemoryDocumentStore>, TransactionCoordinator) {
    let store = Arc::new(InMemoryDocumentStore::new(Arc::new(
        SequentialIdProvider::new("doc"),
    )));
    let tx = TransactionCoordinator::new(store.clone(), CoordinatorConfig::default());
    (store, tx)
}

fn snapshot(store: &InMemoryDocumentStore) -> Vec<Vec<Document>> {
    ["wallets", "wallet_history", "products"]
        .iter()
        .map(|c| store.snapshot(c))
        .collect()
}

fn seed(store: &InMemoryDocumentStore) {
    store.seed("wallets", doc(json!({"_id": "w1", "balance": 100, "holds": []})));
    store.seed("wallets", doc(json!({"_id": "w2", "balance": 5, "holds": []})));
    store.seed("products", doc(json!({"_id": "p1", "status": "draft"})));
    store.seed("products", doc(json!({"_id": "p2", "status": "draft"})));
}

/// Runs a five-step unit of work; step `fail_at` (1-based) is made to fail
async fn run_workflow(store: &InMemoryDocumentStore, tx: &mut TransactionCoordinator, fail_at: usize) {
    let ops = [
        StoreOp::InsertOne,
        StoreOp::UpdateOne,
        StoreOp::FindOneAndUpdate,
        StoreOp::UpdateMany,
        StoreOp::FindOneAndDelete,
    ];
    store.fail_next(ops[fail_at - 1], 1);

    if tx
        .collection("wallet_history")
        .insert_one(TransactionModel::new().document(doc(json!({"amount": 30}))))
        .await
        .is_err()
    {
        return;
    }
    if tx
        .collection("wallets")
        .update_one(
            TransactionModel::new()
                .filter(doc(json!({"_id": "w1"})))
                .update(doc(json!({"$inc": {"balance": -30}})))
                .rollback_update(doc(json!({"$inc": {"balance": 30}}))),
        )
        .await
        .is_err()
    {
        return;
    }
    if tx
        .collection("wallets")
        .find_one_and_update(
            TransactionModel::new()
                .filter(doc(json!({"_id": "w2"})))
                .update(doc(json!({"$push": {"holds": "h1"}, "$set": {"frozen": true}})))
                .rollback_with(RestoreFields::new(["holds", "frozen"])),
        )
        .await
        .is_err()
    {
        return;
    }
    if tx
        .collection("products")
        .update_many(
            TransactionModel::new()
                .filter(doc(json!({"status": "draft"})))
                .update(doc(json!({"$set": {"status": "published"}})))
                .rollback_update(doc(json!({"$set": {"status": "draft"}}))),
        )
        .await
        .is_err()
    {
        return;
    }
    let _ = tx
        .collection("products")
        .find_one_and_delete(TransactionModel::new().filter(doc(json!({"_id": "p2"}))))
        .await;
}

#[tokio::test]
async fn test_rollback_restores_state_for_every_failure_point() {
    for fail_at in 1..=5 {
        let (store, mut tx) = setup();
        seed(&store);
        let before = snapshot(&store);

        run_workflow(&store, &mut tx, fail_at).await;

        assert!(tx.err().is_some(), "step {fail_at} should have failed");
        assert_eq!(tx.actions().len(), fail_at - 1, "log holds only the successful prefix");

        let report = tx.rollback().await.unwrap();
        assert_eq!(report.reverted, fail_at - 1);
        assert!(matches!(
            report.cause,
            Some(TransactionError::MutationFailed { .. })
        ));

        let mut after = snapshot(&store);
        // A re-inserted document lands at the end of its collection
        for collection in after.iter_mut() {
            collection.sort_by(|a, b| a["_id"].as_str().cmp(&b["_id"].as_str()));
        }
        assert_eq!(after, before, "state differs after failing at step {fail_at}");
    }
}

#[tokio::test]
async fn test_rollback_is_lifo_and_forward_order_corrupts() {
    async fn replace_document(tx: &mut TransactionCoordinator) {
        tx.collection("products")
            .find_one_and_delete(TransactionModel::new().filter(doc(json!({"_id": "p1"}))))
            .await
            .unwrap();
        tx.collection("products")
            .insert_one(
                TransactionModel::new().document(doc(json!({"_id": "p1", "status": "replaced"}))),
            )
            .await
            .unwrap();
    }

    // Undoing in forward order re-inserts the old document while the
    // replacement still holds its id, then deletes the id: p1 is lost.
    let (store, mut tx) = setup();
    store.seed("products", doc(json!({"_id": "p1", "status": "draft"})));
    replace_document(&mut tx).await;
    for action in tx.actions() {
        let _ = action.compensate(store.as_ref()).await;
    }
    assert!(store.snapshot("products").is_empty());
    tx.commit().unwrap();

    // Reverse order deletes the replacement first and restores the original
    let (store, mut tx) = setup();
    store.seed("products", doc(json!({"_id": "p1", "status": "draft"})));
    replace_document(&mut tx).await;
    tx.rollback().await.unwrap();
    assert_eq!(
        store.snapshot("products"),
        vec![doc(json!({"_id": "p1", "status": "draft"}))]
    );
}

#[tokio::test]
async fn test_update_with_no_match_is_failure_and_not_logged() {
    let (_store, mut tx) = setup();

    let err = tx
        .collection("wallets")
        .update_one(
            TransactionModel::new()
                .filter(doc(json!({"_id": "missing"})))
                .update(doc(json!({"$set": {"balance": 1}})))
                .rollback_update(doc(json!({"$set": {"balance": 0}}))),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::NoMatch { op: StoreOp::UpdateOne, .. }));
    assert!(tx.err().is_some());
    assert!(tx.actions().is_empty());

    let err = tx
        .collection("wallets")
        .insert_one(TransactionModel::new().document(doc(json!({"x": 1}))))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::Aborted(_)));
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_update_many_and_find_and_modify_no_match() {
    let (_store, mut tx) = setup();
    let err = tx
        .collection("products")
        .update_many(
            TransactionModel::new()
                .filter(doc(json!({"status": "archived"})))
                .update(doc(json!({"$set": {"status": "draft"}})))
                .rollback_update(doc(json!({"$set": {"status": "archived"}}))),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::NoMatch { op: StoreOp::UpdateMany, .. }));

    let (_store, mut tx) = setup();
    let err = tx
        .collection("products")
        .find_one_and_delete(TransactionModel::new().filter(doc(json!({"_id": "nope"}))))
        .await
        .unwrap_err();
    assert!(matches!(err, TransactionError::NoMatch { op: StoreOp::FindOneAndDelete, .. }));
}

#[tokio::test]
async fn test_end_to_end_balance_restored_and_document_kept() {
    let (store, mut tx) = setup();
    // Insert X in its own unit of work that succeeds
    let mut setup_tx = TransactionCoordinator::new(store.clone(), CoordinatorConfig::default());
    setup_tx
        .collection("accounts")
        .insert_one(TransactionModel::new().document(doc(json!({"_id": "X", "balance": 0}))))
        .await
        .unwrap();
    assert_eq!(setup_tx.commit().unwrap(), 1);

    tx.collection("accounts")
        .update_one(
            TransactionModel::new()
                .filter(doc(json!({"_id": "X"})))
                .update(doc(json!({"$set": {"balance": 100}})))
                .rollback_update(doc(json!({"$set": {"balance": 0}}))),
        )
        .await
        .unwrap();

    store.fail_next(StoreOp::InsertOne, 1);
    assert!(tx
        .collection("ledger")
        .insert_one(TransactionModel::new().document(doc(json!({"amount": 100}))))
        .await
        .is_err());

    tx.rollback().await.unwrap();

    let accounts = store.snapshot("accounts");
    let x = accounts.iter().find(|d| d["_id"] == json!("X")).unwrap();
    assert_eq!(x["balance"], json!(0));
    assert!(store.snapshot("ledger").is_empty());
}

#[tokio::test]
async fn test_failed_compensation_keeps_both_errors() {
    let (store, mut tx) = setup();
    tx.collection("wallet_history")
        .insert_one(TransactionModel::new().document(doc(json!({"amount": 1}))))
        .await
        .unwrap();

    store.fail_next(StoreOp::UpdateOne, 1);
    store.seed("wallets", doc(json!({"_id": "w1", "balance": 1})));
    let _ = tx
        .collection("wallets")
        .update_one(
            TransactionModel::new()
                .filter(doc(json!({"_id": "w1"})))
                .update(doc(json!({"$inc": {"balance": -1}})))
                .rollback_update(doc(json!({"$inc": {"balance": 1}}))),
        )
        .await;

    store.fail_always(StoreOp::DeleteMany);
    let err = tx.rollback().await.unwrap_err();

    assert!(err.is_rollback_incomplete());
    match err {
        TransactionError::RollbackIncomplete { cause, failures } => {
            assert!(matches!(
                cause.as_deref(),
                Some(TransactionError::MutationFailed { op: StoreOp::UpdateOne, .. })
            ));
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].kind, ActionKind::InsertOne);
            assert_eq!(failures[0].attempts, CoordinatorConfig::default().retry_budget);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(
        store.calls(StoreOp::DeleteMany),
        CoordinatorConfig::default().retry_budget
    );
}

#[tokio::test]
async fn test_compensation_retries_within_budget() {
    let (store, mut tx) = setup();
    tx.collection("wallet_history")
        .insert_one(TransactionModel::new().document(doc(json!({"amount": 1}))))
        .await
        .unwrap();

    store.fail_next(StoreOp::DeleteMany, 2);
    let report = tx.rollback().await.unwrap();

    assert_eq!(report.reverted, 1);
    assert!(report.cause.is_none());
    assert!(store.snapshot("wallet_history").is_empty());
}

#[tokio::test]
async fn test_partial_insert_many_is_undone_immediately() {
    let (store, mut tx) = setup();
    store.fail_insert_many_after(2);

    let err = tx
        .collection("tasks")
        .insert_many(TransactionModel::new().documents(vec![
            doc(json!({"n": 1})),
            doc(json!({"n": 2})),
            doc(json!({"n": 3})),
        ]))
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::MutationFailed { op: StoreOp::InsertMany, .. }));
    assert!(store.snapshot("tasks").is_empty());
    assert!(tx.actions().is_empty());
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_insert_many_rollback_deletes_all_ids() {
    let (store, mut tx) = setup();
    let ids = tx
        .collection("tasks")
        .insert_many(TransactionModel::new().documents(vec![
            doc(json!({"n": 1})),
            doc(json!({"n": 2})),
        ]))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(tx.actions()[0].resulting_ids(), ids.as_slice());

    tx.rollback().await.unwrap();
    assert!(store.snapshot("tasks").is_empty());
}

#[tokio::test]
async fn test_timed_out_mutation_is_not_logged() {
    let store = Arc::new(InMemoryDocumentStore::new(Arc::new(
        SequentialIdProvider::new("doc"),
    )));
    let mut tx = TransactionCoordinator::new(
        store.clone(),
        CoordinatorConfig {
            operation_timeout: Duration::from_millis(20),
            ..CoordinatorConfig::default()
        },
    );

    store.set_latency(Some(Duration::from_millis(500)));
    let err = tx
        .collection("wallets")
        .insert_one(TransactionModel::new().document(doc(json!({"balance": 1}))))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        TransactionError::MutationFailed {
            source: StoreError::Timeout(_),
            ..
        }
    ));
    assert!(tx.actions().is_empty());
    store.set_latency(None);
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_computed_reverse_requires_find_one_and_update() {
    let (store, mut tx) = setup();
    store.seed("wallets", doc(json!({"_id": "w1", "balance": 1})));

    let err = tx
        .collection("wallets")
        .update_one(
            TransactionModel::new()
                .filter(doc(json!({"_id": "w1"})))
                .update(doc(json!({"$inc": {"balance": 1}})))
                .rollback_with(RestoreFields::new(["balance"])),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransactionError::InvalidModel { .. }));
    assert_eq!(store.calls(StoreOp::UpdateOne), 0);
    tx.rollback().await.unwrap();
}

#[tokio::test]
async fn test_update_reversal_targets_matched_documents() {
    let (store, mut tx) = setup();
    store.seed("products", doc(json!({"_id": "p1", "status": "draft"})));
    store.seed("products", doc(json!({"_id": "p2", "status": "live"})));

    // The forward update changes the field the filter selects on
    tx.collection("products")
        .update_many(
            TransactionModel::new()
                .filter(doc(json!({"status": "draft"})))
                .update(doc(json!({"$set": {"status": "live"}})))
                .rollback_update(doc(json!({"$set": {"status": "draft"}}))),
        )
        .await
        .unwrap();
    assert_eq!(tx.actions()[0].resulting_ids(), ["p1".to_string()]);

    tx.rollback().await.unwrap();
    let products = store.snapshot("products");
    assert_eq!(products[0]["status"], json!("draft"));
    assert_eq!(products[1]["status"], json!("live"));
}

#[tokio::test]
async fn test_commit_hands_back_failed_coordinator() {
    let (_store, mut tx) = setup();
    let _ = tx
        .collection("wallets")
        .find_one_and_delete(TransactionModel::new().filter(doc(json!({"_id": "x"}))))
        .await;

    let tx = tx.commit().unwrap_err();
    assert!(tx.err().is_some());
    tx.rollback().await.unwrap();
}
