//! Change feed: one-shot scans, de-duplication, filters, continuous mode.

mod common;

use std::time::Duration;

use common::{fresh_db, put};
use davenport_core::{ChangesOptions, Error, GetOptions};
use serde_json::json;

#[tokio::test]
async fn one_shot_ascending_and_since() {
    let (_dir, db) = fresh_db("changes_one_shot");
    for id in ["a", "b", "c"] {
        put(&db, json!({"_id": id})).await;
    }

    let resp = db.changes(ChangesOptions::default()).await.unwrap();
    let ids: Vec<_> = resp.results.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
    let seqs: Vec<_> = resp.results.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, [1, 2, 3]);
    assert_eq!(resp.last_seq, 3);

    let resp = db
        .changes(ChangesOptions {
            since: 2,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].id, "c");
}

#[tokio::test]
async fn superseded_sequences_are_not_emitted() {
    let (_dir, db) = fresh_db("changes_dedup");
    let rev1 = put(&db, json!({"_id": "a", "v": 1})).await;
    put(&db, json!({"_id": "a", "_rev": rev1, "v": 2})).await;

    let resp = db.changes(ChangesOptions::default()).await.unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].seq, 2);
    assert!(resp.results[0].changes[0].rev.starts_with("2-"));
}

#[tokio::test]
async fn include_docs_stamps_winning_rev() {
    let (_dir, db) = fresh_db("changes_include_docs");
    let rev = put(&db, json!({"_id": "a", "v": 7})).await;

    let resp = db
        .changes(ChangesOptions {
            include_docs: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let doc = resp.results[0].doc.as_ref().unwrap();
    assert_eq!(doc["v"], 7);
    assert_eq!(doc["_rev"], rev);
}

#[tokio::test]
async fn tombstones_are_flagged_deleted() {
    let (_dir, db) = fresh_db("changes_deleted");
    let rev1 = put(&db, json!({"_id": "a"})).await;
    put(&db, json!({"_id": "a", "_rev": rev1, "_deleted": true})).await;

    let resp = db.changes(ChangesOptions::default()).await.unwrap();
    assert_eq!(resp.results.len(), 1);
    assert!(resp.results[0].deleted);
}

#[tokio::test]
async fn descending_and_limit() {
    let (_dir, db) = fresh_db("changes_desc_limit");
    for id in ["a", "b", "c"] {
        put(&db, json!({"_id": id})).await;
    }

    let resp = db
        .changes(ChangesOptions {
            descending: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<_> = resp.results.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["c", "b", "a"]);

    let resp = db
        .changes(ChangesOptions {
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resp.results.len(), 2);
    assert_eq!(resp.last_seq, 2);
}

#[tokio::test]
async fn doc_ids_filter() {
    let (_dir, db) = fresh_db("changes_doc_ids");
    for id in ["a", "b", "c"] {
        put(&db, json!({"_id": id})).await;
    }

    let resp = db
        .changes(ChangesOptions {
            doc_ids: Some(vec!["b".into()]),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].id, "b");
}

#[tokio::test]
async fn selector_filter_without_include_docs_strips_doc() {
    let (_dir, db) = fresh_db("changes_selector");
    put(&db, json!({"_id": "n1", "kind": "note"})).await;
    put(&db, json!({"_id": "t1", "kind": "task"})).await;

    let resp = db
        .changes(ChangesOptions {
            selector: Some(json!({"kind": "note"})),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resp.results.len(), 1);
    assert_eq!(resp.results[0].id, "n1");
    assert!(resp.results[0].doc.is_none());
}

#[tokio::test]
async fn design_doc_filter_resolves_selector() {
    let (_dir, db) = fresh_db("changes_ddoc_filter");
    put(
        &db,
        json!({"_id": "_design/app", "filters": {
            "notes": {"kind": "note"},
            "legacy": "function(doc) { return true; }",
        }}),
    )
    .await;
    put(&db, json!({"_id": "n1", "kind": "note"})).await;
    put(&db, json!({"_id": "t1", "kind": "task"})).await;

    let resp = db
        .changes(ChangesOptions {
            filter: Some("app/notes".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    let ids: Vec<_> = resp.results.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, ["n1"]);

    // JavaScript filters are never evaluated.
    let err = db
        .changes(ChangesOptions {
            filter: Some("app/legacy".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[tokio::test]
async fn live_feed_delivers_writes_in_commit_order() {
    let (_dir, db) = fresh_db("changes_live");
    put(&db, json!({"_id": "existing"})).await;

    let (mut rx, handle) = db.live_changes(ChangesOptions::default());

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, "existing");

    put(&db, json!({"_id": "new1"})).await;
    put(&db, json!({"_id": "new2"})).await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, "new1");
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, "new2");

    // After cancel, nothing more is delivered.
    handle.cancel();
    put(&db, json!({"_id": "after_cancel"})).await;
    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(matches!(outcome, Err(_) | Ok(None)));
}

#[tokio::test]
async fn live_feed_skips_losing_branch_writes() {
    let (_dir, db) = fresh_db("changes_live_losing_branch");
    let (mut rx, handle) = db.live_changes(ChangesOptions {
        include_docs: true,
        ..Default::default()
    });

    let repl = davenport_core::BulkDocsOptions::replication();
    db.bulk_docs(
        vec![json!({"_id": "a", "_rev": "1-bbb", "v": "winner"})],
        repl.clone(),
    )
    .await
    .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.seq, 1);
    assert_eq!(event.doc.as_ref().unwrap()["_rev"], "1-bbb");

    // A sibling branch that loses the hash comparison gets seq 2, but seq 2
    // does not hold the winning revision; the feed must stay silent instead
    // of emitting the loser's body stamped with the winner's rev.
    db.bulk_docs(
        vec![json!({"_id": "a", "_rev": "1-aaa", "v": "loser"})],
        repl.clone(),
    )
    .await
    .unwrap();
    let outcome = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(outcome.is_err(), "losing branch write must not be emitted");

    // Extending the winning branch is announced again.
    db.bulk_docs(
        vec![json!({
            "_id": "a",
            "_rev": "2-ccc",
            "_revisions": {"start": 2, "ids": ["ccc", "bbb"]},
            "v": "extended",
        })],
        repl,
    )
    .await
    .unwrap();
    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.seq, 3);
    assert_eq!(event.doc.as_ref().unwrap()["_rev"], "2-ccc");
    assert_eq!(event.doc.as_ref().unwrap()["v"], "extended");
    handle.cancel();
}

#[tokio::test]
async fn live_feed_ignores_local_docs() {
    let (_dir, db) = fresh_db("changes_live_local");
    let (mut rx, handle) = db.live_changes(ChangesOptions::default());

    put(&db, json!({"_id": "_local/private"})).await;
    put(&db, json!({"_id": "public"})).await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, "public");
    handle.cancel();
}

#[tokio::test]
async fn changes_tracks_conflict_leaves() {
    let (_dir, db) = fresh_db("changes_conflict_leaves");
    put(&db, json!({"_id": "a", "v": 1})).await;
    let rev1 = db.get("a", GetOptions::default()).await.unwrap()["_rev"]
        .as_str()
        .unwrap()
        .to_string();
    // A replicated branch at the same generation forks the tree.
    db.bulk_docs(
        vec![json!({"_id": "a", "_rev": "1-zzzzzzzz", "v": 2})],
        davenport_core::BulkDocsOptions::replication(),
    )
    .await
    .unwrap();

    let resp = db.changes(ChangesOptions::default()).await.unwrap();
    assert_eq!(resp.results.len(), 1);
    let revs: Vec<_> = resp.results[0].changes.iter().map(|c| c.rev.as_str()).collect();
    assert_eq!(revs.len(), 2);
    assert!(revs.contains(&"1-zzzzzzzz"));
    assert!(revs.contains(&rev1.as_str()));
}
