//! End-to-end flows across the whole store: graph persistence through a
//! root, lazy navigation after reopen, and concurrent independent writers.

use std::collections::HashSet;
use std::sync::Once;

use loam_store::{wait_for_completion, Database, Managed, Object, ObjectId};

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

fn string_object(text: &str) -> Object {
    Object::new(text.as_bytes().to_vec(), &[]).unwrap()
}

#[test]
fn linked_list_roundtrip_through_a_root() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("list.db");

    let text = "a list holding A, B, and C";
    {
        let db = Database::open(&path).unwrap();
        let root = db.root("list").unwrap();

        let a = string_object("A");
        let b = string_object("B");
        let c = string_object("C");
        let list = Object::new(text, &[a.clone(), b.clone(), c.clone()]).unwrap();
        a.release();
        b.release();
        c.release();

        root.set(&list).unwrap();
        list.release();
        root.release();
        db.release();
        wait_for_completion();
    }

    let db = Database::open(&path).unwrap();
    let root = db.root("list").unwrap();
    let list = root.get().unwrap();

    assert_eq!(list.with_payload(|p| p.to_vec()).unwrap(), text.as_bytes());
    assert_eq!(list.num_references(), 3);
    for (index, expected) in [b"A", b"B", b"C"].iter().enumerate() {
        let entry = list.weak_reference(index).unwrap();
        assert_eq!(entry.with_payload(|p| p.to_vec()).unwrap(), *expected);
    }

    list.release();
    root.release();
    db.release();
    wait_for_completion();
}

#[test]
fn a_thousand_concurrent_writes_round_trip() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("many.db");

    let ids: Vec<(usize, ObjectId)> = {
        let db = Database::open(&path).unwrap();
        let ids = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|worker| {
                    let db = db.clone();
                    scope.spawn(move || {
                        (0..125)
                            .map(|i| {
                                let n = worker * 125 + i;
                                let obj = string_object(&format!("payload-{n}"));
                                let id = db.write_object(&obj).unwrap();
                                obj.release();
                                (n, id)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .collect::<Vec<_>>()
        });
        db.release();
        wait_for_completion();
        ids
    };

    assert_eq!(ids.len(), 1000);
    let distinct: HashSet<ObjectId> = ids.iter().map(|(_, id)| *id).collect();
    assert_eq!(distinct.len(), 1000);

    let db = Database::open(&path).unwrap();
    for (n, id) in &ids {
        let obj = db.read_object(*id).unwrap();
        let payload = obj.with_payload(|p| p.to_vec()).unwrap();
        assert_eq!(payload, format!("payload-{n}").into_bytes());
        obj.release();
    }
    db.release();
    wait_for_completion();
}

#[test]
fn balanced_releases_tear_everything_down() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("balance.db");

    let db = Database::open(&path).unwrap();
    let root = db.root("tree").unwrap();

    let leaves: Vec<Object> = (0..4).map(|i| string_object(&format!("leaf-{i}"))).collect();
    let top = Object::new("top", &leaves).unwrap();
    root.set(&top).unwrap();

    for leaf in &leaves {
        assert_eq!(leaf.retain_count(), 2);
        leaf.release();
    }
    assert_eq!(top.retain_count(), 2);
    top.release();

    root.delete().unwrap();
    wait_for_completion();
    // The root's cache retain is gone along with every caller retain.
    assert_eq!(top.retain_count(), 0);
    for leaf in &leaves {
        assert_eq!(leaf.retain_count(), 0);
    }

    root.release();
    db.release();
    wait_for_completion();
    assert_eq!(db.retain_count(), 0);
    assert_eq!(root.retain_count(), 0);
}

#[test]
fn asynchronous_pipeline_settles_at_the_barrier() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.db");

    {
        let db = Database::open(&path).unwrap();
        let root = db.root("stream").unwrap();
        let first = string_object("first");
        let second = string_object("second");

        // Two queued updates on one root apply in submission order.
        root.set_async(&first);
        root.set_async(&second);
        let (tx, rx) = std::sync::mpsc::channel();
        root.get_async(move |bound| {
            let payload = bound.as_ref().map(|obj| obj.with_payload(|p| p.to_vec()));
            if let Some(obj) = bound {
                obj.release();
            }
            tx.send(payload).unwrap();
        });
        let seen = rx.recv().unwrap().unwrap().unwrap();
        assert_eq!(seen, b"second");

        wait_for_completion();
        first.release();
        second.release();
        root.release();
        db.release();
        wait_for_completion();
    }

    let db = Database::open(&path).unwrap();
    let root = db.root("stream").unwrap();
    let bound = root.get().unwrap();
    assert_eq!(bound.with_payload(|p| p.to_vec()).unwrap(), b"second");
    bound.release();
    root.release();
    db.release();
    wait_for_completion();
}
