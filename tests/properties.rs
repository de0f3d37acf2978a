//! Property- and case-based tests for assembler invariants that are
//! easier to state as a law than to enumerate by hand.

mod support;

use std::sync::Arc;

use leafvault::assembler::{Assembler, DeleteOptions, GetOptions};
use leafvault::cache::HashCache;
use leafvault::config::Config;
use leafvault::db::Database;
use leafvault::filter::FileFilter;
use leafvault::lock::LockRegistry;
use leafvault::model::NewNote;
use leafvault::sanity::CorruptedEntries;
use leafvault::waiter::Waiter;
use quickcheck_macros::quickcheck;
use rstest::rstest;

fn new_assembler() -> Assembler {
    let db = support::InMemoryDatabase::new() as Arc<dyn Database>;
    let cache = Arc::new(HashCache::new(64));
    let waiter = Arc::new(Waiter::new());
    let filter = Arc::new(FileFilter::new(None, None).unwrap());
    let locks = Arc::new(LockRegistry::new());
    let corrupted = Arc::new(CorruptedEntries::new());
    Assembler::new(db, cache, waiter, filter, locks, corrupted, Config::default())
}

/// `put(p); put(p)` reads back identically to a single `put(p)` — writing
/// the same content twice is idempotent from the reader's perspective.
#[quickcheck]
fn put_twice_is_idempotent(payload: String) -> bool {
    let assembler = new_assembler();
    let note = NewNote { id: "idempotent.md".into(), data: payload.clone(), ctime: 0, mtime: 0 };

    futures::executor::block_on(async {
        assembler.put_entry(&note, false).await.unwrap();
        assembler.put_entry(&note, false).await.unwrap();
        let entry = assembler.get_entry("idempotent.md", &GetOptions::default()).await.unwrap();
        entry.map(|e| e.data) == Some(payload)
    })
}

/// `put(a); delete; put(b)` reads back exactly as a fresh database with
/// only `put(b)` ever applied would — a delete leaves no trace in the
/// materialized content of whatever gets written afterward.
#[rstest]
#[case("first version", "second version")]
#[case("", "non-empty after empty")]
#[case("same", "same")]
fn put_delete_put_is_equivalent_to_a_fresh_put(#[case] first: &str, #[case] second: &str) {
    let revived = new_assembler();
    let fresh = new_assembler();

    futures::executor::block_on(async {
        let note_a = NewNote { id: "doc.md".into(), data: first.to_owned(), ctime: 0, mtime: 0 };
        revived.put_entry(&note_a, false).await.unwrap();
        revived.delete_entry("doc.md", None::<DeleteOptions>).await.unwrap();

        let note_b = NewNote { id: "doc.md".into(), data: second.to_owned(), ctime: 0, mtime: 0 };
        revived.put_entry(&note_b, false).await.unwrap();
        fresh.put_entry(&note_b, false).await.unwrap();

        let revived_entry = revived.get_entry("doc.md", &GetOptions::default()).await.unwrap().unwrap();
        let fresh_entry = fresh.get_entry("doc.md", &GetOptions::default()).await.unwrap().unwrap();

        assert_eq!(revived_entry.data, fresh_entry.data);
        assert!(!revived_entry.meta.deleted);
    });
}
