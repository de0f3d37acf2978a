//! An in-memory `Database` test double, standing in for the real CouchDB/
//! PouchDB-backed implementation a host application would supply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use leafvault::db::{
    AllDocsOptions, AllDocsRow, BulkResult, ChangeEvent, ChangeFilter, Database, DbInfo,
    Direction, PutResult, ReplicationEvent, ReplicationHandle, ReplicationOptions,
};
use leafvault::error::{Error, Result};
use serde_json::Value;

#[derive(Default)]
struct Inner {
    docs: HashMap<String, Value>,
    subscribers: Vec<(ChangeFilter, Sender<ChangeEvent>)>,
}

pub struct InMemoryDatabase {
    inner: Mutex<Inner>,
}

impl InMemoryDatabase {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { inner: Mutex::new(Inner::default()) })
    }

    fn notify(inner: &mut Inner, id: &str, doc: Option<Value>, deleted: bool) {
        let kind = doc
            .as_ref()
            .and_then(|d| d.get("type"))
            .and_then(|t| t.as_str())
            .map(str::to_owned);
        for (filter, tx) in &inner.subscribers {
            let matches = match filter {
                ChangeFilter::All => true,
                ChangeFilter::TypeEquals(tag) => kind.as_deref() == Some(*tag),
            };
            if matches {
                let _ = tx.send(ChangeEvent { id: id.to_owned(), doc: doc.clone(), deleted });
            }
        }
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn get(&self, id: &str) -> Result<Value> {
        let inner = self.inner.lock().unwrap();
        inner.docs.get(id).cloned().ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    async fn put(&self, id: &str, doc: Value, _force: bool) -> Result<PutResult> {
        let mut inner = self.inner.lock().unwrap();
        inner.docs.insert(id.to_owned(), doc.clone());
        Self::notify(&mut inner, id, Some(doc), false);
        Ok(PutResult { ok: true, rev: "1".to_owned() })
    }

    async fn bulk_docs(&self, docs: Vec<Value>) -> Result<Vec<BulkResult>> {
        let mut inner = self.inner.lock().unwrap();
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc
                .get("id")
                .and_then(|v| v.as_str())
                .expect("test fixture docs always carry an id")
                .to_owned();
            inner.docs.insert(id.clone(), doc.clone());
            Self::notify(&mut inner, &id, Some(doc), false);
            results.push(BulkResult { id, ok: true, conflict: false, rev: Some("1".to_owned()) });
        }
        Ok(results)
    }

    async fn all_docs(&self, opts: AllDocsOptions) -> Result<Vec<AllDocsRow>> {
        let inner = self.inner.lock().unwrap();
        let mut rows = Vec::new();
        match opts.keys {
            Some(keys) => {
                for key in keys {
                    match inner.docs.get(&key) {
                        Some(doc) => rows.push(AllDocsRow {
                            id: key,
                            doc: opts.include_docs.then(|| doc.clone()),
                            error: None,
                        }),
                        None => rows.push(AllDocsRow { id: key, doc: None, error: Some("not_found".to_owned()) }),
                    }
                }
            }
            None => {
                let mut ids: Vec<&String> = inner.docs.keys().collect();
                ids.sort();
                for id in ids {
                    if let Some(start) = &opts.start_key {
                        if id <= start {
                            continue;
                        }
                    }
                    rows.push(AllDocsRow {
                        id: id.clone(),
                        doc: opts.include_docs.then(|| inner.docs[id].clone()),
                        error: None,
                    });
                    if let Some(limit) = opts.limit {
                        if rows.len() as u32 >= limit {
                            break;
                        }
                    }
                }
            }
        }
        Ok(rows)
    }

    fn subscribe_changes(&self, filter: ChangeFilter) -> Receiver<ChangeEvent> {
        let (tx, rx) = unbounded();
        self.inner.lock().unwrap().subscribers.push((filter, tx));
        rx
    }

    fn replicate(&self, remote: Arc<dyn Database>, _opts: ReplicationOptions) -> Box<dyn ReplicationHandle> {
        let (tx, rx) = unbounded();
        let docs: Vec<Value> = self.inner.lock().unwrap().docs.values().cloned().collect();
        std::thread::spawn(move || {
            if !docs.is_empty() {
                futures::executor::block_on(remote.bulk_docs(docs.clone())).ok();
            }
            let _ = tx.send(ReplicationEvent::Change { direction: Direction::Push, docs });
            let _ = tx.send(ReplicationEvent::Complete);
        });
        Box::new(InMemoryReplicationHandle { events: rx })
    }

    async fn info(&self) -> Result<DbInfo> {
        let inner = self.inner.lock().unwrap();
        Ok(DbInfo { doc_count: inner.docs.len() as u64, update_seq: "0".to_owned() })
    }

    async fn destroy(&self) -> Result<()> {
        self.inner.lock().unwrap().docs.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct InMemoryReplicationHandle {
    events: Receiver<ReplicationEvent>,
}

impl ReplicationHandle for InMemoryReplicationHandle {
    fn events(&self) -> &Receiver<ReplicationEvent> {
        &self.events
    }

    fn cancel(&self) {}
}
