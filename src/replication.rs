//! Replication coordinator.
//!
//! Owns the single live replication a node may run at a time, the
//! milestone connection-check that gates it, and the adaptive batch-size
//! backoff that reacts to transport-layer size rejections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::Receiver;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::json;

use crate::config::{Config, BACKOFF_FLOOR, BACKOFF_RESTORE_THROUGHPUT_FACTOR};
use crate::db::{
    AllDocsOptions, Checkpoint, Database, Direction, ReplicationEvent, ReplicationMode,
    ReplicationOptions, TransportSignals,
};
use crate::error::{Error, Result};
use crate::ids::LeafId;
use crate::milestone::{MilestoneNegotiator, VersionRange};
use crate::model::{Leaf, LeafTag};

/// Lifecycle states a replication moves through; `Paused` and `Connected`
/// alternate freely while `live` replication is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    NotConnected,
    Started,
    Connected,
    Paused,
    Completed,
    Errored,
    Closed,
}

struct Backoff {
    batch_size: u32,
    batches_limit: u32,
    original_batch_size: u32,
    original_batches_limit: u32,
}

impl Backoff {
    fn new(cfg: &Config) -> Self {
        Self {
            batch_size: cfg.batch_size,
            batches_limit: cfg.batches_limit,
            original_batch_size: cfg.batch_size,
            original_batches_limit: cfg.batches_limit,
        }
    }

    /// On a transport-level size rejection, each parameter is replaced by
    /// `ceil(old / 2) + 2`; if both land at or below [`BACKOFF_FLOOR`] after
    /// applying the reduction, there is nowhere meaningful left to shrink
    /// and the caller should give up.
    fn shrink(&mut self) -> Result<()> {
        if self.batch_size <= BACKOFF_FLOOR && self.batches_limit <= BACKOFF_FLOOR {
            return Err(Error::CannotReplicateLower);
        }
        self.batch_size = ceil_half(self.batch_size) + 2;
        self.batches_limit = ceil_half(self.batches_limit) + 2;
        warn!(
            "replication batch size reduced to {} (limit {})",
            self.batch_size, self.batches_limit
        );
        if self.batch_size <= BACKOFF_FLOOR && self.batches_limit <= BACKOFF_FLOOR {
            return Err(Error::CannotReplicateLower);
        }
        Ok(())
    }

    /// Restores the original settings in one jump once sustained throughput
    /// exceeds `originalSetting.batch_size * BACKOFF_RESTORE_THROUGHPUT_FACTOR`
    /// documents transferred in a single batch.
    fn maybe_restore(&mut self, docs_in_batch: u32) {
        if self.batch_size >= self.original_batch_size {
            return;
        }
        let threshold = self.original_batch_size as u64 * BACKOFF_RESTORE_THROUGHPUT_FACTOR as u64;
        if docs_in_batch as u64 > threshold {
            self.batch_size = self.original_batch_size;
            self.batches_limit = self.original_batches_limit;
            info!(
                "replication throughput recovered, restoring batch_size={} batches_limit={}",
                self.batch_size, self.batches_limit
            );
        }
    }

    /// `live` replication runs indefinitely and gets the 30s continuous
    /// heartbeat; a one-shot batch uses the shorter 10s heartbeat since it
    /// only needs to detect a stalled single pass. `filters_enabled` mirrors
    /// `read_chunks_online`: when chunk reads go through `CollectChunks`
    /// instead of per-leaf gets, the `replicate/push` and `replicate/pull`
    /// filters are attached too.
    fn as_options(&self, mode: ReplicationMode, live: bool, filters_enabled: bool) -> ReplicationOptions {
        ReplicationOptions {
            mode,
            live,
            retry: true,
            batch_size: self.batch_size,
            batches_limit: self.batches_limit,
            heartbeat_ms: Some(if live { 30_000 } else { 10_000 }),
            push_checkpoint: Checkpoint::Target,
            pull_checkpoint: Checkpoint::Target,
            push_filter: filters_enabled.then(|| "replicate/push".to_owned()),
            pull_filter: filters_enabled.then(|| "replicate/pull".to_owned()),
        }
    }
}

/// Singleton guard over the one replication a node may run concurrently;
/// `start` try-acquires rather than queuing a caller that finds one
/// already running.
pub struct ReplicationCoordinator {
    running: AtomicBool,
    state: Mutex<State>,
    backoff: Mutex<Backoff>,
    version: VersionRange,
    config: Config,
    doc_arrived: AtomicU64,
    doc_sent: AtomicU64,
}

/// Outcome of draining one `Database::replicate` handle to its end.
enum DrainOutcome {
    Done,
    Retry,
}

impl ReplicationCoordinator {
    /// A fresh [`MilestoneNegotiator`] is built per call from whatever
    /// nodeid is current at that time, since that identity is only known
    /// once bootstrap has assigned it — not at coordinator construction.
    pub fn new(config: Config) -> Self {
        let version = VersionRange {
            min: config.chunk_version_min,
            max: config.chunk_version_max,
            current: config.chunk_version_current,
        };
        Self {
            running: AtomicBool::new(false),
            state: Mutex::new(State::NotConnected),
            backoff: Mutex::new(Backoff::new(&config)),
            version,
            config,
            doc_arrived: AtomicU64::new(0),
            doc_sent: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock()
    }

    fn set_state(&self, state: State) {
        *self.state.lock() = state;
    }

    /// Count of documents pulled in across every replication this
    /// coordinator has run, exposed so a host application can poll
    /// progress without parsing [`ReplicationEvent`]s itself.
    pub fn doc_arrived(&self) -> u64 {
        self.doc_arrived.load(Ordering::Relaxed)
    }

    /// Count of documents pushed out across every replication this
    /// coordinator has run.
    pub fn doc_sent(&self) -> u64 {
        self.doc_sent.load(Ordering::Relaxed)
    }

    /// `openReplication({keepAlive, showResult, cb})`. Runs the milestone
    /// connection-check, then drives `local.replicate` to completion (or
    /// indefinitely if `keep_alive`), calling `on_event` for every
    /// [`ReplicationEvent`]. Fails immediately with
    /// [`Error::ReplicationBusy`] if another replication is already
    /// running on this node. `keep_alive` first runs a one-shot pull-only
    /// catch-up, then opens a live bidirectional leg — a node rejoining
    /// after time offline pulls what it missed before it starts pushing.
    pub fn start(
        &self,
        local: Arc<dyn Database>,
        remote: Arc<dyn Database>,
        nodeid: &str,
        keep_alive: bool,
        transport: &Arc<dyn TransportSignals>,
        mut on_event: impl FnMut(&ReplicationEvent) + Send + 'static,
        now: i64,
    ) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::ReplicationBusy);
        }
        self.set_state(State::Started);

        let result = self.run(local, remote, nodeid, keep_alive, transport, &mut on_event, now);

        self.running.store(false, Ordering::Release);
        result
    }

    fn run(
        &self,
        local: Arc<dyn Database>,
        remote: Arc<dyn Database>,
        nodeid: &str,
        keep_alive: bool,
        transport: &Arc<dyn TransportSignals>,
        on_event: &mut (impl FnMut(&ReplicationEvent) + Send + 'static),
        now: i64,
    ) -> Result<()> {
        if !self.config.version_up_flash.is_empty() {
            self.set_state(State::NotConnected);
            return Err(Error::NotReady);
        }

        let milestone = MilestoneNegotiator::new(nodeid.to_owned());
        if let Err(e) = futures::executor::block_on(milestone.check(
            &remote,
            self.version,
            self.config.ignore_version_check,
            now,
        )) {
            self.set_state(State::Errored);
            return Err(e);
        }
        self.set_state(State::Connected);

        let filters_enabled = self.config.read_chunks_online;

        if keep_alive {
            self.run_replication(
                &local,
                &remote,
                ReplicationMode::PullOnly,
                false,
                filters_enabled,
                transport,
                on_event,
            )?;
            self.set_state(State::Connected);
            self.run_replication(
                &local,
                &remote,
                ReplicationMode::Sync,
                true,
                filters_enabled,
                transport,
                on_event,
            )
        } else {
            self.run_replication(
                &local,
                &remote,
                ReplicationMode::Sync,
                false,
                filters_enabled,
                transport,
                on_event,
            )
        }
    }

    /// Opens `Database::replicate` at the coordinator's current (possibly
    /// already backed-off) batch settings and drains its events, reopening
    /// at a smaller batch size whenever the transport signals a size
    /// rejection, until the replication genuinely completes or fails for
    /// another reason.
    fn run_replication(
        &self,
        local: &Arc<dyn Database>,
        remote: &Arc<dyn Database>,
        mode: ReplicationMode,
        live: bool,
        filters_enabled: bool,
        transport: &Arc<dyn TransportSignals>,
        on_event: &mut (impl FnMut(&ReplicationEvent) + Send + 'static),
    ) -> Result<()> {
        loop {
            let opts = self.backoff.lock().as_options(mode, live, filters_enabled);
            let handle = local.replicate(remote.clone(), opts);
            match self.drain(handle.events(), transport, on_event)? {
                DrainOutcome::Done => return Ok(()),
                DrainOutcome::Retry => {
                    info!("retrying replication at reduced batch size after a transport size rejection");
                    continue;
                }
            }
        }
    }

    fn drain(
        &self,
        events: &Receiver<ReplicationEvent>,
        transport: &Arc<dyn TransportSignals>,
        on_event: &mut (impl FnMut(&ReplicationEvent) + Send + 'static),
    ) -> Result<DrainOutcome> {
        loop {
            match events.recv() {
                Ok(event) => {
                    self.observe(&event);
                    on_event(&event);
                    match &event {
                        ReplicationEvent::Complete => return Ok(DrainOutcome::Done),
                        ReplicationEvent::Denied(msg) => {
                            return Err(Error::Unclassified(msg.clone()));
                        }
                        ReplicationEvent::Error(msg) => {
                            if transport.get_last_post_failed_by_size() {
                                let (batch_size, batches_limit) = {
                                    let backoff = self.backoff.lock();
                                    (backoff.batch_size, backoff.batches_limit)
                                };
                                warn!("{}", Error::SizeRejected { batch_size, batches_limit });
                                self.handle_size_rejection()?;
                                self.set_state(State::Connected);
                                return Ok(DrainOutcome::Retry);
                            }
                            return Err(Error::Unclassified(msg.clone()));
                        }
                        _ => {}
                    }
                }
                Err(_) => return Ok(DrainOutcome::Done),
            }
        }
    }

    fn observe(&self, event: &ReplicationEvent) {
        match event {
            ReplicationEvent::Active => self.set_state(State::Connected),
            ReplicationEvent::Paused => self.set_state(State::Paused),
            ReplicationEvent::Complete => self.set_state(State::Completed),
            ReplicationEvent::Error(msg) => {
                warn!("replication error: {msg}");
                self.set_state(State::Errored);
            }
            ReplicationEvent::Denied(msg) => {
                warn!("replication denied: {msg}");
                self.set_state(State::Errored);
            }
            ReplicationEvent::Change { direction, docs } => {
                match direction {
                    Direction::Pull => {
                        self.doc_arrived.fetch_add(docs.len() as u64, Ordering::Relaxed);
                    }
                    Direction::Push => {
                        self.doc_sent.fetch_add(docs.len() as u64, Ordering::Relaxed);
                    }
                }
                self.backoff.lock().maybe_restore(docs.len() as u32);
            }
        }
    }

    /// Records a transport-level size rejection and shrinks the batch
    /// parameters, or reports [`Error::CannotReplicateLower`] once already
    /// at the floor.
    pub fn handle_size_rejection(&self) -> Result<()> {
        self.backoff.lock().shrink()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// `closeReplication()` — best-effort; the actual handle is owned by
    /// the caller of `start` since it is obtained from `Database::replicate`.
    pub fn close(&self) {
        self.running.store(false, Ordering::Release);
        self.set_state(State::Closed);
    }
}

/// `CollectChunks`: materializes a note's payload from its leaf ids,
/// falling back to the remote database for any ids missing locally, and
/// persisting what it fetches so a later read does not repeat the trip.
/// Retries against the remote rotate their starting offset so a run of
/// unresolvable ids near the front of the list does not starve ids further
/// back across repeated calls; the assembled output always follows the
/// caller's original id order regardless of fetch order.
pub struct ChunkCollector {
    rotation: AtomicUsize,
}

impl ChunkCollector {
    pub fn new() -> Self {
        Self { rotation: AtomicUsize::new(0) }
    }

    pub async fn collect(
        &self,
        local: &Arc<dyn Database>,
        remote: Option<&Arc<dyn Database>>,
        ids: &[LeafId],
    ) -> Result<Option<String>> {
        if ids.is_empty() {
            return Ok(Some(String::new()));
        }

        let mut hits = fetch_batch(local, ids).await?;
        let mut missing: Vec<LeafId> = ids
            .iter()
            .filter(|id| !hits.contains_key(id.as_str()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            if let Some(remote) = remote {
                let rotated = self.rotate(&missing);
                let remote_hits = fetch_batch(remote, &rotated).await?;
                for (id, data) in &remote_hits {
                    let leaf = Leaf {
                        id: LeafId(id.clone()),
                        kind: LeafTag::Leaf,
                        data: data.clone(),
                    };
                    let _ = local.put(id, json!(leaf), true).await;
                }
                hits.extend(remote_hits);
                missing.retain(|id| !hits.contains_key(id.as_str()));
            }
        }

        if !missing.is_empty() {
            return Ok(None);
        }

        let mut out = String::new();
        for id in ids {
            out.push_str(hits.get(id.as_str()).expect("checked above"));
        }
        Ok(Some(out))
    }

    fn rotate(&self, missing: &[LeafId]) -> Vec<LeafId> {
        let len = missing.len();
        let offset = self.rotation.fetch_add(1, Ordering::Relaxed) % len;
        missing[offset..]
            .iter()
            .chain(missing[..offset].iter())
            .cloned()
            .collect()
    }
}

impl Default for ChunkCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn ceil_half(x: u32) -> u32 {
    (x + 1) / 2
}

async fn fetch_batch(db: &Arc<dyn Database>, ids: &[LeafId]) -> Result<HashMap<String, String>> {
    let keys = ids.iter().map(|id| id.as_str().to_owned()).collect();
    let rows = db
        .all_docs(AllDocsOptions {
            keys: Some(keys),
            include_docs: true,
            ..Default::default()
        })
        .await?;
    let mut out = HashMap::new();
    for row in rows {
        if row.error.is_some() {
            continue;
        }
        if let Some(doc) = row.doc {
            if let Ok(leaf) = serde_json::from_value::<Leaf>(doc) {
                out.insert(row.id, leaf.data);
            }
        }
    }
    Ok(out)
}

/// Spawns [`ReplicationCoordinator::start`] on a dedicated OS thread rather
/// than parking it on the shared cooperative scheduler, since a live
/// replication blocks on channel receives for the duration of the sync.
pub fn spawn_replication(
    coordinator: Arc<ReplicationCoordinator>,
    local: Arc<dyn Database>,
    remote: Arc<dyn Database>,
    nodeid: String,
    keep_alive: bool,
    transport: Arc<dyn TransportSignals>,
    on_event: impl FnMut(&ReplicationEvent) + Send + 'static,
    now: i64,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || {
        coordinator.start(local, remote, &nodeid, keep_alive, &transport, on_event, now)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(batch_size: u32, batches_limit: u32) -> Config {
        Config {
            batch_size,
            batches_limit,
            ..Config::default()
        }
    }

    #[test]
    fn shrink_applies_ceil_half_plus_two_until_floor_then_errors() {
        // small starting values so the fixed point (ceil(x/2)+2 -> 4) is
        // reached, and both land at/under the floor, within a few steps
        let mut b = Backoff::new(&cfg(16, 8));
        b.shrink().unwrap();
        assert_eq!(b.batch_size, 10); // ceil(16/2)+2
        assert_eq!(b.batches_limit, 6); // ceil(8/2)+2
        b.shrink().unwrap();
        assert_eq!(b.batch_size, 7); // ceil(10/2)+2
        assert_eq!(b.batches_limit, 5); // ceil(6/2)+2
        b.shrink().unwrap();
        assert_eq!(b.batch_size, 6); // ceil(7/2)+2
        assert_eq!(b.batches_limit, 5); // ceil(5/2)+2
        assert!(b.shrink().is_err()); // next step lands both <= floor
        assert_eq!(b.batch_size, 5);
        assert_eq!(b.batches_limit, 5);
    }

    #[test]
    fn restore_jumps_back_to_original_on_sustained_throughput() {
        let mut b = Backoff::new(&cfg(100, 25));
        b.shrink().unwrap();
        assert_eq!(b.batch_size, 52);
        b.maybe_restore(150); // below threshold (100*2=200), no restore
        assert_eq!(b.batch_size, 52);
        b.maybe_restore(201); // exceeds threshold, full restore
        assert_eq!(b.batch_size, b.original_batch_size);
        assert_eq!(b.batches_limit, b.original_batches_limit);
    }

    #[test]
    fn rotation_advances_across_calls() {
        let collector = ChunkCollector::new();
        let missing = vec![LeafId("h:a".into()), LeafId("h:b".into()), LeafId("h:c".into())];
        let first = collector.rotate(&missing);
        let second = collector.rotate(&missing);
        assert_ne!(first[0], second[0]);
    }
}
