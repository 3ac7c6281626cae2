use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use nacre_common::{LogicAddr, ParamId};
use nacre_storage::BlockStore;
use rustc_hash::FxHashMap;
use tracing::{debug, error, info};

use crate::catalog::MetadataCatalog;
use crate::error::DbError;

/// How long the worker sleeps between forced sync passes.
const SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct Pending {
    rescue: FxHashMap<ParamId, Vec<LogicAddr>>,
    names: Vec<(ParamId, String)>,
    barriers: Vec<SyncSender<()>>,
    shutdown: bool,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.rescue.is_empty() && self.names.is_empty() && self.barriers.is_empty()
    }
}

#[derive(Debug, Default)]
struct Shared {
    pending: Mutex<Pending>,
    wakeup: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Pending> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Background worker that periodically flushes the block store and
/// persists pending rescue points and series names to the catalog.
///
/// Sessions blocked on a WAL rotation register a barrier and wait for
/// the pass that drains it; afterwards nothing referenced by the
/// discarded log volume is unpersisted.
#[derive(Debug)]
pub struct MetadataSync {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl MetadataSync {
    pub fn spawn(
        bstore: Arc<dyn BlockStore>,
        catalog: Arc<dyn MetadataCatalog>,
    ) -> MetadataSync {
        let shared = Arc::new(Shared::default());
        let running = Arc::new(AtomicBool::new(true));
        let worker_shared = Arc::clone(&shared);
        let worker_running = Arc::clone(&running);
        let worker = std::thread::Builder::new()
            .name("nacre-meta-sync".into())
            .spawn(move || run_worker(worker_shared, worker_running, bstore, catalog))
            .ok();
        if worker.is_none() {
            error!("failed to spawn the metadata sync worker");
            running.store(false, Ordering::SeqCst);
        }
        MetadataSync {
            shared,
            worker: Mutex::new(worker),
            running,
        }
    }

    pub fn add_rescue_points(&self, id: ParamId, points: Vec<LogicAddr>) {
        let mut pending = self.shared.lock();
        pending.rescue.insert(id, points);
        self.shared.wakeup.notify_one();
    }

    pub fn add_rescue_batch(&self, items: FxHashMap<ParamId, Vec<LogicAddr>>) {
        let mut pending = self.shared.lock();
        pending.rescue.extend(items);
        self.shared.wakeup.notify_one();
    }

    pub fn add_series_name(&self, id: ParamId, name: String) {
        let mut pending = self.shared.lock();
        pending.names.push((id, name));
        self.shared.wakeup.notify_one();
    }

    /// Register a barrier released after the next completed sync pass.
    pub fn add_barrier(&self) -> Receiver<()> {
        let (tx, rx) = sync_channel(1);
        let mut pending = self.shared.lock();
        pending.barriers.push(tx);
        self.shared.wakeup.notify_one();
        rx
    }

    /// Drain outstanding work and stop the worker. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut pending = self.shared.lock();
            pending.shutdown = true;
            self.shared.wakeup.notify_one();
        }
        let handle = {
            let mut worker = match self.worker.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            worker.take()
        };
        if let Some(worker) = handle {
            let _ = worker.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }
}

fn run_worker(
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    bstore: Arc<dyn BlockStore>,
    catalog: Arc<dyn MetadataCatalog>,
) {
    info!("metadata sync worker started");
    loop {
        let (batch, stop) = {
            let mut pending = shared.lock();
            if pending.is_empty() && !pending.shutdown {
                let (guard, _timeout) = match shared.wakeup.wait_timeout(pending, SYNC_INTERVAL) {
                    Ok(res) => res,
                    Err(poisoned) => {
                        let (guard, timeout) = poisoned.into_inner();
                        (guard, timeout)
                    }
                };
                pending = guard;
            }
            let stop = pending.shutdown && pending.is_empty();
            (std::mem::take(&mut *pending), stop)
        };
        if stop {
            break;
        }
        if let Err(err) = sync_pass(&bstore, &catalog, &batch) {
            // Keep the pass' rescue points queued for the next round
            // rather than losing them.
            error!(%err, "metadata sync pass failed, retrying later");
            let mut pending = shared.lock();
            for (id, points) in batch.rescue {
                pending.rescue.entry(id).or_insert(points);
            }
            for item in batch.names {
                pending.names.push(item);
            }
            std::thread::sleep(Duration::from_millis(100));
            continue;
        }
        for barrier in batch.barriers {
            let _ = barrier.send(());
        }
    }
    running.store(false, Ordering::SeqCst);
    info!("metadata sync worker stopped");
}

fn sync_pass(
    bstore: &Arc<dyn BlockStore>,
    catalog: &Arc<dyn MetadataCatalog>,
    batch: &Pending,
) -> Result<(), DbError> {
    // Order matters: blocks referenced by the rescue points must be
    // durable before the catalog names them.
    bstore.flush()?;
    if !batch.names.is_empty() {
        catalog.add_series(&batch.names)?;
    }
    if !batch.rescue.is_empty() {
        let items: Vec<(ParamId, Vec<LogicAddr>)> = batch
            .rescue
            .iter()
            .map(|(id, points)| (*id, points.clone()))
            .collect();
        catalog.update_rescue_points(&items)?;
        debug!(series = items.len(), "rescue points persisted");
    }
    Ok(())
}
