//! Per-key single-flight scheduling of engine work.
//!
//! Every unit of work for a key goes through the [`Dispatcher`]. One attempt
//! per key runs at a time; newer work for a busy key flags the running attempt
//! as superseded and waits behind it, and older or duplicate work is dropped.
//! A shared semaphore bounds the number of attempts running on the node.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, trace};

use crate::data::IntentData;
use crate::engine::{EngineCore, processor};
use crate::key::Key;
use crate::version::Version;

/// Per-key bookkeeping of the attempt in flight and the work queued behind it.
struct KeySlot {
    version: Version,
    superseded: Arc<AtomicBool>,
    next: Option<IntentData>,
}

/// Runs at most one attempt per key, bounded by a shared worker semaphore.
///
/// Work arriving for a key with an attempt in flight raises that attempt's
/// superseded flag and waits as the key's single successor; anything not newer
/// than what is already running or queued is dropped.
pub(crate) struct Dispatcher {
    core: Arc<EngineCore>,
    slots: Mutex<HashMap<Key, KeySlot>>,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub(crate) fn new(core: Arc<EngineCore>, workers: usize) -> Arc<Self> {
        Arc::new(Self {
            core,
            slots: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(workers.max(1))),
        })
    }

    /// Schedules `data`. Must be called from within a tokio runtime.
    pub(crate) fn dispatch(self: &Arc<Self>, data: IntentData) {
        let superseded = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots.get_mut(data.key()) {
                if !data.version().is_newer_than(slot.version) {
                    trace!(key = %data.key(), version = %data.version(), "attempt already in flight");
                    return;
                }
                if let Some(next) = &slot.next
                    && !data.version().is_newer_than(next.version())
                {
                    trace!(key = %data.key(), version = %data.version(), "newer work already queued");
                    return;
                }
                debug!(
                    key = %data.key(),
                    running = %slot.version,
                    queued = %data.version(),
                    "superseding in-flight attempt"
                );
                slot.superseded.store(true, Ordering::Release);
                slot.next = Some(data);
                return;
            }

            let superseded = Arc::new(AtomicBool::new(false));
            slots.insert(
                data.key().clone(),
                KeySlot {
                    version: data.version(),
                    superseded: Arc::clone(&superseded),
                    next: None,
                },
            );
            superseded
        };

        let dispatcher = Arc::clone(self);
        tokio::spawn(dispatcher.run(data, superseded));
    }

    /// Stops handing out permits; queued attempts are dropped.
    pub(crate) fn close(&self) {
        self.permits.close();
    }

    /// Keys with an attempt in flight.
    pub(crate) fn in_flight(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether an attempt for `key` is running or waiting for a worker.
    pub(crate) fn is_in_flight(&self, key: &Key) -> bool {
        self.slots.lock().contains_key(key)
    }

    async fn run(self: Arc<Self>, mut data: IntentData, mut superseded: Arc<AtomicBool>) {
        loop {
            let Ok(permit) = Arc::clone(&self.permits).acquire_owned().await else {
                debug!(key = %data.key(), "dispatcher closed; dropping attempt");
                self.slots.lock().remove(data.key());
                return;
            };
            processor::process(&self.core, data.clone(), &superseded).await;
            drop(permit);

            match self.advance(data.key()) {
                Some((next, flag)) => {
                    data = next;
                    superseded = flag;
                }
                None => return,
            }
        }
    }

    /// Promotes the queued successor of `key`, or releases the key.
    fn advance(&self, key: &Key) -> Option<(IntentData, Arc<AtomicBool>)> {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(key)?;
        match slot.next.take() {
            Some(next) => {
                let flag = Arc::new(AtomicBool::new(false));
                slot.version = next.version();
                slot.superseded = Arc::clone(&flag);
                Some((next, flag))
            }
            None => {
                slots.remove(key);
                None
            }
        }
    }
}
