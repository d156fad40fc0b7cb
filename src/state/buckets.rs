//! Time-bucketed probe results.
//!
//! Every probe is filed under the second it was sent in. The reporter evicts
//! buckets oldest-first once their grace period has elapsed, so the store is
//! a min-heap of bucket keys paired with a hash index from key to bucket.
//!
//! Locking is two-level:
//! - one coarse lock over the heap + index pair, held only to create or
//!   remove a bucket (the two structures are always mutated together)
//! - one lock per bucket for record inserts and merges, so writers for
//!   different seconds never contend

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;

use super::result::{BucketKey, ProbeKey, ProbeResult, latency_between};

/// All probe records sent within one second
#[derive(Debug)]
pub struct Bucket {
    key: BucketKey,
    results: Mutex<HashMap<ProbeKey, ProbeResult>>,
}

impl Bucket {
    fn new(key: BucketKey) -> Self {
        Self {
            key,
            results: Mutex::new(HashMap::new()),
        }
    }

    pub fn key(&self) -> BucketKey {
        self.key
    }

    /// Insert or overwrite the record for this probe
    fn add(&self, result: ProbeResult) {
        self.results.lock().insert(result.key(), result);
    }

    /// Merge a reply into the matching send record
    ///
    /// With a send record present the latency is recomputed against its send
    /// time (which may be a kernel TX stamp). Without one the reply is kept
    /// as-is.
    fn add_reply(&self, mut reply: ProbeResult) {
        let mut results = self.results.lock();
        if let Some(sent) = results.get(&reply.key())
            && let Some(rx_ns) = reply.rx_ns
        {
            reply.tx_ns = sent.tx_ns;
            reply.latency = latency_between(sent.tx_ns, rx_ns);
        }
        results.insert(reply.key(), reply);
    }

    fn refine_send(&self, probe: &ProbeKey, tx_ns: i64) -> bool {
        let mut results = self.results.lock();
        match results.get_mut(probe) {
            Some(result) => {
                result.tx_ns = tx_ns;
                if let Some(rx_ns) = result.rx_ns {
                    result.latency = latency_between(tx_ns, rx_ns);
                }
                true
            }
            None => false,
        }
    }

    fn remove(&self, probe: &ProbeKey) -> Option<ProbeResult> {
        self.results.lock().remove(probe)
    }

    pub fn get(&self, probe: &ProbeKey) -> Option<ProbeResult> {
        self.results.lock().get(probe).cloned()
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.lock().is_empty()
    }

    /// Drain every record, leaving the bucket empty
    pub fn take_results(&self) -> Vec<ProbeResult> {
        self.results.lock().drain().map(|(_, result)| result).collect()
    }
}

/// Min-heap of bucket keys plus the key → bucket index
#[derive(Debug, Default)]
struct BucketQueue {
    heap: BinaryHeap<Reverse<BucketKey>>,
    index: HashMap<BucketKey, Arc<Bucket>>,
}

impl BucketQueue {
    fn get_or_create(&mut self, key: BucketKey) -> Arc<Bucket> {
        if let Some(bucket) = self.index.get(&key) {
            return bucket.clone();
        }
        let bucket = Arc::new(Bucket::new(key));
        self.index.insert(key, bucket.clone());
        self.heap.push(Reverse(key));
        bucket
    }

    fn pop(&mut self) -> Option<Arc<Bucket>> {
        let Reverse(key) = self.heap.pop()?;
        self.index.remove(&key)
    }
}

/// Thread-safe store shared by the sender, receiver, and reporter
#[derive(Debug, Default)]
pub struct BucketAggregator {
    queue: Mutex<BucketQueue>,
}

impl BucketAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for `key`, created if absent. Coarse lock is released on return.
    fn bucket(&self, key: BucketKey) -> Arc<Bucket> {
        self.queue.lock().get_or_create(key)
    }

    fn existing(&self, key: BucketKey) -> Option<Arc<Bucket>> {
        self.queue.lock().index.get(&key).cloned()
    }

    /// Record a send event (overwrites any record for the same probe)
    pub fn add(&self, key: BucketKey, result: ProbeResult) {
        self.bucket(key).add(result);
    }

    /// Record a reply, merging with the matching send record if present
    pub fn add_reply(&self, key: BucketKey, result: ProbeResult) {
        self.bucket(key).add_reply(result);
    }

    /// Replace the logical send time of a recorded probe with a kernel TX stamp
    ///
    /// Returns false if the bucket or record no longer exists.
    pub fn refine_send(&self, key: BucketKey, probe: &ProbeKey, tx_ns: i64) -> bool {
        self.existing(key)
            .is_some_and(|bucket| bucket.refine_send(probe, tx_ns))
    }

    /// Drop a probe's record (used when the send itself failed)
    pub fn remove(&self, key: BucketKey, probe: &ProbeKey) -> Option<ProbeResult> {
        self.existing(key)?.remove(probe)
    }

    /// Key of the oldest bucket, without removing it
    pub fn last(&self) -> Option<BucketKey> {
        self.queue.lock().heap.peek().map(|Reverse(key)| *key)
    }

    /// Remove and return the oldest bucket
    pub fn pop(&self) -> Option<Arc<Bucket>> {
        self.queue.lock().pop()
    }

    /// Remove the oldest bucket only if its key is still `key`
    ///
    /// Peek-then-pop across two calls can race with a writer creating an
    /// older bucket; this check and the pop happen under one lock.
    pub fn pop_if_oldest(&self, key: BucketKey) -> Option<Arc<Bucket>> {
        let mut queue = self.queue.lock();
        match queue.heap.peek() {
            Some(Reverse(oldest)) if *oldest == key => queue.pop(),
            _ => None,
        }
    }

    /// Snapshot of a bucket's record for one probe
    pub fn get(&self, key: BucketKey, probe: &ProbeKey) -> Option<ProbeResult> {
        self.existing(key)?.get(probe)
    }

    /// Number of live buckets
    pub fn len(&self) -> usize {
        let queue = self.queue.lock();
        debug_assert_eq!(queue.heap.len(), queue.index.len());
        queue.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
