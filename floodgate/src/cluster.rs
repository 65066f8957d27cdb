use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::Resource;
use crate::clock::MilliClock;
use crate::node::Node;
use crate::node::StatConfig;
use crate::node::StatNode;

/// Resource-wide statistics, shared by every entry point that reaches the
/// same resource.
///
/// Besides its own counters, a cluster node keys per-caller statistics by
/// origin. The origin map is copy-on-write: readers grab the current
/// snapshot lock-free, and the rare insert clones the map under a mutex
/// before swapping the new version in.
#[derive(Debug)]
pub struct ClusterNode {
    resource: Resource,
    stats: StatNode,
    origins: ArcSwap<HashMap<String, Arc<StatNode>>>,
    origin_write: Mutex<()>,
    stat_config: StatConfig,
    clock: MilliClock,
}

impl ClusterNode {
    pub fn new(resource: Resource, config: &StatConfig, clock: MilliClock) -> Self {
        Self {
            resource,
            stats: StatNode::new(config, clock.clone()),
            origins: ArcSwap::from_pointee(HashMap::new()),
            origin_write: Mutex::new(()),
            stat_config: *config,
            clock,
        }
    }

    #[inline]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    /// Statistics for one named caller, created on first sight.
    pub fn get_or_create_origin_node(&self, origin: &str) -> Arc<StatNode> {
        if let Some(node) = self.origins.load().get(origin) {
            return Arc::clone(node);
        }

        let _guard = self.origin_write.lock();
        // Re-check: another writer may have published this origin while we
        // waited for the lock.
        let current = self.origins.load_full();
        if let Some(node) = current.get(origin) {
            return Arc::clone(node);
        }

        let node = Arc::new(StatNode::new(&self.stat_config, self.clock.clone()));
        let mut next = HashMap::clone(&current);
        next.insert(origin.to_owned(), Arc::clone(&node));
        self.origins.store(Arc::new(next));
        tracing::debug!(
            resource = self.resource.name(),
            origin,
            "created origin statistics"
        );
        node
    }

    /// Statistics for `origin` if that caller has been seen.
    pub fn origin_node(&self, origin: &str) -> Option<Arc<StatNode>> {
        self.origins.load().get(origin).map(Arc::clone)
    }

    /// Snapshot of every known caller name.
    pub fn origin_names(&self) -> Vec<String> {
        self.origins.load().keys().cloned().collect()
    }
}

impl Node for ClusterNode {
    fn inc_concurrency(&self) {
        self.stats.inc_concurrency();
    }

    fn dec_concurrency(&self) {
        self.stats.dec_concurrency();
    }

    fn add_pass(&self, n: u64) {
        self.stats.add_pass(n);
    }

    fn add_block(&self, n: u64) {
        self.stats.add_block(n);
    }

    fn add_exception(&self, n: u64) {
        self.stats.add_exception(n);
    }

    fn add_rt_and_success(&self, rt_ms: u64, n: u64) {
        self.stats.add_rt_and_success(rt_ms, n);
    }

    fn add_occupied_pass(&self, n: u64) {
        self.stats.add_occupied_pass(n);
    }

    fn add_waiting_request(&self, future_time_ms: u64, n: u64) {
        self.stats.add_waiting_request(future_time_ms, n);
    }

    fn cur_concurrency(&self) -> u32 {
        self.stats.cur_concurrency()
    }

    fn pass_qps(&self) -> f64 {
        self.stats.pass_qps()
    }

    fn block_qps(&self) -> f64 {
        self.stats.block_qps()
    }

    fn exception_qps(&self) -> f64 {
        self.stats.exception_qps()
    }

    fn success_qps(&self) -> f64 {
        self.stats.success_qps()
    }

    fn occupied_pass_qps(&self) -> f64 {
        self.stats.occupied_pass_qps()
    }

    fn previous_pass_qps(&self) -> f64 {
        self.stats.previous_pass_qps()
    }

    fn avg_rt(&self) -> f64 {
        self.stats.avg_rt()
    }

    fn min_rt(&self) -> f64 {
        self.stats.min_rt()
    }

    fn waiting(&self) -> u64 {
        self.stats.waiting()
    }

    fn try_occupy_next(&self, now_ms: u64, acquire: u32, threshold: f64) -> u64 {
        self.stats.try_occupy_next(now_ms, acquire, threshold)
    }

    fn total_pass(&self) -> u64 {
        self.stats.total_pass()
    }

    fn total_block(&self) -> u64 {
        self.stats.total_block()
    }

    fn total_exception(&self) -> u64 {
        self.stats.total_exception()
    }

    fn total_success(&self) -> u64 {
        self.stats.total_success()
    }
}
