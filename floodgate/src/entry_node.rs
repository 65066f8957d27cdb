use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use crate::Resource;
use crate::clock::MilliClock;
use crate::cluster::ClusterNode;
use crate::node::Node;
use crate::node::StatConfig;
use crate::node::StatNode;

/// Per-entry-point statistics for one resource.
///
/// Each (context, resource) pair gets its own entry node, so the same
/// resource reached from different entry points stays distinguishable.
/// Every write is forwarded to the shared [`ClusterNode`], which keeps the
/// resource-wide aggregate consistent by construction; reads stay local.
#[derive(Debug)]
pub struct EntryNode {
    resource: Resource,
    stats: StatNode,
    cluster: Arc<ClusterNode>,
    /// Call-tree edges observed at runtime. Copy-on-write, identity-keyed:
    /// the same child is recorded once.
    children: ArcSwap<Vec<Arc<EntryNode>>>,
    child_write: Mutex<()>,
}

impl EntryNode {
    pub fn new(
        resource: Resource,
        cluster: Arc<ClusterNode>,
        config: &StatConfig,
        clock: MilliClock,
    ) -> Self {
        Self {
            resource,
            stats: StatNode::new(config, clock),
            cluster,
            children: ArcSwap::from_pointee(Vec::new()),
            child_write: Mutex::new(()),
        }
    }

    #[inline]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    #[inline]
    pub fn cluster(&self) -> &Arc<ClusterNode> {
        &self.cluster
    }

    /// Records `child` as invoked beneath this node.
    pub fn add_child(&self, child: Arc<EntryNode>) {
        if self
            .children
            .load()
            .iter()
            .any(|c| Arc::ptr_eq(c, &child))
        {
            return;
        }

        let _guard = self.child_write.lock();
        let current = self.children.load_full();
        if current.iter().any(|c| Arc::ptr_eq(c, &child)) {
            return;
        }
        let mut next = Vec::clone(&current);
        next.push(child);
        self.children.store(Arc::new(next));
    }

    /// Snapshot of the recorded children.
    pub fn children(&self) -> Arc<Vec<Arc<EntryNode>>> {
        self.children.load_full()
    }
}

impl Node for EntryNode {
    fn inc_concurrency(&self) {
        self.stats.inc_concurrency();
        self.cluster.inc_concurrency();
    }

    fn dec_concurrency(&self) {
        self.stats.dec_concurrency();
        self.cluster.dec_concurrency();
    }

    fn add_pass(&self, n: u64) {
        self.stats.add_pass(n);
        self.cluster.add_pass(n);
    }

    fn add_block(&self, n: u64) {
        self.stats.add_block(n);
        self.cluster.add_block(n);
    }

    fn add_exception(&self, n: u64) {
        self.stats.add_exception(n);
        self.cluster.add_exception(n);
    }

    fn add_rt_and_success(&self, rt_ms: u64, n: u64) {
        self.stats.add_rt_and_success(rt_ms, n);
        self.cluster.add_rt_and_success(rt_ms, n);
    }

    fn add_occupied_pass(&self, n: u64) {
        self.stats.add_occupied_pass(n);
        self.cluster.add_occupied_pass(n);
    }

    fn add_waiting_request(&self, future_time_ms: u64, n: u64) {
        self.stats.add_waiting_request(future_time_ms, n);
        self.cluster.add_waiting_request(future_time_ms, n);
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
