use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::RwLock;

use crate::Checked;
use crate::Resource;
use crate::ResourceKind;
use crate::TrafficShaper;
use crate::clock::MilliClock;
use crate::cluster::ClusterNode;
use crate::entry::CallGuard;
use crate::entry::Context;
use crate::entry_node::EntryNode;
use crate::error::BlockError;
use crate::error::ConfigError;
use crate::leap_array::WindowShape;
use crate::node::Node;
use crate::node::StatConfig;
use crate::rule::FlowRule;
use crate::rule::build_controller;

/// A flow rule compiled together with the controller that enforces it.
#[derive(Debug)]
struct Binding {
    rule: Arc<FlowRule>,
    controller: Box<dyn TrafficShaper>,
}

/// The admission engine.
///
/// A gate owns the rule table and the per-resource statistics tree. Every
/// admitted call is tracked from entry to exit, so the sliding-window rates
/// and in-flight gauges the controllers consult are maintained by the gate
/// itself rather than by the caller.
///
/// The gate is fully thread-safe; share it behind an [`Arc`]. Each calling
/// chain supplies its own [`Context`].
#[derive(Debug)]
pub struct Floodgate {
    stat_config: RwLock<StatConfig>,
    rules: ArcSwap<HashMap<String, Vec<Binding>>>,
    clusters: RwLock<HashMap<String, Arc<ClusterNode>>>,
    entries: RwLock<HashMap<String, HashMap<String, Arc<EntryNode>>>>,
    clock: MilliClock,
}

impl Floodgate {
    pub fn new(config: StatConfig) -> Self {
        Self::with_clock(config, MilliClock::new())
    }

    /// A gate driven by the given clock. Controllers and statistics all
    /// read time from it, which is what makes mock-clock tests possible.
    pub fn with_clock(config: StatConfig, clock: MilliClock) -> Self {
        Self {
            stat_config: RwLock::new(config),
            rules: ArcSwap::from_pointee(HashMap::new()),
            clusters: RwLock::new(HashMap::new()),
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// A gate with an initial rule set.
    pub fn with_rules(config: StatConfig, rules: Vec<FlowRule>) -> Result<Self, ConfigError> {
        let gate = Self::new(config);
        gate.load_rules(rules)?;
        Ok(gate)
    }

    /// Replaces the whole rule table.
    ///
    /// Every rule is validated and compiled before anything is published;
    /// one invalid rule leaves the previous table fully in force. Calls
    /// already sleeping on an old controller finish against it.
    pub fn load_rules(&self, rules: Vec<FlowRule>) -> Result<(), ConfigError> {
        let config = *self.stat_config.read();
        let mut table: HashMap<String, Vec<Binding>> = HashMap::new();
        let total = rules.len();
        for rule in rules {
            let controller = build_controller(&rule, &config, self.clock.clone())?;
            table.entry(rule.resource.clone()).or_default().push(Binding {
                rule: Arc::new(rule),
                controller,
            });
        }
        let resources = table.len();
        self.rules.store(Arc::new(table));
        tracing::info!(rules = total, resources, "flow rules replaced");
        Ok(())
    }

    /// Changes the sliding-window layout and discards every statistics
    /// node, since buckets shaped one way cannot be reinterpreted under
    /// another. Counters restart from zero; live call guards keep their
    /// references to the old nodes and drain harmlessly.
    pub fn set_window_shape(&self, shape: WindowShape) {
        // Lock order: clusters, entries, config. Matches the node factories
        // below so a concurrent creation cannot deadlock or resurrect a
        // node with the outgoing shape.
        let mut clusters = self.clusters.write();
        let mut entries = self.entries.write();
        let mut config = self.stat_config.write();
        if config.shape == shape {
            return;
        }
        config.shape = shape;
        clusters.clear();
        entries.clear();
        tracing::info!(
            sample_count = shape.sample_count(),
            interval_ms = shape.interval_ms(),
            "window shape changed, statistics nodes rebuilt"
        );
    }

    /// Admits one call or refuses it, waiting when a shaping rule asks.
    pub fn enter(&self, ctx: &mut Context, resource: &str) -> Result<CallGuard, BlockError> {
        self.admit(ctx, resource, ResourceKind::Common, 1, false, true)
    }

    /// [`enter`](Self::enter) for a batch of `batch` permits at once.
    /// `prioritized` lets a refused call borrow capacity from an upcoming
    /// window instead, when the rule's controller supports that.
    pub fn enter_n(
        &self,
        ctx: &mut Context,
        resource: &str,
        batch: u32,
        prioritized: bool,
    ) -> Result<CallGuard, BlockError> {
        self.admit(ctx, resource, ResourceKind::Common, batch, prioritized, true)
    }

    /// Full-control admission: resource classification, batch size and
    /// priority all explicit.
    pub fn enter_typed(
        &self,
        ctx: &mut Context,
        resource: &str,
        kind: ResourceKind,
        batch: u32,
        prioritized: bool,
    ) -> Result<CallGuard, BlockError> {
        self.admit(ctx, resource, kind, batch, prioritized, true)
    }

    /// Admits one call without ever sleeping.
    ///
    /// Shaping rules are consulted through their non-waiting probe, so a
    /// call a pacer would have queued is refused with a back-off hint
    /// instead.
    pub fn try_enter(&self, ctx: &mut Context, resource: &str) -> Result<CallGuard, BlockError> {
        self.admit(ctx, resource, ResourceKind::Common, 1, false, false)
    }

    /// [`try_enter`](Self::try_enter) for a batch of permits.
    pub fn try_enter_n(
        &self,
        ctx: &mut Context,
        resource: &str,
        batch: u32,
    ) -> Result<CallGuard, BlockError> {
        self.admit(ctx, resource, ResourceKind::Common, batch, false, false)
    }

    /// [`try_enter`](Self::try_enter) with the resource classification and
    /// batch size explicit.
    pub fn try_enter_typed(
        &self,
        ctx: &mut Context,
        resource: &str,
        kind: ResourceKind,
        batch: u32,
    ) -> Result<CallGuard, BlockError> {
        self.admit(ctx, resource, kind, batch, false, false)
    }

    fn admit(
        &self,
        ctx: &mut Context,
        name: &str,
        kind: ResourceKind,
        batch: u32,
        prioritized: bool,
        waiting: bool,
    ) -> Result<CallGuard, BlockError> {
        let resource = Resource::new(name, kind);
        let cluster = self.cluster_for(&resource);
        let node = self.entry_for(ctx.name(), &resource, &cluster);

        if let Some(parent) = ctx.current_node() {
            if !Arc::ptr_eq(&parent, &node) {
                parent.add_child(Arc::clone(&node));
            }
        }
        let origin_node = ctx
            .origin()
            .map(|origin| cluster.get_or_create_origin_node(origin));

        // Response time is measured from here, so time spent queued by a
        // shaping rule is part of the recorded latency.
        let created_ms = self.clock.now_millis();
        let mut occupied_wait = None;

        let table = self.rules.load_full();
        if let Some(bindings) = table.get(resource.name()) {
            'rules: for binding in bindings {
                let verdict = if waiting {
                    binding.controller.check(&*cluster, batch, prioritized)
                } else {
                    binding.controller.check_nowait(&*cluster, batch)
                };
                match verdict {
                    Checked::Pass => {}
                    Checked::Block { retry_after_ms } => {
                        node.add_block(u64::from(batch));
                        if let Some(origin) = &origin_node {
                            origin.add_block(u64::from(batch));
                        }
                        return Err(BlockError::new(Arc::clone(&binding.rule), retry_after_ms));
                    }
                    Checked::Queue { wait_ms } => {
                        if !waiting {
                            // A probe must never be told to wait. When in
                            // doubt, admit.
                            tracing::warn!(
                                resource = resource.name(),
                                wait_ms,
                                "non-waiting probe got a queue verdict, admitting"
                            );
                            continue;
                        }
                        if wait_ms > 0 {
                            thread::sleep(Duration::from_millis(wait_ms));
                        }
                    }
                    Checked::Occupy { wait_ms } => {
                        if !waiting {
                            tracing::warn!(
                                resource = resource.name(),
                                wait_ms,
                                "non-waiting probe got an occupy verdict, admitting"
                            );
                            continue;
                        }
                        if wait_ms > 0 {
                            thread::sleep(Duration::from_millis(wait_ms));
                        }
                        // The controller already booked this call's passes
                        // in the window it waited for; counting them again
                        // here would double them. Remaining rules are
                        // skipped, the borrowed slot is considered earned.
                        occupied_wait = Some(wait_ms);
                        break 'rules;
                    }
                }
            }
        }

        node.inc_concurrency();
        if let Some(origin) = &origin_node {
            origin.inc_concurrency();
        }
        if occupied_wait.is_none() {
            node.add_pass(u64::from(batch));
            if let Some(origin) = &origin_node {
                origin.add_pass(u64::from(batch));
            }
        }

        let id = ctx.push(Arc::clone(&node));
        Ok(CallGuard::new(
            id,
            node,
            origin_node,
            created_ms,
            batch,
            occupied_wait,
            self.clock.clone(),
        ))
    }

    /// Resource-global statistics, if the resource has been seen.
    pub fn cluster_node(&self, resource: &str) -> Option<Arc<ClusterNode>> {
        self.clusters.read().get(resource).cloned()
    }

    /// Per-entry-point statistics, if that context has touched the
    /// resource.
    pub fn entry_node(&self, context: &str, resource: &str) -> Option<Arc<EntryNode>> {
        self.entries
            .read()
            .get(context)
            .and_then(|nodes| nodes.get(resource))
            .cloned()
    }

    /// Names of every resource with live statistics.
    pub fn resource_names(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Snapshot of the active rules.
    pub fn rules(&self) -> Vec<Arc<FlowRule>> {
        self.rules
            .load()
            .values()
            .flatten()
            .map(|binding| Arc::clone(&binding.rule))
            .collect()
    }

    pub fn stat_config(&self) -> StatConfig {
        *self.stat_config.read()
    }

    fn cluster_for(&self, resource: &Resource) -> Arc<ClusterNode> {
        if let Some(cluster) = self.clusters.read().get(resource.name()) {
            return Arc::clone(cluster);
        }

        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get(resource.name()) {
            return Arc::clone(cluster);
        }
        let config = *self.stat_config.read();
        let cluster = Arc::new(ClusterNode::new(
            resource.clone(),
            &config,
            self.clock.clone(),
        ));
        clusters.insert(resource.name().to_owned(), Arc::clone(&cluster));
        tracing::debug!(resource = resource.name(), "created cluster node");
        cluster
    }

    fn entry_for(
        &self,
        context: &str,
        resource: &Resource,
        cluster: &Arc<ClusterNode>,
    ) -> Arc<EntryNode> {
        if let Some(node) = self
            .entries
            .read()
            .get(context)
            .and_then(|nodes| nodes.get(resource.name()))
        {
            return Arc::clone(node);
        }

        let mut entries = self.entries.write();
        let nodes = entries.entry(context.to_owned()).or_default();
        if let Some(node) = nodes.get(resource.name()) {
            return Arc::clone(node);
        }
        let config = *self.stat_config.read();
        let node = Arc::new(EntryNode::new(
            resource.clone(),
            Arc::clone(cluster),
            &config,
            self.clock.clone(),
        ));
        nodes.insert(resource.name().to_owned(), Arc::clone(&node));
        tracing::debug!(
            context,
            resource = resource.name(),
            "created entry node"
        );
        node
    }
}

impl Default for Floodgate {
    fn default() -> Self {
        Self::new(StatConfig::default())
    }
}
