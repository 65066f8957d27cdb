use std::sync::Arc;
use std::time::Duration;

use crate::Resource;
use crate::clock::MilliClock;
use crate::entry_node::EntryNode;
use crate::error::EntryMismatch;
use crate::node::Node;
use crate::node::StatNode;

/// One logical invocation chain.
///
/// A context names the entry point traffic arrives through, optionally
/// carries the caller's origin, and tracks the stack of live call handles
/// so exits can be checked against creation order. It is owned by the
/// calling code and never shared between threads mid-chain.
#[derive(Debug)]
pub struct Context {
    name: String,
    origin: Option<String>,
    stack: Vec<(u64, Arc<EntryNode>)>,
    next_id: u64,
}

impl Context {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            origin: None,
            stack: Vec::new(),
            next_id: 0,
        }
    }

    /// A context whose calls are attributed to a named caller.
    pub fn with_origin(name: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..Self::new(name)
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    /// Number of live call handles on this chain.
    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Resource of the innermost live handle.
    pub fn current_resource(&self) -> Option<&Resource> {
        self.stack.last().map(|(_, node)| node.resource())
    }

    pub(crate) fn current_node(&self) -> Option<Arc<EntryNode>> {
        self.stack.last().map(|(_, node)| Arc::clone(node))
    }

    pub(crate) fn push(&mut self, node: Arc<EntryNode>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.stack.push((id, node));
        id
    }

    pub(crate) fn pop(&mut self, id: u64) -> Result<(), EntryMismatch> {
        match self.stack.last() {
            Some((top, _)) if *top == id => {
                self.stack.pop();
                Ok(())
            }
            _ => Err(EntryMismatch),
        }
    }
}

/// A live, admitted call.
///
/// Completion is a consuming operation, so a call can never be counted
/// twice. A guard that is dropped without an explicit exit releases its
/// in-flight slot but records no response time; this keeps the gauges
/// honest when request futures are cancelled or a caller panics.
#[derive(Debug)]
pub struct CallGuard {
    id: u64,
    node: Arc<EntryNode>,
    origin_node: Option<Arc<StatNode>>,
    created_ms: u64,
    batch: u32,
    occupied_wait_ms: Option<u64>,
    clock: MilliClock,
    exited: bool,
}

impl CallGuard {
    pub(crate) fn new(
        id: u64,
        node: Arc<EntryNode>,
        origin_node: Option<Arc<StatNode>>,
        created_ms: u64,
        batch: u32,
        occupied_wait_ms: Option<u64>,
        clock: MilliClock,
    ) -> Self {
        Self {
            id,
            node,
            origin_node,
            created_ms,
            batch,
            occupied_wait_ms,
            clock,
            exited: false,
        }
    }

    #[inline]
    pub fn resource(&self) -> &Resource {
        self.node.resource()
    }

    /// Admission timestamp in clock milliseconds.
    #[inline]
    pub fn created_millis(&self) -> u64 {
        self.created_ms
    }

    /// How long this call waited for capacity borrowed from a future
    /// window, if it was admitted that way.
    pub fn occupied_wait(&self) -> Option<Duration> {
        self.occupied_wait_ms.map(Duration::from_millis)
    }

    /// Completes the call successfully, recording its response time.
    ///
    /// Returns the recorded response time. Fails if this handle is not the
    /// innermost live handle of `ctx`; the call then counts neither as a
    /// success nor an exception, though its in-flight slot is still
    /// released when the guard drops.
    pub fn exit(self, ctx: &mut Context) -> Result<Duration, EntryMismatch> {
        self.complete(ctx, false)
    }

    /// Completes the call as failed with a business error. The response
    /// time and completion are recorded along with the exception.
    pub fn exit_with_error(self, ctx: &mut Context) -> Result<Duration, EntryMismatch> {
        self.complete(ctx, true)
    }

    fn complete(mut self, ctx: &mut Context, errored: bool) -> Result<Duration, EntryMismatch> {
        ctx.pop(self.id)?;

        let rt = self.clock.now_millis().saturating_sub(self.created_ms);
        let batch = self.batch as u64;

        self.node.add_rt_and_success(rt, batch);
        if errored {
            self.node.add_exception(batch);
        }
        self.node.dec_concurrency();

        if let Some(origin) = &self.origin_node {
            origin.add_rt_and_success(rt, batch);
            if errored {
                origin.add_exception(batch);
            }
            origin.dec_concurrency();
        }

        self.exited = true;
        Ok(Duration::from_millis(rt))
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.exited {
            self.node.dec_concurrency();
            if let Some(origin) = &self.origin_node {
                origin.dec_concurrency();
            }
        }
    }
}
