use std::sync::Arc;
use std::time::Duration;

use tower::Layer;

use floodgate::Floodgate;
use floodgate::ResourceKind;

use crate::service::DEFAULT_ENTRY_POINT;
use crate::service::GateService;

/// Applies floodgate admission control to requests.
///
/// Every service built by one layer guards the same named resource
/// through the same shared gate, so clones of the stack draw down one
/// threshold together.
#[derive(Clone, Debug)]
pub struct GateLayer {
    gate: Arc<Floodgate>,
    resource: Arc<str>,
    entry_point: Arc<str>,
    kind: ResourceKind,
    fail_fast: bool,
    timeout: Option<Duration>,
}

impl GateLayer {
    /// Create a GateLayer guarding `resource` through `gate`.
    pub fn new(gate: Arc<Floodgate>, resource: impl Into<Arc<str>>) -> Self {
        GateLayer {
            gate,
            resource: resource.into(),
            entry_point: Arc::from(DEFAULT_ENTRY_POINT),
            kind: ResourceKind::Web,
            fail_fast: false,
            timeout: None,
        }
    }

    /// Name this layer's traffic enters the gate's node tree under.
    pub fn with_entry_point(mut self, entry_point: impl Into<Arc<str>>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Resource classification recorded alongside the statistics.
    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set whether built services should fail immediately when blocked.
    ///
    /// If `true`, a refused request returns `GateError::Blocked` at once
    /// instead of waiting out the controller's back-off hint.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified deadline for both waiting for admission and request
    /// execution.
    ///
    /// If the total time exceeds this duration, the request fails with
    /// `GateError::Timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S> Layer<S> for GateLayer {
    type Service = GateService<S>;

    fn layer(&self, service: S) -> Self::Service {
        let mut svc =
            GateService::new(service, Arc::clone(&self.gate), Arc::clone(&self.resource))
                .with_entry_point(Arc::clone(&self.entry_point))
                .with_kind(self.kind)
                .with_fail_fast(self.fail_fast);
        if let Some(timeout) = self.timeout {
            svc = svc.with_timeout(timeout);
        }
        svc
    }
}
