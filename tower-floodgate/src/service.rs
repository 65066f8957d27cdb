use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::Counter;
use pin_project_lite::pin_project;
use tokio::time::Sleep;
use tokio::time::sleep;
use tower::BoxError;
use tower::Service;

use floodgate::CallGuard;
use floodgate::Context as FlowContext;
use floodgate::Floodgate;
use floodgate::ResourceKind;

use crate::error::GateError;

/// Entry-point name used for the gate's statistics when none is
/// configured.
pub const DEFAULT_ENTRY_POINT: &str = "tower";

/// Poll cadence while waiting out a refusal that carried no hint.
const DEFAULT_RETRY: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
struct GateServiceMetrics {
    admitted: Counter<u64>,
    blocked: Counter<u64>,
    timed_out: Counter<u64>,
}

fn resource_label(resource: &Arc<str>) -> KeyValue {
    KeyValue::new("resource", resource.to_string())
}

/// Guards an inner service behind a shared [`Floodgate`].
///
/// Each request is admitted as one call on the configured resource before
/// the inner service runs, and its completion and latency are reported
/// back when the response resolves. Admission uses the gate's non-waiting
/// probe, so the executor is never blocked: a refused request either
/// fails immediately (`fail_fast`) or naps for the refusal's back-off
/// hint and probes again.
#[derive(Clone, Debug)]
pub struct GateService<S> {
    inner: S,
    gate: Arc<Floodgate>,
    resource: Arc<str>,
    entry_point: Arc<str>,
    kind: ResourceKind,
    fail_fast: bool,
    timeout: Option<Duration>,
    instruments: GateServiceMetrics,
}

impl<S> GateService<S> {
    pub fn new(inner: S, gate: Arc<Floodgate>, resource: impl Into<Arc<str>>) -> Self {
        let meter = global::meter("floodgate_service");
        let instruments = GateServiceMetrics {
            admitted: meter.u64_counter("admitted").build(),
            blocked: meter.u64_counter("blocked").build(),
            timed_out: meter.u64_counter("timed_out").build(),
        };

        Self {
            inner,
            gate,
            resource: resource.into(),
            entry_point: Arc::from(DEFAULT_ENTRY_POINT),
            kind: ResourceKind::Web,
            fail_fast: false,
            timeout: None,
            instruments,
        }
    }

    /// Name this service's traffic enters the gate's node tree under.
    pub fn with_entry_point(mut self, entry_point: impl Into<Arc<str>>) -> Self {
        self.entry_point = entry_point.into();
        self
    }

    /// Resource classification recorded alongside the statistics.
    pub fn with_kind(mut self, kind: ResourceKind) -> Self {
        self.kind = kind;
        self
    }

    /// Set whether the service should fail immediately when blocked.
    ///
    /// If `true`, a refused request returns [`GateError::Blocked`] at once
    /// instead of waiting out the controller's back-off hint.
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Set a unified deadline for both waiting for admission and request
    /// execution.
    ///
    /// If the total time exceeds this duration, the request fails with
    /// [`GateError::Timeout`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl<S, Req> Service<Req> for GateService<S>
where
    S: Service<Req, Error = BoxError> + Clone,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = ResponseFuture<S, Req>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Admission is per request and never parks the task, so readiness
        // is the inner service's alone.
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        // Take the service that just reported ready and leave a fresh
        // clone in its place.
        let clone = self.inner.clone();
        let service = std::mem::replace(&mut self.inner, clone);

        ResponseFuture {
            service,
            req: Some(req),
            gate: Arc::clone(&self.gate),
            ctx: FlowContext::new(self.entry_point.as_ref()),
            resource: Arc::clone(&self.resource),
            kind: self.kind,
            fail_fast: self.fail_fast,
            guard: None,
            instruments: self.instruments.clone(),
            deadline: self.timeout.map(sleep),
            retry: None,
            state: State::Admitting,
        }
    }
}

pin_project! {
    /// Drives admission and then the inner call, under one deadline.
    ///
    /// Dropping this future abandons the request; an already-admitted
    /// call releases its in-flight slot without recording a completion.
    pub struct ResponseFuture<S, Req>
    where
        S: Service<Req>,
    {
        service: S,
        req: Option<Req>,
        gate: Arc<Floodgate>,
        ctx: FlowContext,
        resource: Arc<str>,
        kind: ResourceKind,
        fail_fast: bool,
        guard: Option<CallGuard>,
        instruments: GateServiceMetrics,
        #[pin]
        deadline: Option<Sleep>,
        #[pin]
        retry: Option<Sleep>,
        #[pin]
        state: State<S::Future>,
    }
}

pin_project! {
    #[project = StateProj]
    enum State<F> {
        Admitting,
        Calling {
            #[pin]
            future: F,
        },
    }
}

impl<S, Req> Future for ResponseFuture<S, Req>
where
    S: Service<Req, Error = BoxError>,
{
    type Output = Result<S::Response, BoxError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            match this.state.as_mut().project() {
                StateProj::Admitting => {
                    if let Some(deadline) = this.deadline.as_mut().as_pin_mut()
                        && deadline.poll(cx).is_ready()
                    {
                        this.instruments
                            .timed_out
                            .add(1, &[resource_label(this.resource)]);
                        return Poll::Ready(Err(Box::new(GateError::Timeout)));
                    }

                    if let Some(retry) = this.retry.as_mut().as_pin_mut() {
                        match retry.poll(cx) {
                            Poll::Ready(()) => this.retry.set(None),
                            Poll::Pending => return Poll::Pending,
                        }
                    }

                    match this
                        .gate
                        .try_enter_typed(this.ctx, this.resource, *this.kind, 1)
                    {
                        Ok(guard) => {
                            this.instruments
                                .admitted
                                .add(1, &[resource_label(this.resource)]);
                            *this.guard = Some(guard);
                            let req = this.req.take().expect("polled after completion");
                            let future = this.service.call(req);
                            this.state.set(State::Calling { future });
                        }
                        Err(blocked) => {
                            this.instruments
                                .blocked
                                .add(1, &[resource_label(this.resource)]);
                            if *this.fail_fast {
                                return Poll::Ready(Err(Box::new(GateError::Blocked {
                                    retry_after: blocked.retry_after(),
                                })));
                            }
                            // Nap for the hint, then probe again. A hard
                            // refusal has no hint and a hint can be zero;
                            // both still nap so the task cannot spin.
                            let nap = blocked
                                .retry_after()
                                .unwrap_or(DEFAULT_RETRY)
                                .max(Duration::from_millis(1));
                            this.retry.set(Some(sleep(nap)));
                        }
                    }
                }
                StateProj::Calling { future } => {
                    match future.poll(cx) {
                        Poll::Ready(Ok(response)) => {
                            // One guard per context, so this exit cannot
                            // mismatch.
                            if let Some(guard) = this.guard.take() {
                                let _ = guard.exit(this.ctx);
                            }
                            return Poll::Ready(Ok(response));
                        }
                        Poll::Ready(Err(error)) => {
                            if let Some(guard) = this.guard.take() {
                                let _ = guard.exit_with_error(this.ctx);
                            }
                            return Poll::Ready(Err(error));
                        }
                        Poll::Pending => {
                            if let Some(deadline) = this.deadline.as_mut().as_pin_mut()
                                && deadline.poll(cx).is_ready()
                            {
                                // The guard goes down with this future and
                                // releases the in-flight slot without
                                // recording a completion.
                                this.instruments
                                    .timed_out
                                    .add(1, &[resource_label(this.resource)]);
                                return Poll::Ready(Err(Box::new(GateError::Timeout)));
                            }
                            return Poll::Pending;
                        }
                    }
                }
            }
        }
    }
}
