//! A contention-free reference model.
//!
//! Executions last `flops / min(speed, bound)` on the slowest host.
//! Transfers last the route's summed latency (plus seeded jitter) and
//! `bytes / min(bottleneck bandwidth, rate)`. Host and link failures are
//! scripted ahead of time and fail every attachment that touches them.
//! Infinite work never completes; NaN work fails on attach.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::rng::DeterministicRng;
use super::{Completion, Demand, HostEvent, ResourceHandle, ResourceModel};
use crate::activity::{ActivityId, Failure};
use crate::platform::{HostId, LinkId};
use crate::time::VirtualTime;

/// Tunables of the [`LinearModel`].
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    /// Maximum extra latency added to each transfer, drawn in `[0, jitter)`.
    pub jitter: f64,
    /// Seed for the jitter generator.
    pub seed: u64,
    /// Bandwidth of a host talking to itself. `None` means instant.
    pub loopback_bandwidth: Option<f64>,
}

impl ModelConfig {
    /// No jitter, instant loopback.
    pub fn exact() -> Self {
        ModelConfig {
            jitter: 0.0,
            seed: 0,
            loopback_bandwidth: None,
        }
    }

    /// Seeded latency jitter on top of [`ModelConfig::exact`].
    pub fn jittered(jitter: f64, seed: u64) -> Self {
        ModelConfig {
            jitter,
            seed,
            ..Self::exact()
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::exact()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scripted {
    HostOff(HostId),
    HostOn(HostId),
    LinkDown(LinkId),
    LinkUp(LinkId),
}

#[derive(Debug, Clone)]
struct Flow {
    /// `None` while the flow cannot finish: infinite work, or suspended.
    finish: Option<VirtualTime>,
    /// Seconds left when the flow was suspended (`None` is unbounded).
    paused: Option<Option<f64>>,
    hosts: Vec<HostId>,
    links: Vec<LinkId>,
    /// Set when the flow was doomed at attach time.
    failure: Option<Failure>,
}

/// Deterministic, contention-free [`ResourceModel`].
#[derive(Debug, Clone)]
pub struct LinearModel {
    config: ModelConfig,
    rng: DeterministicRng,
    now: VirtualTime,
    next_handle: u64,
    flows: BTreeMap<ResourceHandle, Flow>,
    /// Scripted availability changes, kept sorted by time (stable).
    script: Vec<(VirtualTime, Scripted)>,
    hosts_off: BTreeSet<HostId>,
    links_down: BTreeSet<LinkId>,
    completed: Vec<Completion>,
    host_events: Vec<HostEvent>,
}

impl LinearModel {
    pub fn new(config: ModelConfig) -> Self {
        let rng = DeterministicRng::new(config.seed);
        LinearModel {
            config,
            rng,
            now: VirtualTime::ZERO,
            next_handle: 0,
            flows: BTreeMap::new(),
            script: Vec::new(),
            hosts_off: BTreeSet::new(),
            links_down: BTreeSet::new(),
            completed: Vec::new(),
            host_events: Vec::new(),
        }
    }

    // ── Failure injection ─────────────────────────────────────

    /// Turn `host` off at `at`.
    pub fn schedule_host_off(&mut self, host: HostId, at: VirtualTime) -> &mut Self {
        self.push_script(at, Scripted::HostOff(host))
    }

    /// Turn `host` back on at `at`.
    pub fn schedule_host_on(&mut self, host: HostId, at: VirtualTime) -> &mut Self {
        self.push_script(at, Scripted::HostOn(host))
    }

    /// Break `link` at `at`.
    pub fn schedule_link_failure(&mut self, link: LinkId, at: VirtualTime) -> &mut Self {
        self.push_script(at, Scripted::LinkDown(link))
    }

    /// Repair `link` at `at`.
    pub fn schedule_link_repair(&mut self, link: LinkId, at: VirtualTime) -> &mut Self {
        self.push_script(at, Scripted::LinkUp(link))
    }

    fn push_script(&mut self, at: VirtualTime, what: Scripted) -> &mut Self {
        let pos = self.script.partition_point(|(t, _)| *t <= at);
        self.script.insert(pos, (at, what));
        self
    }

    /// Number of attachments still in flight.
    pub fn in_flight(&self) -> usize {
        self.flows.len()
    }

    // ── Internals ─────────────────────────────────────────────

    /// How long `demand` takes. `Ok(None)` means it never finishes.
    fn duration(&mut self, demand: &Demand) -> Result<Option<f64>, Failure> {
        let secs = match demand {
            Demand::Compute {
                hosts, flops, bound, ..
            } => {
                let slowest = hosts
                    .iter()
                    .map(|(_, speed)| bound.map_or(*speed, |b| speed.min(b)))
                    .fold(f64::INFINITY, f64::min);
                if flops.is_nan() || !(slowest > 0.0) || !slowest.is_finite() {
                    return Err(Failure::Host);
                }
                flops.max(0.0) / slowest
            }
            Demand::Transfer {
                route, bytes, rate, ..
            } => {
                let latency: f64 = route.iter().map(|l| l.latency).sum();
                let jitter = self.rng.next_below(self.config.jitter);
                let mut bandwidth = if route.is_empty() {
                    self.config.loopback_bandwidth.unwrap_or(f64::INFINITY)
                } else {
                    route.iter().map(|l| l.bandwidth).fold(f64::INFINITY, f64::min)
                };
                if let Some(r) = rate {
                    bandwidth = bandwidth.min(*r);
                }
                if bytes.is_nan() || latency.is_nan() || !(bandwidth > 0.0) {
                    return Err(Failure::Transfer);
                }
                let payload = if bandwidth.is_infinite() {
                    0.0
                } else {
                    bytes.max(0.0) / bandwidth
                };
                latency + jitter + payload
            }
        };
        Ok(secs.is_finite().then_some(secs))
    }

    fn next_script_time(&self) -> Option<VirtualTime> {
        self.script.first().map(|(t, _)| *t)
    }

    /// Earliest in-flight flow, ties broken by handle.
    fn next_flow(&self) -> Option<(ResourceHandle, VirtualTime)> {
        self.flows
            .iter()
            .filter_map(|(h, f)| Some((*h, f.finish?)))
            .min_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)))
    }

    fn fail_flows(&mut self, failure: Failure, touches: impl Fn(&Flow) -> bool) {
        let doomed: Vec<ResourceHandle> = self
            .flows
            .iter()
            .filter(|(_, f)| touches(f))
            .map(|(h, _)| *h)
            .collect();
        for handle in doomed {
            self.flows.remove(&handle);
            self.completed.push(Completion {
                handle,
                outcome: Err(failure),
            });
        }
    }

    fn apply(&mut self, what: Scripted) {
        debug!(at = %self.now, ?what, "availability change");
        match what {
            Scripted::HostOff(host) => {
                if self.hosts_off.insert(host) {
                    self.fail_flows(Failure::Host, |f| f.hosts.contains(&host));
                    self.host_events.push(HostEvent::TurnedOff(host));
                }
            }
            Scripted::HostOn(host) => {
                if self.hosts_off.remove(&host) {
                    self.host_events.push(HostEvent::TurnedOn(host));
                }
            }
            Scripted::LinkDown(link) => {
                if self.links_down.insert(link) {
                    self.fail_flows(Failure::Transfer, |f| f.links.contains(&link));
                }
            }
            Scripted::LinkUp(link) => {
                self.links_down.remove(&link);
            }
        }
    }
}

impl Default for LinearModel {
    fn default() -> Self {
        Self::new(ModelConfig::default())
    }
}

impl ResourceModel for LinearModel {
    fn attach(&mut self, activity: ActivityId, demand: Demand, now: VirtualTime) -> ResourceHandle {
        let handle = ResourceHandle::new(self.next_handle);
        self.next_handle += 1;

        let hosts = demand.hosts();
        let links: Vec<LinkId> = match &demand {
            Demand::Transfer { route, .. } => route.iter().map(|l| l.id).collect(),
            Demand::Compute { .. } => Vec::new(),
        };

        let mut failure = if hosts.iter().any(|h| self.hosts_off.contains(h)) {
            Some(Failure::Host)
        } else if links.iter().any(|l| self.links_down.contains(l)) {
            Some(Failure::Transfer)
        } else {
            None
        };
        let finish = match self.duration(&demand) {
            Ok(secs) => secs.and_then(|d| now.advance(d)),
            Err(f) => {
                failure.get_or_insert(f);
                Some(now)
            }
        };
        if failure.is_some() {
            debug!(%activity, %handle, ?failure, "attachment doomed at start");
        } else if finish.is_none() {
            debug!(%activity, %handle, "attachment never completes");
        }

        self.flows.insert(
            handle,
            Flow {
                finish: if failure.is_some() { Some(now) } else { finish },
                paused: None,
                hosts,
                links,
                failure,
            },
        );
        handle
    }

    fn detach(&mut self, handle: ResourceHandle) {
        self.flows.remove(&handle);
        self.completed.retain(|c| c.handle != handle);
    }

    fn suspend(&mut self, handle: ResourceHandle, now: VirtualTime) {
        let Some(flow) = self.flows.get_mut(&handle) else {
            return;
        };
        if flow.failure.is_some() || flow.paused.is_some() {
            return;
        }
        let left = flow.finish.and_then(|f| f.duration_since(now));
        flow.paused = Some(left);
        flow.finish = None;
    }

    fn resume(&mut self, handle: ResourceHandle, now: VirtualTime) {
        let Some(flow) = self.flows.get_mut(&handle) else {
            return;
        };
        if let Some(left) = flow.paused.take() {
            flow.finish = left.and_then(|d| now.advance(d));
        }
    }

    fn next_completion_time(&self) -> Option<VirtualTime> {
        let flow = self.next_flow().map(|(_, t)| t);
        match (flow, self.next_script_time()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn advance_to(&mut self, now: VirtualTime) {
        if now > self.now {
            self.now = now;
        }
        loop {
            let flow = self.next_flow().filter(|(_, t)| *t <= now);
            let script = self.next_script_time().filter(|t| *t <= now);
            // A flow finishing at the same instant as a failure wins.
            let finished = match (flow, script) {
                (Some((handle, t)), Some(st)) if t <= st => Some(handle),
                (Some((handle, _)), None) => Some(handle),
                (_, Some(_)) => None,
                (None, None) => break,
            };
            match finished {
                Some(handle) => {
                    if let Some(f) = self.flows.remove(&handle) {
                        self.completed.push(Completion {
                            handle,
                            outcome: f.failure.map_or(Ok(()), Err),
                        });
                    }
                }
                None => {
                    let (_, what) = self.script.remove(0);
                    self.apply(what);
                }
            }
        }
    }

    fn poll_completed(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completed)
    }

    fn poll_host_events(&mut self) -> Vec<HostEvent> {
        std::mem::take(&mut self.host_events)
    }

    fn is_host_on(&self, host: HostId) -> bool {
        !self.hosts_off.contains(&host)
    }
}
