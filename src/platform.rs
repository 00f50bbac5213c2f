//! Topology and placement, as seen by the kernel.
//!
//! The kernel never routes or computes speeds itself. It asks a
//! [`Platform`] for the route between two hosts and for a host's speed,
//! and forwards the answers to the resource model when an activity starts.

use std::collections::BTreeMap;

use crate::error::{KernelError, KernelResult};

// ── Identifiers ───────────────────────────────────────────────────────

/// Index of a host in the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HostId(u32);

impl HostId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        HostId(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for HostId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "H{}", self.0)
    }
}

/// Index of a link in the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkId(u32);

impl LinkId {
    #[inline]
    pub fn new(raw: u32) -> Self {
        LinkId(raw)
    }

    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for LinkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One hop of a route, carrying the parameters the resource model needs.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct LinkRef {
    pub id: LinkId,
    /// Bytes per second.
    pub bandwidth: f64,
    /// Seconds.
    pub latency: f64,
}

// ── Platform trait ────────────────────────────────────────────────────

/// Read-only view of the simulated topology.
pub trait Platform: Send + Sync {
    /// Links traversed from `src` to `dst`. Empty for a loopback.
    fn route(&self, src: HostId, dst: HostId) -> Vec<LinkRef>;

    /// Host speed in flops per second.
    fn host_speed(&self, host: HostId) -> f64;

    /// Whether `host` exists.
    fn has_host(&self, host: HostId) -> bool;

    /// Human-readable host name, for logs.
    fn host_name(&self, host: HostId) -> Option<&str> {
        let _ = host;
        None
    }
}

// ── StaticPlatform ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct HostSpec {
    name: String,
    speed: f64,
}

/// An immutable platform assembled in code.
///
/// Routes are symmetric. A pair of distinct hosts without an explicit
/// route goes through the backbone link when one is set, and through an
/// empty (instant) route otherwise.
///
/// # Example
/// ```rust
/// use simkernel::StaticPlatform;
///
/// let mut b = StaticPlatform::builder();
/// let alice = b.host("alice", 1e9);
/// let bob = b.host("bob", 2e9);
/// let wire = b.link("wire", 1.25e8, 1e-4);
/// b.route(alice, bob, &[wire]);
/// let platform = b.build();
/// assert_eq!(platform.host_count(), 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticPlatform {
    hosts: Vec<HostSpec>,
    links: Vec<(String, LinkRef)>,
    routes: BTreeMap<(HostId, HostId), Vec<LinkId>>,
    backbone: Option<LinkId>,
}

impl StaticPlatform {
    /// Start building a platform.
    pub fn builder() -> StaticPlatformBuilder {
        StaticPlatformBuilder {
            platform: StaticPlatform::default(),
        }
    }

    /// `n` hosts of identical speed, fully connected through one backbone.
    pub fn uniform(n: u32, speed: f64, bandwidth: f64, latency: f64) -> Self {
        let mut b = Self::builder();
        for i in 0..n {
            b.host(&format!("host{i}"), speed);
        }
        let backbone = b.link("backbone", bandwidth, latency);
        b.backbone(backbone);
        b.build()
    }

    /// A single host, no links.
    pub fn single_host(speed: f64) -> Self {
        let mut b = Self::builder();
        b.host("host0", speed);
        b.build()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }

    /// Look a host up by name.
    pub fn host_by_name(&self, name: &str) -> Option<HostId> {
        self.hosts
            .iter()
            .position(|h| h.name == name)
            .map(|i| HostId::new(i as u32))
    }

    /// Parameters of a link.
    pub fn link(&self, id: LinkId) -> Option<LinkRef> {
        self.links.get(id.raw() as usize).map(|(_, l)| *l)
    }

    /// Fail with `UnknownHost` unless `host` exists.
    pub fn check_host(&self, host: HostId) -> KernelResult<()> {
        if self.has_host(host) {
            Ok(())
        } else {
            Err(KernelError::UnknownHost(host))
        }
    }

    fn key(a: HostId, b: HostId) -> (HostId, HostId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

impl Platform for StaticPlatform {
    fn route(&self, src: HostId, dst: HostId) -> Vec<LinkRef> {
        if src == dst {
            return Vec::new();
        }
        match self.routes.get(&Self::key(src, dst)) {
            Some(ids) => ids.iter().filter_map(|id| self.link(*id)).collect(),
            None => self.backbone.and_then(|id| self.link(id)).into_iter().collect(),
        }
    }

    fn host_speed(&self, host: HostId) -> f64 {
        self.hosts
            .get(host.raw() as usize)
            .map(|h| h.speed)
            .unwrap_or(0.0)
    }

    fn has_host(&self, host: HostId) -> bool {
        (host.raw() as usize) < self.hosts.len()
    }

    fn host_name(&self, host: HostId) -> Option<&str> {
        self.hosts.get(host.raw() as usize).map(|h| h.name.as_str())
    }
}

/// Incremental construction of a [`StaticPlatform`].
#[derive(Debug)]
pub struct StaticPlatformBuilder {
    platform: StaticPlatform,
}

impl StaticPlatformBuilder {
    /// Add a host with `speed` flops per second.
    pub fn host(&mut self, name: &str, speed: f64) -> HostId {
        let id = HostId::new(self.platform.hosts.len() as u32);
        self.platform.hosts.push(HostSpec {
            name: name.to_string(),
            speed,
        });
        id
    }

    /// Add a link (`bandwidth` in bytes/s, `latency` in seconds).
    pub fn link(&mut self, name: &str, bandwidth: f64, latency: f64) -> LinkId {
        let id = LinkId::new(self.platform.links.len() as u32);
        self.platform.links.push((
            name.to_string(),
            LinkRef {
                id,
                bandwidth,
                latency,
            },
        ));
        id
    }

    /// Declare the (symmetric) route between two hosts.
    pub fn route(&mut self, a: HostId, b: HostId, links: &[LinkId]) -> &mut Self {
        self.platform
            .routes
            .insert(StaticPlatform::key(a, b), links.to_vec());
        self
    }

    /// Link used by every host pair without an explicit route.
    pub fn backbone(&mut self, link: LinkId) -> &mut Self {
        self.platform.backbone = Some(link);
        self
    }

    pub fn build(self) -> StaticPlatform {
        self.platform
    }
}
