//! Host port allocation for lab desktops.
//!
//! Each session holds one display port and one proxy port. Ports come from a
//! per-kind counter; released ports are kept on a free list and handed out
//! again (lowest first) before the counter advances.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Mutex;
use thiserror::Error;

/// Result type for port allocation.
pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free {0} ports left")]
    Exhausted(PortKind),

    #[error("invalid {kind} port range {start}-{end}")]
    InvalidRange { kind: PortKind, start: u16, end: u16 },
}

/// The two services every lab desktop exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Remote-display (VNC) port.
    Display,
    /// Browser proxy (noVNC) port.
    Proxy,
}

impl std::fmt::Display for PortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortKind::Display => write!(f, "display"),
            PortKind::Proxy => write!(f, "proxy"),
        }
    }
}

/// Ports held by one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortLease {
    pub display: u16,
    pub proxy: u16,
}

/// Inclusive host port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn overlaps(&self, other: &PortRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

#[derive(Debug)]
struct Pool {
    kind: PortKind,
    range: PortRange,
    /// Next never-used port; `None` once the counter has passed the range end.
    next: Option<u16>,
    free: BTreeSet<u16>,
    allocated: BTreeSet<u16>,
}

impl Pool {
    fn new(kind: PortKind, range: PortRange) -> Self {
        Self {
            kind,
            range,
            next: Some(range.start),
            free: BTreeSet::new(),
            allocated: BTreeSet::new(),
        }
    }

    fn allocate(&mut self) -> PortResult<u16> {
        let port = match self.free.pop_first() {
            Some(port) => port,
            None => {
                let port = self.next.ok_or(PortError::Exhausted(self.kind))?;
                self.next = if port < self.range.end {
                    Some(port + 1)
                } else {
                    None
                };
                port
            }
        };
        self.allocated.insert(port);
        Ok(port)
    }

    /// Returns `false` when the port was not allocated.
    fn release(&mut self, port: u16) -> bool {
        if !self.allocated.remove(&port) {
            return false;
        }
        self.free.insert(port);
        true
    }

    /// Undo an allocation that was never handed out.
    fn unwind(&mut self, port: u16) {
        self.release(port);
    }
}

#[derive(Debug)]
struct Pools {
    display: Pool,
    proxy: Pool,
}

impl Pools {
    fn pool_mut(&mut self, kind: PortKind) -> &mut Pool {
        match kind {
            PortKind::Display => &mut self.display,
            PortKind::Proxy => &mut self.proxy,
        }
    }
}

/// Thread-safe allocator over the display and proxy ranges.
#[derive(Debug)]
pub struct PortAllocator {
    pools: Mutex<Pools>,
}

impl PortAllocator {
    /// Create an allocator. The two ranges must be well-formed and disjoint.
    pub fn new(display: PortRange, proxy: PortRange) -> PortResult<Self> {
        for (kind, range) in [(PortKind::Display, display), (PortKind::Proxy, proxy)] {
            if range.start == 0 || range.start > range.end {
                return Err(PortError::InvalidRange {
                    kind,
                    start: range.start,
                    end: range.end,
                });
            }
        }
        if display.overlaps(&proxy) {
            return Err(PortError::InvalidRange {
                kind: PortKind::Proxy,
                start: proxy.start,
                end: proxy.end,
            });
        }

        Ok(Self {
            pools: Mutex::new(Pools {
                display: Pool::new(PortKind::Display, display),
                proxy: Pool::new(PortKind::Proxy, proxy),
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pools> {
        // The pools hold plain sets; a panic mid-update cannot leave them torn.
        self.pools.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a single port of the given kind.
    pub fn allocate(&self, kind: PortKind) -> PortResult<u16> {
        self.lock().pool_mut(kind).allocate()
    }

    /// Allocate a display and proxy port together. Either both are handed out
    /// or neither is.
    pub fn allocate_pair(&self) -> PortResult<PortLease> {
        let mut pools = self.lock();
        let display = pools.display.allocate()?;
        let proxy = match pools.proxy.allocate() {
            Ok(port) => port,
            Err(e) => {
                pools.display.unwind(display);
                return Err(e);
            }
        };
        Ok(PortLease { display, proxy })
    }

    /// Return a port to its pool. Releasing a port that is not currently
    /// allocated does nothing.
    pub fn release(&self, port: u16) {
        let mut pools = self.lock();
        let kind = if pools.display.range.contains(port) {
            PortKind::Display
        } else if pools.proxy.range.contains(port) {
            PortKind::Proxy
        } else {
            log::warn!("Ignoring release of port {} outside both ranges", port);
            return;
        };
        if !pools.pool_mut(kind).release(port) {
            log::debug!("Port {} was not allocated, release ignored", port);
        }
    }

    /// Return both ports of a lease.
    pub fn release_pair(&self, lease: PortLease) {
        self.release(lease.display);
        self.release(lease.proxy);
    }

    /// Whether the port is currently held by a session.
    pub fn is_allocated(&self, port: u16) -> bool {
        let pools = self.lock();
        pools.display.allocated.contains(&port) || pools.proxy.allocated.contains(&port)
    }

    /// Number of ports currently held, per kind.
    pub fn allocated_count(&self, kind: PortKind) -> usize {
        self.lock().pool_mut(kind).allocated.len()
    }
}
