use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Capture,
    Plane,
    TrackingResult,
}

#[derive(Debug, Default)]
struct Counters {
    captures: AtomicUsize,
    planes: AtomicUsize,
    results: AtomicUsize,
}

impl Counters {
    fn slot(&self, kind: HandleKind) -> &AtomicUsize {
        match kind {
            HandleKind::Capture => &self.captures,
            HandleKind::Plane => &self.planes,
            HandleKind::TrackingResult => &self.results,
        }
    }
}

/// Live-handle counters shared by every producer of captures, planes and
/// tracking results in one session.
#[derive(Clone, Debug, Default)]
pub struct HandleLedger {
    counters: Arc<Counters>,
}

impl HandleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lease(&self, kind: HandleKind) -> Lease {
        self.counters.slot(kind).fetch_add(1, Ordering::SeqCst);
        Lease {
            ledger: self.clone(),
            kind,
        }
    }

    pub fn outstanding(&self) -> Outstanding {
        Outstanding {
            captures: self.counters.captures.load(Ordering::SeqCst),
            planes: self.counters.planes.load(Ordering::SeqCst),
            results: self.counters.results.load(Ordering::SeqCst),
        }
    }
}

/// One counted handle. Cloning takes a fresh lease; dropping returns it.
#[derive(Debug)]
pub struct Lease {
    ledger: HandleLedger,
    kind: HandleKind,
}

impl Lease {
    pub fn ledger(&self) -> &HandleLedger {
        &self.ledger
    }
}

impl Clone for Lease {
    fn clone(&self) -> Self {
        self.ledger.lease(self.kind)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.ledger
            .counters
            .slot(self.kind)
            .fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Outstanding {
    pub captures: usize,
    pub planes: usize,
    pub results: usize,
}

impl Outstanding {
    pub fn is_clear(&self) -> bool {
        self.captures == 0 && self.planes == 0 && self.results == 0
    }
}
