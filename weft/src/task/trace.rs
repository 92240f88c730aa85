use crate::task::TaskState;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::panic::Location;
use std::time::Instant;

/// Where a trace entry was captured, for noise suppression in dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    /// Inside this crate.
    Runtime,
    /// Inside a registry dependency.
    Vendor,
    /// Application code.
    User,
}

pub(crate) fn classify(site: &Location<'_>) -> FrameClass {
    let file = site.file();
    if file.contains("weft/src/") || file.contains("weft\\src\\") {
        FrameClass::Runtime
    } else if file.contains(".cargo") && file.contains("registry") {
        FrameClass::Vendor
    } else {
        FrameClass::User
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TraceEntry {
    pub at: Instant,
    pub state: TaskState,
    pub event: &'static str,
    pub site: &'static Location<'static>,
}

/// Bounded ring of the most recent task events. Every task carries one; the
/// dump is attached to unresolved-error reports.
#[derive(Debug)]
pub(crate) struct TraceRing {
    entries: VecDeque<TraceEntry>,
    capacity: usize,
    born: Instant,
}

impl TraceRing {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(64)),
            capacity,
            born: Instant::now(),
        }
    }

    #[track_caller]
    pub(crate) fn record(&mut self, state: TaskState, event: &'static str) {
        self.record_at(state, event, Location::caller());
    }

    pub(crate) fn record_at(
        &mut self,
        state: TaskState,
        event: &'static str,
        site: &'static Location<'static>,
    ) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(TraceEntry {
            at: Instant::now(),
            state,
            event,
            site,
        });
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.born = Instant::now();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Renders the ring, oldest first. Runtime and vendor frames are skipped
    /// unless `debug` is set.
    pub(crate) fn dump(&self, debug: bool) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let class = classify(entry.site);
            if !debug && class != FrameClass::User {
                let _ = writeln!(
                    out,
                    "    +{:>9.1?} {:<8?} {}",
                    entry.at.duration_since(self.born),
                    entry.state,
                    entry.event,
                );
                continue;
            }
            let _ = writeln!(
                out,
                "    +{:>9.1?} {:<8?} {} ({}:{})",
                entry.at.duration_since(self.born),
                entry.state,
                entry.event,
                entry.site.file(),
                entry.site.line(),
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_is_bounded() {
        let mut ring = TraceRing::new(3);
        for _ in 0..10 {
            ring.record(TaskState::Running, "spin");
        }
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_zero_capacity_records_nothing() {
        let mut ring = TraceRing::new(0);
        ring.record(TaskState::Created, "create");
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn test_dump_hides_sites_without_debug() {
        let mut ring = TraceRing::new(8);
        ring.record(TaskState::Waiting, "park");
        let quiet = ring.dump(false);
        let loud = ring.dump(true);
        assert!(quiet.contains("park"));
        assert!(!quiet.contains(".rs:"));
        assert!(loud.contains(".rs:"));
    }
}
