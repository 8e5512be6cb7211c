//! Connection counters (thread-safe, lock-free), rendered as a serializable snapshot or in the
//! Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Stats {
    /// Every submitted request, any type.
    pub requests: AtomicU64,
    pub searches: AtomicU64,
    pub binds: AtomicU64,
    pub modifies: AtomicU64,
    pub adds: AtomicU64,
    pub removes: AtomicU64,
    pub renames: AtomicU64,
    /// Responses delivered through the router.
    pub results: AtomicU64,
    /// Responses carrying a non-zero result code plus undecodable responses.
    pub errors: AtomicU64,
    pub disconnects: AtomicU64,
    pub reconnects: AtomicU64,
    pub sync_entries: AtomicU64,
    /// Messages that could not be parsed (invalid BER / unknown operation).
    pub parse_errors: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub requests: u64,
    pub searches: u64,
    pub binds: u64,
    pub modifies: u64,
    pub adds: u64,
    pub removes: u64,
    pub renames: u64,
    pub results: u64,
    pub errors: u64,
    pub disconnects: u64,
    pub reconnects: u64,
    pub sync_entries: u64,
    pub parse_errors: u64,
}

/// Submitted operation kinds, for [`Stats::inc_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Bind,
    Search,
    Modify,
    Add,
    Delete,
    Rename,
    Other,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_request(&self, op: OpKind) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let counter = match op {
            OpKind::Bind => &self.binds,
            OpKind::Search => &self.searches,
            OpKind::Modify => &self.modifies,
            OpKind::Add => &self.adds,
            OpKind::Delete => &self.removes,
            OpKind::Rename => &self.renames,
            OpKind::Other => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_result(&self, is_error: bool) {
        self.results.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn inc_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_sync_entry(&self) {
        self.sync_entries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            binds: self.binds.load(Ordering::Relaxed),
            modifies: self.modifies.load(Ordering::Relaxed),
            adds: self.adds.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            results: self.results.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            sync_entries: self.sync_entries.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
        }
    }

    /// Prometheus exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();

        out.push_str("# HELP ldap_mux_requests_total Total LDAP requests submitted by operation.\n");
        out.push_str("# TYPE ldap_mux_requests_total counter\n");
        for (op, val) in [
            ("bind", s.binds),
            ("search", s.searches),
            ("modify", s.modifies),
            ("add", s.adds),
            ("delete", s.removes),
            ("modify_dn", s.renames),
            ("other", s.requests - s.binds - s.searches - s.modifies - s.adds - s.removes - s.renames),
        ] {
            out.push_str(&format!("ldap_mux_requests_total{{op=\"{}\"}} {}\n", op, val));
        }

        for (name, help, val) in [
            ("results", "Total responses delivered.", s.results),
            ("errors", "Total error responses and undecodable messages.", s.errors),
            ("parse_errors", "Total LDAP message parse errors (invalid BER / unknown operation).", s.parse_errors),
            ("disconnects", "Total connection teardowns.", s.disconnects),
            ("reconnects", "Total successful reconnects.", s.reconnects),
            ("sync_entries", "Total content sync entries received.", s.sync_entries),
        ] {
            out.push_str(&format!("# HELP ldap_mux_{}_total {}\n", name, help));
            out.push_str(&format!("# TYPE ldap_mux_{}_total counter\n", name));
            out.push_str(&format!("ldap_mux_{}_total {}\n", name, val));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inc_request_counts_kind_and_total() {
        let stats = Stats::new();
        stats.inc_request(OpKind::Search);
        stats.inc_request(OpKind::Search);
        stats.inc_request(OpKind::Delete);
        stats.inc_request(OpKind::Other);
        let s = stats.snapshot();
        assert_eq!(s.requests, 4);
        assert_eq!(s.searches, 2);
        assert_eq!(s.removes, 1);
    }

    #[test]
    fn test_render_contains_counters() {
        let stats = Stats::new();
        stats.inc_request(OpKind::Bind);
        stats.inc_result(true);
        stats.inc_parse_error();
        let out = stats.render();
        assert!(out.contains("ldap_mux_requests_total{op=\"bind\"} 1"));
        assert!(out.contains("ldap_mux_requests_total{op=\"other\"} 0"));
        assert!(out.contains("ldap_mux_errors_total 2"));
        assert!(out.contains("ldap_mux_parse_errors_total 1"));
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = Stats::new();
        stats.inc_disconnect();
        let yaml = serde_yaml::to_string(&stats.snapshot()).unwrap();
        assert!(yaml.contains("disconnects: 1"));
    }
}
