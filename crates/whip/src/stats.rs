use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Monotonic counters behind the periodic stats log line and the mesh
/// sections of STATUS_GET. Rate counters reset on every [`ServerStats::take`].
#[derive(Default)]
pub struct ServerStats {
    requests: AtomicU64,
    kb_transferred: AtomicU64,
    mesh_requests: AtomicU64,
    mesh_positive: AtomicU64,
    mesh_kb_transferred: AtomicU64,
    clients: AtomicUsize,
}

/// One reset-on-read sample of the rate counters.
pub struct StatsSample {
    pub requests: u64,
    pub kb_transferred: u64,
    pub mesh_requests: u64,
    pub mesh_positive: u64,
    pub mesh_kb_transferred: u64,
}

/// Transfers are tallied in kilobytes; anything under 1 kB counts as 1.
fn kb_rounded(bytes: usize) -> u64 {
    if bytes < 1000 {
        1
    } else {
        ((bytes as f32 / 1000.0) + 0.5).floor() as u64
    }
}

impl ServerStats {
    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_transfer(&self, bytes: usize) {
        self.kb_transferred
            .fetch_add(kb_rounded(bytes), Ordering::Relaxed);
    }

    pub fn add_mesh_transfer(&self, bytes: usize) {
        self.mesh_kb_transferred
            .fetch_add(kb_rounded(bytes), Ordering::Relaxed);
    }

    pub fn add_mesh_request(&self) {
        self.mesh_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_mesh_positive(&self) {
        self.mesh_positive.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_connected(&self) {
        self.clients.fetch_add(1, Ordering::Relaxed);
    }

    pub fn client_disconnected(&self) {
        self.clients.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::Relaxed)
    }

    pub fn take(&self) -> StatsSample {
        StatsSample {
            requests: self.requests.swap(0, Ordering::Relaxed),
            kb_transferred: self.kb_transferred.swap(0, Ordering::Relaxed),
            mesh_requests: self.mesh_requests.swap(0, Ordering::Relaxed),
            mesh_positive: self.mesh_positive.swap(0, Ordering::Relaxed),
            mesh_kb_transferred: self.mesh_kb_transferred.swap(0, Ordering::Relaxed),
        }
    }
}
