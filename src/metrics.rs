use tracing::trace;

// Lightweight metrics helpers that stay safe when no recorder is installed.
// The Prometheus endpoint in main.rs renders whatever the recorder collected.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "sellerdesk.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn sync_elapsed(pass: &'static str, elapsed_ms: u128) {
    trace!(
        target = "sellerdesk.metrics",
        pass = pass,
        elapsed_ms = elapsed_ms as u64,
        "sync_pass_elapsed"
    );
}
