use tonic::Code;
use tracing::info;

/// Call lifecycle sink. The bridge reports the events; collectors decide
/// what a metric or a log line looks like.
pub trait CallObserver: Send + Sync {
    fn call_started(&self, method: &str);
    fn call_closed(&self, method: &str, code: Code);
}

/// Emits one tracing event per lifecycle edge.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl CallObserver for LogObserver {
    fn call_started(&self, method: &str) {
        info!(method, "call started");
    }

    fn call_closed(&self, method: &str, code: Code) {
        info!(method, code = ?code, "call closed");
    }
}
