use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

pub struct RelayMetrics {
    ws_duration_count: Mutex<HashMap<String, u64>>,
    ws_duration_sum_ms: Mutex<HashMap<String, u64>>,
    ws_errors_total: Mutex<HashMap<String, u64>>,
    ws_rate_total: Mutex<HashMap<String, u64>>,
    connected_clients: AtomicU64,
    occupied_sessions: AtomicU64,
    message_append_failures_total: AtomicU64,
}

static GLOBAL_METRICS: OnceLock<Arc<RelayMetrics>> = OnceLock::new();

impl Default for RelayMetrics {
    fn default() -> Self {
        Self {
            ws_duration_count: Mutex::new(HashMap::new()),
            ws_duration_sum_ms: Mutex::new(HashMap::new()),
            ws_errors_total: Mutex::new(HashMap::new()),
            ws_rate_total: Mutex::new(HashMap::new()),
            connected_clients: AtomicU64::new(0),
            occupied_sessions: AtomicU64::new(0),
            message_append_failures_total: AtomicU64::new(0),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<RelayMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

fn global_metrics() -> Option<&'static Arc<RelayMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_ws_request(frame_kind: &str, is_error: bool, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_ws_request(frame_kind, is_error, latency_ms);
    }
}

pub fn set_connected_clients(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_connected_clients(count);
    }
}

pub fn set_occupied_sessions(count: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_occupied_sessions(count);
    }
}

pub fn increment_message_append_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_message_append_failures();
    }
}

pub fn render_global() -> String {
    global_metrics().map(|metrics| metrics.render_prometheus()).unwrap_or_default()
}

impl RelayMetrics {
    pub fn record_ws_request(&self, frame_kind: &str, is_error: bool, latency_ms: u64) {
        increment_label_counter(&self.ws_rate_total, frame_kind, 1);
        increment_label_counter(&self.ws_duration_sum_ms, frame_kind, latency_ms);
        increment_label_counter(&self.ws_duration_count, frame_kind, 1);
        if is_error {
            increment_label_counter(&self.ws_errors_total, frame_kind, 1);
        }
    }

    pub fn set_connected_clients(&self, count: usize) {
        self.connected_clients.store(count as u64, Ordering::SeqCst);
    }

    pub fn set_occupied_sessions(&self, count: usize) {
        self.occupied_sessions.store(count as u64, Ordering::SeqCst);
    }

    pub fn increment_message_append_failures(&self) {
        self.message_append_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP relay_ws_rate_total Total websocket frames by kind.\n");
        output.push_str("# TYPE relay_ws_rate_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_rate_total", &self.ws_rate_total);

        output.push_str("# HELP relay_ws_errors_total Total websocket frame errors by kind.\n");
        output.push_str("# TYPE relay_ws_errors_total counter\n");
        append_label_counter_lines(&mut output, "relay_ws_errors_total", &self.ws_errors_total);

        output.push_str("# HELP relay_ws_duration_ms_sum Sum of websocket frame handling latency in milliseconds by kind.\n");
        output.push_str("# TYPE relay_ws_duration_ms_sum counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_sum",
            &self.ws_duration_sum_ms,
        );

        output.push_str(
            "# HELP relay_ws_duration_ms_count Count of websocket latency samples by kind.\n",
        );
        output.push_str("# TYPE relay_ws_duration_ms_count counter\n");
        append_label_counter_lines(
            &mut output,
            "relay_ws_duration_ms_count",
            &self.ws_duration_count,
        );

        output.push_str("# HELP relay_connected_clients Currently identified connections.\n");
        output.push_str("# TYPE relay_connected_clients gauge\n");
        output.push_str(&format!(
            "relay_connected_clients {}\n",
            self.connected_clients.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP relay_occupied_sessions Sessions with at least one member.\n");
        output.push_str("# TYPE relay_occupied_sessions gauge\n");
        output.push_str(&format!(
            "relay_occupied_sessions {}\n",
            self.occupied_sessions.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP relay_message_append_failures_total Message store appends that failed and degraded to relay-only delivery.\n",
        );
        output.push_str("# TYPE relay_message_append_failures_total counter\n");
        output.push_str(&format!(
            "relay_message_append_failures_total {}\n",
            self.message_append_failures_total.load(Ordering::SeqCst)
        ));

        output
    }
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, amount: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(amount);
}

fn append_label_counter_lines(output: &mut String, name: &str, map: &Mutex<HashMap<String, u64>>) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries = guard.iter().collect::<Vec<_>>();
    entries.sort_by(|(a, _), (b, _)| a.cmp(b));
    for (label, value) in entries {
        output.push_str(&format!("{name}{{kind=\"{label}\"}} {value}\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::RelayMetrics;

    #[test]
    fn ws_counters_accumulate_per_kind() {
        let metrics = RelayMetrics::default();
        metrics.record_ws_request("identify", false, 3);
        metrics.record_ws_request("identify", true, 7);
        metrics.record_ws_request("new_message", false, 1);

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_ws_rate_total{kind=\"identify\"} 2"));
        assert!(rendered.contains("relay_ws_errors_total{kind=\"identify\"} 1"));
        assert!(rendered.contains("relay_ws_duration_ms_sum{kind=\"identify\"} 10"));
        assert!(rendered.contains("relay_ws_rate_total{kind=\"new_message\"} 1"));
    }

    #[test]
    fn gauges_and_failure_counter_render() {
        let metrics = RelayMetrics::default();
        metrics.set_connected_clients(4);
        metrics.set_occupied_sessions(2);
        metrics.increment_message_append_failures();

        let rendered = metrics.render_prometheus();
        assert!(rendered.contains("relay_connected_clients 4"));
        assert!(rendered.contains("relay_occupied_sessions 2"));
        assert!(rendered.contains("relay_message_append_failures_total 1"));
    }
}
