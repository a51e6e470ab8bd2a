use std::sync::Mutex;
use std::time::Duration;

/// Capacity of the per-node response-time window.
const MAX_RESPONSE_SAMPLES: usize = 5;

/// Weight of the newest sample in the response-time EWMA.
const EWMA_ALPHA: f64 = 0.5;

/// One member of the cluster topology.
///
/// Identity fields come from the topology document; the response-time
/// window is filled locally as requests complete and feeds the
/// SLA-aware read behaviors.
#[derive(Debug)]
pub struct ServerNode {
    url: String,
    database: String,
    cluster_tag: String,
    response_times: Mutex<ResponseTimeWindow>,
}

/// Fixed-capacity circular buffer of the most recent response times.
#[derive(Debug, Default)]
struct ResponseTimeWindow {
    samples: [Duration; MAX_RESPONSE_SAMPLES],
    len: usize,
    next: usize,
}

impl ResponseTimeWindow {
    fn record(&mut self, sample: Duration) {
        self.samples[self.next] = sample;
        self.next = (self.next + 1) % MAX_RESPONSE_SAMPLES;
        if self.len < MAX_RESPONSE_SAMPLES {
            self.len += 1;
        }
    }

    /// EWMA over the recorded window, oldest sample first.
    fn ewma(&self) -> Option<Duration> {
        if self.len == 0 {
            return None;
        }
        // oldest sample sits at `next` once the buffer has wrapped
        let start = if self.len == MAX_RESPONSE_SAMPLES {
            self.next
        } else {
            0
        };
        let mut average = self.samples[start].as_secs_f64();
        for offset in 1..self.len {
            let sample = self.samples[(start + offset) % MAX_RESPONSE_SAMPLES];
            average = EWMA_ALPHA * sample.as_secs_f64() + (1.0 - EWMA_ALPHA) * average;
        }
        Some(Duration::from_secs_f64(average))
    }
}

impl ServerNode {
    pub fn new(url: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: database.into(),
            cluster_tag: String::new(),
            response_times: Mutex::new(ResponseTimeWindow::default()),
        }
    }

    pub fn with_cluster_tag(mut self, cluster_tag: impl Into<String>) -> Self {
        self.cluster_tag = cluster_tag.into();
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn cluster_tag(&self) -> &str {
        &self.cluster_tag
    }

    /// Record a completed round trip against this node.
    pub fn record_response_time(&self, elapsed: Duration) {
        let mut window = self.response_times.lock().unwrap();
        window.record(elapsed);
    }

    /// EWMA of the recent response times; `None` until a request completes.
    pub fn average_response_time(&self) -> Option<Duration> {
        self.response_times.lock().unwrap().ewma()
    }

    /// Whether this node currently answers slower than the given SLA.
    pub fn is_rate_surpassed(&self, sla_threshold: Duration) -> bool {
        match self.average_response_time() {
            Some(average) => average > sla_threshold,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_has_no_samples() {
        let node = ServerNode::new("http://localhost:8080", "db");
        assert_eq!(node.average_response_time(), None);
        assert!(!node.is_rate_surpassed(Duration::from_millis(1)));
    }

    #[test]
    fn test_window_wraps_at_capacity() {
        let node = ServerNode::new("http://localhost:8080", "db");
        for millis in [500, 500, 500, 500, 500] {
            node.record_response_time(Duration::from_millis(millis));
        }
        // five fast samples push the slow ones out of the window
        for _ in 0..MAX_RESPONSE_SAMPLES {
            node.record_response_time(Duration::from_millis(10));
        }
        let average = node.average_response_time().unwrap();
        assert!(average <= Duration::from_millis(10));
    }

    #[test]
    fn test_ewma_weighs_recent_samples() {
        let node = ServerNode::new("http://localhost:8080", "db");
        node.record_response_time(Duration::from_millis(10));
        node.record_response_time(Duration::from_millis(1000));
        let average = node.average_response_time().unwrap();
        assert!(average > Duration::from_millis(400));
    }

    #[test]
    fn test_rate_surpassed_flips_on_slow_responses() {
        let node = ServerNode::new("http://localhost:8080", "db");
        let sla = Duration::from_millis(100);

        node.record_response_time(Duration::from_millis(20));
        assert!(!node.is_rate_surpassed(sla));

        for _ in 0..MAX_RESPONSE_SAMPLES {
            node.record_response_time(Duration::from_millis(400));
        }
        assert!(node.is_rate_surpassed(sla));
    }
}
