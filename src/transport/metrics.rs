use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Classification of outbound frames whose send latency is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricTag {
    Config,
    DeviceContext,
    AudioStart,
    AudioLast,
    Telemetry,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyStats {
    pub count: u64,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub last: Duration,
}

impl LatencyStats {
    fn record(&mut self, elapsed: Duration) {
        if self.count == 0 || elapsed < self.min {
            self.min = elapsed;
        }
        self.max = self.max.max(elapsed);
        self.last = elapsed;
        self.total += elapsed;
        self.count += 1;
    }

    pub fn average(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            let average = self.total.as_nanos() / u128::from(self.count);
            Duration::from_nanos(u64::try_from(average).unwrap_or(u64::MAX))
        }
    }
}

/// Point-in-time copy of a transport's counters.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub connect_started: Option<SystemTime>,
    pub connected: Option<SystemTime>,
    pub dropped: Option<SystemTime>,
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub frames_received: u64,
    pub protocol_violations: u64,
    pub latency: HashMap<MetricTag, LatencyStats>,
}

/// One timed event in a telemetry report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MetricEvent {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub start: String,
    pub end: String,
}

/// Body of the `telemetry` message sent at the end of every turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct TelemetryReport {
    /// One single-key object per path, mapping to its arrival times.
    pub received_messages: Vec<BTreeMap<String, Vec<String>>>,
    pub metrics: Vec<MetricEvent>,
}

impl TelemetryReport {
    pub fn is_empty(&self) -> bool {
        self.received_messages.is_empty() && self.metrics.is_empty()
    }
}

fn wall_clock(at: SystemTime) -> String {
    DateTime::<Utc>::from(at).to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Default)]
pub(crate) struct TransportMetrics {
    in_flight: HashMap<u64, (MetricTag, Instant, SystemTime)>,
    snapshot: MetricsSnapshot,
    // 当前轮次的遥测数据
    received: BTreeMap<String, Vec<String>>,
    events: Vec<MetricEvent>,
}

impl TransportMetrics {
    pub(crate) fn connect_started(&mut self) {
        self.snapshot.connect_started = Some(SystemTime::now());
        self.snapshot.connected = None;
        self.snapshot.dropped = None;
    }

    pub(crate) fn connected(&mut self, connection_id: &str) {
        let now = SystemTime::now();
        self.snapshot.connected = Some(now);
        self.events.push(MetricEvent {
            name: "Connection".to_string(),
            id: Some(connection_id.to_string()),
            start: wall_clock(self.snapshot.connect_started.unwrap_or(now)),
            end: wall_clock(now),
        });
    }

    pub(crate) fn dropped(&mut self) {
        self.in_flight.clear();
        self.snapshot.dropped = Some(SystemTime::now());
    }

    /// Starts the latency clock for a tagged frame handed to the socket.
    pub(crate) fn frame_queued(&mut self, frame_id: u64, tag: Option<MetricTag>, bytes: usize) {
        self.snapshot.frames_sent += 1;
        self.snapshot.bytes_sent += bytes as u64;
        if let Some(tag) = tag {
            self.in_flight.insert(frame_id, (tag, Instant::now(), SystemTime::now()));
        }
    }

    pub(crate) fn frame_sent(&mut self, frame_id: u64) -> Option<(MetricTag, Duration)> {
        let (tag, started, queued_at) = self.in_flight.remove(&frame_id)?;
        let elapsed = started.elapsed();
        self.snapshot.latency.entry(tag).or_default().record(elapsed);
        if tag == MetricTag::AudioStart {
            self.events.push(MetricEvent {
                name: "AudioStart".to_string(),
                id: None,
                start: wall_clock(queued_at),
                end: wall_clock(SystemTime::now()),
            });
        }
        Some((tag, elapsed))
    }

    pub(crate) fn frame_received(&mut self, path: Option<&str>) {
        self.snapshot.frames_received += 1;
        if let Some(path) = path {
            self.received
                .entry(path.to_string())
                .or_default()
                .push(wall_clock(SystemTime::now()));
        }
    }

    /// Drains what the current turn collected.
    pub(crate) fn take_telemetry(&mut self) -> TelemetryReport {
        TelemetryReport {
            received_messages: std::mem::take(&mut self.received)
                .into_iter()
                .map(|(path, times)| BTreeMap::from([(path, times)]))
                .collect(),
            metrics: std::mem::take(&mut self.events),
        }
    }

    pub(crate) fn protocol_violation(&mut self) {
        self.snapshot.protocol_violations += 1;
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        self.snapshot.clone()
    }
}
