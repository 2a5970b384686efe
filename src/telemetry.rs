//! Fire-and-forget telemetry points.
//!
//! Points are written in Influx line protocol by a fixed number of
//! background workers fed through a bounded queue. `record` never
//! blocks and never fails: under backpressure the point is dropped and
//! counted, and write errors are only logged.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use url::Url;

use crate::config::InfluxConfig;
use crate::metrics::RuntimeMetrics;

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<Duration> for FieldValue {
    fn from(v: Duration) -> Self {
        Self::Int(i64::try_from(v.as_millis()).unwrap_or(i64::MAX))
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

/// A single measurement point.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, FieldValue>,
    pub timestamp_ns: Option<i64>,
}

impl Point {
    pub fn new(measurement: impl Into<String>) -> Self {
        Self {
            measurement: measurement.into(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp_ns: chrono::Utc::now().timestamp_nanos_opt(),
        }
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Renders the point in line protocol:
    /// `measurement,tag=v field=1i,flag=true 1700000000000000000`
    pub fn to_line(&self) -> String {
        let mut line = escape(&self.measurement, &[',', ' ']);

        for (key, value) in &self.tags {
            line.push(',');
            line.push_str(&escape(key, &[',', '=', ' ']));
            line.push('=');
            line.push_str(&escape(value, &[',', '=', ' ']));
        }

        let fields: Vec<String> = self
            .fields
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    FieldValue::Int(v) => format!("{v}i"),
                    FieldValue::Float(v) => v.to_string(),
                    FieldValue::Bool(v) => v.to_string(),
                    FieldValue::Text(v) => format!("\"{}\"", escape(v, &['"', '\\'])),
                };
                format!("{}={value}", escape(key, &[',', '=', ' ']))
            })
            .collect();

        line.push(' ');
        line.push_str(&fields.join(","));

        if let Some(ts) = self.timestamp_ns {
            line.push(' ');
            line.push_str(&ts.to_string());
        }
        line
    }
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if special.contains(&c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Where points end up.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write(&self, point: &Point) -> anyhow::Result<()>;
}

/// InfluxDB v1 `/write` endpoint.
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: Url,
}

impl InfluxWriter {
    pub fn new(cfg: &InfluxConfig) -> anyhow::Result<Self> {
        let base = Url::parse(&cfg.url)?;
        let mut write_url = base.join("write")?;
        write_url
            .query_pairs_mut()
            .append_pair("db", &cfg.database);

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self { client, write_url })
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write(&self, point: &Point) -> anyhow::Result<()> {
        self.client
            .post(self.write_url.clone())
            .body(point.to_line())
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Handle used by the ingestion path to emit points.
///
/// Cheap to clone; every clone feeds the same bounded queue.
#[derive(Clone)]
pub struct Telemetry {
    tx: Option<mpsc::Sender<Point>>,
    metrics: Arc<RuntimeMetrics>,
}

impl Telemetry {
    pub fn disabled(metrics: Arc<RuntimeMetrics>) -> Self {
        Self { tx: None, metrics }
    }

    /// Builds the Influx writer and its workers from configuration.
    ///
    /// A disabled or broken telemetry section yields a no-op handle;
    /// telemetry is never fatal.
    pub fn from_config(cfg: &InfluxConfig, metrics: Arc<RuntimeMetrics>) -> Self {
        if !cfg.enabled {
            log::info!("Telemetry disabled");
            return Self::disabled(metrics);
        }

        match InfluxWriter::new(cfg) {
            Ok(writer) => Self::spawn(Arc::new(writer), cfg.workers, cfg.queue_size, metrics),
            Err(e) => {
                log::warn!("Could not initialise telemetry, continuing without it: {e}");
                Self::disabled(metrics)
            }
        }
    }

    /// Starts `workers` writer tasks draining a queue of `queue_size`.
    pub fn spawn(
        sink: Arc<dyn PointSink>,
        workers: usize,
        queue_size: usize,
        metrics: Arc<RuntimeMetrics>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Point>(queue_size.max(1));
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let rx = rx.clone();
            let sink = sink.clone();

            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(point) = next else { break };

                    if let Err(e) = sink.write(&point).await {
                        log::warn!("Could not write telemetry point {}: {e}", point.measurement);
                    }
                }
            });
        }

        Self {
            tx: Some(tx),
            metrics,
        }
    }

    /// Enqueues a point without waiting. Drops it if the queue is full.
    pub fn record(&self, point: Point) {
        let Some(tx) = &self.tx else { return };

        match tx.try_send(point) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(point)) => {
                RuntimeMetrics::incr(&self.metrics.telemetry_dropped);
                log::debug!("Telemetry queue full, dropping {}", point.measurement);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    /// Stops this handle from accepting points.
    ///
    /// Clones keep the queue open. Workers exit once every clone is
    /// closed or dropped and the queue has drained; in `main` the role's
    /// clones go away when its future is dropped.
    pub fn close(&mut self) {
        self.tx = None;
    }
}
