use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::iter::once;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

/// A set of key-value pairs with unique keys.
///
/// A `Metric` records one series for each unique set of `Attributes`.
#[derive(Debug, Clone, Default, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Attributes(BTreeMap<&'static str, Cow<'static, str>>);

impl Attributes {
    pub fn iter(&self) -> std::collections::btree_map::Iter<'_, &'static str, Cow<'static, str>> {
        self.0.iter()
    }

    /// Sets the given key, overriding it if already set.
    pub fn insert(&mut self, key: &'static str, value: impl Into<Cow<'static, str>>) {
        assert_legal_key(key);
        self.0.insert(key, value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a, const N: usize> From<&'a [(&'static str, &'static str); N]> for Attributes {
    fn from(pairs: &'a [(&'static str, &'static str); N]) -> Self {
        pairs
            .iter()
            .map(|(key, value)| (*key, Cow::Borrowed(*value)))
            .collect()
    }
}

impl<const N: usize> From<[(&'static str, Cow<'static, str>); N]> for Attributes {
    fn from(pairs: [(&'static str, Cow<'static, str>); N]) -> Self {
        pairs.into_iter().collect()
    }
}

impl FromIterator<(&'static str, Cow<'static, str>)> for Attributes {
    fn from_iter<T: IntoIterator<Item = (&'static str, Cow<'static, str>)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(key, value)| {
                    assert_legal_key(key);
                    (key, value)
                })
                .collect(),
        )
    }
}

/// Panics if the provided string does not match [0-9a-z_]+
fn assert_legal_key(s: &str) {
    assert!(!s.is_empty(), "string must not be empty");
    assert!(
        s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='z' | '_')),
        "string must be [0-9a-z_]+ got: \"{s}\""
    )
}

#[derive(Clone, Debug)]
pub enum Observation {
    Counter(u64),
    Gauge(u64),
    Histogram(HistogramObservation),
}

/// Series types must expose a snapshot of their current value, and know
/// how to construct themselves from family-level options.
pub trait Observer: Clone + Send + 'static {
    type Options: Clone + Send + Sync;

    fn create(options: &Self::Options) -> Self;

    fn observe(&self) -> Observation;
}

#[derive(Clone, Debug, Default)]
pub struct Counter {
    state: Arc<AtomicU64>,
}

impl Counter {
    pub fn inc(&self, value: u64) {
        self.state.fetch_add(value, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl Observer for Counter {
    type Options = ();

    fn create(_options: &Self::Options) -> Self {
        Self::default()
    }

    fn observe(&self) -> Observation {
        Observation::Counter(self.fetch())
    }
}

#[derive(Clone, Debug, Default)]
pub struct Gauge {
    state: Arc<AtomicU64>,
}

impl Gauge {
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self, value: u64) {
        self.state.fetch_add(value, Ordering::Relaxed);
    }

    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl Observer for Gauge {
    type Options = ();

    fn create(_options: &Self::Options) -> Self {
        Self::default()
    }

    fn observe(&self) -> Observation {
        Observation::Gauge(self.fetch())
    }
}

#[derive(Clone, Debug)]
pub struct ObservationBucket {
    pub le: f64,
    pub count: u64,
}

#[derive(Clone, Debug)]
pub struct HistogramObservation {
    pub buckets: Vec<ObservationBucket>,
    pub sum: f64,
}

#[derive(Clone, Debug)]
pub struct Histogram {
    state: Arc<Mutex<HistogramObservation>>,
}

impl Histogram {
    pub fn new(buckets: impl Iterator<Item = f64>) -> Self {
        let buckets = buckets
            .chain(once(f64::INFINITY))
            .map(|le| ObservationBucket { le, count: 0 })
            .collect::<Vec<_>>();

        Self {
            state: Arc::new(Mutex::new(HistogramObservation { buckets, sum: 0.0 })),
        }
    }

    pub fn record(&self, value: f64) {
        let mut state = self.state.lock();

        if let Some(bucket) = state.buckets.iter_mut().find(|b| value <= b.le) {
            bucket.count = bucket.count.wrapping_add(1);
            state.sum += value;
        }
    }

    pub fn get(&self) -> HistogramObservation {
        self.state.lock().clone()
    }
}

impl Observer for Histogram {
    type Options = Vec<f64>;

    fn create(options: &Self::Options) -> Self {
        if options.is_empty() {
            return Histogram::new(exponential_buckets(1.0, 2.0, 10));
        }

        let mut buckets = options.clone();
        buckets.sort_by(|a, b| a.total_cmp(b));
        buckets.dedup();

        Histogram::new(buckets.into_iter())
    }

    fn observe(&self) -> Observation {
        Observation::Histogram(self.get())
    }
}

pub fn exponential_buckets(start: f64, factor: f64, length: u64) -> impl Iterator<Item = f64> {
    (0..length as usize).map(move |i| start * factor.powf(i as f64))
}

/// A named family of series, one per unique attribute set.
#[derive(Clone)]
pub struct Metric<M: Observer> {
    name: &'static str,
    description: &'static str,
    shard: Arc<Mutex<BTreeMap<Attributes, M>>>,
    options: M::Options,
}

impl<M: Observer> Metric<M> {
    pub fn recorder(&self, attributes: impl Into<Attributes>) -> M {
        self.shard
            .lock()
            .entry(attributes.into())
            .or_insert_with(|| M::create(&self.options))
            .clone()
    }
}

#[derive(Clone, Default)]
pub struct Registry {
    counters: Arc<Mutex<BTreeMap<&'static str, Metric<Counter>>>>,
    gauges: Arc<Mutex<BTreeMap<&'static str, Metric<Gauge>>>>,
    histograms: Arc<Mutex<BTreeMap<&'static str, Metric<Histogram>>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(
        &self,
        name: &'static str,
        description: &'static str,
    ) -> Metric<Counter> {
        assert_legal_key(name);

        self.counters
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
                options: (),
            })
            .clone()
    }

    pub fn register_gauge(&self, name: &'static str, description: &'static str) -> Metric<Gauge> {
        assert_legal_key(name);

        self.gauges
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
                options: (),
            })
            .clone()
    }

    pub fn register_histogram(
        &self,
        name: &'static str,
        description: &'static str,
        buckets: impl Iterator<Item = f64>,
    ) -> Metric<Histogram> {
        assert_legal_key(name);

        let options = buckets.collect::<Vec<f64>>();

        self.histograms
            .lock()
            .entry(name)
            .or_insert_with(|| Metric {
                name,
                description,
                shard: Arc::new(Mutex::new(BTreeMap::new())),
                options,
            })
            .clone()
    }

    /// Render all registered series in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut buf = String::with_capacity(4 * 1024);

        for metric in self.counters.lock().values() {
            let shard = metric.shard.lock();
            if shard.is_empty() {
                continue;
            }

            let name = metric.name;
            write_header(&mut buf, name, metric.description, "counter");
            for (attrs, series) in shard.iter() {
                if let Observation::Counter(value) = series.observe() {
                    write_series(&mut buf, name, attrs, &[], &value.to_string());
                }
            }
        }

        for metric in self.gauges.lock().values() {
            let shard = metric.shard.lock();
            if shard.is_empty() {
                continue;
            }

            let name = metric.name;
            write_header(&mut buf, name, metric.description, "gauge");
            for (attrs, series) in shard.iter() {
                if let Observation::Gauge(value) = series.observe() {
                    write_series(&mut buf, name, attrs, &[], &value.to_string());
                }
            }
        }

        for metric in self.histograms.lock().values() {
            let shard = metric.shard.lock();
            if shard.is_empty() {
                continue;
            }

            let name = metric.name;
            write_header(&mut buf, name, metric.description, "histogram");
            for (attrs, series) in shard.iter() {
                let Observation::Histogram(observation) = series.observe() else {
                    continue;
                };

                let mut count = 0;
                let bucket_name = format!("{name}_bucket");
                for bucket in &observation.buckets {
                    count += bucket.count;

                    let le = if bucket.le == f64::INFINITY {
                        "+Inf".to_string()
                    } else {
                        bucket.le.to_string()
                    };

                    write_series(
                        &mut buf,
                        &bucket_name,
                        attrs,
                        &[("le", &le)],
                        &count.to_string(),
                    );
                }

                write_series(
                    &mut buf,
                    &format!("{name}_sum"),
                    attrs,
                    &[],
                    &observation.sum.to_string(),
                );
                write_series(&mut buf, &format!("{name}_count"), attrs, &[], &count.to_string());
            }
        }

        buf
    }
}

fn write_header(buf: &mut String, name: &str, description: &str, kind: &str) {
    writeln!(buf, "# HELP {name} {description}").ok();
    writeln!(buf, "# TYPE {name} {kind}").ok();
}

fn write_series(buf: &mut String, name: &str, attrs: &Attributes, extra: &[(&str, &str)], value: &str) {
    if attrs.is_empty() && extra.is_empty() {
        writeln!(buf, "{name} {value}").ok();
        return;
    }

    let labels = attrs
        .iter()
        .map(|(k, v)| format!("{k}=\"{v}\""))
        .chain(extra.iter().map(|(k, v)| format!("{k}=\"{v}\"")))
        .collect::<Vec<_>>()
        .join(",");

    writeln!(buf, "{name}{{{labels}}} {value}").ok();
}

static GLOBAL_REGISTRY: OnceLock<Registry> = OnceLock::new();

pub fn global_registry() -> Registry {
    GLOBAL_REGISTRY.get_or_init(Registry::new).clone()
}

pub fn register_counter(name: &'static str, description: &'static str) -> Metric<Counter> {
    global_registry().register_counter(name, description)
}

pub fn register_gauge(name: &'static str, description: &'static str) -> Metric<Gauge> {
    global_registry().register_gauge(name, description)
}

pub fn register_histogram(
    name: &'static str,
    description: &'static str,
    buckets: impl Iterator<Item = f64>,
) -> Metric<Histogram> {
    global_registry().register_histogram(name, description, buckets)
}
