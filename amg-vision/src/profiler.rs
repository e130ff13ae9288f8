//! Scoped profiling: spans recorded as Chrome trace events
//!
//! [`TraceRecorder`] is a `tracing_subscriber` layer. It stays idle until a
//! profiling session is started, then turns every span that opens and
//! closes during the session into a "complete" event and every event into
//! an "instant" event. Spans on [`DEVICE_TARGET`] are categorised as device
//! work, everything else as host work. Span fields (input shapes, precision,
//! device) travel along as event arguments.

use crate::error::VisionError;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{info_span, Event, Metadata, Subscriber};
use tracing_subscriber::filter::{filter_fn, FilterFn};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Target for spans that wrap work submitted to the compute device
pub const DEVICE_TARGET: &str = "amg_vision::device";

const HOST_CATEGORY: &str = "cpu_op";
const DEVICE_CATEGORY: &str = "gpu_op";

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static TID: u64 = NEXT_TID.fetch_add(1, Ordering::Relaxed);
}

fn current_tid() -> u64 {
    TID.with(|tid| *tid)
}

/// One entry of a Chrome trace (`chrome://tracing`, Perfetto)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub cat: String,
    /// Phase: `X` complete, `i` instant
    pub ph: String,
    /// Start, microseconds since the session began
    pub ts: f64,
    /// Duration in microseconds (complete events only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dur: Option<f64>,
    pub pid: u32,
    pub tid: u64,
    #[serde(default)]
    pub args: Map<String, Value>,
}

#[derive(Serialize)]
struct ChromeTrace<'a> {
    #[serde(rename = "traceEvents")]
    trace_events: &'a [TraceEvent],
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: &'static str,
}

/// Span bookkeeping kept in the registry's extensions
struct SpanTiming {
    start: Instant,
    tid: u64,
    args: Map<String, Value>,
}

#[derive(Default)]
struct JsonVisitor {
    args: Map<String, Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.args.insert(field.name().to_string(), Value::String(format!("{:?}", value)));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.args.insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.args.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.args.insert(field.name().to_string(), Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.args.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.args.insert(field.name().to_string(), Value::from(value));
    }
}

struct RecorderState {
    active: AtomicBool,
    epoch: Mutex<Instant>,
    events: Mutex<Vec<TraceEvent>>,
}

/// Collects trace events while a profiling session is active
#[derive(Clone)]
pub struct TraceRecorder {
    state: Arc<RecorderState>,
}

impl Default for TraceRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RecorderState {
                active: AtomicBool::new(false),
                epoch: Mutex::new(Instant::now()),
                events: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Begin a session, discarding anything left from a previous one
    pub fn start(&self) {
        self.state.events.lock().clear();
        *self.state.epoch.lock() = Instant::now();
        self.state.active.store(true, Ordering::SeqCst);
    }

    /// End the session and take its events
    pub fn stop(&self) -> Vec<TraceEvent> {
        self.state.active.store(false, Ordering::SeqCst);
        std::mem::take(&mut *self.state.events.lock())
    }

    pub fn is_active(&self) -> bool {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Per-layer filter that disables every callsite for this recorder
    /// outside a session, so an idle recorder never sees spans or events.
    pub fn active_filter(&self) -> FilterFn<impl Fn(&Metadata<'_>) -> bool> {
        let state = Arc::clone(&self.state);
        filter_fn(move |_| state.active.load(Ordering::SeqCst))
    }

    fn micros_since_epoch(&self, at: Instant) -> f64 {
        let epoch = *self.state.epoch.lock();
        at.saturating_duration_since(epoch).as_secs_f64() * 1e6
    }

    fn push(&self, event: TraceEvent) {
        self.state.events.lock().push(event);
    }
}

fn category(target: &str) -> &'static str {
    if target == DEVICE_TARGET {
        DEVICE_CATEGORY
    } else {
        HOST_CATEGORY
    }
}

impl<S> Layer<S> for TraceRecorder
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if !self.is_active() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        span.extensions_mut().insert(SpanTiming {
            start: Instant::now(),
            tid: current_tid(),
            args: visitor.args,
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(timing) = extensions.get_mut::<SpanTiming>() {
            let mut visitor = JsonVisitor { args: std::mem::take(&mut timing.args) };
            values.record(&mut visitor);
            timing.args = visitor.args;
        }
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !self.is_active() {
            return;
        }
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();
        let name = visitor
            .args
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(metadata.name())
            .to_string();
        self.push(TraceEvent {
            name,
            cat: category(metadata.target()).to_string(),
            ph: "i".to_string(),
            ts: self.micros_since_epoch(Instant::now()),
            dur: None,
            pid: std::process::id(),
            tid: current_tid(),
            args: visitor.args,
        });
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        if !self.is_active() {
            return;
        }
        let Some(span) = ctx.span(&id) else { return };
        let end = Instant::now();
        let extensions = span.extensions();
        if let Some(timing) = extensions.get::<SpanTiming>() {
            let metadata = span.metadata();
            self.push(TraceEvent {
                name: metadata.name().to_string(),
                cat: category(metadata.target()).to_string(),
                ph: "X".to_string(),
                ts: self.micros_since_epoch(timing.start),
                dur: Some(end.saturating_duration_since(timing.start).as_secs_f64() * 1e6),
                pid: std::process::id(),
                tid: timing.tid,
                args: timing.args.clone(),
            });
        }
    }
}

/// Serialise events as a Chrome trace; gzip-compressed when the path ends in `.gz`
pub fn write_chrome_trace(path: &Path, events: &[TraceEvent]) -> Result<(), VisionError> {
    let unwritable = |e: &dyn std::fmt::Display| {
        VisionError::Format(format!("Cannot write trace to {}: {}", path.display(), e))
    };

    let file = File::create(path).map_err(|e| unwritable(&e))?;
    let document = ChromeTrace {
        trace_events: events,
        display_time_unit: "ms",
    };

    let gzip = path.extension().map_or(false, |ext| ext == "gz");
    if gzip {
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, &document).map_err(|e| unwritable(&e))?;
        let mut writer = encoder.finish().map_err(|e| unwritable(&e))?;
        writer.flush().map_err(|e| unwritable(&e))?;
    } else {
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &document).map_err(|e| unwritable(&e))?;
        writer.flush().map_err(|e| unwritable(&e))?;
    }
    Ok(())
}

/// Run `f` inside a profiling session and export what it recorded to `path`.
///
/// The destination is printed before the file is written. A failing `f`
/// propagates its error and no trace is written.
pub fn profile_run<T, F>(recorder: &TraceRecorder, path: &Path, f: F) -> Result<T, VisionError>
where
    F: FnOnce() -> Result<T, VisionError>,
{
    recorder.start();
    let result = {
        let _span = info_span!("profile_run", path = %path.display()).entered();
        f()
    };
    let events = recorder.stop();
    let value = result?;

    println!("Saving trace under {}", path.display());
    write_chrome_trace(path, &events)?;
    Ok(value)
}
