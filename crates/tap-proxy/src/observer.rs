//! Metric extraction from upstream responses
//!
//! Extraction is best effort. Each field is an independent lookup and a
//! missing or mistyped field means "no observation", never an error. Nothing
//! here can fail the proxied request.

use crate::ProxyError;
use serde_json::Value;
use std::time::Instant;
use tap_metrics::{MetricsRegistry, TokenPhase};
use tracing::{debug, trace};

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

/// Longest partial record kept while waiting for a newline
pub const MAX_PENDING_RECORD_BYTES: usize = 1024 * 1024;

/// Fields of interest in a (final) response record. Durations are reported
/// by the upstream in nanoseconds and normalised to seconds here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationStats {
    pub prompt_tokens: Option<u64>,
    pub generated_tokens: Option<u64>,
    pub prompt_eval_seconds: Option<f64>,
    pub eval_seconds: Option<f64>,
    pub load_seconds: Option<f64>,
    pub total_seconds: Option<f64>,
}

impl GenerationStats {
    pub fn from_value(value: &Value) -> Self {
        let usage = value.get("usage");

        Self {
            prompt_tokens: count(value.get("prompt_eval_count"))
                .or_else(|| count(usage.and_then(|u| u.get("prompt_tokens")))),
            generated_tokens: count(value.get("eval_count"))
                .or_else(|| count(usage.and_then(|u| u.get("completion_tokens")))),
            prompt_eval_seconds: nanos_to_seconds(value.get("prompt_eval_duration")),
            eval_seconds: nanos_to_seconds(value.get("eval_duration")),
            load_seconds: nanos_to_seconds(value.get("load_duration")),
            total_seconds: nanos_to_seconds(value.get("total_duration")),
        }
    }

    /// Generated tokens per second, if generation time was positive
    pub fn eval_rate(&self) -> Option<f64> {
        rate(self.generated_tokens, self.eval_seconds)
    }

    /// Prompt tokens per second, if prompt processing time was positive
    pub fn prompt_eval_rate(&self) -> Option<f64> {
        rate(self.prompt_tokens, self.prompt_eval_seconds)
    }

    /// Prompt plus generated tokens, if either was reported
    pub fn context_length(&self) -> Option<u64> {
        match (self.prompt_tokens, self.generated_tokens) {
            (None, None) => None,
            (p, g) => Some(p.unwrap_or(0) + g.unwrap_or(0)),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn count(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| f.is_finite() && *f >= 0.0).map(|f| f as u64))
}

fn nanos_to_seconds(value: Option<&Value>) -> Option<f64> {
    value?
        .as_f64()
        .filter(|f| f.is_finite() && *f >= 0.0)
        .map(|nanos| nanos / NANOS_PER_SECOND)
}

fn rate(tokens: Option<u64>, seconds: Option<f64>) -> Option<f64> {
    match (tokens, seconds) {
        (Some(tokens), Some(seconds)) if seconds > 0.0 => Some(tokens as f64 / seconds),
        _ => None,
    }
}

/// Whether a record carries any newly generated text
pub fn has_partial_text(value: &Value) -> bool {
    let non_empty = |v: Option<&Value>| v.and_then(Value::as_str).is_some_and(|s| !s.is_empty());

    if non_empty(value.get("response")) {
        return true;
    }
    if non_empty(value.get("message").and_then(|m| m.get("content"))) {
        return true;
    }
    if let Some(choice) = value.get("choices").and_then(|c| c.get(0)) {
        return non_empty(choice.get("delta").and_then(|d| d.get("content")))
            || non_empty(choice.get("text"));
    }
    false
}

/// Whether a streamed record carries the final statistics
pub fn is_final_record(value: &Value) -> bool {
    value.get("done").and_then(Value::as_bool) == Some(true)
        || value.get("usage").is_some_and(Value::is_object)
}

/// Records generation metrics for parsed response objects
#[derive(Debug, Clone)]
pub struct ResponseObserver {
    registry: MetricsRegistry,
}

impl ResponseObserver {
    pub fn new(registry: MetricsRegistry) -> Self {
        Self { registry }
    }

    /// Extract and record whatever statistics `value` carries
    pub fn observe(&self, model: &str, value: &Value) -> GenerationStats {
        let stats = GenerationStats::from_value(value);

        if let Some(tokens) = stats.prompt_tokens {
            self.registry.record_prompt_tokens(model, tokens);
        }
        if let Some(tokens) = stats.generated_tokens {
            self.registry.record_generated_tokens(model, tokens);
        }
        if let Some(rate) = stats.eval_rate() {
            self.registry.record_tokens_per_second(model, TokenPhase::Eval, rate);
        }
        if let Some(rate) = stats.prompt_eval_rate() {
            self.registry.record_tokens_per_second(model, TokenPhase::PromptEval, rate);
        }
        if let Some(seconds) = stats.load_seconds {
            self.registry.record_model_load(model, seconds);
        }
        if let Some(tokens) = stats.context_length().filter(|t| *t > 0) {
            self.registry.record_context_length(model, tokens);
        }

        trace!(model, ?stats, "Observed response statistics");
        stats
    }

    /// Parse a buffered body and observe it. An unparseable body records
    /// nothing.
    pub fn observe_body(&self, model: &str, body: &[u8]) -> Option<GenerationStats> {
        match serde_json::from_slice::<Value>(body) {
            Ok(value) => Some(self.observe(model, &value)),
            Err(e) => {
                let err = ProxyError::MalformedUpstreamResponse(e.to_string());
                debug!(model, "Skipping metrics: {}", err);
                None
            }
        }
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }
}

/// Per-response scratch state for a streamed body
#[derive(Debug, Clone, Default)]
pub struct StreamingExtractionState {
    pub first_token_seen_at: Option<Instant>,
    pub last_parsed_chunk: Option<Value>,
}

/// Reassembles newline-delimited records from a streamed body and records
/// time-to-first-token and the final statistics.
///
/// Accepts plain NDJSON and server-sent events (`data: {...}` lines, with
/// the `[DONE]` sentinel ignored). Records that fail to parse are skipped.
#[derive(Debug)]
pub struct StreamObserver {
    observer: ResponseObserver,
    model: String,
    request_start: Instant,
    state: StreamingExtractionState,
    buffer: Vec<u8>,
    resync: bool,
    final_stats: Option<GenerationStats>,
    parse_failures: usize,
}

impl StreamObserver {
    pub fn new(observer: ResponseObserver, model: impl Into<String>, request_start: Instant) -> Self {
        Self {
            observer,
            model: model.into(),
            request_start,
            state: StreamingExtractionState::default(),
            buffer: Vec::new(),
            resync: false,
            final_stats: None,
            parse_failures: 0,
        }
    }

    /// Feed bytes read from upstream at `arrival`
    pub fn push(&mut self, bytes: &[u8], arrival: Instant) {
        let mut bytes = bytes;

        if self.resync {
            match bytes.iter().position(|b| *b == b'\n') {
                Some(pos) => {
                    bytes = &bytes[pos + 1..];
                    self.resync = false;
                }
                None => return,
            }
        }

        self.buffer.extend_from_slice(bytes);

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.process_line(&line, arrival);
        }

        if self.buffer.len() > MAX_PENDING_RECORD_BYTES {
            debug!(
                model = %self.model,
                pending = self.buffer.len(),
                "Dropping oversized stream record"
            );
            self.buffer.clear();
            self.resync = true;
        }
    }

    /// Some bytes were not delivered to the observer. The partial record in
    /// the buffer is discarded. Unless the undelivered bytes ended with a
    /// newline, parsing resumes after the next one.
    pub fn mark_gap(&mut self, ended_on_newline: bool) {
        self.buffer.clear();
        self.resync = !ended_on_newline;
    }

    /// Flush a trailing record without a newline and return the final state
    pub fn finish(mut self) -> StreamSummary {
        if !self.buffer.is_empty() && !self.resync {
            let line = std::mem::take(&mut self.buffer);
            self.process_line(&line, Instant::now());
        }

        StreamSummary {
            time_to_first_token: self
                .state
                .first_token_seen_at
                .map(|t| t.duration_since(self.request_start)),
            final_stats: self.final_stats,
            parse_failures: self.parse_failures,
            last_parsed_chunk: self.state.last_parsed_chunk,
        }
    }

    pub fn state(&self) -> &StreamingExtractionState {
        &self.state
    }

    fn process_line(&mut self, line: &[u8], arrival: Instant) {
        let line = trim_ascii(line);
        let line = line.strip_prefix(b"data:").map(trim_ascii).unwrap_or(line);
        if line.is_empty() || line == b"[DONE]" || line.starts_with(b":") {
            return;
        }

        let value: Value = match serde_json::from_slice(line) {
            Ok(value) => value,
            Err(e) => {
                self.parse_failures += 1;
                let err = ProxyError::ChunkParseError(e.to_string());
                debug!(model = %self.model, "Skipping stream record: {}", err);
                return;
            }
        };

        if self.state.first_token_seen_at.is_none() && has_partial_text(&value) {
            self.state.first_token_seen_at = Some(arrival);
            self.observer
                .registry()
                .record_time_to_first_token(&self.model, arrival.duration_since(self.request_start));
        }

        if self.final_stats.is_none() && is_final_record(&value) {
            self.final_stats = Some(self.observer.observe(&self.model, &value));
        }

        self.state.last_parsed_chunk = Some(value);
    }
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &bytes[start..end]
}

/// What a finished stream yielded
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub time_to_first_token: Option<std::time::Duration>,
    pub final_stats: Option<GenerationStats>,
    pub parse_failures: usize,
    pub last_parsed_chunk: Option<Value>,
}
