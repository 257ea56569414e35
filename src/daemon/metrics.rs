//! Throughput counters for the inference worker.
//!
//! Only the worker thread mutates these; they never influence control flow.

use std::time::{Duration, Instant};
use tracing::info;

/// Emit cumulative totals after every this many requests.
pub const TOTALS_EVERY: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Counters {
    pub prompt_tokens: u64,
    pub prompt_time: Duration,
    pub generated_tokens: u64,
    pub generation_time: Duration,
}

impl Counters {
    pub fn prompt_rate(&self) -> f64 {
        rate(self.prompt_tokens, self.prompt_time)
    }

    pub fn generation_rate(&self) -> f64 {
        rate(self.generated_tokens, self.generation_time)
    }

    fn add(&mut self, other: &Counters) {
        self.prompt_tokens += other.prompt_tokens;
        self.prompt_time += other.prompt_time;
        self.generated_tokens += other.generated_tokens;
        self.generation_time += other.generation_time;
    }
}

fn rate(tokens: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        tokens as f64 / secs
    } else {
        0.0
    }
}

#[derive(Debug)]
pub struct Metrics {
    started: Instant,
    requests: u64,
    completed: u64,
    current: Counters,
    total: Counters,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            requests: 0,
            completed: 0,
            current: Counters::default(),
            total: Counters::default(),
        }
    }

    /// Open a new request and reset its counters.
    pub fn on_request_start(&mut self) {
        self.requests += 1;
        self.current = Counters::default();
    }

    pub fn on_prompt_eval(&mut self, tokens: usize, elapsed: Duration) {
        self.current.prompt_tokens += tokens as u64;
        self.current.prompt_time += elapsed;
    }

    pub fn on_token_generated(&mut self, elapsed: Duration) {
        self.current.generated_tokens += 1;
        self.current.generation_time += elapsed;
    }

    /// Fold the request into the totals and log its summary.
    ///
    /// Runs for aborted requests too, with whatever was counted so far.
    pub fn on_request_end(&mut self) {
        self.completed += 1;
        self.total.add(&self.current);

        let c = &self.current;
        info!(
            request = self.requests,
            prompt_tokens = c.prompt_tokens,
            prompt_ms = c.prompt_time.as_millis() as u64,
            prompt_tps = %format!("{:.1}", c.prompt_rate()),
            generated_tokens = c.generated_tokens,
            generation_ms = c.generation_time.as_millis() as u64,
            generation_tps = %format!("{:.1}", c.generation_rate()),
            "Request metrics"
        );

        if self.requests % TOTALS_EVERY == 0 {
            let t = &self.total;
            info!(
                requests = self.requests,
                uptime_s = self.started.elapsed().as_secs(),
                prompt_tokens = t.prompt_tokens,
                prompt_tps = %format!("{:.1}", t.prompt_rate()),
                generated_tokens = t.generated_tokens,
                generation_tps = %format!("{:.1}", t.generation_rate()),
                "Total metrics"
            );
        }
    }

    /// Requests started so far.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Requests whose bookkeeping has been closed, successful or not.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn current(&self) -> &Counters {
        &self.current
    }

    pub fn total(&self) -> &Counters {
        &self.total
    }
}
