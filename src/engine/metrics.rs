// ── Chatvend Engine: Metrics ───────────────────────────────────────────────
// Process-local atomic counters, rendered as Prometheus text exposition by
// the callback HTTP server. Counters only; gauges come from the store at
// scrape time via the stats use-case.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Metrics {
    /// Inbound Telegram updates accepted for processing.
    pub updates_received: AtomicU64,
    /// Commands rejected by the rate limiter.
    pub rate_limited: AtomicU64,
    /// AI jobs finished per outcome.
    pub jobs_completed: AtomicU64,
    pub jobs_failed: AtomicU64,
    /// Token totals from provider-reported usage.
    pub prompt_tokens: AtomicU64,
    pub completion_tokens: AtomicU64,
    /// Micro-IRR debited from subscriptions.
    pub credits_spent_micros: AtomicU64,
    /// Payment outcomes observed by confirm_auto.
    pub payments_succeeded: AtomicU64,
    pub payments_failed: AtomicU64,
    /// Outbound messenger sends that errored (charge already applied).
    pub delivery_failures: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Prometheus text exposition format, one counter per family.
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            "chatvend_updates_received_total",
            "Inbound Telegram updates accepted",
            self.updates_received.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_rate_limited_total",
            "Commands rejected by the rate limiter",
            self.rate_limited.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_ai_jobs_completed_total",
            "AI jobs completed",
            self.jobs_completed.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_ai_jobs_failed_total",
            "AI jobs failed terminally",
            self.jobs_failed.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_prompt_tokens_total",
            "Prompt tokens reported by providers",
            self.prompt_tokens.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_completion_tokens_total",
            "Completion tokens reported by providers",
            self.completion_tokens.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_credits_spent_micros_total",
            "Micro-IRR debited from subscriptions",
            self.credits_spent_micros.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_payments_succeeded_total",
            "Payments verified successfully",
            self.payments_succeeded.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_payments_failed_total",
            "Payments that failed verification",
            self.payments_failed.load(Ordering::Relaxed),
        );
        counter(
            "chatvend_delivery_failures_total",
            "Assistant replies that could not be delivered",
            self.delivery_failures.load(Ordering::Relaxed),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_contains_counter_families() {
        let m = Metrics::new();
        Metrics::incr(&m.jobs_completed);
        Metrics::add(&m.prompt_tokens, 17);
        let text = m.render();
        assert!(text.contains("chatvend_ai_jobs_completed_total 1"));
        assert!(text.contains("chatvend_prompt_tokens_total 17"));
        assert!(text.contains("# TYPE chatvend_payments_succeeded_total counter"));
    }
}
