use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// What a gateway call was for. Aggregation and "last stats" queries key on
/// this.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Dialogue,
    Profile,
    GuideSelection,
    CommandInterpretation,
}

/// Normalized per-call stats emitted by the gateway.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CallStats {
    pub model: String,
    pub total_time: f64,
    pub time_to_first_token: Option<f64>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CallRecord {
    pub call_type: CallType,
    pub stats: CallStats,
    pub timestamp: DateTime<Local>,
}

#[derive(Clone, Debug, Default)]
struct Aggregate {
    calls: u64,
    total_tokens: u64,
    total_time: f64,
    last: Option<CallStats>,
}

/// Process-wide accounting of gateway calls. Constructed once and injected
/// into the pipeline; append-only, never persisted.
#[derive(Debug, Default)]
pub struct StatsLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    records: Vec<CallRecord>,
    by_type: HashMap<CallType, Aggregate>,
}

impl StatsLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, call_type: CallType, stats: CallStats) {
        let mut inner = self.inner.lock().expect("stats ledger poisoned");
        let agg = inner.by_type.entry(call_type).or_default();
        agg.calls += 1;
        agg.total_tokens += u64::from(stats.total_tokens);
        agg.total_time += stats.total_time;
        agg.last = Some(stats.clone());
        inner.records.push(CallRecord {
            call_type,
            stats,
            timestamp: Local::now(),
        });
    }

    pub fn last_of_type(&self, call_type: CallType) -> Option<CallStats> {
        let inner = self.inner.lock().expect("stats ledger poisoned");
        inner.by_type.get(&call_type).and_then(|a| a.last.clone())
    }

    pub fn call_count(&self, call_type: CallType) -> u64 {
        let inner = self.inner.lock().expect("stats ledger poisoned");
        inner.by_type.get(&call_type).map_or(0, |a| a.calls)
    }

    /// Human-readable session summary, one line per call type plus a total.
    pub fn session_summary(&self) -> String {
        use strum::IntoEnumIterator;

        let inner = self.inner.lock().expect("stats ledger poisoned");
        let mut lines = Vec::new();
        let mut total_calls = 0u64;
        let mut total_tokens = 0u64;
        for call_type in CallType::iter() {
            let Some(agg) = inner.by_type.get(&call_type) else {
                continue;
            };
            total_calls += agg.calls;
            total_tokens += agg.total_tokens;
            lines.push(format!(
                "{}: {} calls, {} tokens, {:.2}s",
                call_type, agg.calls, agg.total_tokens, agg.total_time
            ));
        }
        lines.push(format!(
            "total: {total_calls} calls, {total_tokens} tokens"
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(tokens: u32) -> CallStats {
        CallStats {
            model: "test-model".into(),
            total_time: 0.5,
            input_tokens: tokens / 2,
            output_tokens: tokens - tokens / 2,
            total_tokens: tokens,
            ..Default::default()
        }
    }

    #[test]
    fn aggregates_per_call_type() {
        let ledger = StatsLedger::new();
        ledger.record(CallType::Dialogue, stats(100));
        ledger.record(CallType::Dialogue, stats(40));
        ledger.record(CallType::Profile, stats(10));

        assert_eq!(ledger.call_count(CallType::Dialogue), 2);
        assert_eq!(ledger.call_count(CallType::Profile), 1);
        assert_eq!(ledger.call_count(CallType::GuideSelection), 0);
        assert_eq!(
            ledger.last_of_type(CallType::Dialogue).unwrap().total_tokens,
            40
        );
    }

    #[test]
    fn summary_mentions_each_recorded_type() {
        let ledger = StatsLedger::new();
        ledger.record(CallType::CommandInterpretation, stats(8));
        let summary = ledger.session_summary();
        assert!(summary.contains("command_interpretation: 1 calls"));
        assert!(summary.contains("total: 1 calls, 8 tokens"));
    }
}
