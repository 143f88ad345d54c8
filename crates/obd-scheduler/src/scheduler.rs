//! Interlaced Priority Polling
//!
//! The adapter round-trip is slow, so each tick queries every fast key
//! (high-priority or graphed) plus exactly one slow key taken round-robin
//! from the remaining active keys.

use obd_protocol::ObdClient;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, trace};

/// Sensors that are always polled on every tick when active
pub const HIGH_PRIORITY_SENSORS: [&str; 9] = [
    "RPM",
    "SPEED",
    "THROTTLE_POS",
    "ENGINE_LOAD",
    "CONTROL_MODULE_VOLTAGE",
    "BMW_BOOST_PRESSURE",
    "BMW_RAIL_PRESSURE",
    "F150L_HV_BATTERY_CURRENT",
    "VW_HV_BATTERY_CURRENT",
];

/// Configuration for the poll scheduler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Keys polled every tick whenever they are active
    pub high_priority: Vec<String>,
    /// Pause between ticks of a driving loop (ms)
    pub tick_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high_priority: HIGH_PRIORITY_SENSORS.iter().map(|k| k.to_string()).collect(),
            tick_interval_ms: 10,
        }
    }
}

impl SchedulerConfig {
    /// Pause between ticks
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Keys chosen for one tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollPlan {
    /// Every active high-priority or graphed key, in caller order
    pub fast: Vec<String>,
    /// The one slow key due this tick
    pub slow: Option<String>,
    /// Length of the slow queue this tick
    pub slow_queue_len: usize,
}

impl PollPlan {
    /// All keys to query, fast keys first
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fast.iter().chain(self.slow.iter()).map(String::as_str)
    }

    /// Number of requests this tick costs
    pub fn request_count(&self) -> usize {
        self.fast.len() + usize::from(self.slow.is_some())
    }
}

/// Round-robin scheduler over a slow request/response channel
#[derive(Debug, Clone)]
pub struct InterlacedScheduler {
    config: SchedulerConfig,
    high_priority: HashSet<String>,
    /// Position of the next slow key
    cursor: usize,
    ticks: u64,
}

impl Default for InterlacedScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

impl InterlacedScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let high_priority = config.high_priority.iter().cloned().collect();
        Self {
            config,
            high_priority,
            cursor: 0,
            ticks: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current rotation cursor
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Ticks planned so far
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Restart the slow rotation from the first key
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// Whether a key is polled every tick regardless of graphing
    pub fn is_high_priority(&self, key: &str) -> bool {
        self.high_priority.contains(key)
    }

    /// Split the active keys and pick this tick's slow key
    ///
    /// Duplicate active keys count once. Fast membership is recomputed from
    /// scratch on every call.
    pub fn plan<A, G>(&mut self, active: &[A], graphed: &[G]) -> PollPlan
    where
        A: AsRef<str>,
        G: AsRef<str>,
    {
        let graphed: HashSet<&str> = graphed.iter().map(AsRef::as_ref).collect();
        let mut seen = HashSet::new();
        let mut fast = Vec::new();
        let mut slow_queue = Vec::new();

        for key in active.iter().map(AsRef::as_ref) {
            if !seen.insert(key) {
                continue;
            }
            if self.is_high_priority(key) || graphed.contains(key) {
                fast.push(key.to_string());
            } else {
                slow_queue.push(key);
            }
        }

        if self.cursor >= slow_queue.len() {
            if self.cursor > 0 {
                trace!("Slow queue wrapped at {} of {}", self.cursor, slow_queue.len());
            }
            self.cursor = 0;
        }

        let slow = slow_queue.get(self.cursor).map(|key| key.to_string());
        if slow.is_some() {
            self.cursor += 1;
        }
        self.ticks += 1;

        PollPlan {
            fast,
            slow,
            slow_queue_len: slow_queue.len(),
        }
    }

    /// Run one tick against the client
    ///
    /// Returns readings for the keys queried this tick that produced a
    /// value; nothing is carried over from earlier ticks.
    pub async fn poll_tick<A, G>(
        &mut self,
        client: &mut ObdClient,
        active: &[A],
        graphed: &[G],
    ) -> BTreeMap<String, f64>
    where
        A: AsRef<str>,
        G: AsRef<str>,
    {
        let plan = self.plan(active, graphed);
        let mut readings = BTreeMap::new();

        for key in plan.keys() {
            if let Some(value) = client.query_sensor(key).await {
                readings.insert(key.to_string(), value);
            }
        }

        debug!(
            "Tick {}: {} fast, slow {:?}, {} reading(s)",
            self.ticks,
            plan.fast.len(),
            plan.slow,
            readings.len()
        );
        readings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obd_protocol::mock::MockAdapter;
    use obd_protocol::ClientConfig;
    use proptest::prelude::*;

    const NONE: [&str; 0] = [];

    #[test]
    fn test_fast_and_slow_partition() {
        let mut scheduler = InterlacedScheduler::default();
        let active = ["RPM", "COOLANT_TEMP", "SPEED", "FUEL_LEVEL", "MAF"];
        let plan = scheduler.plan(&active, &["MAF"]);

        assert_eq!(plan.fast, vec!["RPM", "SPEED", "MAF"]);
        assert_eq!(plan.slow.as_deref(), Some("COOLANT_TEMP"));
        assert_eq!(plan.slow_queue_len, 2);
        assert_eq!(plan.request_count(), 4);

        let plan = scheduler.plan(&active, &["MAF"]);
        assert_eq!(plan.slow.as_deref(), Some("FUEL_LEVEL"));
        let plan = scheduler.plan(&active, &["MAF"]);
        assert_eq!(plan.slow.as_deref(), Some("COOLANT_TEMP"));
    }

    #[test]
    fn test_graphed_inactive_key_is_not_polled() {
        let mut scheduler = InterlacedScheduler::default();
        let plan = scheduler.plan(&["FUEL_LEVEL"], &["MAF"]);
        assert!(plan.fast.is_empty());
        assert_eq!(plan.slow.as_deref(), Some("FUEL_LEVEL"));
    }

    #[test]
    fn test_fast_membership_is_not_sticky() {
        let mut scheduler = InterlacedScheduler::default();
        let active = ["MAF", "FUEL_LEVEL"];
        let plan = scheduler.plan(&active, &["MAF"]);
        assert_eq!(plan.fast, vec!["MAF"]);
        let plan = scheduler.plan(&active, &NONE);
        assert!(plan.fast.is_empty());
        assert_eq!(plan.slow_queue_len, 2);
    }

    #[test]
    fn test_empty_slow_queue_skips_extra_query() {
        let mut scheduler = InterlacedScheduler::default();
        let plan = scheduler.plan(&["RPM", "SPEED"], &NONE);
        assert_eq!(plan.slow, None);
        assert_eq!(plan.request_count(), 2);
        assert_eq!(scheduler.cursor(), 0);
    }

    #[test]
    fn test_cursor_resets_on_shrink() {
        let mut scheduler = InterlacedScheduler::default();
        let wide = ["A1", "A2", "A3", "A4"];
        for _ in 0..3 {
            scheduler.plan(&wide, &NONE);
        }
        assert_eq!(scheduler.cursor(), 3);

        let plan = scheduler.plan(&["A1", "A2"], &NONE);
        assert_eq!(plan.slow.as_deref(), Some("A1"));
        assert_eq!(scheduler.cursor(), 1);
    }

    #[test]
    fn test_custom_high_priority_list() {
        let mut scheduler = InterlacedScheduler::new(SchedulerConfig {
            high_priority: vec!["OIL_TEMP".to_string()],
            ..Default::default()
        });
        let plan = scheduler.plan(&["RPM", "OIL_TEMP"], &NONE);
        assert_eq!(plan.fast, vec!["OIL_TEMP"]);
        assert_eq!(plan.slow.as_deref(), Some("RPM"));
    }

    #[tokio::test]
    async fn test_poll_tick_returns_only_queried_keys() {
        let mut client = ObdClient::mock();
        let mut scheduler = InterlacedScheduler::default();
        let active = ["RPM", "FUEL_LEVEL", "COOLANT_TEMP", "NOT_A_SENSOR"];

        let first = scheduler.poll_tick(&mut client, &active, &NONE).await;
        assert_eq!(first.len(), 2);
        assert!(first.contains_key("RPM"));
        assert_eq!(first.get("FUEL_LEVEL"), Some(&75.0));

        let second = scheduler.poll_tick(&mut client, &active, &NONE).await;
        assert!(second.contains_key("COOLANT_TEMP"));
        assert!(!second.contains_key("FUEL_LEVEL"));

        // Unknown key yields no value and is absent
        let third = scheduler.poll_tick(&mut client, &active, &NONE).await;
        assert_eq!(third.len(), 1);
        assert!(third.contains_key("RPM"));
    }

    #[tokio::test]
    async fn test_request_count_on_the_wire() {
        let adapter = MockAdapter::vehicle();
        let mut client = ObdClient::new(ClientConfig {
            timeout_ms: 200,
            connect_timeout_ms: 200,
            ..Default::default()
        });
        assert!(client.connect_transport(Box::new(adapter.clone()), "mock").await);

        let mut scheduler = InterlacedScheduler::default();
        let active = ["RPM", "SPEED", "COOLANT_TEMP", "FUEL_LEVEL", "MAF"];
        let before = adapter.sent().len();
        let readings = scheduler.poll_tick(&mut client, &active, &NONE).await;

        let sent = adapter.sent()[before..].to_vec();
        assert_eq!(sent, vec!["010C", "010D", "0105"]);
        assert_eq!(readings.get("RPM"), Some(&1726.0));
        assert_eq!(readings.get("COOLANT_TEMP"), Some(&75.0));
    }

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("SLOW_{}", i)).collect()
    }

    proptest! {
        #[test]
        fn prop_every_slow_key_visited_once_per_cycle(slow in 1usize..20, fast in 0usize..5) {
            let mut scheduler = InterlacedScheduler::default();
            let mut active: Vec<String> = HIGH_PRIORITY_SENSORS[..fast].iter().map(|k| k.to_string()).collect();
            active.extend(keys(slow));

            let mut visited = Vec::new();
            for _ in 0..slow {
                let plan = scheduler.plan(&active, &NONE);
                prop_assert_eq!(plan.request_count(), fast + 1);
                visited.extend(plan.slow);
            }
            visited.sort();
            let mut expected = keys(slow);
            expected.sort();
            prop_assert_eq!(visited, expected);
        }

        #[test]
        fn prop_cursor_stays_valid_under_changing_sets(sizes in proptest::collection::vec(0usize..12, 1..40)) {
            let mut scheduler = InterlacedScheduler::default();
            for size in sizes {
                let active = keys(size);
                let plan = scheduler.plan(&active, &NONE);
                prop_assert_eq!(plan.slow.is_some(), size > 0);
                prop_assert!(scheduler.cursor() <= size);
                if let Some(slow) = plan.slow {
                    prop_assert!(active.contains(&slow));
                }
            }
        }
    }
}
