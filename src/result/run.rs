//! Aggregation of one named test run.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use super::{LinkedMap, LogFile, TestDescription, TestResult, TestStatus};
use crate::config::ResultsConfig;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Results of a single test run.
///
/// Mutators take `&mut self`: exactly one pipeline drives a run. Per-status
/// counts are computed lazily and cached behind their own lock, so readers
/// holding `&self` can still fill the cache.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use devicepool::result::{TestDescription, TestRunResult, TestStatus};
///
/// let mut run = TestRunResult::new();
/// let test = TestDescription::new("FooTest", "testBar");
///
/// run.test_run_started("suite", 1);
/// run.test_started(&test);
/// run.test_ended(&test, HashMap::new());
/// run.test_run_ended(1200, HashMap::new());
///
/// assert_eq!(run.num_tests_in_state(TestStatus::Passed), 1);
/// assert_eq!(run.text_summary(), "Total tests 1, passed 1, ");
/// ```
#[derive(Debug)]
pub struct TestRunResult {
    name: String,
    results: LinkedMap<TestDescription, TestResult>,
    run_metrics: HashMap<String, String>,
    run_logs: LinkedMap<String, LogFile>,
    elapsed_ms: i64,
    complete: bool,
    failure_message: Option<String>,
    aggregate_metrics: bool,
    /// Tests started and not yet ended, most recent last.
    open_tests: Vec<TestDescription>,
    status_counts: Mutex<Option<HashMap<TestStatus, usize>>>,
}

impl Default for TestRunResult {
    fn default() -> Self {
        Self::new()
    }
}

impl TestRunResult {
    pub fn new() -> Self {
        Self {
            name: "not started".to_string(),
            results: LinkedMap::new(),
            run_metrics: HashMap::new(),
            run_logs: LinkedMap::new(),
            elapsed_ms: 0,
            complete: false,
            failure_message: None,
            aggregate_metrics: false,
            open_tests: Vec::new(),
            status_counts: Mutex::new(None),
        }
    }

    /// A fresh run honouring the `[results]` settings.
    pub fn from_config(config: &ResultsConfig) -> Self {
        let mut run = Self::new();
        run.set_aggregate_metrics(config.aggregate_metrics);
        run
    }

    /// Numeric run metrics are summed across re-runs instead of overwritten.
    pub fn set_aggregate_metrics(&mut self, aggregate: bool) {
        self.aggregate_metrics = aggregate;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Results in the order tests were first started.
    pub fn test_results(&self) -> &LinkedMap<TestDescription, TestResult> {
        &self.results
    }

    pub fn get(&self, test: &TestDescription) -> Option<&TestResult> {
        self.results.get(test)
    }

    pub fn run_metrics(&self) -> &HashMap<String, String> {
        &self.run_metrics
    }

    /// Logs saved while no test was running.
    pub fn run_logged_files(&self) -> &LinkedMap<String, LogFile> {
        &self.run_logs
    }

    /// Tests that are no longer incomplete, in run order.
    pub fn completed_tests(&self) -> Vec<&TestDescription> {
        self.results
            .iter()
            .filter(|(_, r)| r.status != TestStatus::Incomplete)
            .map(|(t, _)| t)
            .collect()
    }

    pub fn num_tests(&self) -> usize {
        self.results.len()
    }

    pub fn num_complete_tests(&self) -> usize {
        self.num_tests() - self.num_tests_in_state(TestStatus::Incomplete)
    }

    pub fn has_failed_tests(&self) -> bool {
        self.num_all_failed_tests() > 0
    }

    /// Number of tests in [`TestStatus::Failure`].
    ///
    /// Assumption failures are not counted.
    pub fn num_all_failed_tests(&self) -> usize {
        self.num_tests_in_state(TestStatus::Failure)
    }

    /// Accumulated elapsed time over every end or stop, in milliseconds.
    pub fn elapsed_time(&self) -> i64 {
        self.elapsed_ms
    }

    pub fn run_failure_message(&self) -> Option<&str> {
        self.failure_message.as_deref()
    }

    pub fn is_run_failure(&self) -> bool {
        self.failure_message.is_some()
    }

    pub fn is_run_complete(&self) -> bool {
        self.complete
    }

    pub fn set_run_complete(&mut self, complete: bool) {
        self.complete = complete;
    }

    /// Number of tests currently in `status`.
    pub fn num_tests_in_state(&self, status: TestStatus) -> usize {
        let mut cache = self
            .status_counts
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let counts = cache.get_or_insert_with(|| {
            let mut counts = HashMap::new();
            for result in self.results.values() {
                *counts.entry(result.status).or_insert(0) += 1;
            }
            counts
        });
        counts.get(&status).copied().unwrap_or(0)
    }

    /// Drops the cached per-status counts.
    pub fn invalidate(&mut self) {
        *self
            .status_counts
            .get_mut()
            .unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Starts (or restarts) the run.
    ///
    /// A failure message recorded by an earlier attempt is kept until a later
    /// [`test_run_failed`](Self::test_run_failed) replaces it.
    pub fn test_run_started(&mut self, name: impl Into<String>, test_count: usize) {
        self.name = name.into();
        self.complete = false;
        debug!(run = %self.name, test_count, "Test run started");
    }

    pub fn test_started(&mut self, test: &TestDescription) {
        self.test_started_at(test, now_ms());
    }

    /// Records a fresh incomplete result, replacing any earlier one.
    pub fn test_started_at(&mut self, test: &TestDescription, start_time_ms: i64) {
        self.open_tests.retain(|t| t != test);
        self.open_tests.push(test.clone());
        self.results
            .insert(test.clone(), TestResult::new(start_time_ms));
        self.invalidate();
    }

    pub fn test_failed(&mut self, test: &TestDescription, trace: impl Into<String>) {
        self.update_status(test, TestStatus::Failure, Some(trace.into()));
    }

    pub fn test_assumption_failure(&mut self, test: &TestDescription, trace: impl Into<String>) {
        self.update_status(test, TestStatus::AssumptionFailure, Some(trace.into()));
    }

    pub fn test_ignored(&mut self, test: &TestDescription) {
        self.update_status(test, TestStatus::Ignored, None);
    }

    pub fn test_ended(&mut self, test: &TestDescription, metrics: HashMap<String, String>) {
        self.test_ended_at(test, now_ms(), metrics);
    }

    /// Ends a test. An incomplete test passes; any other status is kept.
    pub fn test_ended_at(
        &mut self,
        test: &TestDescription,
        end_time_ms: i64,
        metrics: HashMap<String, String>,
    ) {
        if let Some(pos) = self.open_tests.iter().rposition(|t| t == test) {
            self.open_tests.remove(pos);
        }
        let result = self.result_entry(test, end_time_ms);
        if result.status == TestStatus::Incomplete {
            result.status = TestStatus::Passed;
        }
        result.end_time_ms = Some(end_time_ms);
        result.metrics = metrics;
        self.invalidate();
    }

    /// Records a run-level failure. The latest message wins.
    pub fn test_run_failed(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(run = %self.name, "Test run failed: {}", message);
        self.failure_message = Some(message);
    }

    /// Ends the run, merging `metrics` into the run metrics.
    pub fn test_run_ended(&mut self, elapsed_ms: i64, metrics: HashMap<String, String>) {
        for (key, value) in metrics {
            let value = if self.aggregate_metrics {
                combine_values(self.run_metrics.get(&key).map(String::as_str), value)
            } else {
                value
            };
            self.run_metrics.insert(key, value);
        }
        self.elapsed_ms += elapsed_ms;
        self.complete = true;
    }

    /// Ends the run abruptly; metrics are left alone.
    pub fn test_run_stopped(&mut self, elapsed_ms: i64) {
        self.elapsed_ms += elapsed_ms;
        self.complete = true;
    }

    /// Saves a log against the most recently started test that has not ended,
    /// or against the run if none is open.
    pub fn test_log_saved(&mut self, name: impl Into<String>, file: LogFile) {
        let name = name.into();
        let open = match self.open_tests.last() {
            Some(test) => self.results.get_mut(test),
            None => None,
        };
        match open {
            Some(result) => {
                result.logs.insert(name, file);
            }
            None => {
                self.run_logs.insert(name, file);
            }
        }
    }

    /// Saves a log against `test` regardless of which tests are open.
    pub fn test_log_saved_for(
        &mut self,
        test: &TestDescription,
        name: impl Into<String>,
        file: LogFile,
    ) {
        let result = self.result_entry(test, now_ms());
        result.logs.insert(name.into(), file);
        self.invalidate();
    }

    /// `"Total tests N, "` followed by `"<status> <count>, "` for each status
    /// with a non-zero count.
    pub fn text_summary(&self) -> String {
        let mut summary = format!("Total tests {}, ", self.num_tests());
        for status in TestStatus::ALL {
            let count = self.num_tests_in_state(status);
            if count > 0 {
                summary.push_str(&format!("{} {}, ", status, count));
            }
        }
        summary
    }

    fn update_status(&mut self, test: &TestDescription, status: TestStatus, trace: Option<String>) {
        if !self.results.contains_key(test) {
            debug!(test = %test, "Received test event without test start");
        }
        let result = self.result_entry(test, now_ms());
        result.status = status;
        result.stack_trace = trace;
        self.invalidate();
    }

    fn result_entry(&mut self, test: &TestDescription, start_time_ms: i64) -> &mut TestResult {
        self.results
            .get_or_insert_with(test.clone(), || TestResult::new(start_time_ms))
    }
}

/// Combines two metric values: integer sum, else real sum, else the new value.
fn combine_values(existing: Option<&str>, new: String) -> String {
    let Some(existing) = existing else {
        return new;
    };
    if let (Ok(a), Ok(b)) = (existing.parse::<i64>(), new.parse::<i64>()) {
        if let Some(sum) = a.checked_add(b) {
            return sum.to_string();
        }
    }
    if let (Ok(a), Ok(b)) = (existing.parse::<f64>(), new.parse::<f64>()) {
        return format!("{:?}", a + b);
    }
    new
}
