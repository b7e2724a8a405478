//! Test run results.
//!
//! [`TestRunResult`] consumes the lifecycle events of one named run (possibly
//! re-run several times under the same name) and keeps an ordered, queryable
//! model of per-test outcomes for reporting.

mod linked;
pub mod run;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use linked::LinkedMap;
pub use run::TestRunResult;

/// Identity of a single test case.
///
/// # Example
///
/// ```
/// use devicepool::result::TestDescription;
///
/// let test = TestDescription::new("com.example.FooTest", "testBar");
/// assert_eq!(test.to_string(), "com.example.FooTest#testBar");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestDescription {
    /// Suite or class the test belongs to.
    pub class_name: String,
    /// Name of the test case.
    pub test_name: String,
}

impl TestDescription {
    pub fn new(class_name: impl Into<String>, test_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            test_name: test_name.into(),
        }
    }
}

impl std::fmt::Display for TestDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.class_name, self.test_name)
    }
}

/// Outcome of a single test.
///
/// Declaration order is the order used by reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    /// Started but not ended.
    Incomplete,
    Passed,
    Failure,
    /// A precondition of the test did not hold.
    AssumptionFailure,
    Ignored,
}

impl TestStatus {
    /// Every status in declaration order.
    pub const ALL: [TestStatus; 5] = [
        TestStatus::Incomplete,
        TestStatus::Passed,
        TestStatus::Failure,
        TestStatus::AssumptionFailure,
        TestStatus::Ignored,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::Incomplete => "incomplete",
            TestStatus::Passed => "passed",
            TestStatus::Failure => "failure",
            TestStatus::AssumptionFailure => "assumption_failure",
            TestStatus::Ignored => "ignored",
        }
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of data a saved log holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDataType {
    #[default]
    Text,
    Logcat,
    Bugreport,
    Screenshot,
    Zip,
}

/// A log saved during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogFile {
    /// Local path of the saved file.
    pub path: String,
    /// Where the file was uploaded, if anywhere.
    pub url: Option<String>,
    pub data_type: LogDataType,
}

impl LogFile {
    pub fn new(path: impl Into<String>, data_type: LogDataType) -> Self {
        Self {
            path: path.into(),
            url: None,
            data_type,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Result of one test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub status: TestStatus,

    /// Start time in milliseconds since the epoch.
    pub start_time_ms: i64,

    /// End time in milliseconds since the epoch, once ended.
    pub end_time_ms: Option<i64>,

    /// Failure trace, for failed tests.
    pub stack_trace: Option<String>,

    pub metrics: HashMap<String, String>,

    /// Logs saved while the test was running, in save order.
    pub logs: LinkedMap<String, LogFile>,
}

impl TestResult {
    /// A fresh incomplete result.
    pub fn new(start_time_ms: i64) -> Self {
        Self {
            status: TestStatus::Incomplete,
            start_time_ms,
            end_time_ms: None,
            stack_trace: None,
            metrics: HashMap::new(),
            logs: LinkedMap::new(),
        }
    }

    /// Wall time between start and end, if ended.
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time_ms.map(|end| end - self.start_time_ms)
    }
}
