//! Assertions over captured command output and HTTP probe outcomes.
//!
//! Every check returns `Ok(())` (logging a `SUCCESS:` line) or a [`Failure`]
//! that carries both the expectation and what was actually observed. Use `?`
//! to abort the current step on the first failure, or collect failures with
//! [`Checks`] to report every violated expectation of a step at once.

use crate::probe::Outcome;
use std::{fmt, time::Duration};

/// A violated expectation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Failure {
    message: String,
    detail: Option<String>,
}

/// Collects the failures of several checks without stopping at the first.
#[derive(Debug, Default)]
#[must_use]
pub struct Checks {
    failures: Vec<Failure>,
}

// === impl Failure ===

impl Failure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    /// Attaches the full actual value (output, body, diff) to the failure.
    pub fn with_detail(self, detail: impl Into<String>) -> Self {
        Self {
            detail: Some(detail.into()),
            ..self
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}; {}", self.message, detail),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Failure {}

// === impl Checks ===

impl Checks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the result of a check. Returns true if the check passed.
    pub fn record(&mut self, result: Result<(), Failure>) -> bool {
        match result {
            Ok(()) => true,
            Err(failure) => {
                tracing::warn!("FAILURE: {failure}");
                self.failures.push(failure);
                false
            }
        }
    }

    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Fails with every recorded failure if any check did not pass.
    pub fn finish(self) -> Result<(), Failure> {
        let mut failures = self.failures;
        match failures.len() {
            0 => Ok(()),
            1 => Err(failures.remove(0)),
            n => {
                let detail = failures
                    .iter()
                    .map(|f| format!("- {f}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(Failure::new(format!("{n} checks failed")).with_detail(detail))
            }
        }
    }
}

fn success(msg: impl fmt::Display) -> Result<(), Failure> {
    tracing::info!("SUCCESS: {msg}");
    Ok(())
}

// === output ===

pub fn output_contains(output: &str, expected: &str) -> Result<(), Failure> {
    output_contains_any(output, &[expected])
}

/// Passes if at least one of `expected` occurs in `output`.
pub fn output_contains_any<S: AsRef<str>>(output: &str, expected: &[S]) -> Result<(), Failure> {
    if let Some(found) = expected.iter().find(|s| output.contains(s.as_ref())) {
        return success(format_args!("string '{}' found in output", found.as_ref()));
    }

    let message = match expected {
        [one] => format!(
            "expected to find the string '{}' in the output, but it wasn't found",
            one.as_ref()
        ),
        _ => format!(
            "expected to find any of {:?} in the output, but none was found",
            expected.iter().map(AsRef::as_ref).collect::<Vec<_>>()
        ),
    };
    Err(Failure::new(message).with_detail(format!("full output:\n{output}")))
}

pub fn output_does_not_contain(output: &str, unexpected: &str) -> Result<(), Failure> {
    if output.contains(unexpected) {
        return Err(Failure::new(format!(
            "expected the string '{unexpected}' to be absent from the output, but it was present"
        ))
        .with_detail(format!("full output:\n{output}")));
    }
    success(format_args!("string '{unexpected}' not found in output"))
}

/// Passes if `pattern` (a regular expression) matches somewhere in `output`.
pub fn output_matches(output: &str, pattern: &str) -> Result<(), Failure> {
    let re = regex::Regex::new(pattern)
        .map_err(|error| Failure::new(format!("invalid pattern {pattern:?}: {error}")))?;
    if re.is_match(output) {
        return success(format_args!("output matches /{pattern}/"));
    }
    Err(
        Failure::new(format!("expected the output to match /{pattern}/, but it didn't"))
            .with_detail(format!("full output:\n{output}")),
    )
}

/// Passes if `expected` occurs exactly `times` times in `output`.
pub fn count_occurrences(output: &str, expected: &str, times: usize) -> Result<(), Failure> {
    let found = output.matches(expected).count();
    if found == times {
        return success(format_args!("string '{expected}' found {times} time(s) in output"));
    }
    Err(Failure::new(format!(
        "expected to find the string '{expected}' {times} time(s) in the output, but found it {found} time(s)"
    ))
    .with_detail(format!("full output:\n{output}")))
}

// === responses ===

pub fn status(outcome: &Outcome, expected: u16) -> Result<(), Failure> {
    let rsp = require_response(outcome)?;
    if rsp.status.as_u16() == expected {
        return success(format_args!("received status {}", rsp.status));
    }
    Err(Failure::new(format!(
        "expected status code {expected} but got {}",
        rsp.status
    )))
}

pub fn body_contains(outcome: &Outcome, expected: &str) -> Result<(), Failure> {
    let rsp = require_response(outcome)?;
    let body = rsp.text();
    if body.contains(expected) {
        return success(format_args!("string '{expected}' found in response"));
    }
    Err(Failure::new(format!(
        "expected to find the string '{expected}' in the response, but it wasn't found"
    ))
    .with_detail(format!("full response:\n{body}")))
}

pub fn body_does_not_contain(outcome: &Outcome, unexpected: &str) -> Result<(), Failure> {
    let rsp = require_response(outcome)?;
    let body = rsp.text();
    if body.contains(unexpected) {
        return Err(Failure::new(format!(
            "expected the string '{unexpected}' to be absent from the response, but it was present"
        ))
        .with_detail(format!("full response:\n{body}")));
    }
    success(format_args!("string '{unexpected}' not found in response"))
}

/// Passes if the round trip of the probe took between `min` and `max`.
pub fn duration_in_range(outcome: &Outcome, min: Duration, max: Duration) -> Result<(), Failure> {
    let rsp = require_response(outcome)?;
    let elapsed = Duration::from_millis(rsp.elapsed.as_millis() as u64);
    if min <= rsp.elapsed && rsp.elapsed <= max {
        return success(format_args!(
            "request completed in {elapsed:?}, which is within the expected range {min:?} - {max:?}"
        ));
    }
    Err(Failure::new(format!(
        "expected request duration to be between {min:?} and {max:?}, but was {elapsed:?}"
    )))
}

/// Passes if the request completed at the transport level, whatever its
/// status.
pub fn request_succeeds(outcome: &Outcome) -> Result<(), Failure> {
    match outcome {
        Ok(rsp) => success(format_args!("request succeeded with status {}", rsp.status)),
        Err(error) => Err(Failure::new(format!(
            "expected request to succeed, but it failed: {}",
            error.chain_to_string()
        ))),
    }
}

/// Passes if the request could not be completed (connection reset, TLS
/// handshake failure, ...).
pub fn request_fails(outcome: &Outcome) -> Result<(), Failure> {
    match outcome {
        Err(error) => success(format_args!(
            "request failed as expected: {}",
            error.chain_to_string()
        )),
        Ok(rsp) => Err(Failure::new(format!(
            "expected request to fail, but it succeeded with status {}",
            rsp.status
        ))
        .with_detail(format!("full response:\n{}", rsp.text()))),
    }
}

/// Passes if the request failed with an error whose chain mentions any of
/// `messages`.
pub fn request_fails_with_any<S: AsRef<str>>(outcome: &Outcome, messages: &[S]) -> Result<(), Failure> {
    let error = match outcome {
        Err(error) => error.chain_to_string(),
        Ok(rsp) => {
            return Err(Failure::new(format!(
                "expected request to fail, but it succeeded with status {}",
                rsp.status
            )))
        }
    };
    if let Some(found) = messages.iter().find(|m| error.contains(m.as_ref())) {
        return success(format_args!(
            "request failed with the expected error '{}'",
            found.as_ref()
        ));
    }
    Err(Failure::new(format!(
        "expected request to fail with any of {:?}, but it failed with: {error}",
        messages.iter().map(AsRef::as_ref).collect::<Vec<_>>()
    )))
}

fn require_response(outcome: &Outcome) -> Result<&crate::probe::ProbeResponse, Failure> {
    outcome.as_ref().map_err(|error| {
        Failure::new("no response; the HTTP request must have failed")
            .with_detail(error.chain_to_string())
    })
}

// === distributions ===

/// Returns true iff `count` lies in the band `[(rate - tolerance) * total,
/// (rate + tolerance) * total]`, with both bounds truncated toward zero.
pub fn is_within_percentage(count: usize, total: usize, rate: f64, tolerance: f64) -> bool {
    let total = total as f64;
    let minimum = ((rate - tolerance) * total) as i64;
    let maximum = ((rate + tolerance) * total) as i64;
    let count = count as i64;
    minimum <= count && count <= maximum
}

/// Check form of [`is_within_percentage`], used to validate weighted traffic
/// splits.
pub fn within_percentage(
    what: &str,
    count: usize,
    total: usize,
    rate: f64,
    tolerance: f64,
) -> Result<(), Failure> {
    if is_within_percentage(count, total, rate, tolerance) {
        return success(format_args!(
            "{what}: {count}/{total} is within {:.0}% ± {:.0}%",
            rate * 100.0,
            tolerance * 100.0
        ));
    }
    Err(Failure::new(format!(
        "{what}: expected {:.0}% ± {:.0}% of {total} requests, but got {count}",
        rate * 100.0,
        tolerance * 100.0
    )))
}
