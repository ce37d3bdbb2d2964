// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded polling for state that converges eventually.
//!
//! Every wait in the harness goes through [`wait_for_result`] or
//! [`wait_for_decoded`]: a probe is invoked up to `attempts` times with a
//! fixed `interval` between invocations until a [`Matcher`] accepts its
//! result. There is no backoff or jitter: the worst-case duration of a wait
//! is `attempts × interval`.

use std::fmt;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::{debug, error};

/// The attempt budget for one wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
pub struct PollPolicy {
    /// The maximum number of times to invoke the probe.
    pub attempts: u32,

    /// The delay between two consecutive probes.
    #[serde(rename = "interval_secs", deserialize_with = "duration_from_secs")]
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    pub const fn from_secs(attempts: u32, interval_secs: u64) -> Self {
        Self::new(attempts, Duration::from_secs(interval_secs))
    }

    /// Converts a timeout/interval pair into an attempt budget. At least one
    /// attempt is always made.
    pub fn from_timeout(timeout: Duration, interval: Duration) -> Self {
        let attempts = if interval.is_zero() {
            1
        } else {
            let n = timeout.as_millis().div_ceil(interval.as_millis());
            u32::try_from(n).unwrap_or(u32::MAX).max(1)
        };
        Self { attempts, interval }
    }

    /// The longest a wait under this policy can spend sleeping.
    pub fn budget(&self) -> Duration {
        self.interval.saturating_mul(self.attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::from_secs(20, 5)
    }
}

fn duration_from_secs<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

#[derive(Debug, Error)]
pub enum PollError<T: fmt::Debug> {
    #[error(
        "timed out waiting for {description} after {attempts} attempts \
         (last observed: {last:?})"
    )]
    TimedOut { description: String, attempts: u32, last: Option<T> },

    #[error("probe failed while waiting for {description}: {error:#}")]
    Probe { description: String, error: anyhow::Error },
}

impl<T: fmt::Debug> PollError<T> {
    /// Returns the last value the probe produced before the budget ran out.
    pub fn last_observed(&self) -> Option<&T> {
        match self {
            PollError::TimedOut { last, .. } => last.as_ref(),
            PollError::Probe { .. } => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::TimedOut { .. })
    }
}

/// A predicate over a probe result.
pub trait Matcher<T: ?Sized> {
    fn matches(&self, value: &T) -> bool;
}

impl<T: ?Sized, F> Matcher<T> for F
where
    F: Fn(&T) -> bool,
{
    fn matches(&self, value: &T) -> bool {
        self(value)
    }
}

/// Matches values equal to the wrapped one.
#[derive(Clone, Debug)]
pub struct Equals<T>(pub T);

impl<T: PartialEq> Matcher<T> for Equals<T> {
    fn matches(&self, value: &T) -> bool {
        *value == self.0
    }
}

/// Counts non-overlapping matches of a pattern in status text.
#[derive(Clone, Debug)]
pub struct RegexCount {
    pattern: Regex,
    count: usize,
    exact: bool,
}

impl RegexCount {
    /// Matches text containing at least one occurrence of `pattern`.
    pub fn any(pattern: Regex) -> Self {
        Self::at_least(pattern, 1)
    }

    pub fn at_least(pattern: Regex, count: usize) -> Self {
        Self { pattern, count, exact: false }
    }

    pub fn exactly(pattern: Regex, count: usize) -> Self {
        Self { pattern, count, exact: true }
    }

    fn occurrences(&self, text: &str) -> usize {
        self.pattern.find_iter(text).count()
    }
}

impl<S: AsRef<str> + ?Sized> Matcher<S> for RegexCount {
    fn matches(&self, value: &S) -> bool {
        let found = self.occurrences(value.as_ref());
        if self.exact {
            found == self.count
        } else {
            found >= self.count
        }
    }
}

/// Invokes `probe` until `matcher` accepts its result or the policy's budget
/// is exhausted.
pub fn wait_for_result<T, P, M>(
    policy: PollPolicy,
    description: &str,
    probe: P,
    matcher: &M,
) -> Result<T, PollError<T>>
where
    T: fmt::Debug,
    P: FnMut() -> anyhow::Result<T>,
    M: Matcher<T> + ?Sized,
{
    wait_for_decoded(policy, description, probe, |raw| raw, matcher)
}

/// Like [`wait_for_result`], but passes each raw probe result through
/// `decode` before it reaches the matcher.
pub fn wait_for_decoded<R, T, P, D, M>(
    policy: PollPolicy,
    description: &str,
    mut probe: P,
    decode: D,
    matcher: &M,
) -> Result<T, PollError<T>>
where
    T: fmt::Debug,
    P: FnMut() -> anyhow::Result<R>,
    D: Fn(R) -> T,
    M: Matcher<T> + ?Sized,
{
    let started = Instant::now();
    let mut last = None;

    for attempt in 1..=policy.attempts {
        let raw = probe().map_err(|error| PollError::Probe {
            description: description.to_owned(),
            error,
        })?;

        let value = decode(raw);
        if matcher.matches(&value) {
            debug!(
                description,
                attempt,
                elapsed = ?started.elapsed(),
                "Poll condition satisfied"
            );
            return Ok(value);
        }

        debug!(description, attempt, ?value, "Poll condition not yet met");
        last = Some(value);
        if attempt < policy.attempts {
            std::thread::sleep(policy.interval);
        }
    }

    error!(
        description,
        attempts = policy.attempts,
        last = ?last,
        "Timed out waiting for result"
    );

    Err(PollError::TimedOut {
        description: description.to_owned(),
        attempts: policy.attempts,
        last,
    })
}
