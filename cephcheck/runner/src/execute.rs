// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::info;

use crate::checks::{Check, CheckOutcome};
use crate::filter::CheckFilter;

/// Statistics returned after executing a set of checks.
#[derive(Debug)]
pub struct ExecutionStats {
    pub checks_passed: u32,
    pub checks_failed: u32,

    /// The number of checks that decided they did not apply.
    pub checks_skipped: u32,

    /// The number of selected checks the runner never started, because the
    /// run was interrupted.
    pub checks_not_run: u32,

    pub duration: Duration,

    pub failed_checks: Vec<&'static str>,
}

/// Runs the checks `filter` selects, one at a time, in declaration order.
pub fn run_checks<C>(
    ctx: &C,
    checks: &[Check<C>],
    filter: &CheckFilter<'_>,
    interrupted: &AtomicBool,
) -> ExecutionStats {
    let selected: Vec<_> = checks.iter().filter(|c| filter.check(c.name)).collect();
    let mut stats = ExecutionStats {
        checks_passed: 0,
        checks_failed: 0,
        checks_skipped: 0,
        checks_not_run: selected.len() as u32,
        duration: Duration::default(),
        failed_checks: Vec::new(),
    };

    if selected.is_empty() {
        info!("No checks selected for execution");
        return stats;
    }

    info!("Running {} check(s)", selected.len());
    let start_time = Instant::now();
    for check in selected {
        if interrupted.load(Ordering::SeqCst) {
            info!("Check run interrupted by SIGINT");
            break;
        }

        info!("Starting check {}", check.name);
        stats.checks_not_run -= 1;
        let outcome = check.run(ctx);

        info!(
            "check {} ... {}{}",
            check.name,
            match outcome {
                CheckOutcome::Passed => "ok",
                CheckOutcome::Failed(_) => "FAILED: ",
                CheckOutcome::Skipped(_) => "skipped: ",
            },
            match &outcome {
                CheckOutcome::Failed(Some(s)) | CheckOutcome::Skipped(Some(s)) => s,
                CheckOutcome::Failed(None) | CheckOutcome::Skipped(None) => "[no message]",
                CheckOutcome::Passed => "",
            }
        );

        match outcome {
            CheckOutcome::Passed => stats.checks_passed += 1,
            CheckOutcome::Failed(_) => {
                stats.checks_failed += 1;
                stats.failed_checks.push(check.name);
            }
            CheckOutcome::Skipped(_) => stats.checks_skipped += 1,
        }
    }
    stats.duration = start_time.elapsed();

    stats
}
