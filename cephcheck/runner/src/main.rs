// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

mod checks;
mod config;
mod execute;
mod filter;
mod sweep;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use camino::Utf8Path;
use cephcheck_framework::BringUp;
use clap::Parser;
use config::{ListOptions, ProcessArgs, RunOptions};
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::execute::ExecutionStats;
use crate::filter::CheckFilter;

fn main() -> anyhow::Result<()> {
    let runner_args = ProcessArgs::parse();
    let log_guard = set_tracing_subscriber(&runner_args)?;

    info!(?runner_args);

    let exit_code = match &runner_args.command {
        config::Command::Run(opts) => {
            let stats = run(opts, &runner_args)?;
            stats.map_or(0, |s| s.checks_failed)
        }
        config::Command::List(opts) => {
            list_checks(opts);
            0
        }
        config::Command::Sweep(opts) => {
            let config = runner_args.load_config(&config::Overrides::default())?;
            sweep::sweep(&config, opts)?;
            0
        }
    };

    debug!(exit_code);
    drop(log_guard);
    std::process::exit(i32::try_from(exit_code).unwrap_or(i32::MAX));
}

fn run(
    run_opts: &RunOptions,
    runner_args: &ProcessArgs,
) -> anyhow::Result<Option<ExecutionStats>> {
    let config = runner_args.load_config(&run_opts.overrides)?;
    info!(config = ?config::masked(&config), "Resolved configuration");

    let interrupted = set_sigint_handler()?;
    let env = BringUp::new(&config)
        .interrupt_flag(interrupted.clone())
        .run()
        .inspect_err(|e| error!(error = ?e, "Bring-up failed"))?;

    for (stage, elapsed) in env.progress().timings() {
        info!(%stage, elapsed_secs = elapsed.as_secs_f64(), "Stage reached");
    }
    if run_opts.bring_up_only {
        return Ok(None);
    }

    let filter = CheckFilter {
        must_include: &run_opts.include_filter,
        must_exclude: &run_opts.exclude_filter,
    };
    let execution_stats = execute::run_checks(&env, checks::ALL, &filter, &interrupted);

    // Tear down before reporting so the summary is the last thing printed.
    drop(env);

    if !execution_stats.failed_checks.is_empty() {
        println!("\nfailures:");
        for name in &execution_stats.failed_checks {
            println!("    {name}");
        }
        println!();
    }

    println!(
        "check result: {}. {} passed; {} failed; {} skipped; {} not run; \
        finished in {:.2}s\n",
        if execution_stats.checks_failed != 0 { "FAILED" } else { "ok" },
        execution_stats.checks_passed,
        execution_stats.checks_failed,
        execution_stats.checks_skipped,
        execution_stats.checks_not_run,
        execution_stats.duration.as_secs_f64()
    );

    Ok(Some(execution_stats))
}

fn list_checks(list_opts: &ListOptions) {
    println!("Checks enabled after applying filters:\n");

    let filter = CheckFilter {
        must_include: &list_opts.include_filter,
        must_exclude: &list_opts.exclude_filter,
    };
    let mut count = 0;
    for check in checks::ALL.iter().filter(|c| filter.check(c.name)) {
        println!("    {}", check.name);
        count += 1
    }

    println!("\n{} check(s) selected", count);
}

/// Sets a flag on the first SIGINT so the run stops at the next stage or
/// check boundary and tears down. A second SIGINT exits at once.
fn set_sigint_handler() -> anyhow::Result<Arc<AtomicBool>> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            error!("SIGINT received while shutting down, rudely terminating");
            error!("some nodes and volumes may have been leaked!");
            std::process::exit(130);
        }
        warn!("SIGINT received, stopping at the next boundary");
    })
    .context("installing SIGINT handler")?;
    Ok(interrupted)
}

fn set_tracing_subscriber(args: &ProcessArgs) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();

    let (file_layer, guard) = match &args.log_file {
        Some(path) => {
            let dir = path.parent().filter(|d| !d.as_str().is_empty()).unwrap_or(Utf8Path::new("."));
            let name = path.file_name().context("--log-file must name a file")?;
            std::fs::create_dir_all(dir).with_context(|| format!("creating {dir}"))?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let subscriber = Registry::default().with(filter).with(file_layer);
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("cephcheck-runner".into(), std::io::stdout);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let stdout_log = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stdout_log);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(guard)
}
