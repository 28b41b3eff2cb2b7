// SPDX-License-Identifier: Apache-2.0

//! `tf-master` — inspect and validate trainflow experiment configurations.
//!
//! The master itself is embedded by a launcher that owns the transport to
//! the worker fleet; this binary covers the pre-flight story: load an
//! experiment config, build its dataflow graph, and print the execution
//! plan a master would run.

use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use std::io::Write;
use std::path::{Path, PathBuf};
use trainflow_config::{ExperimentConfig, Hook};

#[derive(Parser)]
#[command(name = "tf-master", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate an experiment configuration and print its execution plan.
    Validate {
        /// Path to the experiment JSON.
        #[arg(long, short)]
        config: PathBuf,
    },
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Validate { config } => validate(&config),
    }
}

fn validate(path: &Path) -> miette::Result<()> {
    let raw = std::fs::read_to_string(path).into_diagnostic()?;
    let mut config: ExperimentConfig = serde_json::from_str(&raw).into_diagnostic()?;

    let promotions = config.promote_batch_floors();
    let graph = config.validate()?;

    let mut out = std::io::stdout().lock();
    let mut emit = |line: String| writeln!(out, "{line}").into_diagnostic();

    emit(format!(
        "experiment `{}` trial `{}`: {} models, {} workers, {} RPCs",
        config.experiment_name,
        config.trial_name,
        config.deployments.len(),
        config
            .placements
            .iter()
            .map(|p| p.worker)
            .collect::<std::collections::BTreeSet<_>>()
            .len(),
        graph.rpcs().len(),
    ))?;

    for d in &config.deployments {
        emit(format!(
            "  model {:24} topology {} ({} shards)",
            d.name.to_string(),
            d.topology,
            d.topology.world_size(),
        ))?;
    }

    emit("execution plan (topological order):".to_owned())?;
    for &idx in graph.topological_order() {
        let rpc = graph.rpc(idx);
        let role = match (graph.is_src(idx), graph.is_dst(idx)) {
            (true, true) => "src+dst",
            (true, false) => "src",
            (false, true) => "dst",
            (false, false) => "mid",
        };
        let parents: Vec<&str> = graph
            .parents_of(idx)
            .iter()
            .map(|&p| graph.rpc(p).name.as_ref())
            .collect();
        let hooks = rpc
            .pre_hooks
            .iter()
            .chain(&rpc.post_hooks)
            .map(|h| match h {
                Hook::SyncParam { .. } => "sync_param",
                Hook::Offload => "offload",
            })
            .collect::<Vec<_>>();
        emit(format!(
            "  {:16} {} on {} [{}] seqs {}..={} concurrency {}{}{}",
            rpc.name.as_ref(),
            rpc.interface_type,
            rpc.model_name,
            role,
            rpc.min_n_seqs,
            rpc.max_n_seqs,
            rpc.max_concurrent_calls,
            if parents.is_empty() {
                String::new()
            } else {
                format!(" after {}", parents.join(", "))
            },
            if hooks.is_empty() {
                String::new()
            } else {
                format!(" hooks [{}]", hooks.join(", "))
            },
        ))?;
    }

    for p in &promotions {
        emit(format!(
            "note: min_n_seqs of `{}` promoted {} -> {} (dp*pp floor)",
            p.rpc, p.from, p.to,
        ))?;
    }

    emit("configuration is valid".to_owned())?;
    Ok(())
}
