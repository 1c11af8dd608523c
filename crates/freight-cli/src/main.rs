use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use freight_adapters::KfzAuthenticator;
use freight_core::RunPhase;
use freight_sync::{
    load_template, BatchOrchestrator, NoopProgressSink, ProgressSink, RunConfig, RunRequest,
    TracingProgressSink,
};
use tokio_util::sync::CancellationToken;
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "freight")]
#[command(about = "Reassign shipping profiles on listings, one price bracket at a time")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Validate the template, fetch every bracket, then apply the profiles.
    Run(RunArgs),
    /// Check a template without touching the network.
    Validate {
        #[arg(long)]
        template: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    template: PathBuf,
    #[arg(long, env = "FREIGHT_USERNAME")]
    username: String,
    #[arg(long, env = "FREIGHT_PASSWORD", hide_env_values = true)]
    password: String,
    /// Parent directory for the timestamped run directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// `itemUnit` value sent with every bulk change.
    #[arg(long)]
    unit_weight: Option<String>,
    /// Only print the final outcome line.
    #[arg(long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { template } => {
            let brackets = load_template(&template)?;
            println!("template ok: {} brackets", brackets.len());
            for bracket in &brackets {
                println!("  {} -> {}", bracket.range_label(), bracket.profile_name);
            }
        }
        Commands::Run(args) => {
            let code = run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
    }

    Ok(())
}

async fn run(args: RunArgs) -> Result<i32> {
    let mut config = RunConfig::from_env();
    if let Some(dir) = args.output_dir {
        config.output_root = dir;
    }
    if let Some(weight) = args.unit_weight {
        config.unit_weight = weight;
    }

    let authenticator = Arc::new(KfzAuthenticator::new(config.kfz_settings()));
    let progress: Arc<dyn ProgressSink> = if args.quiet {
        Arc::new(NoopProgressSink)
    } else {
        Arc::new(TracingProgressSink)
    };
    let orchestrator = Arc::new(BatchOrchestrator::new(config, authenticator, progress));
    let request = RunRequest {
        template_path: args.template,
        username: args.username,
        password: args.password,
    };

    let cancel = CancellationToken::new();
    let mut handle = orchestrator.spawn(request, cancel.clone());
    let outcome = tokio::select! {
        joined = &mut handle => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("stop requested; finishing the in-flight request");
            cancel.cancel();
            handle.await?
        }
    };

    match (&outcome.summary, &outcome.run_dir) {
        (Some(summary), Some(run_dir)) => println!(
            "run finished: phase={} succeeded={} failed={} output={}",
            outcome.phase,
            summary.success_count,
            summary.fail_count,
            run_dir.display()
        ),
        _ => println!("run ended before retrieval; see the log above for details"),
    }

    Ok(match outcome.phase {
        RunPhase::Stopped => 130,
        _ if outcome.summary.is_none() => 1,
        _ => 0,
    })
}
