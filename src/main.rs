use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};

use dining_philosophers::{
    actor, csp, simulate, LogTrace, Policy, RunSummary, TableConfig, TraceSink,
};

const NAMES: [&str; 11] = [
    "Socrates",
    "Plato",
    "Aristotle",
    "Descartes",
    "Spinoza",
    "Kant",
    "Schopenhauer",
    "Nietzsche",
    "Wittgenstein",
    "Heidegger",
    "Sartre",
];

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Runtime {
    Actor,
    Csp,
    Sim,
}

#[derive(Parser)]
#[command(name = "dining_philosophers")]
#[command(about = "Run the dining philosophers with a choice of fork arbitration", long_about = None)]
struct Cli {
    /// Which runtime drives the philosophers
    #[arg(long, value_enum, default_value = "actor")]
    runtime: Runtime,

    /// How forks are handed out
    #[arg(long, value_enum, default_value = "waiter-timestamps")]
    policy: Policy,

    /// Number of philosophers (defaults to the number of names)
    #[arg(long)]
    philosophers: Option<usize>,

    /// Meals each philosopher eats before leaving
    #[arg(long, default_value_t = 3)]
    meals: u32,

    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Failures younger than this do not raise a philosopher's priority
    #[arg(long, default_value_t = 50)]
    threshold_ms: u64,

    /// Philosopher who takes the right fork first (dijkstra only)
    #[arg(long)]
    reversed: Option<usize>,

    /// Comma separated philosopher names
    #[arg(long, value_delimiter = ',')]
    names: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn config(&self) -> TableConfig {
        let names = if self.names.is_empty() {
            NAMES.iter().map(|s| s.to_string()).collect()
        } else {
            self.names.clone()
        };
        let n = self.philosophers.unwrap_or(names.len());

        let mut config = TableConfig::new(n, self.meals, self.policy)
            .with_seed(self.seed)
            .with_failure_threshold(Duration::from_millis(self.threshold_ms))
            .with_names(names);
        if self.reversed.is_some() {
            config = config.with_reversed(self.reversed);
        }
        config
    }
}

fn print_summary(config: &TableConfig, summary: &RunSummary) {
    println!("finished in {:?}", summary.elapsed);
    for (rank, p) in summary.completion_order.iter().enumerate() {
        println!("{:>3}. {}", rank + 1, config.name(*p));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.config();
    let trace: Arc<dyn TraceSink> = Arc::new(LogTrace);

    match cli.runtime {
        Runtime::Actor => {
            let summary = actor::run(&config, trace)
                .await
                .context("actor run failed")?;
            print_summary(&config, &summary);
        }
        Runtime::Csp => {
            let cfg = config.clone();
            let summary = tokio::task::spawn_blocking(move || csp::run(&cfg, trace))
                .await?
                .context("csp run failed")?;
            print_summary(&config, &summary);
        }
        Runtime::Sim => {
            let report = simulate(&config, trace).context("simulation failed")?;
            println!(
                "{} steps, {:?} of virtual time, forks free: {}",
                report.steps, report.elapsed, report.forks_free
            );
            // 1人ずつ状態の記号を並べて表示
            for i in 0..config.philosophers {
                let line: String = report
                    .trace
                    .iter()
                    .filter(|e| e.philosopher == i)
                    .map(|e| e.state.symbol())
                    .collect();
                println!("{:>14}: {}", config.name(i), line);
            }
            print_summary(
                &config,
                &RunSummary {
                    completion_order: report.completion_order,
                    elapsed: report.elapsed,
                },
            );
        }
    }

    Ok(())
}
