//! Simulates client libraries sending traces through a priority sampler, and reports how the published rates converge
//! towards the configured target throughput.

#![deny(warnings)]
#![deny(missing_docs)]

use std::sync::Arc;

use anyhow::{Context as _, Error};
use clap::Parser as _;
use priority_sampler::{ConfigurationLoader, PriorityEngine, PrioritySamplerConfiguration, RateByService};
use tokio::{task::JoinSet, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod cli;
use self::cli::Cli;

mod logging;
use self::logging::initialize_logging;

mod traffic;
use self::traffic::TrafficGenerator;

#[tokio::main]
async fn main() -> Result<(), Error> {
    initialize_logging()?;

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => info!("priority-sampler-sim stopped."),
        Err(e) => {
            error!("{:?}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn load_configuration(cli: &Cli) -> Result<PrioritySamplerConfiguration, Error> {
    let mut loader = ConfigurationLoader::new();
    if let Some(path) = &cli.config {
        loader = loader
            .from_yaml(path)
            .with_context(|| format!("Failed to load configuration file '{}'.", path.display()))?;
    }
    let loader = loader.from_environment("DD")?;

    PrioritySamplerConfiguration::from_loader(&loader).context("Invalid priority sampler configuration.")
}

async fn run(cli: Cli) -> Result<(), Error> {
    info!("priority-sampler-sim starting...");

    let config = load_configuration(&cli)?;
    info!(
        target_tps = config.target_traces_per_second(),
        extra_sample_rate = config.extra_sample_rate(),
        rate_sync_period = ?config.rate_sync_period(),
        services = cli.services.len(),
        "Loaded configuration."
    );

    let rate_by_service = Arc::new(RateByService::new());
    let engine = PriorityEngine::new(&config, Arc::clone(&rate_by_service))
        .context("Invalid priority sampler configuration.")?;
    let engine = Arc::new(engine);

    let engine_task = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    let shutdown = CancellationToken::new();
    let mut generators = JoinSet::new();
    for (idx, mut traffic) in cli.services.iter().cloned().enumerate() {
        // Mirror the sampler's own fallback so clients look up the rates published for them.
        if traffic.env.is_empty() {
            traffic.env = config.default_env().to_string();
        }

        let service = traffic.service.clone();
        let generator = TrafficGenerator::new(
            traffic,
            Arc::clone(&engine),
            Arc::clone(&rate_by_service),
            cli.seed.wrapping_add(idx as u64),
        );
        let shutdown = shutdown.clone();
        generators.spawn(async move { (service, generator.run(shutdown).await) });
    }

    let deadline = async {
        match cli.duration() {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut reporter = interval(cli.report_interval());
    reporter.tick().await;

    loop {
        tokio::select! {
            _ = &mut deadline => {
                info!("Simulation duration elapsed.");
                break;
            },
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for interrupt signal.")?;
                info!("Received interrupt signal.");
                break;
            },
            _ = reporter.tick() => report(&engine, &rate_by_service)?,
        }
    }

    shutdown.cancel();
    while let Some(result) = generators.join_next().await {
        let (service, stats) = result.context("Traffic generator panicked.")?;
        let kept_ratio = if stats.generated == 0 {
            0.0
        } else {
            stats.kept as f64 / stats.generated as f64
        };
        info!(
            service,
            generated = stats.generated,
            kept = stats.kept,
            kept_ratio,
            "Traffic summary."
        );
    }

    engine.stop().await;
    engine_task.await.context("Priority sampler task panicked.")?;
    report(&engine, &rate_by_service)?;

    Ok(())
}

fn report(engine: &PriorityEngine, rate_by_service: &RateByService) -> Result<(), Error> {
    let state = engine.get_state();
    info!(
        cardinality = state.cardinality,
        in_tps = state.in_tps,
        out_tps = state.out_tps,
        default_rate = state.default_rate,
        "Sampler state."
    );

    let published = rate_by_service.get_all();
    let rates = serde_json::to_string(&*published).context("Failed to serialize rates by service.")?;
    info!(version = published.version(), %rates, "Published rates.");

    Ok(())
}
