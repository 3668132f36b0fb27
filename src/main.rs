//! KAIROS demo binary.
//!
//! Generates a synthetic EMA subject, fits the PLRNN, then walks the
//! analysis surface: hybrid forecasts at all three horizons, early
//! warnings, the causal graph, attention explanation, and one what-if
//! intervention.

use clap::Parser;

use kairos::config::EngineConfig;
use kairos::dynamics::{ForecastHorizon, InterventionDirection, PlrnnEngine};
use kairos::training;

/// KAIROS forecasting CLI.
#[derive(Parser, Debug)]
#[command(
    name = "kairos",
    about = "Hybrid Kalman/attention/PLRNN forecasting for momentary self-report series",
    version
)]
struct Cli {
    /// Hours of synthetic history to generate.
    #[arg(long, default_value_t = 240)]
    hours: usize,

    /// Training epochs.
    #[arg(short, long, default_value_t = 20)]
    epochs: usize,

    /// Seed for data generation and weight init.
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Append a critical-slowing segment to the synthetic series.
    #[arg(long, default_value_t = false)]
    transition: bool,

    /// Dendritic basis count (0 disables the expansion).
    #[arg(long, default_value_t = 0)]
    dendritic: usize,

    /// Write trained weights to this JSON file.
    #[arg(long)]
    weights_out: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    tracing::info!("KAIROS v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig {
        epochs: cli.epochs,
        seed: cli.seed,
        dendritic_bases: cli.dendritic,
        ..EngineConfig::default()
    };

    let sequence = if cli.transition {
        training::synthetic_sequence_with_transition(&config, cli.hours, cli.seed)
    } else {
        training::synthetic_sequence(&config, cli.hours, cli.seed)
    };
    tracing::info!(
        "Synthetic subject: {} observations, {} dimensions",
        sequence.len(),
        config.state_dim,
    );

    let mut engine = PlrnnEngine::new(config.clone())?;
    engine.initialize();

    let report = training::train(&mut engine, &sequence)?;
    match report.best_validation_loss {
        Some(v) => tracing::info!(
            "Trained {} epochs (train loss {:.4}, best validation {:.4})",
            report.epochs_run,
            report.final_training_loss,
            v,
        ),
        None => tracing::info!(
            "Trained {} epochs (train loss {:.4})",
            report.epochs_run,
            report.final_training_loss,
        ),
    }
    if report.stopped_early {
        tracing::info!("Stopped early on validation patience");
    }

    // Warm the fusion window with the observed tail before forecasting.
    let prepared = sequence.prepare(&config);
    let tail = prepared.len().saturating_sub(config.window_size);
    for k in tail..prepared.len() {
        engine.observe(&prepared.observations[k], prepared.timestamps[k])?;
    }

    let state = engine.current_state().clone();
    for horizon in [
        ForecastHorizon::Short,
        ForecastHorizon::Medium,
        ForecastHorizon::Long,
    ] {
        let forecast = engine.hybrid_predict(&state, horizon)?;
        let last = forecast.mean.len() - 1;
        let (lower, upper) = &forecast.ci95[last];
        tracing::info!(
            "{:?} forecast, {} steps: valence {:+.2} in [{:+.2}, {:+.2}]",
            horizon,
            last,
            forecast.mean[last][0],
            lower[0],
            upper[0],
        );
    }

    let warnings = engine.early_warnings();
    if warnings.is_empty() {
        tracing::info!("No early warnings active");
    }
    for w in &warnings {
        tracing::info!(
            "Early warning [{:?}] on {}: strength {:.2}, {}",
            w.kind,
            w.label,
            w.strength,
            w.recommendation,
        );
    }

    let network = engine.extract_causal_network()?;
    tracing::info!(
        "Causal graph: {} edges, density {:.2}, {} feedback loop(s)",
        network.edges.len(),
        network.density,
        network.loops.len(),
    );
    if let Some(central) = &network.central_node {
        tracing::info!("Most central dimension: {}", central);
    }
    for edge in network.edges.iter().take(5) {
        tracing::info!("  {} -> {} ({:+.2})", edge.from, edge.to, edge.weight);
    }
    tracing::info!("Spectral radius: {:.3}", engine.spectral_radius()?);

    let explanation = engine.fusion().explain()?;
    tracing::info!("Attention pattern: {:?}", explanation.pattern);
    for influence in explanation.top_influences.iter().take(3) {
        tracing::info!(
            "  influence at t={:.0} h, weight {:.3}",
            influence.timestamp,
            influence.weight,
        );
    }

    if let Some(label) = config.dim_labels.last() {
        let outcome = engine.simulate_intervention(label, InterventionDirection::Decrease, 1.0)?;
        tracing::info!(
            "Intervention: decrease {} by 1.0 -> peak {:+.2} after {:.0} h, {} side effect(s)",
            outcome.target,
            outcome.peak_effect,
            outcome.time_to_peak_hours,
            outcome.side_effects.len(),
        );
    }

    if let Some(path) = &cli.weights_out {
        engine.save_weights(path)?;
        tracing::info!("Weights written to {}", path.display());
    }

    tracing::info!("Done.");
    Ok(())
}
