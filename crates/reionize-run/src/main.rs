//! Reionize Run
//!
//! Computes coeval boxes or lightcones with the analytic engine, and lists
//! what is in a cache directory.
//!
//! Usage:
//!   `reionize-run coeval -z 8 -z 10 [--template ts] [--global Z_HEAT_MAX=30]`
//!   `reionize-run lightcone --min-redshift 6 --max-redshift 12 [--checkpoint lc.bin]`
//!   `reionize-run query [--kind IonizedBox] [--redshift 8]`

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use ndarray::ArrayD;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use reionize_params::{GlobalParams, InputParameters};
use reionize_runtime::{
    query_cache, run_coeval, run_lightcone, AnalyticEngine, CacheQuery, CoevalOptions, Config,
    IoOptions, LightconeOptions, OutputKind, ParamArgs, RectilinearLightconer,
};

#[derive(Parser, Debug)]
#[command(name = "reionize-run")]
#[command(about = "Run the 21-cm orchestration pipeline against the analytic engine")]
struct Cli {
    /// Config file (defaults to $REIONIZE_CONFIG or ~/.reionize/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache directory, overriding the config
    #[arg(long, global = true)]
    direc: Option<PathBuf>,

    /// Recompute even if a cached box exists
    #[arg(long, global = true)]
    regenerate: bool,

    /// Do not write computed boxes to the cache
    #[arg(long, global = true)]
    no_write: bool,

    /// Override a global parameter for this run (NAME=VALUE, repeatable)
    #[arg(long = "global", global = true, value_parser = parse_global)]
    globals: Vec<(String, f64)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compute all outputs at one or more redshifts
    Coeval {
        /// Target redshift (repeatable)
        #[arg(short = 'z', long = "redshift", required = true)]
        redshifts: Vec<f64>,

        #[command(flatten)]
        params: ParamOpts,
    },
    /// Build a rectilinear lightcone
    Lightcone {
        #[arg(long = "min-redshift")]
        min_z: f64,

        #[arg(long = "max-redshift")]
        max_z: f64,

        /// Slice spacing in Mpc (defaults to the cell size)
        #[arg(long)]
        resolution: Option<f64>,

        /// Quantity to slice (repeatable)
        #[arg(long = "quantity", default_values_t = vec!["brightness_temp".to_string()])]
        quantities: Vec<String>,

        /// Checkpoint file to create or resume from
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Stop after the first node at or below this redshift
        #[arg(long)]
        return_at_z: Option<f64>,

        #[command(flatten)]
        params: ParamOpts,
    },
    /// List cached boxes
    Query {
        /// Output kind or stage name
        #[arg(long)]
        kind: Option<String>,

        #[arg(long)]
        seed: Option<u64>,

        #[arg(long)]
        redshift: Option<f64>,
    },
}

#[derive(Args, Debug)]
struct ParamOpts {
    /// Built-in template alias or a TOML file
    #[arg(long, default_value = "default")]
    template: String,

    /// Random seed (drawn when omitted)
    #[arg(long)]
    seed: Option<u64>,
}

impl ParamOpts {
    fn inputs(&self) -> anyhow::Result<InputParameters> {
        InputParameters::from_template(&self.template, self.seed)
            .with_context(|| format!("failed to load template '{}'", self.template))
    }
}

fn parse_global(s: &str) -> Result<(String, f64), String> {
    GlobalParams::parse_override(s).map_err(|e| e.to_string())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reionize_run=info,reionize_runtime=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        error!("{e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::load()?,
    };
    let mut io = config.io_options();
    if let Some(direc) = cli.direc {
        io.direc = direc;
    }
    let regenerate = cli.regenerate || io.regenerate;
    let write = io.write && !cli.no_write;
    let io: IoOptions = io.with_regenerate(regenerate).with_write(write);

    let mut globals = GlobalParams::default();
    config.apply_globals(&mut globals)?;

    match cli.command {
        Command::Coeval { redshifts, params } => {
            let inputs = params.inputs()?;
            let mut engine = AnalyticEngine::new();
            let coevals = run_coeval(
                &mut engine,
                &mut globals,
                io,
                CoevalOptions {
                    redshifts,
                    params: ParamArgs::from(&inputs),
                    global_overrides: cli.globals,
                    ..Default::default()
                },
            )?
            .into_vec();
            for coeval in &coevals {
                let xh = mean(coeval.get("xH_box"));
                let tb = mean(coeval.get("brightness_temp"));
                info!(redshift = coeval.redshift, mean_xH = ?xh, mean_Tb = ?tb, "Coeval");
            }
            let summary: Vec<_> = coevals
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "redshift": c.redshift,
                        "random_seed": c.inputs().random_seed,
                        "mean_xH": mean(c.get("xH_box")),
                        "mean_brightness_temp": mean(c.get("brightness_temp")),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Lightcone {
            min_z,
            max_z,
            resolution,
            quantities,
            checkpoint,
            return_at_z,
            params,
        } => {
            let inputs = params.inputs()?;
            let resolution = resolution.unwrap_or_else(|| inputs.user_params.cell_size());
            let names: Vec<&str> = quantities.iter().map(String::as_str).collect();
            let lightconer = RectilinearLightconer::with_equal_cdist_slices(
                min_z,
                max_z,
                resolution,
                &inputs.cosmo_params,
                &names,
                None,
                false,
            )?;
            let mut engine = AnalyticEngine::new();
            let run = run_lightcone::<()>(
                &mut engine,
                &mut globals,
                io,
                &lightconer,
                LightconeOptions {
                    params: ParamArgs::from(&inputs),
                    global_overrides: cli.globals,
                    checkpoint,
                    return_at_z,
                    ..Default::default()
                },
            )?;
            let lc = run.lightcone;
            info!(
                shape = ?lc.shape(),
                nodes = lc.node_redshifts.len(),
                complete = lc.is_complete(),
                "Lightcone"
            );
            let summary = serde_json::json!({
                "shape": lc.shape(),
                "node_redshifts": lc.node_redshifts,
                "current_redshift": lc.current_redshift,
                "global_quantities": lc.global_quantities,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::Query {
            kind,
            seed,
            redshift,
        } => {
            let kind: Option<OutputKind> = kind.map(|k| k.parse()).transpose()?;
            let hits = query_cache(
                &io.direc,
                &CacheQuery {
                    kind,
                    random_seed: seed,
                    redshift,
                    inputs: None,
                },
            )?;
            info!(direc = %io.direc.display(), n = hits.len(), "Cache query");
            for (path, data) in hits {
                println!("{}\t{}", path.display(), data.identity());
            }
        }
    }
    Ok(())
}

fn mean(array: Option<&ArrayD<f32>>) -> Option<f64> {
    array
        .filter(|a| !a.is_empty())
        .map(|a| a.iter().map(|&v| v as f64).sum::<f64>() / a.len() as f64)
}
