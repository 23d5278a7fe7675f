use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use kino_core::KinoConfig;
use kino_feedback::{EvolutionEngine, EvolutionRequest, PreferenceFilter, PreferenceStore};
use kino_kernel::{CorrectionEvent, CorrectionLog};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn config_arg() -> Arg {
    Arg::new("config")
        .long("config")
        .value_parser(value_parser!(PathBuf))
        .help("TOML configuration file")
}

fn cli() -> Command {
    Command::new("kino")
        .version(kino_core::VERSION)
        .about("Correction-driven regeneration and preference learning")
        .arg(
            Arg::new("json-logs")
                .long("json-logs")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Emit logs as JSON lines"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("replay")
                .about("Run preference evolution over a stored correction log")
                .arg(
                    Arg::new("log")
                        .long("log")
                        .required(true)
                        .value_parser(value_parser!(PathBuf))
                        .help("JSON array of correction events"),
                )
                .arg(
                    Arg::new("runs")
                        .long("runs")
                        .default_value("1")
                        .value_parser(value_parser!(usize))
                        .help("Evolution runs to perform"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .value_parser(value_parser!(usize))
                        .help("Maximum corrections claimed per run"),
                )
                .arg(config_arg())
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Print preferences as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(config_arg()),
        )
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(args: &ArgMatches) -> Result<KinoConfig> {
    match args.get_one::<PathBuf>("config") {
        Some(path) => KinoConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(KinoConfig::default()),
    }
}

fn replay(args: &ArgMatches) -> Result<()> {
    let config = load_config(args)?;
    let Some(path) = args.get_one::<PathBuf>("log") else {
        bail!("--log is required");
    };
    let runs = args.get_one::<usize>("runs").copied().unwrap_or(1);
    let limit = args.get_one::<usize>("limit").copied();

    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let events: Vec<CorrectionEvent> =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

    let log = Arc::new(CorrectionLog::new());
    log.restore(events, Vec::new())
        .context("correction log does not verify")?;
    let store = Arc::new(PreferenceStore::new());
    let engine = EvolutionEngine::new(
        Arc::clone(&log),
        Arc::clone(&store),
        config.evolution,
        config.confidence,
    );

    for run in 1..=runs {
        let report = engine.evolve(EvolutionRequest {
            project: None,
            limit,
        })?;
        tracing::info!(
            run,
            analyzed = report.analyzed,
            created = report.created.len(),
            reinforced = report.reinforced.len(),
            weakened = report.weakened.len(),
            deferred = report.deferred.len(),
            "evolution run finished"
        );
        if report.analyzed == 0 {
            break;
        }
    }

    let preferences = store.audit(&PreferenceFilter::default());
    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&preferences)?);
    } else {
        println!("{} corrections, {} preferences", log.len(), preferences.len());
        for p in &preferences {
            let tier = config.confidence.tier(p.confidence);
            println!(
                "  {:.3}  {:<10} {:<12} {}{}",
                p.confidence,
                format!("{tier:?}"),
                p.scope.to_string(),
                p.description,
                if p.is_active { "" } else { " (inactive)" }
            );
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    let matches = cli().get_matches();
    init_tracing(matches.get_flag("json-logs"));

    match matches.subcommand() {
        Some(("replay", args)) => replay(args),
        Some(("config", args)) => {
            let config = load_config(args)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
        _ => bail!("unknown command"),
    }
}
