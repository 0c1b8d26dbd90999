mod cli;
mod run;

use clap::Parser;
use cli::{Cli, Commands, FILE_GUARD};
use eyre::WrapErr;
use std::fs;
use tracing_subscriber::EnvFilter;

fn init_logging(args: &Cli, cfg: &dmf_config::Config) {
    let level = cfg
        .logging
        .level
        .clone()
        .unwrap_or_else(|| args.log_level.clone());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(file) = &cfg.logging.file {
        let path = std::path::Path::new(file);
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let name = path.file_name().unwrap_or_else(|| "dmf.log".as_ref());
        let appender = match cfg.logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(writer)
            .init();
    } else if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn load_config(args: &Cli) -> eyre::Result<dmf_config::Config> {
    let Some(path) = &args.config else {
        return Ok(dmf_config::Config::default());
    };
    let text = fs::read_to_string(path).wrap_err_with(|| format!("reading config {path:?}"))?;
    let cfg = dmf_config::load_toml(&text).wrap_err("parsing config TOML")?;
    cfg.validate().wrap_err("validating config")?;
    Ok(cfg)
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let args = Cli::parse();
    let cfg = load_config(&args)?;
    init_logging(&args, &cfg);

    match args.cmd {
        Commands::Run {
            duration,
            voltage,
            frequency,
            force,
            ref channels,
            area,
            action,
            percent_threshold,
            increase_voltage,
            max_repeats,
            sweep_start,
            sweep_end,
            sweep_steps,
            no_feedback,
            ref c_drop_csv,
        } => run::run(
            &cfg,
            run::RunArgs {
                duration,
                voltage,
                frequency,
                force,
                channels: channels.clone(),
                area,
                action,
                percent_threshold,
                increase_voltage,
                max_repeats,
                sweep_start,
                sweep_end,
                sweep_steps,
                no_feedback,
                c_drop_csv: c_drop_csv.clone(),
            },
            args.json,
        ),
        Commands::Check {
            voltage,
            frequency,
            amplifier_off,
        } => run::check(&cfg, voltage, frequency, amplifier_off, args.json),
        Commands::Plan {
            window_ms,
            windows,
            delay_ms,
            buffer,
        } => {
            run::plan(window_ms, windows, delay_ms, buffer, args.json);
            Ok(())
        }
    }
}
