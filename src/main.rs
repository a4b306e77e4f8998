mod alert;
mod config;
mod router;
mod signals;
mod subscription;
mod timer;
mod watchdog;

use clap::{Parser, Subcommand};
use config::ConfigSource;
use router::{DocumentFilter, EventRouter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use watchdog::WatchdogController;

/// An inactivity watchdog: reads editor events as JSON lines on stdin and
/// raises an alert once editing has stopped for the configured countdown.
#[derive(Parser, Debug)]
#[command(name = "edit-watchdog", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Settings file path
    #[arg(short, long, default_value = "edit-watchdog.toml", global = true)]
    config: PathBuf,

    /// Print resolved settings and exit
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra logging (countdown arm/reset decisions, routing)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Watch host events on stdin (default)
    Run,
    /// Flip the `enabled` setting in the settings file
    Toggle,
    /// Fire the configured alert once, without a countdown
    TestSound,
    /// Write a default settings file
    Init,
}

fn init_logging(cli: &Cli) {
    let default_level = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(&cli);
    tracing::debug!(?cli, "parsed CLI arguments");

    let command = cli.command.unwrap_or(Command::Run);
    let result = match command {
        Command::Run => run(&cli).await,
        Command::Toggle => toggle(&cli),
        Command::TestSound => test_sound(&cli),
        Command::Init => init(&cli),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "edit-watchdog failed");
        if command == Command::Run {
            alert::notify_activation_failure(&*e).await;
        }
        std::process::exit(1);
    }
    // The stdin reader can still be parked in a blocking read that tokio
    // cannot cancel; returning normally would wait on it during runtime drop.
    std::process::exit(0);
}

fn print_settings(source: &ConfigSource) -> Result<(), Box<dyn std::error::Error>> {
    let settings = source.settings();
    println!("Settings file: {}", source.path().display());
    println!("{}", toml::to_string_pretty(&settings)?);
    Ok(())
}

/// Construct and wire every component, watch stdin, then tear down in order:
/// router, controller, config source.
async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config_source = ConfigSource::open(&cli.config);
    if cli.dry_run {
        return print_settings(&config_source);
    }

    let settings = config_source.settings();
    let filter = DocumentFilter::from_config(&settings.router)?;
    let sink = alert::sink_from_config(&settings.alert);
    let controller = Arc::new(WatchdogController::new(
        config_source.get_configuration(),
        sink,
    ));

    {
        let controller = Arc::clone(&controller);
        config_source.on_configuration_changed(settings.reload.poll_interval(), move |config| {
            controller.update_configuration(config);
        });
    }

    let mut router = EventRouter::new(Arc::clone(&controller), filter);
    let (tx, rx) = mpsc::channel(256);
    router.attach("stdin", rx);
    let reader = tokio::spawn(router::read_host_events(tokio::io::stdin(), tx));

    let config = controller.config();
    tracing::info!(
        enabled = config.enabled,
        countdown_secs = config.countdown_duration.as_secs(),
        settings = %config_source.path().display(),
        "edit-watchdog active"
    );

    tokio::select! {
        signal = signals::wait_for_shutdown() => {
            tracing::info!(%signal, "shutdown requested");
        }
        outcome = reader => match outcome {
            Ok(Ok(events)) => tracing::info!(events, "host event stream closed"),
            Ok(Err(e)) => tracing::warn!(error = %e, "failed reading host events"),
            Err(e) => tracing::warn!(error = %e, "host event reader stopped"),
        },
    }

    let snapshot = controller.snapshot();
    if snapshot.phase == watchdog::Phase::Armed {
        tracing::info!(
            remaining_secs = snapshot.remaining.map(|d| d.as_secs()),
            armed_secs_ago = snapshot.last_change.map(|t| t.elapsed().as_secs()),
            terminal_focus_secs_ago = snapshot.last_focus.map(|t| t.elapsed().as_secs()),
            "discarding pending countdown"
        );
    }

    router.dispose();
    controller.dispose();
    config_source.dispose();
    tracing::info!("edit-watchdog stopped");
    Ok(())
}

fn toggle(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let source = ConfigSource::open(&cli.config);
    if cli.dry_run {
        return print_settings(&source);
    }
    let enabled = source.toggle_enabled()?;
    println!(
        "edit-watchdog {}",
        if enabled { "enabled" } else { "disabled" }
    );
    Ok(())
}

fn test_sound(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let source = ConfigSource::open(&cli.config);
    let settings = source.settings();
    if cli.dry_run {
        if let config::AlertBackend::Desktop = settings.alert.backend {
            for cmd in alert::DesktopAlertSink::new(settings.alert.clone()).commands() {
                println!("{} {:?}", cmd.program, cmd.args);
            }
        } else {
            println!("terminal bell");
        }
        return Ok(());
    }
    alert::sink_from_config(&settings.alert).fire()?;
    Ok(())
}

fn init(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    if config::init_settings(&cli.config)? {
        println!("Wrote {}", cli.config.display());
    } else {
        println!("{} already exists, left unchanged", cli.config.display());
    }
    Ok(())
}
