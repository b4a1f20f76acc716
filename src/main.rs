use clap::Parser;
use condor::cli::{self, Cli, Commands};
use condor::config::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Size {
            equity,
            max_loss_per_unit,
            risk,
        } => {
            init_logging_simple();
            cli::size(&cli, *equity, *max_loss_per_unit, *risk)
        }
        Commands::CheckConfig => {
            init_logging_simple();
            cli::check_config(&cli)
        }
        _ => {
            let config = cli::load_config(&cli)?;
            let _guard = init_logging(&config.logging);
            cli::dispatch(&cli, config).await
        }
    }
}

/// Console logging plus an optional daily file. `RUST_LOG` overrides the
/// configured level.
fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::Layer;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},reqwest=warn,hyper=warn", config.level)));

    // `rolling::daily` panics if it cannot create the first file, so check
    // the directory is writable before handing it over.
    let mut guard = None;
    let file_layer = config.dir.as_ref().and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "Warning: Could not create log directory {} ({}), file logging disabled",
                dir.display(),
                e
            );
            return None;
        }
        let marker = dir.join(".condor_write_test");
        match std::fs::OpenOptions::new().create(true).append(true).open(&marker) {
            Ok(_) => {
                let _ = std::fs::remove_file(&marker);
                let appender = tracing_appender::rolling::daily(dir, "condor.log");
                let (writer, worker) = tracing_appender::non_blocking(appender);
                guard = Some(worker);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(writer)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    dir.display(),
                    e
                );
                None
            }
        }
    });

    let console_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .boxed()
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let (true, Some(dir)) = (file_logging_enabled, config.dir.as_ref()) {
        eprintln!("Logging to: {}/condor.log", dir.display());
    }
    guard
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
