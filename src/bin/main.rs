use std::process::exit;
use supervisor_control::cli::{version_string, Cli, CliCommand};
use supervisor_control::run::ControlPlaneRunner;
use supervisor_control::shutdown::{shutdown_channel, ShutdownRequester};
use tracing::{error, info};

fn main() {
    let cli_command = Cli::init().unwrap_or_else(|cli_error| {
        eprintln!("Error starting supervisor control plane: {cli_error}");
        exit(1);
    });

    let (config, config_path, _logger_guard) = match cli_command {
        CliCommand::Run(config, config_path, logger_guard) => (config, config_path, logger_guard),
        CliCommand::PrintVersion => {
            println!("{}", version_string());
            exit(0);
        }
        CliCommand::PrintConfig(config) => {
            println!(
                "server: {}:{}\nprojects: {}\nport ranges: {}",
                config.server.host,
                config.server.port,
                config
                    .projects
                    .iter()
                    .map(|p| p.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                config
                    .port_ranges
                    .iter()
                    .map(|r| format!("{} [{}-{}]", r.name, r.start, r.end))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
            exit(0);
        }
    };

    if let Err(err) = run(*config, config_path) {
        error!("the control plane exited with an error: {err}");
        exit(1);
    }
}

// Separated from `main` so errors propagate once and get logged in one
// place, in string form.
fn run(
    config: supervisor_control::config::ControlPlaneConfig,
    config_path: std::path::PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_requester, shutdown_waiter) = shutdown_channel();
    create_shutdown_signal_handler(shutdown_requester)?;

    ControlPlaneRunner::new(config, config_path, shutdown_waiter).run()?;

    info!("exiting gracefully");
    Ok(())
}

fn create_shutdown_signal_handler(requester: ShutdownRequester) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || {
        info!("received termination signal, stopping control plane");
        requester.request_stop();
    })
}
