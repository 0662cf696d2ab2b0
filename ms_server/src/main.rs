use std::path::PathBuf;
use std::process::ExitCode;
use std::rc::Rc;

use clap::Parser;
use ms_server::config::ServerConfig;
use ms_server::connection::{Exchange, Service};
use ms_server::logging::{AccessLog, LogContext};
use ms_server::process::Master;
use tracing::error;

#[derive(Debug, Parser)]
#[command(version, about = "Multi-process TCP server echoing requests over HTTP/1.1")]
struct Cli {
    /// TOML configuration file; built-in defaults when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `workers` from the configuration.
    #[arg(short, long)]
    workers: Option<usize>,

    /// Validates the configuration and exits.
    #[arg(long)]
    check: bool,
}

/// Replies `200 OK` with the request as the body.
struct HttpEcho {
    access: AccessLog,
}

impl Service for HttpEcho {
    fn handle(&self, exchange: &mut Exchange<'_>, received: usize) -> ms_server::Result<()> {
        let mut response =
            format!("HTTP/1.1 200 OK\r\nContent-Length: {received}\r\n\r\n").into_bytes();
        response.extend_from_slice(exchange.request());
        exchange.respond(&response);

        self.access
            .record(exchange.peer(), received, response.len(), exchange.request());
        Ok(())
    }
}

fn load(cli: &Cli) -> ms_server::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(workers) = cli.workers {
        config.workers = workers;
        config.validate()?;
    }
    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ms_server: {e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.check {
        println!("configuration ok");
        return ExitCode::SUCCESS;
    }

    let logs = match LogContext::init(&config) {
        Ok(logs) => logs,
        Err(e) => {
            eprintln!("ms_server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let master = Master::new(config, logs);
    let make_service = |_: usize, logs: &LogContext| -> Rc<dyn Service> {
        Rc::new(HttpEcho {
            access: logs.access_log().clone(),
        })
    };
    match master.run(make_service) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "server failed");
            ExitCode::FAILURE
        }
    }
}
