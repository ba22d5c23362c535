use encoderd::auth::TokenService;
use encoderd::cli::Args;
use encoderd::core::event_bus::EventBus;
use encoderd::engine::sim::SimEngine;
use encoderd::logging::{LogInstanceManager, SessionLog};
use encoderd::router::{ApiRouter, TerminationEvent};
use encoderd::server::{api_handlers, HttpServer};

use clap::Parser;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Key the application/scan-level log is registered under. Present before
/// any encode starts and never deregistered while the process lives.
const MASTER_LOG_KEY: &str = "activity_log.main.txt";

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Determine log level based on verbosity flags
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    // Initialize logger based on --log flag
    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .as_ref()
            .cloned()
            .unwrap_or_else(|| std::path::PathBuf::from("encoderd.log"));
        let file = std::fs::File::create(&log_path)?;

        env_logger::Builder::new()
            .filter_level(log_level)
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
    } else {
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }

    debug!("Command-line args: {:?}", args);
    println!("Worker: starting encoderd v{} ...", env!("CARGO_PKG_VERSION"));

    let tokens = Arc::new(TokenService::new());
    if let Some(token) = &args.token {
        tokens.register_token(token);
        info!("Token pre-registered from command line");
    }

    let bus = EventBus::new();
    let logs = Arc::new(LogInstanceManager::new(bus.clone()));
    let master_log = Arc::new(SessionLog::new(MASTER_LOG_KEY));
    logs.register(MASTER_LOG_KEY, Arc::clone(&master_log), true)?;
    master_log.log_message("worker process started");

    let engine = Box::new(SimEngine::new(Duration::from_millis(40)));
    let router = ApiRouter::new(Arc::clone(&logs), engine, bus.clone());

    // The entry point blocks on this channel until Shutdown arrives
    let (term_tx, term_rx) = crossbeam_channel::bounded::<()>(1);
    bus.subscribe::<TerminationEvent, _>(move |_| {
        let _ = term_tx.try_send(());
    });

    println!("Worker: starting web server on port {} ...", args.port);
    let handlers = api_handlers(Arc::clone(&router), Arc::clone(&tokens));
    let server = match HttpServer::start(args.port, handlers, tokens) {
        Ok(server) => server,
        Err(e) => {
            // Bind failure is fatal; report and exit without serving
            println!("Worker: failed to start: {}. Exiting ...", e);
            return Err(e.into());
        }
    };
    println!("Worker: server started on 127.0.0.1:{}", server.port());

    term_rx.recv()?;
    println!("Worker: shutting down ...");
    master_log.log_message("worker process shutting down");
    server.stop();
    println!("Worker: server stopped");

    Ok(())
}
