use std::process;

use analytics_relay::{
    application::{error::AppError, relay::Relay},
    config::{self, CacheCommand, Command, TargetsCommand},
    domain::targets::{self, TargetInput},
    infra::{error::InfraError, http, telemetry},
};
use serde::Serialize;
use serde_json::json;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        Command::Serve(_) => run_serve(settings).await,
        Command::Cache(args) => run_cache(&settings, args.command),
        Command::Targets(args) => run_targets(&settings, args.command),
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let relay = Relay::from_settings(&settings);
    let state = http::HttpState { status: relay.status() };
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = "analytics_relay::serve",
        addr = %settings.server.addr,
        cache_dir = %settings.cache.directory.display(),
        cache_enabled = settings.cache.enabled,
        "Status endpoint listening"
    );

    axum::serve(listener, router.into_make_service())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))
}

fn run_cache(settings: &config::Settings, command: CacheCommand) -> Result<(), AppError> {
    let status = Relay::from_settings(settings).status();
    match command {
        CacheCommand::Stats => print_json(&status.snapshot()),
        CacheCommand::Health => {
            let health = status.health();
            print_json(&health)?;
            if health.overall_healthy {
                Ok(())
            } else {
                Err(AppError::unexpected(format!(
                    "cache is unhealthy: {}",
                    health
                        .persistent
                        .issues
                        .iter()
                        .chain(&health.discovery.issues)
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("; ")
                )))
            }
        }
        CacheCommand::Clear(args) => print_json(&status.clear(args.namespace.as_deref())?),
        CacheCommand::Repair => print_json(&status.repair()),
    }
}

fn run_targets(settings: &config::Settings, command: TargetsCommand) -> Result<(), AppError> {
    match command {
        TargetsCommand::Validate(args) => {
            let values: Vec<String> = args
                .values
                .iter()
                .flat_map(|arg| targets::parse(Some(&TargetInput::from(arg.as_str()))))
                .collect();
            let (valid, invalid) = targets::validate(&values, args.kind);
            let distinct: Vec<String> = targets::into_targets(valid.clone(), args.kind)
                .into_iter()
                .map(|target| target.id)
                .collect();
            targets::ensure_batch_size(distinct.len(), settings.query.max_batch_size.get(), args.kind)?;
            print_json(&json!({
                "kind": args.kind,
                "valid": valid,
                "invalid": invalid,
                "distinct": distinct,
            }))
        }
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::unexpected(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
