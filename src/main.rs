//! Connection coordinator diagnostic CLI.
//!
//! Connects to one database, reports the resolved connection mode, product
//! identity, isolation and metrics as JSON, optionally streams one query
//! through a leased reader, then closes.

use db_conn_coordinator::config::Config;
use db_conn_coordinator::db::{ConnectionCoordinator, IsolationProfile};
use db_conn_coordinator::models::ExecutionKind;
use serde_json::json;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // logs go to stderr so stdout carries only the JSON report
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let coordinator_config = config.coordinator_config()?;
    let coordinator = ConnectionCoordinator::with_config(coordinator_config).await?;

    let profile = config.isolation_profile.unwrap_or_default();
    let isolation = coordinator.isolation().resolve(profile);

    let mut report = json!({
        "resolution": coordinator.resolution(),
        "identity": coordinator.identity(),
        "dialect": coordinator.dialect(),
        "isolation": {
            "profile": profile,
            "resolved": isolation,
            "supported": coordinator.isolation().supported_levels(),
        },
    });

    if let Some(sql) = &config.query {
        let mut reader = coordinator
            .create_statement_container()
            .sql(sql.as_str())
            .kind(ExecutionKind::Read)
            .read()
            .await?;
        let mut rows = Vec::new();
        while let Some(row) = reader.next().await? {
            rows.push(serde_json::Value::Object(row.to_json_map()));
        }
        info!(rows = rows.len(), "Query finished");
        report["rows"] = serde_json::Value::Array(rows);
    }

    report["metrics"] = serde_json::to_value(coordinator.metrics())?;
    coordinator.close().await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    let config = Config::parse_args();
    init_tracing(&config);

    info!(
        "Starting db-conn-coordinator v{}",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = run(&config).await {
        error!(error = %e, "Diagnostic run failed");
        std::process::exit(1);
    }
}
