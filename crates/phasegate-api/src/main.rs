//! phasegate CLI and REST API entry point.
//!
//! Binary name: `pgate`
//!
//! Parses CLI arguments, initializes the engine, then dispatches to the
//! appropriate command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use clap::Parser;
use clap_complete::generate;
use phasegate_observe::tracing_setup;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,phasegate=debug",
        _ => "trace",
    };
    if let Err(e) = tracing_setup::init_tracing(filter, cli.log_format, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let result = run(cli).await;
    tracing_setup::shutdown_tracing();
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pgate", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    let json = cli.json;

    match cli.command {
        Commands::Start {
            instance_id,
            input,
            input_file,
        } => {
            let input = cli::instance::read_input(input.as_deref(), input_file.as_deref()).await?;
            cli::instance::start(&state, instance_id, input, json).await?;
        }

        Commands::Resume {
            instance_id,
            decision,
            gate,
            payload,
        } => {
            cli::instance::resume(&state, instance_id, decision, gate, payload.as_deref(), json)
                .await?;
        }

        Commands::Cancel {
            instance_id,
            reason,
        } => {
            cli::instance::cancel(&state, instance_id, &reason, json).await?;
        }

        Commands::Status { instance_id } => {
            cli::instance::status(&state, instance_id, json).await?;
        }

        Commands::List { status } => {
            cli::instance::list(&state, status, json).await?;
        }

        Commands::History {
            instance_id,
            limit,
            at,
        } => {
            cli::instance::history(&state, instance_id, limit, at, json).await?;
        }

        Commands::Recover { instance_id } => {
            cli::instance::recover(&state, instance_id, json).await?;
        }

        Commands::Serve { port, host } => {
            // Pick up instances a previous process left mid-phase.
            let recovered = state.engine.recover_all().await?;
            if !recovered.is_empty() {
                tracing::info!(count = recovered.len(), "recovered interrupted instances");
            }

            let addr = format!("{host}:{port}");
            let listener = tokio::net::TcpListener::bind(&addr).await?;

            println!(
                "  {} phasegate API listening on {}",
                console::style("⚡").bold(),
                console::style(format!("http://{addr}")).cyan()
            );
            println!(
                "  {} {}",
                console::style("Data:").dim(),
                state.data_dir.display()
            );
            println!("  {}", console::style("Press Ctrl+C to stop").dim());

            let router = http::router::build_router(state);

            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown_signal())
                .await?;

            println!("\n  Server stopped.");
        }

        // Handled before state init.
        Commands::Completions { .. } => {}
    }

    Ok(())
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
