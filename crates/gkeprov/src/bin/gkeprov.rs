use std::sync::Arc;

use clap::{CommandFactory, FromArgMatches};

use gkeprov::common::cli::{LocationOpts, RootOptions, SubCommand, UpOpts};
use gkeprov::common::setup::setup_logging;
use gkeprov::deployer::Deployer;
use gkeprov::deployer::cluster::gcloud::GcloudHandler;
use gkeprov::deployer::lease::ResourceBroker;
use gkeprov::deployer::lease::boskos::BoskosClient;
use gkeprov::deployer::location::Locations;
use gkeprov::deployer::run::run_until_aborted;

/// Resolves with the name of the first termination signal received by the process.
async fn termination_signal() -> String {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT".to_string(),
                    _ = terminate.recv() => "SIGTERM".to_string(),
                }
            }
            Err(error) => {
                log::warn!("Cannot listen for SIGTERM: {error}");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT".to_string()
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C".to_string()
    }
}

async fn command_up(opts: UpOpts) -> anyhow::Result<()> {
    let (options, run) = opts.into_options();
    log::debug!("Up options: {}", serde_json::to_string(&options)?);

    let broker: Option<Arc<dyn ResourceBroker>> = if options.uses_broker() {
        let owner = options
            .broker
            .owner
            .clone()
            .unwrap_or_else(BoskosClient::default_owner);
        log::info!(
            "Leasing {} project(s) from Boskos at {} as {owner}",
            options.broker.project_count,
            options.broker.url
        );
        Some(Arc::new(BoskosClient::new(&options.broker.url, owner)?))
    } else {
        None
    };
    let handler = Box::new(GcloudHandler::new(options.cluster.clone()));
    let mut deployer = Deployer::new(options, handler, broker);

    run_until_aborted(&mut deployer, &run, termination_signal()).await
}

fn command_check_location(opts: LocationOpts) -> anyhow::Result<()> {
    let locations = Locations::new(&opts.regions, &opts.zones)?;
    for attempt in 0..locations.len() {
        println!(
            "{attempt}: {} (region {})",
            locations.location_arg(attempt),
            locations.region(attempt)
        );
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> gkeprov::Result<()> {
    let matches = RootOptions::command().get_matches();
    let top_opts = match RootOptions::from_arg_matches(&matches) {
        Ok(opts) => opts,
        Err(error) => error.exit(),
    };

    setup_logging(top_opts.common.debug);

    let result = match top_opts.subcmd {
        SubCommand::Up(opts) => command_up(opts).await,
        SubCommand::CheckLocation(opts) => command_check_location(opts),
    };

    if let Err(e) = result {
        log::error!("{e:?}");
        std::process::exit(1);
    }

    Ok(())
}
