//! `pack`: the group packer control loop (spec.md §4.D/§4.E). Claims new
//! files into size-bounded containers and seals them.

use std::path::PathBuf;

use catalog::{CatalogGateway, MongoCatalog};
use clap::Parser;
use common::{config::Config, shutdown::ShutdownSignal, MainError};
use fetch::ReplicaFetcher;
use packer::{run_group_tick, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "pack", about = "Packs catalog-flagged new files into sealed archives")]
struct Args {
    /// Path to container.conf. Defaults to /etc/dcache/container.conf.
    #[arg(default_value = "/etc/dcache/container.conf")]
    config: PathBuf,
}

fn main() {
    if let Err(err) = real_main() {
        eprintln!("pack: {err}");
        std::process::exit(err.exit_code());
    }
}

// `Result<(), E>`'s default `Termination` impl always exits 1 on `Err`,
// which would collapse `MainError::NotRoot`'s exit code 2 (spec.md §6)
// into 1. Matching on `exit_code()` in `main` keeps the distinction.
fn real_main() -> Result<(), MainError> {
    let args = Args::parse();
    if !common::rootcheck::running_as_root() {
        return Err(MainError::NotRoot);
    }
    let config = Config::load(&args.config)?;
    let _guard = common::logging::init(config.default.log_level);

    let tokio_runtime = tokio::runtime::Runtime::new().expect("failed to start tokio runtime");
    tokio_runtime.block_on(run(config)).map_err(MainError::Fatal)
}

async fn run(config: Config) -> anyhow::Result<()> {
    let script_id = config.default.script_id.clone();
    tracing::info!(%script_id, "starting pack");

    let catalog = MongoCatalog::connect(&config.default.mongo_url, &config.default.mongo_db).await?;
    catalog.sanitize(&script_id).await?;

    let macaroon = load_macaroon(config.default.macaroon_path.as_deref())?;
    let http = build_http_client(&config)?;
    let webdav = common::webdav::WebDavClient::new(http.clone(), macaroon);
    let fetcher = ReplicaFetcher::new(http, webdav, config.default.webdav_door.clone());

    let shutdown = ShutdownSignal::install();
    let clock = SystemClock;

    while shutdown.is_running() {
        for group in &config.groups {
            let outcome = run_group_tick(
                &catalog,
                &fetcher,
                &clock,
                &config.default.working_dir,
                &script_id,
                group,
                &shutdown,
            )
            .await?;
            tracing::info!(
                group = %group.name,
                sealed = outcome.sealed,
                discarded = outcome.discarded,
                verification_failed = outcome.verification_failed,
                quota_stopped = outcome.quota_stopped,
                "group tick complete",
            );
            let _ = common::status::write_status(
                "pack",
                &script_id,
                &group.name,
                0,
                group.archive_size_bytes,
                "next tick",
            );
            if outcome.aborted_by_shutdown {
                break;
            }
        }
        if !shutdown.is_running() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(config.default.loop_delay_secs)).await;
    }

    tracing::info!("shutdown requested, exiting cleanly");
    Ok(())
}

fn load_macaroon(path: Option<&std::path::Path>) -> anyhow::Result<Option<String>> {
    match path {
        Some(p) => Ok(Some(std::fs::read_to_string(p)?.trim().to_string())),
        None => Ok(None),
    }
}

fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let common::config::TlsVerify::Off = config.default.tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    Ok(builder.build()?)
}
