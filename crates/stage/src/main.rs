//! `stage`: services catalog stage requests by restaging archived files
//! through the driver (spec.md §4.G).

use std::path::PathBuf;

use catalog::{CatalogGateway, MongoCatalog};
use clap::Parser;
use common::{config::Config, shutdown::ShutdownSignal, MainError};
use stager::Stager;

#[derive(Parser, Debug)]
#[command(name = "stage", about = "Restages archived files on request")]
struct Args {
    #[arg(default_value = "/etc/dcache/container.conf")]
    config: PathBuf,
}

fn main() {
    if let Err(err) = real_main() {
        eprintln!("stage: {err}");
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
    tracing::info!(%script_id, "starting stage");

    let catalog = MongoCatalog::connect(&config.default.mongo_url, &config.default.mongo_db).await?;
    catalog.sanitize(&script_id).await?;

    let frontend = config
        .default
        .frontend
        .clone()
        .ok_or_else(|| anyhow::anyhow!("frontend is required by the stager"))?;
    let webdav_door = config
        .default
        .webdav_door
        .clone()
        .ok_or_else(|| anyhow::anyhow!("webdav_door is required by the stager"))?;
    let macaroon = load_macaroon(config.default.macaroon_path.as_deref())?;
    let http = build_http_client(&config)?;
    let webdav = common::webdav::WebDavClient::new(http.clone(), macaroon);
    let staging_dir = config.default.working_dir.join("stage-tmp");

    let stager = Stager::new(
        http,
        webdav,
        frontend,
        webdav_door,
        staging_dir,
        config.default.keep_archive_time_min,
        config.default.stage_wait_min_secs,
        config.default.stage_wait_max_secs,
    );

    let shutdown = ShutdownSignal::install();

    while shutdown.is_running() {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock is before the epoch")
            .as_secs() as i64;
        let outcome = stager.run_tick(&catalog, now).await?;
        tracing::info!(
            done = outcome.done,
            failed = outcome.failed,
            deferred = outcome.deferred,
            evicted_archives = outcome.evicted_archives,
            "stage tick complete",
        );
        let _ = common::status::write_status("stage", &script_id, "-", 0, 0, "next tick");
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
