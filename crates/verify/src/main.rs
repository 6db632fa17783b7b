//! `verify`: uploads sealed containers and reconciles their checksums
//! against the catalog (spec.md §4.F).

use std::path::PathBuf;

use catalog::{CatalogGateway, MongoCatalog};
use clap::Parser;
use common::{config::Config, shutdown::ShutdownSignal, MainError};

#[derive(Parser, Debug)]
#[command(name = "verify", about = "Uploads sealed archives and reconciles digests")]
struct Args {
    #[arg(default_value = "/etc/dcache/container.conf")]
    config: PathBuf,
}

fn main() {
    if let Err(err) = real_main() {
        eprintln!("verify: {err}");
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
    tracing::info!(%script_id, "starting verify");

    let catalog = MongoCatalog::connect(&config.default.mongo_url, &config.default.mongo_db).await?;
    catalog.sanitize(&script_id).await?;

    let webdav_door = config
        .default
        .webdav_door
        .clone()
        .ok_or_else(|| anyhow::anyhow!("webdav_door is required by the verifier"))?;
    let macaroon = load_macaroon(config.default.macaroon_path.as_deref())?;
    let http = build_http_client(&config)?;
    let webdav = common::webdav::WebDavClient::new(http, macaroon);

    let shutdown = ShutdownSignal::install();

    while shutdown.is_running() {
        let outcome = verifier::run_verify_tick(&catalog, &webdav, &webdav_door).await?;
        tracing::info!(
            promoted = outcome.promoted,
            digest_mismatches = outcome.digest_mismatches,
            missing_archives = outcome.missing_archives,
            skipped_bad_zip = outcome.skipped_bad_zip,
            "verify tick complete",
        );
        let _ = common::status::write_status("verify", &script_id, "-", 0, 0, "next tick");
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
