//! Exposes the command line application.
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use wardrobe_sync::SyncLayer;
use wardrobe_sync::config::Config;
use wardrobe_sync::metrics;
use wardrobe_sync::providers::HttpBackend;

/// The environment variable to read the access token from.
const ACCESS_TOKEN_VAR: &str = "WARDROBE_ACCESS_TOKEN";

#[derive(Debug, Subcommand)]
enum Command {
    /// Print the current session as JSON.
    Session,

    /// Print a signed URL for every photo path.
    Sign {
        /// Storage paths of the photos, relative to the bucket.
        #[arg(required = true)]
        paths: Vec<String>,
    },

    /// Delete a wardrobe item together with its photos.
    Delete {
        /// The id of the item.
        id: String,

        /// A storage path of a photo belonging to the item. Can be repeated.
        #[arg(long = "path", value_name = "PATH")]
        paths: Vec<String>,
    },
}

/// A command line client for the wardrobe backend.
///
/// Requests act on behalf of the user owning the access token passed via `--access-token` or the
/// `WARDROBE_ACCESS_TOKEN` environment variable. Without a token, requests are anonymous.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The access token to sign in with.
    #[arg(long, global = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime is only started below, so this is still single-threaded.
    unsafe { crate::logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let access_token = cli
        .access_token
        .or_else(|| env::var(ACCESS_TOKEN_VAR).ok());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(config, access_token, cli.command))
}

async fn run(config: Config, access_token: Option<String>, command: Command) -> Result<()> {
    let Some(backend_config) = config.backend.clone() else {
        bail!("the configuration file has no `backend` section");
    };
    let backend = Arc::new(HttpBackend::new(backend_config)?);
    let layer = SyncLayer::with_backend(&config, backend.clone());

    if let Some(token) = access_token {
        backend.sign_in(&token).await.context("failed to sign in")?;
    }

    let result = match command {
        Command::Session => {
            let session = layer.ensure_auth_ready(config.auth.ready_timeout).await;
            let json = serde_json::to_string_pretty(&session.as_deref())?;
            println!("{json}");
            Ok(())
        }
        Command::Sign { paths } => {
            let urls = layer.signed_urls(&paths).await;
            let mut failed = 0;
            for (path, url) in paths.iter().zip(urls) {
                match url {
                    Some(url) => println!("{url}"),
                    None => {
                        eprintln!("{path}: could not create a signed URL");
                        failed += 1;
                    }
                }
            }
            match failed {
                0 => Ok(()),
                _ => Err(anyhow::anyhow!(
                    "failed to sign {failed} of {} paths",
                    paths.len()
                )),
            }
        }
        Command::Delete { id, paths } => match layer.delete_item(&id, &paths).await {
            Ok(true) => {
                println!("deleted {id}");
                Ok(())
            }
            Ok(false) => {
                println!("{id} does not exist");
                Ok(())
            }
            Err(err) => Err(anyhow::Error::new(err).context(format!("failed to delete {id}"))),
        },
    };

    layer.shutdown().await;
    result
}
