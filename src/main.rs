//! nvs-blob CLI - persist and read back blobs in a file-backed NVS partition
//!
//! `run` is the demonstration loop: bring the partition up, bump the restart
//! counter, then probe and rewrite the configured blobs every interval until
//! Ctrl-C or the pass limit. The other commands inspect or edit the partition.

use clap::{Parser, Subcommand};
use nvs_blob::{
    init_storage, BlobCycle, BlobStoreClient, CancelToken, Config, Error, FileFlash, Nvs, NvsApi,
    OpenMode,
};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "nvs-blob")]
#[command(about = "Persist and read back binary blobs in a non-volatile key-value store")]
#[command(version)]
struct Cli {
    /// Path to the partition file
    #[arg(short, long, default_value = "nvs.bin")]
    partition: PathBuf,

    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format (json or text)
    #[arg(short, long, default_value = "json")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the read/write loop
    Run {
        /// Stop after this many passes (default: run until Ctrl-C)
        #[arg(short = 'n', long)]
        passes: Option<u64>,
        /// Pause between passes in milliseconds
        #[arg(short, long)]
        interval_ms: Option<u64>,
        /// Keep existing data instead of erasing the partition at start
        #[arg(long)]
        no_erase: bool,
    },

    /// Report the stored size of each configured blob
    Probe,

    /// Write each configured blob once and commit
    Save {
        /// Pass number used for pass-filled blobs
        #[arg(long, default_value = "1")]
        pass: u64,
    },

    /// Read a key
    Get {
        key: String,
        /// Namespace (defaults to the configured one)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Write a blob and commit
    Put {
        key: String,
        /// Write this many zero bytes
        #[arg(long, conflicts_with = "text", required_unless_present = "text")]
        len: Option<usize>,
        /// Write this text as the blob
        #[arg(long)]
        text: Option<String>,
        /// Namespace (defaults to the configured one)
        #[arg(short, long)]
        namespace: Option<String>,
    },

    /// Show the restart counter
    Counter,

    /// Show partition usage
    Stats,

    /// Erase the whole partition
    Erase,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::resolve(cli.config.as_deref())?;
    let nvs = Nvs::new(FileFlash::new(&cli.partition, config.storage.capacity))
        .with_max_blob_size(config.storage.max_blob_size);

    match cli.command {
        Commands::Run {
            passes,
            interval_ms,
            no_erase,
        } => {
            let mut cycle_config = config.cycle.clone();
            if let Some(ms) = interval_ms {
                anyhow::ensure!(ms > 0, "interval must be positive");
                cycle_config.interval_ms = ms;
            }
            let erase_on_boot = cycle_config.erase_on_boot && !no_erase;

            info!(partition = %cli.partition.display(), erase_on_boot, "starting");
            let boot = init_storage(&nvs, erase_on_boot)?;

            let cycle = BlobCycle::new(&nvs, cycle_config, config.storage.max_blob_size);
            let restarts = match cycle.bump_restart_counter() {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "could not update restart counter");
                    None
                }
            };

            let cancel = CancelToken::new();
            let handler_token = cancel.clone();
            ctrlc::set_handler(move || {
                warn!("signal received, stopping");
                handler_token.cancel();
            })?;

            let summary = cycle.run(&cancel, passes);
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "init": boot.history(),
                    "retried": boot.retried(),
                    "restart_counter": restarts,
                    "passes": summary.passes,
                    "read_errors": summary.read_errors,
                    "save_errors": summary.save_errors
                }),
            );
        }

        Commands::Probe => {
            nvs.init()?;
            let cycle = BlobCycle::new(&nvs, config.cycle.clone(), config.storage.max_blob_size);
            let report = cycle.read_probe()?;
            output(&cli.format, &serde_json::to_value(&report)?);
        }

        Commands::Save { pass } => {
            nvs.init()?;
            let cycle = BlobCycle::new(&nvs, config.cycle.clone(), config.storage.max_blob_size);
            let report = cycle.save_blobs(pass)?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "pass": report.pass,
                    "bytes_written": report.bytes_written
                }),
            );
        }

        Commands::Get { key, namespace } => {
            nvs.init()?;
            let namespace = namespace.unwrap_or_else(|| config.cycle.namespace.clone());
            let client = BlobStoreClient::new(&nvs, namespace.as_str());

            let ns = match client.open(OpenMode::ReadOnly) {
                Ok(ns) => ns,
                Err(e) if e.is_not_found() => not_found(&cli.format, &namespace, &key),
                Err(e) => return Err(e.into()),
            };

            match ns.read_blob(&key, config.storage.max_blob_size) {
                Ok(data) => {
                    // An empty stored blob reads back as nothing
                    let data = match data {
                        Some(data) => data,
                        None if ns.find_blob_size(&key)?.is_some() => Vec::new(),
                        None => not_found(&cli.format, &namespace, &key),
                    };
                    let preview = &data[..data.len().min(32)];
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "namespace": namespace,
                            "key": key,
                            "type": "blob",
                            "size": data.len(),
                            "blake3": blake3::hash(&data).to_hex().to_string(),
                            "preview": hex::encode(preview)
                        }),
                    );
                }
                Err(Error::TypeMismatch(_)) => {
                    let value = ns.get_i32_or(&key, 0)?;
                    output(
                        &cli.format,
                        &serde_json::json!({
                            "namespace": namespace,
                            "key": key,
                            "type": "i32",
                            "value": value
                        }),
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Commands::Put {
            key,
            len,
            text,
            namespace,
        } => {
            nvs.init()?;
            let namespace = namespace.unwrap_or_else(|| config.cycle.namespace.clone());
            let data = match (len, text) {
                (_, Some(text)) => text.into_bytes(),
                (Some(len), None) => vec![0u8; len],
                (None, None) => anyhow::bail!("either --len or --text is required"),
            };

            let client = BlobStoreClient::new(&nvs, namespace.as_str());
            let ns = client.open(OpenMode::ReadWrite)?;
            ns.set_blob(&key, &data)?;
            ns.commit()?;
            ns.close();
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "namespace": namespace,
                    "key": key,
                    "size": data.len()
                }),
            );
        }

        Commands::Counter => {
            nvs.init()?;
            let cycle = BlobCycle::new(&nvs, config.cycle.clone(), config.storage.max_blob_size);
            output(
                &cli.format,
                &serde_json::json!({
                    "key": config.cycle.counter_key,
                    "value": cycle.restart_counter()?
                }),
            );
        }

        Commands::Stats => {
            nvs.init()?;
            let stats = nvs.stats()?;
            let mut value = serde_json::to_value(&stats)?;
            value["partition"] = serde_json::json!(cli.partition.display().to_string());
            value["namespace_names"] = serde_json::json!(nvs.namespaces()?);
            output(&cli.format, &value);
        }

        Commands::Erase => {
            nvs.erase()?;
            output(
                &cli.format,
                &serde_json::json!({
                    "status": "ok",
                    "message": format!("Erased partition {}", cli.partition.display())
                }),
            );
        }
    }

    Ok(())
}

fn not_found(format: &OutputFormat, namespace: &str, key: &str) -> ! {
    output(
        format,
        &serde_json::json!({
            "status": "error",
            "message": format!("Not found: {}/{}", namespace, key)
        }),
    );
    std::process::exit(1);
}

fn output(format: &OutputFormat, value: &serde_json::Value) {
    match format {
        OutputFormat::Json => {
            println!("{}", value);
        }
        OutputFormat::Text => {
            println!(
                "{}",
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            );
        }
    }
}
