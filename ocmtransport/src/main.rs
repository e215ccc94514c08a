use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::error;
use ocmtransport::{CopyOutcome, Engine, EngineConfig, Signer};

/// Copy a component and its dependency closure between OCI-like registries
/// through a declarative, filter-matched stage pipeline.
#[derive(Parser, Debug)]
#[command(name = "ocm-transport", version, about)]
struct Cli {
    /// Path to the transport config YAML (downloaders/processors/uploaders/processingRules).
    #[arg(long)]
    config: PathBuf,

    /// Path to the repository-context override document, if any.
    #[arg(long)]
    overrides: Option<PathBuf>,

    /// Default target repository context base URL, used where no override matches.
    #[arg(long)]
    repo_base_url: String,

    /// Component name to copy.
    #[arg(long)]
    component_name: String,

    /// Component version to copy.
    #[arg(long)]
    component_version: String,

    /// Only resolve and match; report the pipeline each resource would run without executing it.
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Sign descriptors leaves-first after processing, tagging the signature with this name.
    #[arg(long)]
    sign_as: Option<String>,

    /// Timeout applied to every individual stage invocation.
    #[arg(long, default_value_t = 300)]
    stage_timeout_secs: u64,

    /// Scratch directory for envelope temp files and UDS sockets.
    #[arg(long, default_value = "/tmp/ocm-transport")]
    work_dir: PathBuf,
}

/// A signer stub that refuses to sign: `--sign-as` wires this crate's
/// `Signer` contract up to a real key-management integration; none is
/// bundled here, matching spec.md's non-goal of not shipping a signing
/// backend.
struct UnconfiguredSigner;

#[async_trait::async_trait]
impl Signer for UnconfiguredSigner {
    async fn sign(&self, _descriptor_digest: &ocmoci::DigestSpec) -> Result<ocmoci::SignatureSpec, ocmtransport::Error> {
        Err(ocmtransport::Error::Sign {
            name: String::new(),
            version: String::new(),
            reason: "no signing backend configured".to_string(),
        })
    }
}

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_PROCESSING_ERROR: u8 = 2;
const EXIT_PUBLISH_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(Failure::Config(msg)) => {
            error!("config error: {msg}");
            ExitCode::from(EXIT_CONFIG_ERROR)
        }
        Err(Failure::Processing(msg)) => {
            error!("processing error: {msg}");
            ExitCode::from(EXIT_PROCESSING_ERROR)
        }
        Err(Failure::Publish(msg)) => {
            error!("publish error: {msg}");
            ExitCode::from(EXIT_PUBLISH_ERROR)
        }
    }
}

enum Failure {
    Config(String),
    Processing(String),
    Publish(String),
}

async fn run(cli: Cli) -> Result<(), Failure> {
    let config_yaml = std::fs::read_to_string(&cli.config).map_err(|e| Failure::Config(format!("reading {}: {e}", cli.config.display())))?;
    let transport_config = ocmconfig::TransportConfig::parse(&config_yaml).map_err(|e| Failure::Config(e.to_string()))?;

    let overrides = match &cli.overrides {
        Some(path) => {
            let yaml = std::fs::read_to_string(path).map_err(|e| Failure::Config(format!("reading {}: {e}", path.display())))?;
            ocmconfig::parse_overrides(&yaml).map_err(|e| Failure::Config(e.to_string()))?
        }
        None => Vec::new(),
    };

    std::fs::create_dir_all(&cli.work_dir).map_err(|e| Failure::Config(format!("creating work dir: {e}")))?;

    let cache_dir = cli.work_dir.join("cache");
    let cache = Arc::new(ocmcache::BlobCache::open(&cache_dir, 10 * 1024 * 1024 * 1024).map_err(|e| Failure::Config(format!("opening blob cache: {e}")))?);

    let http = reqwest::Client::builder().build().map_err(|e| Failure::Config(format!("building http client: {e}")))?;
    let registry: ocmoci::SharedRegistryClient = Arc::new(ocmoci::HttpRegistryClient::new(http));
    let digester: Arc<dyn ocmoci::Digester> = Arc::new(ocmoci::HttpRegistryClient::new(reqwest::Client::new()));

    let signer: Option<Arc<dyn Signer>> = cli.sign_as.as_ref().map(|_| Arc::new(UnconfiguredSigner) as Arc<dyn Signer>);

    let engine = Engine {
        registry,
        cache,
        digester,
        signer,
        config: EngineConfig {
            transport_config,
            default_repo_ctx: ocmoci::RepositoryContext {
                base_url: cli.repo_base_url,
                component_name_mapping: None,
                kind: "OCIRegistry".to_string(),
            },
            overrides,
            per_stage_timeout: Duration::from_secs(cli.stage_timeout_secs),
            signing_name: cli.sign_as,
            work_dir: cli.work_dir,
        },
    };

    match engine.copy(&cli.component_name, &cli.component_version, cli.dry_run).await {
        Ok(CopyOutcome::Copied) => {
            println!("copied {}:{}", cli.component_name, cli.component_version);
            Ok(())
        }
        Ok(CopyOutcome::DryRun(entries)) => {
            for entry in entries {
                println!(
                    "{}:{} resource {} -> downloader={} uploaders={:?} rules={:?}",
                    entry.descriptor_name, entry.descriptor_version, entry.resource_name, entry.matched.downloader, entry.matched.uploaders, entry.matched.rules
                );
            }
            Ok(())
        }
        Err(e @ ocmtransport::Error::Resolve(_)) => Err(Failure::Config(e.to_string())),
        Err(e @ (ocmtransport::Error::Processing { .. } | ocmtransport::Error::Sign { .. })) => Err(Failure::Processing(e.to_string())),
        Err(e @ (ocmtransport::Error::Publish { .. } | ocmtransport::Error::Registry(_))) => Err(Failure::Publish(e.to_string())),
        Err(e @ ocmtransport::Error::Json(_)) => Err(Failure::Processing(e.to_string())),
    }
}
