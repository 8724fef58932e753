use clap::{Parser, Subcommand};
use dotenv::dotenv;
use pef_inventory::artifact_repo::{ArtifactRepoConfig, ArtifactRepoFetcher};
use pef_inventory::cache::MetadataCache;
use pef_inventory::compare::InventoryComparer;
use pef_inventory::config::ReconcileConfig;
use pef_inventory::deployment::{build_cloud_inventory, load_deployments, write_cloud_inventory, Aggregator};
use pef_inventory::diff::ArtifactDiffEngine;
use pef_inventory::fetch::RetryingFetcher;
use pef_inventory::models::{cloud_model_paths, compare_models, load_model_mappings, studio_model_paths};
use pef_inventory::names::{ModelCapabilities, NameMappings};
use pef_inventory::object_store::{ObjectStoreConfig, ObjectStoreFetcher};
use pef_inventory::record::InventoryRow;
use pef_inventory::table::{read_studio_table, read_table, write_table};
use pef_inventory::{init_tracing, InventoryError};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pef-inventory")]
#[command(about = "Reconcile PEF inventories between cloud and studio", long_about = None)]
struct Cli {
    /// Directory for report files
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Metadata cache file
    #[arg(long, global = true)]
    cache_file: Option<PathBuf>,
    /// Repository substituted for {{ARTIFACTS_REPO}} in studio paths
    #[arg(long, global = true)]
    artifacts_repo: Option<String>,
    /// Parallel metadata fetches
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Aggregate deployment specs into the cloud inventory table
    CloudInventory {
        #[arg(long)]
        deployments_dir: Option<PathBuf>,
        #[arg(long)]
        mappings: Option<PathBuf>,
        #[arg(long)]
        capabilities: Option<PathBuf>,
        /// Where to write the table
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Compare the cloud inventory against the studio inventory
    Compare {
        #[arg(long)]
        cloud: Option<PathBuf>,
        #[arg(long)]
        studio: Option<PathBuf>,
    },
    /// Compare model checkpoint folders file by file
    CompareModels {
        #[arg(long)]
        cloud: Option<PathBuf>,
        #[arg(long)]
        studio: Option<PathBuf>,
        /// Cloud model name -> studio model name
        #[arg(long)]
        mappings: Option<PathBuf>,
    },
    /// Show what the metadata cache holds
    CacheStats,
}

fn main() {
    dotenv().ok();
    init_tracing("pef-inventory");
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("[pef-inventory] error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), InventoryError> {
    let mut config = ReconcileConfig::from_env()?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(file) = cli.cache_file {
        config.cache_file = file;
    }
    if let Some(repo) = cli.artifacts_repo {
        config.artifacts_repo = repo;
    }
    if let Some(workers) = cli.workers {
        config.fetch_workers = workers.max(1);
    }

    match cli.command {
        Commands::CloudInventory {
            deployments_dir,
            mappings,
            capabilities,
            out,
        } => {
            if let Some(dir) = deployments_dir {
                config.deployments_dir = dir;
            }
            if let Some(path) = mappings {
                config.model_mappings = path;
            }
            if capabilities.is_some() {
                config.model_capabilities = capabilities;
            }
            if let Some(path) = out {
                config.cloud_inventory = path;
            }
            cloud_inventory(&config)
        }
        Commands::Compare { cloud, studio } => {
            if let Some(path) = cloud {
                config.cloud_inventory = path;
            }
            if let Some(path) = studio {
                config.studio_inventory = path;
            }
            compare(&config)
        }
        Commands::CompareModels { cloud, studio, mappings } => {
            if let Some(path) = cloud {
                config.cloud_inventory = path;
            }
            if let Some(path) = studio {
                config.studio_inventory = path;
            }
            if let Some(path) = mappings {
                config.cloud_studio_model_mappings = path;
            }
            compare_model_folders(&config)
        }
        Commands::CacheStats => {
            let cache = MetadataCache::open(&config.cache_file);
            println!("[pef-inventory] Cache {}: {} entries", cache.path().display(), cache.len());
            cache.close()
        }
    }
}

fn cloud_inventory(config: &ReconcileConfig) -> Result<(), InventoryError> {
    let mappings = NameMappings::load(&config.model_mappings)?;
    let capabilities = match &config.model_capabilities {
        Some(path) => ModelCapabilities::load(path)?,
        None => ModelCapabilities::default(),
    };
    let aggregator = Aggregator::new(&mappings, &capabilities);
    let deployments = load_deployments(&config.deployments_dir)?;
    let inventory = build_cloud_inventory(&aggregator, &deployments)?;
    let rows = write_cloud_inventory(&config.cloud_inventory, &inventory)?;
    println!(
        "[pef-inventory] {} configs from {} deployments -> {}",
        rows.len(),
        deployments.len(),
        config.cloud_inventory.display()
    );
    Ok(())
}

fn studio_fetcher(config: &ReconcileConfig) -> Result<ArtifactRepoFetcher, InventoryError> {
    let repo_config = ArtifactRepoConfig::from_env()
        .ok_or_else(|| InventoryError::Config("PEF_INVENTORY_ARTIFACT_REPO_URL is not set".to_string()))?;
    ArtifactRepoFetcher::new(repo_config.with_timeout(config.fetch_timeout))
}

fn cloud_fetcher(config: &ReconcileConfig) -> Result<ObjectStoreFetcher, InventoryError> {
    ObjectStoreFetcher::new(ObjectStoreConfig::from_env().with_timeout(config.fetch_timeout))
}

fn compare(config: &ReconcileConfig) -> Result<(), InventoryError> {
    let cloud_rows: Vec<InventoryRow> = read_table(&config.cloud_inventory)?;
    let studio_rows = read_studio_table(&config.studio_inventory)?;
    let comparer = InventoryComparer::from_rows(
        cloud_rows,
        studio_rows,
        &config.studio_filter,
        config.artifacts_repo.clone(),
    )?;

    let cloud = RetryingFetcher::new(cloud_fetcher(config)?, config.retry);
    let studio = RetryingFetcher::new(studio_fetcher(config)?, config.retry);

    let report = MetadataCache::scoped(&config.cache_file, |cache| {
        let engine = ArtifactDiffEngine::new(cache, &cloud, &studio, config.artifacts_repo.clone())
            .with_workers(config.fetch_workers);
        let report = comparer.reconcile(&engine)?;
        let stats = cache.stats();
        println!("[pef-inventory] Cache: {} hits, {} misses", stats.hits, stats.misses);
        Ok::<_, InventoryError>(report)
    })?;
    report.write_to(&config.output_dir)?;

    println!(
        "[pef-inventory] {} common, {} cloud-only, {} studio-only, {} to onboard",
        report.common.len(),
        report.cloud_only.len(),
        report.studio_only.len(),
        report.onboarding.len()
    );
    if report.failed_comparisons() > 0 {
        println!(
            "[pef-inventory] {} PEF comparisons failed; see comparison_error",
            report.failed_comparisons()
        );
    }
    Ok(())
}

fn compare_model_folders(config: &ReconcileConfig) -> Result<(), InventoryError> {
    let cloud_rows: Vec<InventoryRow> = read_table(&config.cloud_inventory)?;
    let studio_rows = read_studio_table(&config.studio_inventory)?;
    let mappings = load_model_mappings(&config.cloud_studio_model_mappings)?;

    let cloud = cloud_fetcher(config)?;
    let studio = studio_fetcher(config)?;
    let rows = compare_models(
        &cloud_model_paths(&cloud_rows),
        &studio_model_paths(&studio_rows, &config.artifacts_repo),
        &mappings,
        &cloud,
        &studio,
    )?;

    let out = config.output_dir.join("model_comparison.json");
    write_table(&out, &rows)?;
    let different = rows.iter().filter(|r| !r.is_same).count();
    println!(
        "[pef-inventory] {} model pairs compared, {} different -> {}",
        rows.len(),
        different,
        out.display()
    );
    Ok(())
}
