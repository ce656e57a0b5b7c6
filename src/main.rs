//! postvec CLI
//!
//! Builds, publishes and syncs the community post search index.
//!
//! # Usage
//!
//! ```bash
//! # Placeholder posts + their embeddings (output/embeddings.pvec)
//! postvec generate --seed 7
//!
//! # HNSW index over the stored embeddings
//! postvec build-index --m 16 --ef-construction 200
//!
//! # Query the local index
//! postvec test-query "yoga classes downtown" -k 5
//!
//! # Publish to a blob store, then follow it from a consumer
//! POSTVEC_STORE=/srv/blobs postvec upload
//! POSTVEC_STORE=/srv/blobs postvec sync --once
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use postvec::builder::{embed_documents, DocumentRecord, Generation, IndexBuilder};
use postvec::config::Config;
use postvec::embedder::{CachedEmbedder, Embedder, HashEmbedder, HttpEmbedder};
use postvec::engine::{IndexQueryEngine, ScoreMode};
use postvec::manifest::{next_version, now_unix_secs, Manifest};
use postvec::publish::{describe, Publisher};
use postvec::storage::{open_store, BlobStore};
use postvec::store::EmbeddingStore;
use postvec::sync::SyncClient;
use postvec::synthetic::{self, Event};
use postvec::{format::PvecWriter, Metric};

#[derive(Parser)]
#[command(name = "postvec")]
#[command(about = "Versioned HNSW index builder and sync client for community post search")]
#[command(version)]
struct Cli {
    /// Working directory for artifacts (overrides POSTVEC_OUTPUT_DIR)
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    /// Embedding service URL (overrides EMBEDDING_API_URL)
    #[arg(long, global = true)]
    embedding_url: Option<String>,

    /// Blob store: URL, directory or `memory:` (overrides POSTVEC_STORE)
    #[arg(long, global = true)]
    store: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Clone)]
struct BuildArgs {
    /// HNSW M parameter (max neighbors per layer)
    #[arg(long, default_value = "16")]
    m: usize,

    /// HNSW ef_construction parameter (search depth during build)
    #[arg(long, default_value = "200")]
    ef_construction: usize,

    /// Distance metric: cosine, ip or l2
    #[arg(long, default_value = "cosine")]
    metric: Metric,

    /// Fixed seed for reproducible graphs
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate placeholder posts and embed them
    Generate {
        /// RNG seed for users and timestamps
        #[arg(long, default_value = "42")]
        seed: u64,
    },

    /// Build the HNSW index from the stored embeddings
    BuildIndex {
        #[command(flatten)]
        build: BuildArgs,
    },

    /// Run a text query against the local index
    TestQuery {
        query: String,

        #[arg(short, long, default_value = "5")]
        k: usize,

        /// Search beam width (defaults to the engine's ef_search)
        #[arg(long)]
        ef: Option<usize>,

        /// Drop hits scoring below this
        #[arg(long)]
        min_score: Option<f32>,

        /// Clamp scores into [0, 1]
        #[arg(long)]
        clamp: bool,
    },

    /// Publish the local generation to the blob store
    Upload,

    /// Follow the blob store's latest generation
    Sync {
        /// Poll once and exit
        #[arg(long)]
        once: bool,

        /// Seconds between polls (overrides POSTVEC_SYNC_INTERVAL_SECS)
        #[arg(long)]
        interval: Option<u64>,
    },

    /// Print statistics for the local generation
    Stats,

    /// generate, build-index, test-query and (if a store is set) upload
    All {
        #[arg(long, default_value = "42")]
        seed: u64,

        #[command(flatten)]
        build: BuildArgs,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(err) = run(Cli::parse()) {
        tracing::error!("{:#}", err);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env().context("reading configuration from environment")?;
    if let Some(dir) = cli.output_dir {
        config.output_dir = dir;
    }
    if let Some(url) = cli.embedding_url {
        config.embedding_api_url = Some(url);
    }
    if let Some(store) = cli.store {
        config.store = Some(store);
    }

    match cli.command {
        Commands::Generate { seed } => generate(&config, seed),
        Commands::BuildIndex { build } => build_index(&mut config, &build).map(|_| ()),
        Commands::TestQuery {
            query,
            k,
            ef,
            min_score,
            clamp,
        } => {
            config.engine.min_score = min_score;
            if clamp {
                config.engine.score_mode = ScoreMode::Clamped;
            }
            test_query(&config, &query, k, ef)
        }
        Commands::Upload => upload(&config),
        Commands::Sync { once, interval } => {
            if let Some(secs) = interval {
                config.sync_interval = Duration::from_secs(secs);
            }
            sync(&config, once)
        }
        Commands::Stats => stats(&config),
        Commands::All { seed, build } => {
            generate(&config, seed)?;
            build_index(&mut config, &build)?;
            test_query(&config, "community events this weekend", 5, None)?;
            if config.store.is_some() {
                upload(&config)?;
            } else {
                tracing::info!("No blob store configured, skipping upload");
            }
            Ok(())
        }
    }
}

fn make_embedder(config: &Config) -> anyhow::Result<Box<dyn Embedder>> {
    match &config.embedding_api_url {
        Some(url) => {
            tracing::info!("Using embedding service at {}", url);
            let http = HttpEmbedder::new(url, &config.model_id, config.embedding_timeout)?;
            Ok(Box::new(CachedEmbedder::new(http, config.embedding_cache_size)))
        }
        None => {
            tracing::warn!(
                "EMBEDDING_API_URL not set, using offline hash embedder (dim={}, not semantic)",
                config.dimensions
            );
            Ok(Box::new(HashEmbedder::new(config.dimensions)))
        }
    }
}

fn generate(config: &Config, seed: u64) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("creating {:?}", config.output_dir))?;

    let events = synthetic::generate(seed, now_unix_secs() as i64);
    let events_path = config.events_path();
    std::fs::write(&events_path, serde_json::to_vec_pretty(&events)?)?;
    tracing::info!("Saved {} events to {:?}", events.len(), events_path);

    let embedder = make_embedder(config)?;
    let documents = synthetic::searchable_documents(&events);
    let (records, report) = embed_documents(embedder.as_ref(), &documents, Some(config.dimensions));
    if records.is_empty() {
        bail!("no document could be embedded ({} skipped)", report.skipped.len());
    }

    let path = config.embeddings_path();
    let mut writer = PvecWriter::create(&path, config.dimensions, embedder.model_id())?;
    for record in &records {
        writer.write_vector(&record.id, &record.vector)?;
    }
    let (_, count) = writer.finish()?;
    tracing::info!(
        "Saved {} embeddings to {:?} (skipped {})",
        count,
        path,
        report.skipped.len()
    );
    Ok(())
}

fn build_index(config: &mut Config, args: &BuildArgs) -> anyhow::Result<Manifest> {
    config.index.m = args.m;
    config.index.ef_construction = args.ef_construction;
    config.index.metric = args.metric;
    config.index.seed = args.seed;

    let path = config.embeddings_path();
    let store = EmbeddingStore::open(&path)
        .with_context(|| format!("opening embeddings {:?} (run `postvec generate` first)", path))?;
    tracing::info!("Loaded {} embeddings of dimension {} from {:?}", store.len(), store.dim(), path);

    let documents = store
        .iter()
        .map(|row| {
            row.map(|(id, vector)| DocumentRecord {
                id: id.to_string(),
                vector: vector.to_vec(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Validation happens before anything is written
    let generation = IndexBuilder::new(config.index.clone())
        .build_generation(&documents, store.model_id())?;
    drop(store);
    let artifacts = generation.write_to_dir(&config.output_dir)?;

    let previous = std::fs::read(config.manifest_path())
        .ok()
        .and_then(|bytes| Manifest::from_json(&bytes).ok())
        .map(|m| m.version);
    let version = next_version(previous, now_unix_secs());
    let manifest = describe(
        version,
        generation.len(),
        generation.dim(),
        generation.model_id(),
        &artifacts,
    )?;
    std::fs::write(config.manifest_path(), manifest.to_json()?)?;
    tracing::info!(
        "Saved index to {:?} (version={} vectors={})",
        config.index_path(),
        version,
        manifest.total_vectors
    );
    Ok(manifest)
}

fn load_local(config: &Config) -> anyhow::Result<(u64, Generation)> {
    let generation = Generation::read_from_dir(&config.output_dir)
        .with_context(|| format!("loading index from {:?} (run `postvec build-index` first)", config.output_dir))?;
    let version = std::fs::read(config.manifest_path())
        .ok()
        .and_then(|bytes| Manifest::from_json(&bytes).ok())
        .map(|m| m.version)
        .unwrap_or(0);
    Ok((version, generation))
}

fn test_query(config: &Config, query: &str, k: usize, ef: Option<usize>) -> anyhow::Result<()> {
    let (version, generation) = load_local(config)?;
    let engine = IndexQueryEngine::new(config.engine.clone());
    engine.adopt(version, generation);

    let embedder = make_embedder(config)?;
    let vector = embedder
        .embed(query)
        .map_err(|e| anyhow!("embedding query failed: {e}"))?;
    let hits = match ef {
        Some(ef) => engine.search_with_ef(&vector, k, ef)?,
        None => engine.search(&vector, k)?,
    };

    let contents: HashMap<String, String> = std::fs::read(config.events_path())
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Vec<Event>>(&bytes).ok())
        .map(|events| events.into_iter().map(|e| (e.id, e.content)).collect())
        .unwrap_or_default();

    println!("Search results for: '{query}'");
    println!("{}", "-".repeat(50));
    for (i, hit) in hits.iter().enumerate() {
        let content = contents.get(&hit.id).map(String::as_str).unwrap_or("N/A");
        let preview: String = content.chars().take(80).collect();
        println!("{}. [score: {:.3}] {} {}", i + 1, hit.score, short_id(&hit.id), preview);
    }
    Ok(())
}

/// First 12 characters of a document id, for display
fn short_id(id: &str) -> String {
    id.chars().take(12).collect()
}

fn blob_store(config: &Config) -> anyhow::Result<Box<dyn BlobStore>> {
    let location = config
        .store
        .as_deref()
        .ok_or_else(|| anyhow!("no blob store configured (set POSTVEC_STORE or --store)"))?;
    let is_http = location.starts_with("http://") || location.starts_with("https://");
    if is_http && config.store_token.is_none() {
        bail!("POSTVEC_STORE_TOKEN is required for HTTP blob stores");
    }
    Ok(open_store(location, config.store_token.clone())?)
}

fn upload(config: &Config) -> anyhow::Result<()> {
    let (_, generation) = load_local(config)?;
    let publisher = Publisher::new(blob_store(config)?);
    let manifest = publisher.publish(&generation)?;
    println!("Published version {} ({} vectors)", manifest.version, manifest.total_vectors);
    Ok(())
}

fn sync(config: &Config, once: bool) -> anyhow::Result<()> {
    let engine = Arc::new(IndexQueryEngine::new(config.engine.clone()));
    let client = SyncClient::new(blob_store(config)?, engine.clone()).with_mirror(config.mirror_dir())?;

    restore_cached(&client);

    if once {
        let state = client.poll()?;
        println!("{}", serde_json::to_string_pretty(&engine.stats())?);
        tracing::info!("Sync state: {:?}", state);
        return Ok(());
    }

    // Sender held for the life of the process; the loop runs until killed
    let (_shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    client.run(config.sync_interval, shutdown_rx);
    Ok(())
}

/// Serve the mirrored generation while the first poll runs. A mirror that
/// fails to load is left for the remote to replace.
fn restore_cached<S: BlobStore>(client: &SyncClient<S>) -> Option<u64> {
    match client.restore_local() {
        Ok(Some(version)) => {
            tracing::info!("Serving cached version {} while syncing", version);
            Some(version)
        }
        Ok(None) => None,
        Err(e) => {
            tracing::warn!("Local mirror restore failed, syncing from remote: error={}", e);
            None
        }
    }
}

fn stats(config: &Config) -> anyhow::Result<()> {
    let (version, generation) = load_local(config)?;
    let index_stats = generation.index().stats();
    let engine = IndexQueryEngine::new(config.engine.clone());
    engine.adopt(version, generation);

    println!("{}", serde_json::to_string_pretty(&engine.stats())?);
    println!(
        "graph: max_layer={} total_edges={} layer_counts={:?} m={} ef_construction={}",
        index_stats.max_layer,
        index_stats.total_edges,
        index_stats.layer_counts,
        index_stats.m,
        index_stats.ef_construction
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use postvec::builder::IndexParams;
    use postvec::manifest::LATEST_MANIFEST;
    use postvec::storage::MemoryBlobStore;
    use postvec::sync::SyncState;

    #[test]
    fn test_short_id_respects_char_boundaries() {
        assert_eq!(short_id("abc"), "abc");
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("ééééééééééééé"), "éééééééééééé");
        assert_eq!(short_id("投稿投稿投稿投稿投稿投稿投稿"), "投稿投稿投稿投稿投稿投稿");
    }

    #[test]
    fn test_corrupt_mirror_falls_through_to_remote() {
        let mirror = tempfile::tempdir().unwrap();
        let pointer = mirror.path().join(LATEST_MANIFEST);
        std::fs::create_dir_all(pointer.parent().unwrap()).unwrap();
        std::fs::write(&pointer, b"{not json").unwrap();

        let docs: Vec<DocumentRecord> = (0..4)
            .map(|i| DocumentRecord {
                id: format!("doc-{i}"),
                vector: vec![i as f32, 1.0, 0.5],
            })
            .collect();
        let generation = IndexBuilder::new(IndexParams {
            seed: Some(3),
            ..IndexParams::default()
        })
        .build_generation(&docs, "m")
        .unwrap();
        let store = Arc::new(MemoryBlobStore::new());
        let published = Publisher::new(store.clone()).publish(&generation).unwrap();

        let engine = Arc::new(IndexQueryEngine::default());
        let client = SyncClient::new(store, engine.clone())
            .with_mirror(mirror.path())
            .unwrap();
        assert_eq!(restore_cached(&client), None);
        assert_eq!(client.poll().unwrap(), SyncState::HaveVersion(published.version));
        assert_eq!(engine.stats().total_vectors, 4);
    }
}
