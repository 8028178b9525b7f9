use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use nl2sql_retrieval::corpus::TrainingCorpus;
use nl2sql_retrieval::linking::{SqliteProbeProvider, ValueProbeProvider};
use nl2sql_retrieval::pipeline::load_catalog;
use nl2sql_retrieval::skeleton::to_skeleton;
use nl2sql_retrieval::{Nl2SqlConfig, Nl2SqlPipeline};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nl2sql")]
#[command(about = "Few-shot NL2SQL with schema linking and skeleton-aware example retrieval")]
struct Args {
    /// JSON config file (defaults come from the environment / .env)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate SQL for a question
    Ask {
        question: String,

        #[arg(long)]
        db_id: String,

        /// Extra document context for the refinement prompt
        #[arg(long)]
        context: Option<String>,

        /// Draft stage only, retrying invalid SQL
        #[arg(long)]
        single_stage: bool,
    },
    /// Precompute corpus embeddings and drop stale target embeddings
    WarmCache {
        /// Remove persisted target embeddings older than this many hours
        #[arg(long, default_value_t = 24)]
        max_target_age_hours: u64,
    },
    /// Print tokens, links and the masked question as JSON
    Link {
        question: String,

        #[arg(long)]
        db_id: String,
    },
    /// Print the skeleton of a SQL query
    Skeleton { sql: String },
    /// Recompute tokens, links and skeletons for the whole corpus
    Preprocess {
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Nl2SqlConfig> {
    match path {
        Some(path) => Nl2SqlConfig::load(path).map_err(|e| anyhow!("{}", e)),
        None => Nl2SqlConfig::from_env().map_err(|e| anyhow!("{}", e)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    match args.command {
        Command::Skeleton { sql } => {
            println!("{}", to_skeleton(&sql, None));
        }
        Command::Preprocess { out } => {
            let config = load_config(args.config.as_ref())?;
            let catalog = load_catalog(&config)?;
            let mut corpus = TrainingCorpus::load(&config.corpus_path)?;
            let probes = config.db_dir.clone().map(SqliteProbeProvider::new);
            let updated = corpus.preprocess(
                &catalog,
                probes.as_ref().map(|p| p as &dyn ValueProbeProvider),
            );
            corpus.save(&out)?;
            info!("Wrote {} examples ({} preprocessed) to {}", corpus.len(), updated, out.display());
        }
        Command::WarmCache {
            max_target_age_hours,
        } => {
            let config = load_config(args.config.as_ref())?;
            let pipeline = Nl2SqlPipeline::from_config(config)?;
            pipeline
                .store()
                .warm_up(pipeline.corpus(), pipeline.masker())
                .await?;
            let removed = pipeline
                .store()
                .cleanup_stale_targets(Duration::from_secs(max_target_age_hours * 3600))?;
            info!("Removed {} stale target embeddings", removed);
        }
        Command::Link { question, db_id } => {
            let config = load_config(args.config.as_ref())?;
            let pipeline = Nl2SqlPipeline::from_config(config)?;
            let linked = pipeline.link(&question, &db_id).await?;
            let masked = pipeline
                .masker()
                .mask_question(&linked.tokens, &linked.sc_link, &linked.cv_link);
            let output = serde_json::json!({
                "tokens": linked.tokens,
                "sc_link": linked.sc_link,
                "cv_link": linked.cv_link,
                "masked_question": masked,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Ask {
            question,
            db_id,
            context,
            single_stage,
        } => {
            let config = load_config(args.config.as_ref())?;
            let pipeline = Nl2SqlPipeline::from_config(config)?;
            info!("Question: {}", question);

            if single_stage {
                match pipeline.single_stage(&question, &db_id).await? {
                    Some(sql) => println!("{}", sql),
                    None => return Err(anyhow!("Could not generate valid SQL")),
                }
                return Ok(());
            }

            let response = pipeline.run(&question, context.as_deref(), &db_id).await?;
            match (&response.sql, &response.explanation) {
                (Some(sql), _) => println!("{}", sql),
                (None, Some(explanation)) => println!("{}", explanation),
                (None, None) => println!("No SQL generated"),
            }
        }
    }

    Ok(())
}
