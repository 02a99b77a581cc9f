use anyhow::{Context, Result};
use basket_recs::Pipeline;
use basket_recs_core::{init_logging, load_dotenv, LoggingConfig, PipelineConfig};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "basket-recs")]
#[command(about = "Candidate generation and ranking pipeline for basket recommendations", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        long,
        global = true,
        env = "BASKET_RECS_CONFIG",
        help = "Path to a configuration file"
    )]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Build the interaction table, sparse matrices and encoders")]
    Load {
        #[arg(help = "Training line items (tab-separated)")]
        train: PathBuf,

        #[arg(long, help = "Validation line items appended to the corpus")]
        val: Option<PathBuf>,
    },

    #[command(about = "Train the BM25, TF-IDF, cosine and ALS retrieval models")]
    TrainCandidateModels,

    #[command(about = "Generate candidates for the receipts of a basket file")]
    InferenceCandidates {
        #[arg(help = "Basket line items (tab-separated)")]
        baskets: PathBuf,
    },

    #[command(about = "Sample training pairs and train the ranker")]
    TrainRanker {
        #[arg(help = "Training line items (tab-separated)")]
        train: PathBuf,

        #[arg(long, help = "Validation line items")]
        val: Option<PathBuf>,
    },

    #[command(about = "Join context and item features onto the stored candidates")]
    CandidatesJoinFeatures {
        #[arg(help = "Context line items of the receipts to recommend for")]
        context: PathBuf,
    },

    #[command(about = "Rank candidates and select recommendations")]
    MakeRecommendations {
        #[arg(help = "Context line items of the receipts to recommend for")]
        context: PathBuf,

        #[arg(short, long, default_value = "1", help = "Recommendations per receipt")]
        k: usize,
    },

    #[command(about = "Accuracy of the recommendations against held-out targets")]
    EvaluateCommonMetrics {
        #[arg(help = "Target file with receipt_id and item_id columns")]
        targets: PathBuf,
    },

    #[command(about = "Recall of the candidates against held-out targets")]
    EvaluateCandidatesMetrics {
        #[arg(help = "Target file with receipt_id and item_id columns")]
        targets: PathBuf,
    },

    #[command(about = "Look up stored recommendations by receipt id")]
    Show {
        #[arg(help = "Receipt id; prompts interactively when omitted")]
        receipt_id: Option<i64>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    load_dotenv();

    let cli = Cli::parse();

    init_logging(LoggingConfig::from_env()?).context("Failed to initialize logging")?;

    let config = match &cli.config {
        Some(path) => PipelineConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => PipelineConfig::load().context("Failed to load config")?,
    };
    let pipeline = Pipeline::new(config);

    match cli.command {
        Commands::Load { train, val } => {
            pipeline.load(&train, val.as_deref())?;
        }
        Commands::TrainCandidateModels => {
            pipeline.train_candidate_models()?;
        }
        Commands::InferenceCandidates { baskets } => {
            pipeline.inference_candidates(&baskets)?;
        }
        Commands::TrainRanker { train, val } => {
            pipeline.train_ranker(&train, val.as_deref())?;
        }
        Commands::CandidatesJoinFeatures { context } => {
            pipeline.candidates_join_features(&context)?;
        }
        Commands::MakeRecommendations { context, k } => {
            pipeline.make_recommendations(&context, k)?;
        }
        Commands::EvaluateCommonMetrics { targets } => {
            let metrics = pipeline.evaluate_common_metrics(&targets)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::EvaluateCandidatesMetrics { targets } => {
            let metrics = pipeline.evaluate_candidates_metrics(&targets)?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Show { receipt_id: Some(id) } => {
            print_recommendations(&pipeline, id)?;
        }
        Commands::Show { receipt_id: None } => {
            show_interactive(&pipeline)?;
        }
    }

    Ok(())
}

fn print_recommendations(pipeline: &Pipeline, receipt_id: i64) -> Result<()> {
    let recommendations = pipeline.show(receipt_id)?;
    if recommendations.is_empty() {
        println!("No recommendations for receipt {receipt_id}");
    }
    for rec in recommendations {
        println!(
            "{}\t{}\t{}\t{:.4}",
            rec.receipt_id, rec.rank, rec.item_id, rec.score
        );
    }
    Ok(())
}

fn show_interactive(pipeline: &Pipeline) -> Result<()> {
    let stdin = io::stdin();
    loop {
        print!("Input receipt id ['exit' to stop]: ");
        io::stdout().flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            return Ok(());
        }
        let input = line.trim();
        if input == "exit" {
            return Ok(());
        }
        match input.parse::<i64>() {
            Ok(receipt_id) => print_recommendations(pipeline, receipt_id)?,
            Err(_) => println!("Not a receipt id: {input}"),
        }
    }
}
