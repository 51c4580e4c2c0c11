use anyhow::{bail, Context, Result};
use clap::Parser;
use retriever_core::{
    concatenate, load_contexts, load_dataset, load_tokenizer, preview, save_results, BertEncoder,
    DenseMethod, DenseRetrieval, DeviceKind, HybridLogisticRetrieval, PipelineRun,
    RetrievalResult, RetrievalSummary, RunMode, RunStatus, SparseMethod, SparseRetrieval, Timer,
    TrainingArgs, DEFAULT_CONTEXT_PATH, DEFAULT_DATASET, DEFAULT_DATA_PATH, DEFAULT_MODEL,
    DEFAULT_NUM_NEG, DEFAULT_SEED, DEFAULT_TOPK, HYBRID_MODEL_FILE,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const PRINT_RESULTS: usize = 10;

#[derive(Debug, Parser)]
#[command(name = "retriever")]
#[command(about = "Hybrid sparse + dense passage retrieval over a QA dataset")]
struct Cli {
    /// Directory holding the `train` and `validation` splits (.parquet or .jsonl).
    #[arg(long, alias = "dataset_name", env = "RETRIEVER_DATASET_NAME", default_value = DEFAULT_DATASET)]
    dataset_name: PathBuf,

    /// Checkpoint directory: config.json, optional model.safetensors and tokenizer.json.
    #[arg(long, alias = "model_name_or_path", env = "RETRIEVER_MODEL_NAME_OR_PATH", default_value = DEFAULT_MODEL)]
    model_name_or_path: PathBuf,

    /// Directory for the passage corpus and every persisted artifact.
    #[arg(long, alias = "data_path", env = "RETRIEVER_DATA_PATH", default_value = DEFAULT_DATA_PATH)]
    data_path: PathBuf,

    #[arg(long, alias = "context_path", env = "RETRIEVER_CONTEXT_PATH", default_value = DEFAULT_CONTEXT_PATH)]
    context_path: String,

    #[arg(long, env = "RETRIEVER_TOPK", default_value_t = DEFAULT_TOPK)]
    topk: usize,

    #[arg(long, alias = "dense_method", env = "RETRIEVER_DENSE_METHOD", default_value = "bert")]
    dense_method: DenseMethod,

    #[arg(long, env = "RETRIEVER_DEVICE", default_value = "cpu")]
    device: DeviceKind,

    /// `train` fits encoders and combiner; `eval` reuses saved artifacts.
    #[arg(long, env = "RETRIEVER_MODE", default_value = "train")]
    mode: RunMode,

    #[arg(long, alias = "sparse_method", env = "RETRIEVER_SPARSE_METHOD", default_value = "tfidf")]
    sparse_method: SparseMethod,

    /// Query the train split as well as validation.
    #[arg(long, env = "RETRIEVER_INCLUDE_TRAIN")]
    include_train: bool,

    #[arg(long, env = "RETRIEVER_SEED", default_value_t = DEFAULT_SEED)]
    seed: u64,

    /// In-batch negatives sampled per question.
    #[arg(long, env = "RETRIEVER_NUM_NEG", default_value_t = DEFAULT_NUM_NEG)]
    num_neg: usize,

    #[arg(long, env = "RETRIEVER_EPOCHS", default_value_t = 5)]
    epochs: usize,

    #[arg(long, env = "RETRIEVER_LEARNING_RATE", default_value_t = 3e-5)]
    learning_rate: f64,

    #[arg(long, env = "RETRIEVER_BATCH_SIZE", default_value_t = 1)]
    batch_size: usize,

    #[arg(long, env = "RETRIEVER_WEIGHT_DECAY", default_value_t = 0.01)]
    weight_decay: f64,

    #[arg(long, env = "RETRIEVER_MAX_SEQ_LEN", default_value_t = 512)]
    max_seq_len: usize,

    /// Write per-query results here (.csv, anything else is JSONL).
    #[arg(long, env = "RETRIEVER_RESULTS_OUTPUT")]
    results_output: Option<PathBuf>,
}

impl Cli {
    fn validate(&self) -> Result<()> {
        for (flag, value) in [
            ("--topk", self.topk),
            ("--num-neg", self.num_neg),
            ("--batch-size", self.batch_size),
            ("--epochs", self.epochs),
        ] {
            if value == 0 {
                bail!("{flag} must be greater than 0");
            }
        }
        Ok(())
    }

    fn training_args(&self) -> TrainingArgs {
        TrainingArgs {
            learning_rate: self.learning_rate,
            per_device_train_batch_size: self.batch_size,
            num_train_epochs: self.epochs,
            weight_decay: self.weight_decay,
            max_seq_len: self.max_seq_len,
            seed: self.seed,
            ..TrainingArgs::default()
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

fn print_results(results: &[RetrievalResult]) {
    for (i, r) in results.iter().take(PRINT_RESULTS).enumerate() {
        println!("[{i}] question: {}", r.question);
        println!(
            "original context: {}",
            r.original_context.as_deref().unwrap_or("")
        );
        println!("retrieved context: {}", r.context);
        println!();
    }
}

fn pipeline(cli: &Cli, run: &mut PipelineRun) -> Result<RetrievalSummary> {
    let datasets = load_dataset(&cli.dataset_name)?;
    let (queries, split_name) = if cli.include_train {
        (
            concatenate(&[&datasets.train, &datasets.validation]),
            "train+validation",
        )
    } else {
        (datasets.validation.clone(), "validation")
    };

    println!("{}", "*".repeat(40));
    println!("query dataset");
    println!("{}", preview(&queries, 2)?);
    println!("dataset size: {}", queries.len());
    println!("dataset type: {split_name}");

    let corpus = Arc::new(load_contexts(&cli.data_path, &cli.context_path)?);
    info!(passages = corpus.len(), "corpus loaded");

    let device = cli.device.device()?;
    info!(dense_method = %cli.dense_method, device = %cli.device, "building encoders");
    let p_encoder = BertEncoder::from_pretrained(&cli.model_name_or_path, &device)
        .context("build passage encoder")?;
    let q_encoder = BertEncoder::from_pretrained(&cli.model_name_or_path, &device)
        .context("build query encoder")?;
    let tokenizer = load_tokenizer(&cli.model_name_or_path, p_encoder.config().vocab_size)?;

    run.advance(RunStatus::Indexing);
    let mut sparse = SparseRetrieval::with_corpus(tokenizer.clone(), &cli.data_path, corpus.clone());
    sparse.get_embedding(cli.sparse_method)?;

    run.advance(RunStatus::Training);
    let mut dense = DenseRetrieval::with_corpus(
        cli.training_args(),
        datasets.train.clone(),
        &cli.data_path,
        corpus,
        cli.num_neg,
        tokenizer,
        p_encoder,
        q_encoder,
    )?;
    match cli.mode {
        RunMode::Train => {
            let losses = dense.train()?;
            info!(epochs = losses.len(), last_loss = ?losses.last(), "dense encoders trained");
        }
        RunMode::Eval => dense.load_model()?,
    }
    dense.get_passage_embedding(cli.mode)?;

    run.advance(RunStatus::Fitting);
    let mut retriever =
        HybridLogisticRetrieval::new(cli.mode, datasets.train, &cli.data_path, sparse, dense)?;
    retriever.get_logistic_regression(HYBRID_MODEL_FILE, &[0, 1], cli.topk)?;

    run.advance(RunStatus::Retrieving);
    let results = {
        let _timer = Timer::new("bulk query by exhaustive search");
        let results = retriever.retrieve(&queries, cli.topk)?;
        print_results(&results);
        results
    };

    let summary = RetrievalSummary::from_results(&results);
    println!(
        "correct retrieval result by exhaustive search {}",
        summary.topk_hit
    );
    println!("MRR = {}", summary.mrr);

    if let Some(path) = &cli.results_output {
        save_results(path, &results)?;
        info!(path = %path.display(), results = results.len(), "results written");
    }
    Ok(summary)
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    cli.validate()?;

    let run_id = format!("retrieve-{}", chrono::Utc::now().timestamp_millis());
    let mut run = PipelineRun::start(
        run_id,
        cli.dataset_name.to_string_lossy().into_owned(),
        cli.mode,
        cli.sparse_method,
        cli.topk,
    );

    match pipeline(&cli, &mut run) {
        Ok(summary) => {
            run.on_completed(summary);
            info!(
                run = %serde_json::to_string(&run).context("serialize run")?,
                "run completed"
            );
            Ok(())
        }
        Err(err) => {
            run.on_failed(format!("{err:#}"));
            error!(run_id = %run.run_id, status = ?run.status, "run failed");
            Err(err)
        }
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
