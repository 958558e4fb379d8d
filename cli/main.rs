#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use itertools::izip;
use std::path::PathBuf;
use std::process;

use sdlearn::data::{load_table, load_training_data};
use sdlearn::state::keys;
use sdlearn::validate::score_prediction;
use sdlearn::{
    FitMode, Prediction, PredictionMethod, Predictor, ResultState, RunContext, SdlConfig,
    SupervisedDictionaryLearner,
};

const RESULT_PATH: &str = "sdl_result.toml";
const CONFIG_PATH: &str = "sdl_config.toml";
const PREDICTIONS_PATH: &str = "predictions.tsv";

#[derive(Clone, Copy, ValueEnum)]
pub enum ModeCli {
    Filter,
    Feature,
}

impl From<ModeCli> for FitMode {
    fn from(mode: ModeCli) -> Self {
        match mode {
            ModeCli::Filter => FitMode::Filter,
            ModeCli::Feature => FitMode::Feature,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
pub enum MethodCli {
    Filter,
    Naive,
    Alt,
    Exhaustive,
}

impl From<MethodCli> for PredictionMethod {
    fn from(method: MethodCli) -> Self {
        match method {
            MethodCli::Filter => PredictionMethod::Filter,
            MethodCli::Naive => PredictionMethod::Naive,
            MethodCli::Alt => PredictionMethod::Alt,
            MethodCli::Exhaustive => PredictionMethod::Exhaustive,
        }
    }
}

#[derive(Args)]
pub struct TrainArgs {
    /// Path to training TSV file with a 'label' column, optional aux_* columns and feature columns
    pub training_data: PathBuf,

    /// Held-out TSV file (same columns) scored during and after training
    #[arg(long, value_name = "PATH")]
    pub test_data: Option<PathBuf>,

    /// TOML configuration file; command-line flags override its values
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Number of dictionary atoms
    #[arg(long, value_name = "R")]
    pub n_components: Option<usize>,

    /// Number of outer block coordinate descent iterations
    #[arg(long)]
    pub iterations: Option<usize>,

    /// Alternation schedule
    #[arg(long, value_enum)]
    pub option: Option<ModeCli>,

    /// Train the classifier on the raw features, without a dictionary
    #[arg(long)]
    pub full_dim: bool,

    /// Fixed reconstruction/classification trade-off; estimated from the residual when omitted
    #[arg(long)]
    pub xi: Option<f64>,

    /// Re-estimate xi after every outer iteration
    #[arg(long)]
    pub update_nuisance_param: bool,

    /// Stop early once held-out accuracy exceeds 0.99 (needs --test-data)
    #[arg(long)]
    pub validate: bool,

    /// Seed for initialization and subsampling
    #[arg(long)]
    pub seed: Option<u64>,

    /// Show a progress bar on stderr
    #[arg(long)]
    pub progress: bool,
}

#[derive(Args)]
pub struct PredictArgs {
    /// Path to TSV file with the training feature columns (a 'label' column enables scoring)
    pub data: PathBuf,

    /// Result file written by 'train'
    #[arg(long, default_value = RESULT_PATH)]
    pub model: String,

    /// Configuration used for training
    #[arg(long, default_value = CONFIG_PATH)]
    pub config: String,

    /// Code inference method; defaults to the one matching the training schedule
    #[arg(long, value_enum)]
    pub method: Option<MethodCli>,
}

#[derive(Parser)]
#[command(
    name = "sdlearn",
    about = "Supervised dictionary learning by block coordinate descent",
    long_about = "Learns a low-rank dictionary of the features jointly with a logistic classifier \
                 on the reduced representation, and predicts binary labels for new samples."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a supervised dictionary model
    #[command(about = "Train a model (outputs: sdl_result.toml, sdl_config.toml)")]
    Train(TrainArgs),

    /// Predict labels for new samples
    #[command(about = "Apply a trained model to new data (outputs: predictions.tsv)")]
    Predict(PredictArgs),
}

fn train_config(args: &TrainArgs) -> Result<SdlConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            println!("Loading configuration from: {path}");
            SdlConfig::load(path)?
        }
        None => SdlConfig::default(),
    };
    if let Some(r) = args.n_components {
        config.n_components = r;
    }
    if let Some(iterations) = args.iterations {
        config.iterations = iterations;
    }
    if let Some(mode) = args.option {
        config.option = mode.into();
    }
    if let Some(xi) = args.xi {
        config.xi = Some(xi);
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.full_dim |= args.full_dim;
    config.update_nuisance_param |= args.update_nuisance_param;
    config.if_validate |= args.validate;
    config.show_progress |= args.progress;
    config.validate()?;
    Ok(config)
}

pub fn train(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = train_config(&args)?;

    println!("Loading training data from: {}", args.training_data.display());
    let data = load_training_data(&args.training_data, args.test_data.as_deref())?;
    println!(
        "Loaded {} samples with {} features and {} auxiliary covariates{}",
        data.n_samples(),
        data.n_features(),
        data.n_aux(),
        if data.held_out.is_some() { " (plus held-out data)" } else { "" }
    );

    let mut learner = SupervisedDictionaryLearner::new(data, config.clone())?;
    let termination = learner.fit()?;
    println!("Training finished: {}", termination.as_str());

    let results = learner.results();
    if let (Some(auc), Some(threshold)) = (
        results.scalar(keys::TRAINING_AUC),
        results.scalar(keys::TRAINING_THRESHOLD),
    ) {
        println!("Training AUC {auc:.3} at threshold {threshold:.3}");
    }
    if let Some(accuracy) = results.scalar(keys::ACCURACY) {
        println!("Held-out accuracy {accuracy:.3}");
    }

    results.save(RESULT_PATH)?;
    config.save(CONFIG_PATH)?;
    println!("Model saved to: {RESULT_PATH} (configuration: {CONFIG_PATH})");
    Ok(())
}

pub fn predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = if std::path::Path::new(&args.config).exists() {
        SdlConfig::load(&args.config)?
    } else {
        println!("No configuration at {}; using defaults.", args.config);
        SdlConfig::default()
    };
    let results = ResultState::load(&args.model)?;
    let method = args
        .method
        .map_or_else(|| config.option.default_prediction(), PredictionMethod::from);
    let predictor = Predictor::from_results(&results, &config, method)?;

    println!("Loading prediction data from: {}", args.data.display());
    let table = load_table(&args.data, false)?;
    let mut ctx = RunContext::new(config.seed);

    let prediction = predictor.predict(
        table.features.view(),
        table.aux.as_ref().map(|a| a.view()),
        &mut ctx,
    )?;
    if let Some(labels) = &table.labels {
        let report = score_prediction(labels.view(), &prediction);
        println!(
            "Scored against labels: AUC {:.3}, accuracy {:.3}, F1 {:.3}",
            report.auc,
            report.accuracy(),
            report.confusion.f1_score()
        );
    }

    save_predictions(&prediction, PREDICTIONS_PATH)?;
    println!("Predictions ({method}) saved to: {PREDICTIONS_PATH}");
    Ok(())
}

fn save_predictions(prediction: &Prediction, output_path: &str) -> Result<(), csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_path(output_path)?;
    let code_columns = (1..=prediction.code.nrows()).map(|k| format!("code_{k}"));
    writer.write_record(
        ["sample", "probability", "prediction"]
            .into_iter()
            .map(str::to_string)
            .chain(code_columns),
    )?;
    for (i, p, y, code) in izip!(
        1..,
        prediction.p_pred.iter(),
        prediction.y_hat.iter(),
        prediction.code.columns()
    ) {
        let mut fields = vec![i.to_string(), p.to_string(), (*y as i64).to_string()];
        fields.extend(code.iter().map(f64::to_string));
        writer.write_record(&fields)?;
    }
    writer.flush()?;
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let Cli { command } = cli;

    let result = match command {
        Some(Commands::Train(args)) => train(args),
        Some(Commands::Predict(args)) => predict(args),
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
