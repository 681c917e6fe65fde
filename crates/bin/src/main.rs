use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;

use nngraph_core::{
    data::{BatchQueue, MnistDataset, MnistSource},
    nn::{Adam, GradientDescent, LeNet, Mlp, Optimizer},
    train::{Callbacks, LogProgress, Metrics, TrainableModel, Trainer},
    Backend, CpuDevice, Device, KernelRegistry, Network, NetworkConfig, Shape,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a demo model on MNIST
    Train(TrainArgs),
    /// List every kernel the manifest registers
    Kernels {
        #[arg(long, default_value = "kernels/kernels.txt")]
        kernels: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelKind {
    Lenet,
    Mlp,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceKind {
    Cpu,
    Metal,
}

#[derive(Clone, Copy, ValueEnum)]
enum OptimizerKind {
    Adam,
    Sgd,
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long, value_enum, default_value_t = ModelKind::Mlp)]
    model: ModelKind,
    /// Directory holding the MNIST IDX files
    #[arg(long, default_value = "data")]
    data: PathBuf,
    #[arg(long, default_value = "kernels/kernels.txt")]
    kernels: PathBuf,
    #[arg(long, value_enum, default_value_t = DeviceKind::Cpu)]
    device: DeviceKind,
    #[arg(long, default_value_t = 64)]
    batch: usize,
    #[arg(long, default_value_t = 1000)]
    steps: usize,
    #[arg(long, value_enum, default_value_t = OptimizerKind::Adam)]
    optimizer: OptimizerKind,
    #[arg(long, default_value_t = 0.001)]
    lr: f32,
    #[arg(long, default_value_t = 200)]
    eval_every: usize,
    #[arg(long, default_value_t = NetworkConfig::DEFAULT_SEED)]
    seed: u64,
    /// Write trained parameters to this snapshot
    #[arg(long)]
    save: Option<PathBuf>,
    /// Start from the parameters in this snapshot
    #[arg(long)]
    load: Option<PathBuf>,
    /// Per-step loss and accuracy as CSV
    #[arg(long)]
    metrics: Option<PathBuf>,
    #[arg(long)]
    profile: bool,
    #[arg(long)]
    no_validate: bool,
}

struct CsvLogger {
    progress: LogProgress,
    rows: Vec<String>,
}

impl CsvLogger {
    fn new(every: usize) -> Self {
        Self {
            progress: LogProgress { every },
            rows: vec!["step,kind,loss,accuracy".to_string()],
        }
    }

    fn save(&self, path: &PathBuf) -> Result<()> {
        std::fs::write(path, self.rows.join("\n"))
            .with_context(|| format!("writing metrics to {}", path.display()))?;
        info!("saved metrics to {}", path.display());
        Ok(())
    }
}

impl Callbacks for CsvLogger {
    fn on_step_end(&mut self, step: usize, metrics: &Metrics) {
        self.progress.on_step_end(step, metrics);
        self.rows
            .push(format!("{},train,{:.6},{:.4}", step, metrics.loss, metrics.accuracy));
    }

    fn on_eval(&mut self, step: usize, metrics: &Metrics) {
        self.progress.on_eval(step, metrics);
        self.rows
            .push(format!("{},eval,{:.6},{:.4}", step, metrics.loss, metrics.accuracy));
    }
}

fn optimizer(args: &TrainArgs) -> Box<dyn Optimizer> {
    match args.optimizer {
        OptimizerKind::Adam => Box::new(Adam::new(args.lr)),
        OptimizerKind::Sgd => Box::new(GradientDescent::new(args.lr)),
    }
}

fn run_training<D: Device>(backend: Backend<D>, args: &TrainArgs) -> Result<()> {
    let config = NetworkConfig {
        validate: !args.no_validate,
        seed: args.seed,
        profile: args.profile,
    };
    let mut net = Network::new(backend, config);
    let model: Box<dyn TrainableModel> = match args.model {
        ModelKind::Lenet => Box::new(LeNet::build(&mut net)?),
        ModelKind::Mlp => Box::new(Mlp::build(&mut net, Shape::d3(28, 28, 1), &[784, 128, 10])?),
    };
    net.set_optimizer(optimizer(args))?;
    net.compile(args.batch)?;

    if let Some(path) = &args.load {
        net.load_snapshot(path, model.parameters())
            .with_context(|| format!("loading snapshot {}", path.display()))?;
    }

    info!("loading MNIST from {}", args.data.display());
    let train_set = Arc::new(MnistDataset::load_train(&args.data)?);
    let test_set = Arc::new(MnistDataset::load_test(&args.data)?);
    let pixels = train_set.pixels_per_image();

    let train_queue = Arc::new(BatchQueue::new(4, args.batch * pixels, args.batch));
    let test_queue = Arc::new(BatchQueue::new(2, args.batch * pixels, args.batch));
    let train_producer = train_queue.spawn_producer(MnistSource::new(train_set, args.batch));
    let test_producer = test_queue.spawn_producer(MnistSource::new(test_set, args.batch));

    let mut logger = CsvLogger::new(50);
    let result = Trainer::new(args.steps)
        .with_eval(args.eval_every, 10)
        .train(&mut net, model.as_ref(), &train_queue, Some(&test_queue), &mut logger);
    train_queue.close();
    test_queue.close();
    for producer in [train_producer, test_producer] {
        match producer.join() {
            Ok(outcome) => outcome?,
            Err(_) => bail!("batch producer panicked"),
        }
    }
    let history = result?;

    if let Some(last) = history.last() {
        info!("final loss={:.4}, accuracy={:.2}%", last.loss, last.accuracy * 100.0);
    }
    if let Some(path) = &args.metrics {
        logger.save(path)?;
    }
    if let Some(path) = &args.save {
        net.save_snapshot(path, model.parameters())
            .with_context(|| format!("saving snapshot {}", path.display()))?;
        info!("saved parameters to {}", path.display());
    }
    Ok(())
}

fn train(args: TrainArgs) -> Result<()> {
    let registry = KernelRegistry::from_manifest(&args.kernels, ".metal")
        .with_context(|| format!("loading kernel manifest {}", args.kernels.display()))?;
    match args.device {
        DeviceKind::Cpu => run_training(Backend::new(CpuDevice::new(), registry), &args),
        DeviceKind::Metal => run_metal(registry, &args),
    }
}

#[cfg(target_os = "macos")]
fn run_metal(registry: KernelRegistry, args: &TrainArgs) -> Result<()> {
    run_training(nngraph_gpu_metal::metal_backend(registry)?, args)
}

#[cfg(not(target_os = "macos"))]
fn run_metal(_registry: KernelRegistry, _args: &TrainArgs) -> Result<()> {
    bail!("the metal device is only available on macOS")
}

fn list_kernels(manifest: PathBuf) -> Result<()> {
    let registry = KernelRegistry::from_manifest(&manifest, ".metal")
        .with_context(|| format!("loading kernel manifest {}", manifest.display()))?;
    let mut names = registry.names();
    names.sort_unstable();
    for name in names {
        println!("{name}");
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Train(args) => train(args),
        Commands::Kernels { kernels } => list_kernels(kernels),
    }
}
