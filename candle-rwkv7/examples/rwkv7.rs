use anyhow::Result;
use clap::Parser;

use candle::DType;
use candle_rwkv7::config::{Config, Strategy};
use candle_rwkv7::model::Model;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// Safetensors checkpoint, possibly split over several comma separated files.
    #[arg(long)]
    weights: String,

    /// Device and precision, e.g. "cpu fp32", "cuda bf16" or "cpu fp32i8".
    #[arg(long, default_value = "cpu fp32")]
    strategy: String,

    /// Json config file, overrides --strategy and --fused.
    #[arg(long)]
    config: Option<String>,

    /// Use the fused kernels when available.
    #[arg(long)]
    fused: bool,

    /// Comma separated prompt token ids.
    #[arg(long, value_delimiter = ',', required = true)]
    tokens: Vec<u32>,

    /// The length of the sample to generate (in tokens).
    #[arg(long, short = 'n', default_value_t = 100)]
    sample_len: usize,
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt::init();
        None
    };

    let config = match &args.config {
        Some(path) => serde_json::from_str::<Config>(&std::fs::read_to_string(path)?)?,
        None => {
            let strategy: Strategy = args.strategy.parse()?;
            Config::new(strategy).with_fused_kernels(args.fused)
        }
    };
    let cfg = config.build()?;
    println!(
        "strategy: {:?} {} quantize: {} recurrence: {}",
        cfg.device,
        cfg.precision,
        cfg.quantize,
        cfg.kernels.recurrence.name()
    );

    let start = std::time::Instant::now();
    let mut tensors = std::collections::HashMap::new();
    for file in args.weights.split(',') {
        tensors.extend(candle::safetensors::load(file, &cfg.device)?);
    }
    let model = Model::from_checkpoint(tensors, &cfg)?;
    println!("loaded the model in {:?}", start.elapsed());

    let start = std::time::Instant::now();
    let (logits, mut state) = model.forward(&args.tokens, None, false, None)?;
    println!(
        "prefilled {} tokens in {:?}",
        args.tokens.len(),
        start.elapsed()
    );

    let mut next_logits = logits;
    let mut generated = Vec::with_capacity(args.sample_len);
    let start_gen = std::time::Instant::now();
    for _ in 0..args.sample_len {
        let next_token = next_logits.to_dtype(DType::F32)?.argmax(0)?.to_scalar::<u32>()?;
        generated.push(next_token);
        if next_token == 0 {
            break;
        }
        next_logits = model.forward_one(next_token, &mut state)?;
    }
    let dt = start_gen.elapsed();
    println!("{generated:?}");
    println!(
        "{} tokens generated ({:.2} token/s)",
        generated.len(),
        generated.len() as f64 / dt.as_secs_f64(),
    );
    Ok(())
}
