use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessera_llm::{
    EngineConfig, Error, ErrorKind, InferenceEngine, ModelConfig, RequestChannel, RequestInput,
    Result, SamplingConfig, StubLoader, Waiter,
};

#[derive(Parser, Debug)]
#[command(name = "tessera-llm")]
#[command(about = "A block-based LLM inference serving engine")]
struct Args {
    /// Engine configuration (JSON). Defaults to a single stub model.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model to send the demo request to.
    #[arg(long, default_value = "demo")]
    model: String,

    /// Input token ids, comma separated.
    #[arg(long, default_value = "1,2,3,4")]
    tokens: String,

    /// Maximum tokens to generate.
    #[arg(long, default_value = "16")]
    max_tokens: usize,
}

fn demo_config(model: &str) -> EngineConfig {
    EngineConfig {
        tensor_parallel_size: 1,
        pipeline_parallel_size: 1,
        models: vec![ModelConfig { name: model.to_string(), ..Default::default() }],
        ..Default::default()
    }
}

fn parse_tokens(list: &str) -> Result<Vec<u32>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .map_err(|_| Error::InvalidArgument(format!("bad token id '{s}'")))
        })
        .collect()
}

fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => demo_config(&args.model),
    };

    let channel = Arc::new(RequestChannel::new());
    let engine = InferenceEngine::new(config, &StubLoader, channel.clone())?;
    engine.start()?;

    // Act as the front end: write one request into the channel and stream
    // the generated tokens back.
    let req_id = engine.id_generator().next_id();
    let waiter = Arc::new(Waiter::new());
    channel.write(RequestInput {
        req_id,
        model_name: args.model.clone(),
        token_sequences: vec![parse_tokens(&args.tokens)?],
        sampling_configs: vec![SamplingConfig { max_tokens: args.max_tokens, ..Default::default() }],
        waiter,
    })?;
    info!(req_id, model = %args.model, "demo request submitted");

    // The ingestion thread hands the request over asynchronously; wait for
    // the batch manager to know about it before streaming.
    let stream = loop {
        match engine.stream(req_id) {
            Ok(stream) => break stream,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e),
        }
    };

    print!("generated:");
    for token in stream {
        print!(" {token}");
    }
    println!();

    engine.stop()?;
    let outputs = engine.fetch_result(req_id)?;
    info!(tokens = outputs[0].len(), "request complete");
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
