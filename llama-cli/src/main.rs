use anyhow::Result;
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::error;
use llama_inference::{InferenceConfigBuilder, inspect_model, run_inference};

/// Define the inference subcommand.
fn inference_subcommand() -> Command {
    Command::new("inference")
        .about("Run a Llama 3 GGUF model")
        .arg(
            Arg::new("model")
                .help("Model file in GGUF format (F32, Q8_0 or Q4_0 weights)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], 0 = greedy [default: 0.1]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1] [default: 0.95]")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = model context length")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Maximum positions per request [default: 512]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("mode")
                .short('m')
                .long("mode")
                .value_name("STRING")
                .help("Mode: generate|chat [default: chat]")
                .default_value("chat"),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Input prompt"),
        )
        .arg(
            Arg::new("system")
                .short('y')
                .long("system")
                .value_name("STRING")
                .help("System prompt in chat mode"),
        )
        .arg(
            Arg::new("threads")
                .long("threads")
                .value_name("INT")
                .help("Worker threads for matmul and attention [default: all cores]")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("no-vector")
                .long("no-vector")
                .help("Use scalar dot products only")
                .action(ArgAction::SetTrue),
        )
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    Command::new("inspect")
        .about("Print GGUF metadata and tensor table")
        .arg(Arg::new("model").help("Model file in GGUF format").required(true).index(1))
}

/// Run the inference command with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .model_path(matches.get_one::<String>("model"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .topp(matches.get_one::<f32>("topp").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .max_tokens(matches.get_one::<usize>("max-tokens").copied())
        .mode(matches.get_one::<String>("mode"))
        .prompt(matches.get_one::<String>("input"))
        .system_prompt(matches.get_one::<String>("system"))
        .threads(matches.get_one::<usize>("threads").copied())
        .vector_kernels(matches.get_flag("no-vector").then_some(false))
        .build()?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e}"))?;

    Ok(())
}

fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    match matches.get_one::<String>("model") {
        Some(path) => inspect_model(path),
        None => anyhow::bail!("Model path is required"),
    }
}

fn execute_commands() -> Result<()> {
    // Message-only log lines; verbosity comes from RUST_LOG
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("llama")
        .about("Llama CLI: run and inspect quantized Llama 3 GGUF models")
        .subcommand(inference_subcommand())
        .subcommand(inspect_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("inference", matches)) => run_inference_command(matches),
        Some(("inspect", matches)) => run_inspect_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
