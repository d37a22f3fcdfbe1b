mod app_config;

use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use app_config::AppConfig;
use lib::{demos, network, trace, utils, TraceOptions};
use tracing::info;

#[derive(Parser)]
struct Cli {
  /// YAML config file
  #[arg(short, long, value_name = "PATH")]
  config: Option<PathBuf>,
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand)]
enum Command {
  /// Record one of the bundled demo programs as a graph
  Trace {
    /// Demo program name (see `doctor`)
    #[arg(short, long, default_value = "mix")]
    demo: String,
    /// Directory for the emitted artifacts
    #[arg(short, long, value_name = "PATH", default_value = "out")]
    output: PathBuf,
    /// Trace with a fixed batch of one instead of dynamic shapes
    #[arg(long)]
    fixed_batch: bool,
    /// Seed for the demo input generator
    #[arg(long, value_name = "INT")]
    seed: Option<u64>,
  },
  /// List the bundled demo programs
  Doctor,
}

fn main() -> Result<(), Box<dyn Error>> {
  utils::init_logging()?;
  let args = Cli::parse();

  let config = match &args.config {
    Some(path) => {
      let text = fs::read_to_string(path)?;
      let from_file: AppConfig = serde_yaml::from_str(&text)?;
      AppConfig::default().merge(from_file)
    }
    None => AppConfig::default(),
  };

  match args.command {
    Command::Trace {
      demo,
      output,
      fixed_batch,
      seed,
    } => {
      let program = demos::by_name(&demo).ok_or_else(|| format!("unknown demo `{}`", demo))?;
      let seed = seed.or(config.seed).unwrap_or(7);
      let options = TraceOptions {
        dynamic_shape: !fixed_batch,
        ..TraceOptions::default()
      };
      let traced = trace(program, &demos::demo_inputs(seed), options)?;

      fs::create_dir_all(&output)?;
      utils::serialize_to_file(&output.join("metadata.json"), &traced.metadata())?;
      if config.artifacts.unwrap_or(true) {
        network::save_graphviz(
          output.join("graph.dot").to_string_lossy().into_owned(),
          &traced.network,
        )?;
        fs::write(
          output.join("graph.graphml"),
          network::graphml_string(&traced.network)?,
        )?;
      }
      info!(
        demo = demo.as_str(),
        nodes = traced.network.node_count(),
        "artifacts written"
      );
    }
    Command::Doctor => {
      for (name, _) in demos::DEMOS {
        println!("{}", name);
      }
    }
  }
  Ok(())
}
