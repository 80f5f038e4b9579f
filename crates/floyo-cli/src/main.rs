use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use floyo_contracts::config::Flux2Config;
use floyo_contracts::events::EventWriter;
use floyo_contracts::nodes::{NodeOperation, NodeRegistry};
use floyo_contracts::receipts::write_receipt;
use floyo_contracts::variants::Flux2Variant;
use floyo_engine::codec::{image_to_tensor, tensor_to_image};
use floyo_engine::{Flux2Node, NodeContext, NodeInputs, NodeOutput};
use ndarray::ArrayD;
use serde_json::{json, Value};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "floyo_flux2=info,floyo_engine=info,floyo_contracts=info";
/// Exit status when the node reports an error message instead of an image.
const NODE_MESSAGE_EXIT: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "floyo-flux2", version, about = "FLUX.2 [pro]/[flex] generation and editing")]
struct Cli {
    /// INI file with an [API] section (defaults to $FLOYO_CONFIG or ./config.ini).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Append job lifecycle events to this JSONL file.
    #[arg(long, global = true)]
    events: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Generate(GenerateArgs),
    Edit(EditArgs),
    /// Print the node schemas as JSON.
    Schema,
    /// Print the resolved configuration with the API key masked.
    Config,
}

#[derive(Debug, Args)]
struct GenerateArgs {
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Args)]
struct EditArgs {
    /// Base image to edit.
    #[arg(long)]
    image: PathBuf,
    /// Additional reference images, assigned to input_image_2, input_image_3, ...
    #[arg(long = "reference")]
    references: Vec<PathBuf>,
    #[command(flatten)]
    job: JobArgs,
}

#[derive(Debug, Args)]
struct JobArgs {
    #[arg(long, default_value = "pro")]
    variant: Flux2Variant,
    #[arg(long)]
    prompt: String,
    #[arg(long)]
    width: Option<i64>,
    #[arg(long)]
    height: Option<i64>,
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,
    #[arg(long)]
    safety_tolerance: Option<i64>,
    #[arg(long)]
    output_format: Option<String>,
    #[arg(long)]
    guidance: Option<f64>,
    #[arg(long)]
    steps: Option<i64>,
    #[arg(long)]
    out: PathBuf,
    #[arg(long)]
    receipt: Option<PathBuf>,
}

impl JobArgs {
    /// Only flags that were given; the node schema fills in the rest.
    fn node_inputs(&self) -> NodeInputs {
        let mut inputs = NodeInputs::new().with_widget("prompt", json!(self.prompt));
        let optional = [
            ("width", self.width.map(Value::from)),
            ("height", self.height.map(Value::from)),
            ("seed", self.seed.map(Value::from)),
            ("safety_tolerance", self.safety_tolerance.map(Value::from)),
            ("output_format", self.output_format.clone().map(Value::from)),
            ("guidance", self.guidance.map(Value::from)),
            ("steps", self.steps.map(Value::from)),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                inputs = inputs.with_widget(name, value);
            }
        }
        inputs
    }
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("floyo-flux2 error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = Flux2Config::from_process_env(cli.config.as_deref());
    let events = cli
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, uuid::Uuid::new_v4().to_string()));
    let ctx = NodeContext::new(config).with_events(events);

    match cli.command {
        Command::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(&NodeRegistry::default().to_json())?
            );
            Ok(0)
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&ctx.config().describe())?);
            Ok(0)
        }
        Command::Generate(args) => {
            let node = Flux2Node::for_variant(args.job.variant, NodeOperation::TextToImage);
            run_node(&ctx, &node, args.job.node_inputs(), &args.job)
        }
        Command::Edit(args) => {
            let node = Flux2Node::for_variant(args.job.variant, NodeOperation::ImageEdit);
            let inputs =
                attach_images(&node, args.job.node_inputs(), &args.image, &args.references)?;
            run_node(&ctx, &node, inputs, &args.job)
        }
    }
}

fn attach_images(
    node: &Flux2Node,
    inputs: NodeInputs,
    base: &Path,
    references: &[PathBuf],
) -> Result<NodeInputs> {
    let slots = node.spec().reference_inputs();
    if references.len() > slots.len() {
        bail!(
            "FLUX.2 {} accepts at most {} reference images (got {})",
            node.spec().variant,
            slots.len(),
            references.len()
        );
    }
    let mut inputs = inputs.with_image("input_image", load_image_tensor(base)?);
    for (slot, path) in slots.into_iter().zip(references) {
        inputs = inputs.with_image(slot, load_image_tensor(path)?);
    }
    Ok(inputs)
}

fn load_image_tensor(path: &Path) -> Result<ArrayD<f32>> {
    let image =
        image::open(path).with_context(|| format!("failed to read image {}", path.display()))?;
    Ok(image_to_tensor(&image)?.into_dyn())
}

fn run_node(ctx: &NodeContext, node: &Flux2Node, inputs: NodeInputs, job: &JobArgs) -> Result<i32> {
    info!(node = %node.spec().class_name, "executing node");
    match node.execute(ctx, &inputs) {
        NodeOutput::Message(message) => {
            eprintln!("{message}");
            Ok(NODE_MESSAGE_EXIT)
        }
        NodeOutput::Image {
            tensor,
            sample_url,
            cost,
            run,
        } => {
            let image = tensor_to_image(tensor.view().into_dyn())?;
            if let Some(parent) = job.out.parent().filter(|dir| !dir.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            image
                .save(&job.out)
                .with_context(|| format!("failed to write {}", job.out.display()))?;
            if let Some(receipt_path) = &job.receipt {
                let endpoint = ctx.config().base_url(node.spec().variant);
                write_receipt(receipt_path, &run.receipt(endpoint, Some(job.out.as_path())))?;
            }
            println!(
                "{}",
                json!({
                    "image": job.out.to_string_lossy(),
                    "sample_url": sample_url,
                    "cost": cost,
                })
            );
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser;
    use floyo_contracts::nodes::NodeOperation;
    use floyo_contracts::variants::Flux2Variant;
    use floyo_engine::Flux2Node;
    use image::{DynamicImage, RgbImage};
    use serde_json::json;

    use super::{attach_images, Cli, Command};

    #[test]
    fn generate_flags_become_widgets() -> anyhow::Result<()> {
        let cli = Cli::try_parse_from([
            "floyo-flux2",
            "--events",
            "events.jsonl",
            "generate",
            "--variant",
            "flex",
            "--prompt",
            "city at dusk",
            "--seed",
            "-1",
            "--steps",
            "30",
            "--out",
            "out.png",
        ])?;
        assert_eq!(cli.events, Some(PathBuf::from("events.jsonl")));
        let Command::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        assert_eq!(args.job.variant, Flux2Variant::Flex);
        let inputs = args.job.node_inputs();
        assert_eq!(inputs.widgets.get("prompt"), Some(&json!("city at dusk")));
        assert_eq!(inputs.widgets.get("seed"), Some(&json!(-1)));
        assert_eq!(inputs.widgets.get("steps"), Some(&json!(30)));
        assert!(!inputs.widgets.contains_key("width"));
        Ok(())
    }

    #[test]
    fn unknown_variant_is_rejected() {
        let parsed = Cli::try_parse_from([
            "floyo-flux2",
            "generate",
            "--variant",
            "dev",
            "--prompt",
            "x",
            "--out",
            "o.png",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn edit_images_fill_reference_slots_in_order() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let base = temp.path().join("base.png");
        let reference = temp.path().join("ref.png");
        DynamicImage::ImageRgb8(RgbImage::new(8, 4)).save(&base)?;
        DynamicImage::ImageRgb8(RgbImage::new(2, 2)).save(&reference)?;

        let node = Flux2Node::for_variant(Flux2Variant::Pro, NodeOperation::ImageEdit);
        let inputs = attach_images(
            &node,
            Default::default(),
            &base,
            &[reference.clone(), reference.clone()],
        )?;
        let names: Vec<&str> = inputs.images.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["input_image", "input_image_2", "input_image_3"]);
        assert_eq!(inputs.images["input_image"].shape(), &[1, 4, 8, 3]);

        let too_many = vec![reference; 8];
        assert!(attach_images(&node, Default::default(), &base, &too_many).is_err());
        Ok(())
    }
}
