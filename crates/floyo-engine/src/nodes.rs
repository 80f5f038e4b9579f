//! Execution of the four FLUX.2 host nodes.
//!
//! A node never fails outright: invalid input and API errors come back as an
//! `Error: ...` message, and a result that cannot be downloaded becomes the
//! black placeholder image.

use std::sync::Arc;

use floyo_contracts::config::Flux2Config;
use floyo_contracts::events::EventWriter;
use floyo_contracts::nodes::{NodeOperation, NodeRegistry, NodeSpec};
use floyo_contracts::request::{merge_reference_images, GenerationRequest, OutputFormat};
use floyo_contracts::variants::Flux2Variant;
use floyo_contracts::{Flux2Error, Result};
use indexmap::IndexMap;
use ndarray::{Array4, ArrayD};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::client::{JobClient, JobTransport, PollSettings, RunResult};
use crate::codec::{tensor_to_base64, url_to_tensor_or_blank};

const MIN_DIMENSION: i64 = 64;
const MAX_DIMENSION: i64 = 2048;
const DIMENSION_STEP: i64 = 16;

/// Checks output dimensions; non-positive values mean "unset" and pass.
pub fn validate_resolution(width: i64, height: i64) -> Result<()> {
    for (name, value) in [("width", width), ("height", height)] {
        if value <= 0 {
            continue;
        }
        if value % DIMENSION_STEP != 0 {
            return Err(Flux2Error::Validation(format!(
                "{name} must be a multiple of {DIMENSION_STEP} (got {value})."
            )));
        }
        if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
            return Err(Flux2Error::Validation(format!(
                "{name} must be between {MIN_DIMENSION} and {MAX_DIMENSION} pixels (got {value})."
            )));
        }
    }
    Ok(())
}

/// Widget values and connected image sockets for one execution.
#[derive(Debug, Clone, Default)]
pub struct NodeInputs {
    pub widgets: Map<String, Value>,
    pub images: IndexMap<String, ArrayD<f32>>,
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_widget(mut self, name: &str, value: Value) -> Self {
        self.widgets.insert(name.to_string(), value);
        self
    }

    pub fn with_image(mut self, name: &str, tensor: ArrayD<f32>) -> Self {
        self.images.insert(name.to_string(), tensor);
        self
    }
}

#[derive(Debug, Clone)]
pub enum NodeOutput {
    Image {
        tensor: Array4<f32>,
        sample_url: String,
        cost: Option<f64>,
        run: Box<RunResult>,
    },
    Message(String),
}

impl NodeOutput {
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Message(text) => Some(text),
            Self::Image { .. } => None,
        }
    }
}

/// Shared process state handed to every node execution.
#[derive(Clone)]
pub struct NodeContext {
    config: Flux2Config,
    transport: Option<Arc<dyn JobTransport>>,
    events: Option<EventWriter>,
}

impl NodeContext {
    pub fn new(config: Flux2Config) -> Self {
        Self {
            config,
            transport: None,
            events: None,
        }
    }

    /// Replaces the HTTP transport, e.g. with a recorded one.
    pub fn with_transport(mut self, transport: Arc<dyn JobTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_events(mut self, events: Option<EventWriter>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &Flux2Config {
        &self.config
    }

    pub fn job_client(&self, variant: Flux2Variant) -> Result<JobClient> {
        let client = match &self.transport {
            Some(transport) => JobClient::with_transport(
                self.config.base_url(variant),
                transport.clone(),
                PollSettings::from_config(&self.config),
            ),
            None => JobClient::new(&self.config, variant)?,
        };
        Ok(client.with_events(self.events.clone()))
    }
}

#[derive(Debug, Clone)]
pub struct Flux2Node {
    spec: NodeSpec,
}

impl Flux2Node {
    pub fn new(spec: NodeSpec) -> Self {
        Self { spec }
    }

    pub fn for_variant(variant: Flux2Variant, operation: NodeOperation) -> Self {
        Self::new(NodeSpec::new(variant, operation))
    }

    pub fn from_registry(registry: &NodeRegistry, class_name: &str) -> Option<Self> {
        registry.get(class_name).cloned().map(Self::new)
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn execute(&self, ctx: &NodeContext, inputs: &NodeInputs) -> NodeOutput {
        let request = match self.build_request(inputs) {
            Ok(request) => request,
            Err(err) => {
                warn!(node = %self.spec.class_name, error = %err, "rejected node input");
                return NodeOutput::Message(format!("Error: {err}"));
            }
        };

        match self.submit(ctx, &request) {
            Ok(output) => output,
            Err(err) => {
                let verb = match self.spec.operation {
                    NodeOperation::TextToImage => "generating",
                    NodeOperation::ImageEdit => "editing",
                };
                warn!(node = %self.spec.class_name, error = %err, "FLUX.2 job failed");
                NodeOutput::Message(format!(
                    "Error {verb} with FLUX.2 {}: {err}",
                    self.spec.variant
                ))
            }
        }
    }

    fn build_request(&self, inputs: &NodeInputs) -> Result<GenerationRequest> {
        let width = self.dimension(inputs, "width");
        let height = self.dimension(inputs, "height");
        validate_resolution(width, height)?;

        let mut request = GenerationRequest::new(self.text(inputs, "prompt"))
            .with_dimensions(width, height)
            .with_seed(self.int(inputs, "seed"));
        request.safety_tolerance = u8::try_from(self.int(inputs, "safety_tolerance")).ok();
        request.output_format = self.text(inputs, "output_format").parse::<OutputFormat>().ok();
        if self.spec.variant.supports_sampling_controls() {
            request.guidance = Some(self.float(inputs, "guidance"));
            request.steps = u32::try_from(self.int(inputs, "steps")).ok();
        }

        if self.spec.operation == NodeOperation::ImageEdit {
            let base = inputs
                .images
                .get("input_image")
                .and_then(|tensor| self.encode_reference("input_image", tensor))
                .ok_or_else(|| Flux2Error::Validation("Provide a base image.".to_string()))?;
            let extras: Vec<String> = self
                .spec
                .reference_inputs()
                .into_iter()
                .map(|name| {
                    inputs
                        .images
                        .get(name)
                        .and_then(|tensor| self.encode_reference(name, tensor))
                        .unwrap_or_default()
                })
                .collect();
            request = request.with_input_images(merge_reference_images(
                &base,
                &extras,
                self.spec.variant.max_reference_slot(),
            ));
        }
        Ok(request)
    }

    fn submit(&self, ctx: &NodeContext, request: &GenerationRequest) -> Result<NodeOutput> {
        let client = ctx.job_client(self.spec.variant)?;
        info!(
            node = %self.spec.class_name,
            endpoint = %client.endpoint(),
            references = request.input_images.len(),
            "running FLUX.2 job"
        );
        let run = client.run(&request.to_payload())?;
        let tensor = url_to_tensor_or_blank(client.transport(), &run.sample);
        Ok(NodeOutput::Image {
            tensor,
            sample_url: run.sample.clone(),
            cost: run.cost,
            run: Box::new(run),
        })
    }

    fn encode_reference(&self, name: &str, tensor: &ArrayD<f32>) -> Option<String> {
        match tensor_to_base64(tensor.view(), OutputFormat::Png) {
            Ok(encoded) => Some(encoded),
            Err(err) => {
                warn!(node = %self.spec.class_name, input = name, error = %err, "skipping image input");
                None
            }
        }
    }

    /// Dimensions reach `validate_resolution` unclamped so bad values are reported.
    fn dimension(&self, inputs: &NodeInputs, name: &str) -> i64 {
        self.spec
            .input(name)
            .map(|input| input.resolve_int_unclamped(inputs.widgets.get(name)))
            .unwrap_or_default()
    }

    fn int(&self, inputs: &NodeInputs, name: &str) -> i64 {
        self.spec
            .input(name)
            .map(|input| input.resolve_int(inputs.widgets.get(name)))
            .unwrap_or_default()
    }

    fn float(&self, inputs: &NodeInputs, name: &str) -> f64 {
        self.spec
            .input(name)
            .map(|input| input.resolve_float(inputs.widgets.get(name)))
            .unwrap_or_default()
    }

    fn text(&self, inputs: &NodeInputs, name: &str) -> String {
        self.spec
            .input(name)
            .map(|input| input.resolve_text(inputs.widgets.get(name)))
            .unwrap_or_default()
    }
}
