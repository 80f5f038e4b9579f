//! Input-schema declarations for the FLUX.2 host nodes.
//!
//! A [`NodeSpec`] describes one node the host can place in a graph: its class
//! name, display name, category and the widgets/sockets it takes. Widget
//! values arrive from the host as JSON and are resolved against the declared
//! inputs (missing values take the default, numbers are clamped into range).

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::variants::Flux2Variant;

pub const IMAGE_TYPE: &str = "IMAGE";
pub const OUTPUT_FORMATS: [&str; 2] = ["jpeg", "png"];
const MAX_SEED: i64 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeOperation {
    TextToImage,
    ImageEdit,
}

impl NodeOperation {
    pub fn function_name(self) -> &'static str {
        match self {
            Self::TextToImage => "generate",
            Self::ImageEdit => "edit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum InputKind {
    String {
        multiline: bool,
        default: String,
    },
    Int {
        default: i64,
        min: i64,
        max: i64,
        step: i64,
    },
    Float {
        default: f64,
        min: f64,
        max: f64,
        step: f64,
    },
    Combo {
        options: Vec<String>,
        default: String,
    },
    Image,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSpec {
    pub name: String,
    pub required: bool,
    pub tooltip: String,
    #[serde(flatten)]
    pub kind: InputKind,
}

impl InputSpec {
    fn new(name: &str, required: bool, tooltip: &str, kind: InputKind) -> Self {
        Self {
            name: name.to_string(),
            required,
            tooltip: tooltip.to_string(),
            kind,
        }
    }

    /// Widget value clamped into the declared range, or the default.
    pub fn resolve_int(&self, value: Option<&Value>) -> i64 {
        let InputKind::Int { default, min, max, .. } = self.kind else {
            return value.and_then(value_to_i64).unwrap_or_default();
        };
        value
            .and_then(value_to_i64)
            .unwrap_or(default)
            .clamp(min, max)
    }

    /// Widget value as given, or the default when absent. Used for inputs
    /// whose range is checked by the caller rather than clamped.
    pub fn resolve_int_unclamped(&self, value: Option<&Value>) -> i64 {
        let default = match self.kind {
            InputKind::Int { default, .. } => default,
            _ => 0,
        };
        value.and_then(value_to_i64).unwrap_or(default)
    }

    pub fn resolve_float(&self, value: Option<&Value>) -> f64 {
        let InputKind::Float { default, min, max, .. } = self.kind else {
            return value.and_then(value_to_f64).unwrap_or_default();
        };
        value
            .and_then(value_to_f64)
            .filter(|number| number.is_finite())
            .unwrap_or(default)
            .clamp(min, max)
    }

    pub fn resolve_text(&self, value: Option<&Value>) -> String {
        let given = value.and_then(Value::as_str).map(str::to_string);
        match &self.kind {
            InputKind::String { default, .. } => given.unwrap_or_else(|| default.clone()),
            InputKind::Combo { options, default } => given
                .map(|text| text.trim().to_ascii_lowercase())
                .filter(|text| options.iter().any(|option| option == text))
                .unwrap_or_else(|| default.clone()),
            _ => given.unwrap_or_default(),
        }
    }

    /// Host-style declaration: `[TYPE, {options...}]`.
    fn host_declaration(&self) -> Value {
        let mut options = Map::new();
        let type_name = match &self.kind {
            InputKind::String { multiline, default } => {
                options.insert("multiline".to_string(), json!(multiline));
                options.insert("default".to_string(), json!(default));
                Value::String("STRING".to_string())
            }
            InputKind::Int {
                default,
                min,
                max,
                step,
            } => {
                options.insert("default".to_string(), json!(default));
                options.insert("min".to_string(), json!(min));
                options.insert("max".to_string(), json!(max));
                options.insert("step".to_string(), json!(step));
                Value::String("INT".to_string())
            }
            InputKind::Float {
                default,
                min,
                max,
                step,
            } => {
                options.insert("default".to_string(), json!(default));
                options.insert("min".to_string(), json!(min));
                options.insert("max".to_string(), json!(max));
                options.insert("step".to_string(), json!(step));
                Value::String("FLOAT".to_string())
            }
            InputKind::Combo { options: choices, default } => {
                options.insert("default".to_string(), json!(default));
                json!(choices)
            }
            InputKind::Image => Value::String(IMAGE_TYPE.to_string()),
        };
        if !self.tooltip.is_empty() {
            options.insert("tooltip".to_string(), json!(self.tooltip));
        }
        json!([type_name, options])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeSpec {
    pub class_name: String,
    pub display_name: String,
    pub category: String,
    pub variant: Flux2Variant,
    pub operation: NodeOperation,
    pub inputs: Vec<InputSpec>,
    pub return_types: Vec<String>,
    pub return_names: Vec<String>,
}

impl NodeSpec {
    pub fn new(variant: Flux2Variant, operation: NodeOperation) -> Self {
        let (class_name, display_name) = match (variant, operation) {
            (Flux2Variant::Pro, NodeOperation::TextToImage) => {
                ("Flux2ProTextToImage", "FLUX.2 [pro] Text-to-Image")
            }
            (Flux2Variant::Pro, NodeOperation::ImageEdit) => {
                ("Flux2ProImageEdit", "FLUX.2 [pro] Image Edit")
            }
            (Flux2Variant::Flex, NodeOperation::TextToImage) => {
                ("Flux2FlexTextToImage", "FLUX.2-Flex Text-to-Image")
            }
            (Flux2Variant::Flex, NodeOperation::ImageEdit) => {
                ("Flux2FlexImageEdit", "FLUX.2-Flex Image Edit")
            }
        };
        let category = match variant {
            Flux2Variant::Pro => "Floyo/Flux2 Pro",
            Flux2Variant::Flex => "Floyo/Flux2 Flex",
        };
        Self {
            class_name: class_name.to_string(),
            display_name: display_name.to_string(),
            category: category.to_string(),
            variant,
            operation,
            inputs: declare_inputs(variant, operation),
            return_types: vec![IMAGE_TYPE.to_string()],
            return_names: vec!["image".to_string()],
        }
    }

    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|input| input.name == name)
    }

    /// Names of the optional reference sockets, in slot order.
    pub fn reference_inputs(&self) -> Vec<&str> {
        self.inputs
            .iter()
            .filter(|input| input.kind == InputKind::Image && input.name != "input_image")
            .map(|input| input.name.as_str())
            .collect()
    }

    /// `{"required": {...}, "optional": {...}}` in declaration order.
    pub fn input_types(&self) -> Value {
        let mut required = Map::new();
        let mut optional = Map::new();
        for input in &self.inputs {
            let target = if input.required {
                &mut required
            } else {
                &mut optional
            };
            target.insert(input.name.clone(), input.host_declaration());
        }
        json!({"required": required, "optional": optional})
    }
}

#[derive(Debug, Clone)]
pub struct NodeRegistry {
    nodes: IndexMap<String, NodeSpec>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl NodeRegistry {
    pub fn new(nodes: Option<IndexMap<String, NodeSpec>>) -> Self {
        Self {
            nodes: nodes.unwrap_or_else(default_nodes),
        }
    }

    pub fn get(&self, class_name: &str) -> Option<&NodeSpec> {
        self.nodes.get(class_name)
    }

    pub fn find(&self, variant: Flux2Variant, operation: NodeOperation) -> Option<&NodeSpec> {
        self.nodes
            .values()
            .find(|node| node.variant == variant && node.operation == operation)
    }

    pub fn list(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn display_names(&self) -> IndexMap<String, String> {
        self.nodes
            .values()
            .map(|node| (node.class_name.clone(), node.display_name.clone()))
            .collect()
    }

    /// Host-facing description of every node.
    pub fn to_json(&self) -> Value {
        let nodes: Map<String, Value> = self
            .nodes
            .values()
            .map(|node| {
                (
                    node.class_name.clone(),
                    json!({
                        "display_name": node.display_name,
                        "category": node.category,
                        "function": node.operation.function_name(),
                        "input_types": node.input_types(),
                        "return_types": node.return_types,
                        "return_names": node.return_names,
                    }),
                )
            })
            .collect();
        Value::Object(nodes)
    }
}

fn default_nodes() -> IndexMap<String, NodeSpec> {
    let mut map = IndexMap::new();
    for variant in Flux2Variant::ALL {
        for operation in [NodeOperation::TextToImage, NodeOperation::ImageEdit] {
            let spec = NodeSpec::new(variant, operation);
            map.insert(spec.class_name.clone(), spec);
        }
    }
    map
}

fn declare_inputs(variant: Flux2Variant, operation: NodeOperation) -> Vec<InputSpec> {
    let mut inputs = Vec::new();
    let edit = operation == NodeOperation::ImageEdit;
    let prompt_tooltip = if edit {
        "Describe the edit you want."
    } else {
        "Describe what to generate."
    };
    inputs.push(InputSpec::new(
        "prompt",
        true,
        prompt_tooltip,
        InputKind::String {
            multiline: true,
            default: String::new(),
        },
    ));

    if edit {
        inputs.push(InputSpec::new(
            "input_image",
            true,
            "Base image.",
            InputKind::Image,
        ));
        for slot in 2..=variant.max_reference_slot() {
            inputs.push(InputSpec::new(
                &format!("input_image_{slot}"),
                false,
                &format!("Optional reference image #{slot}."),
                InputKind::Image,
            ));
        }
    }

    let (min_dim, dim_tooltip) = if edit {
        (0, "Override {dim} (0 = keep). Multiple of 16.")
    } else {
        (64, "Output {dim} (multiple of 16, 64-2048).")
    };
    for dim in ["width", "height"] {
        inputs.push(InputSpec::new(
            dim,
            !edit,
            &dim_tooltip.replace("{dim}", dim),
            InputKind::Int {
                default: 1024,
                min: min_dim,
                max: 2048,
                step: 16,
            },
        ));
    }

    if variant.supports_sampling_controls() {
        inputs.push(InputSpec::new(
            "guidance",
            !edit,
            "Prompt adherence (1.5-10).",
            InputKind::Float {
                default: 4.5,
                min: 1.5,
                max: 10.0,
                step: 0.1,
            },
        ));
        inputs.push(InputSpec::new(
            "steps",
            !edit,
            "Inference steps (1-50).",
            InputKind::Int {
                default: 50,
                min: 1,
                max: 50,
                step: 1,
            },
        ));
    }

    inputs.push(InputSpec::new(
        "seed",
        false,
        "-1 = random. Any other integer is reproducible.",
        InputKind::Int {
            default: -1,
            min: -1,
            max: MAX_SEED,
            step: 1,
        },
    ));
    inputs.push(InputSpec::new(
        "safety_tolerance",
        false,
        "Moderation level 0 (strict) to 6 (permissive).",
        InputKind::Int {
            default: 2,
            min: 0,
            max: 6,
            step: 1,
        },
    ));
    inputs.push(InputSpec::new(
        "output_format",
        false,
        "Output format.",
        InputKind::Combo {
            options: OUTPUT_FORMATS.iter().map(|item| item.to_string()).collect(),
            default: OUTPUT_FORMATS[0].to_string(),
        },
    ));
    inputs
}

fn value_to_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(raw) => raw
            .as_i64()
            .or_else(|| raw.as_f64().map(|number| number.round() as i64)),
        Value::String(raw) => raw.trim().parse::<f64>().ok().map(|v| v.round() as i64),
        _ => None,
    }
}

fn value_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(raw) => raw.as_f64(),
        Value::String(raw) => raw.trim().parse::<f64>().ok(),
        _ => None,
    }
}
