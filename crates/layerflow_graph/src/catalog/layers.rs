// SPDX-License-Identifier: MIT OR Apache-2.0
//! Tensor sources and neural network layers.
//!
//! Nothing here computes tensor contents. Sources publish a shape (an array
//! of integers) and every layer maps the shape on its `in` input to the
//! shape it would produce, using the layer's attributes with PyTorch's
//! defaults. A shape the layer cannot accept fails the node.

use crate::execution::{NodeContext, NodeError};
use crate::node::NodeBehavior;
use crate::registry::{NodeRegistry, NodeType};
use serde_json::{json, Value};

const TENSOR: &str = "tensor";

/// Register the tensor sources and the layer kinds
pub fn register(registry: &mut NodeRegistry) {
    // ========================================================================
    // Sources
    // ========================================================================

    let sources = [
        ("Tensor1d", json!(128)),
        ("Tensor2d", json!([128, 128])),
        ("Tensor3d", json!([3, 128, 128])),
        ("Tensor4d", json!([1, 3, 128, 128])),
    ];
    for (rank, (name, size)) in sources.into_iter().enumerate() {
        registry.register(
            NodeType::new(format!("tensor/{name}"), name)
                .with_description("torch.Tensor")
                .with_output("out", TENSOR)
                .with_attribute("size", size)
                .with_behavior(move || TensorSource { rank: rank + 1 }),
        );
    }

    // ========================================================================
    // Convolution
    // ========================================================================

    registry.register(
        conv("Conv1d", 1)
            .with_attribute("kernel_size", json!([3]))
            .with_attribute("padding", json!([0]))
            .with_attribute("dilation", json!([1]))
            .with_attribute("stride", json!([1]))
            .with_attribute("bias", true),
    );
    registry.register(
        conv("Conv2d", 2)
            .with_attribute("kernel_size", json!([3, 3]))
            .with_attribute("padding", json!([0, 0]))
            .with_attribute("dilation", json!([1, 1]))
            .with_attribute("stride", json!([1, 1]))
            .with_attribute("bias", true),
    );

    registry.register(
        layer("Linear", "torch.nn.modules.linear", ShapeRule::Linear)
            .with_hidden_attribute("in_features")
            .with_hidden_attribute("out_features")
            .with_attribute("bias", true),
    );

    // ========================================================================
    // Activations
    // ========================================================================

    registry.register(
        layer("ReLU", "torch.nn.modules.activation", ShapeRule::Identity)
            .with_hidden_default("inplace", false)
            .with_attribute("threshold", 0)
            .with_attribute("value", 0),
    );
    for name in ["Sigmoid", "Tanh", "Softmax"] {
        registry.register(layer(name, "torch.nn.modules.activation", ShapeRule::Identity));
    }

    // ========================================================================
    // Pooling
    // ========================================================================

    registry.register(
        layer("MaxPool2d", "torch.nn.modules.pooling", ShapeRule::MaxPool { spatial: 2 })
            .with_attribute("kernel_size", json!([2, 2]))
            .with_attribute("stride", Value::Null)
            .with_attribute("padding", 0)
            .with_attribute("dilation", 1)
            .with_attribute("return_indices", false)
            .with_hidden_attribute("ceil_mode"),
    );
    registry.register(
        layer("AvgPool2d", "torch.nn.modules.pooling", ShapeRule::AvgPool { spatial: 2 })
            .with_attribute("kernel_size", json!([2, 2]))
            .with_attribute("stride", Value::Null)
            .with_attribute("padding", 0)
            .with_attribute("count_include_pad", true)
            .with_hidden_attribute("ceil_mode"),
    );
    registry.register(
        layer(
            "AdaptiveAvgPool2d",
            "torch.nn.modules.pooling",
            ShapeRule::AdaptivePool { spatial: 2 },
        )
        .with_attribute("output_size", json!([1, 1])),
    );

    // ========================================================================
    // Normalization, regularization, reshaping
    // ========================================================================

    registry.register(
        layer("BatchNorm2d", "torch.nn.modules.batchnorm", ShapeRule::BatchNorm)
            .with_hidden_attribute("num_features")
            .with_attribute("eps", 1e-05)
            .with_attribute("momentum", 0.1)
            .with_attribute("affine", true)
            .with_attribute("track_running_stats", true),
    );
    registry.register(
        layer("Dropout", "torch.nn.modules.dropout", ShapeRule::Identity)
            .with_hidden_default("inplace", false)
            .with_attribute("p", 0.5),
    );
    registry.register(
        layer("Flatten", "torch.nn.modules.flatten", ShapeRule::Flatten)
            .with_attribute("start_dim", 1)
            .with_attribute("end_dim", -1),
    );
}

fn layer(name: &str, package: &str, rule: ShapeRule) -> NodeType {
    NodeType::new(format!("layer/{name}"), name)
        .with_description(package)
        .with_input("in", TENSOR)
        .with_output("out", TENSOR)
        .with_behavior(move || Layer { rule })
}

fn conv(name: &str, spatial: usize) -> NodeType {
    layer(name, "torch.nn.modules.conv", ShapeRule::Conv { spatial })
        .with_hidden_attribute("output_padding")
        .with_hidden_attribute("in_channels")
        .with_hidden_attribute("out_channels")
        .with_attribute("groups", 1)
        .with_attribute("transposed", false)
}

/// Publishes the shape in its `size` property
#[derive(Debug)]
pub struct TensorSource {
    rank: usize,
}

impl NodeBehavior for TensorSource {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let shape = Attrs(ctx).ints("size", self.rank)?;
        if shape.iter().any(|dim| *dim < 1) {
            return Err(invalid_property("size", format!("{shape:?} has an empty dimension")));
        }
        ctx.set_output_data(0, json!(shape));
        Ok(())
    }
}

/// How a layer maps its input shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeRule {
    /// Output equals input
    Identity,
    /// Convolution over `spatial` trailing dimensions, plain or transposed
    Conv {
        /// Number of spatial dimensions
        spatial: usize,
    },
    /// Max pooling
    MaxPool {
        /// Number of spatial dimensions
        spatial: usize,
    },
    /// Average pooling
    AvgPool {
        /// Number of spatial dimensions
        spatial: usize,
    },
    /// Pooling to a fixed output size
    AdaptivePool {
        /// Number of spatial dimensions
        spatial: usize,
    },
    /// Affine map over the last dimension
    Linear,
    /// Per-channel normalization of `[N, C, H, W]`
    BatchNorm,
    /// Merge a range of dimensions into one
    Flatten,
}

/// Maps the shape on its input to its output
#[derive(Debug)]
pub struct Layer {
    rule: ShapeRule,
}

impl NodeBehavior for Layer {
    fn can_execute(&self) -> bool {
        true
    }

    fn execute(&mut self, ctx: &mut NodeContext<'_>) -> Result<(), NodeError> {
        let Some(input) = ctx.get_input_data(0).cloned() else {
            return Ok(());
        };
        let shape: Vec<i64> = serde_json::from_value(input).map_err(|err| NodeError::InvalidInput {
            slot: "in".to_string(),
            reason: err.to_string(),
        })?;
        let output = output_shape(self.rule, &shape, &Attrs(ctx))?;
        ctx.set_output_data(0, json!(output));
        Ok(())
    }
}

/// Shape produced by `rule` for an input of `shape`
pub fn output_shape(rule: ShapeRule, shape: &[i64], attrs: &dyn AttributeSource) -> Result<Vec<i64>, NodeError> {
    match rule {
        ShapeRule::Identity => Ok(shape.to_vec()),
        ShapeRule::Conv { spatial } => conv_shape(spatial, shape, attrs),
        ShapeRule::MaxPool { spatial } => pool_shape(spatial, shape, attrs, true),
        ShapeRule::AvgPool { spatial } => pool_shape(spatial, shape, attrs, false),
        ShapeRule::AdaptivePool { spatial } => {
            expect_rank(shape, spatial + 2)?;
            let mut output = shape[..2].to_vec();
            output.extend(attrs.ints("output_size", spatial)?);
            Ok(output)
        }
        ShapeRule::Linear => {
            let Some((&features, batch)) = shape.split_last() else {
                return Err(NodeError::ShapeMismatch("Linear needs at least one dimension".into()));
            };
            if let Some(expected) = attrs.optional_int("in_features")? {
                if expected != features {
                    return Err(NodeError::ShapeMismatch(format!(
                        "Linear expects {expected} input features, got {features}"
                    )));
                }
            }
            let mut output = batch.to_vec();
            output.push(attrs.optional_int("out_features")?.unwrap_or(features));
            Ok(output)
        }
        ShapeRule::BatchNorm => {
            expect_rank(shape, 4)?;
            if let Some(expected) = attrs.optional_int("num_features")? {
                if expected != shape[1] {
                    return Err(NodeError::ShapeMismatch(format!(
                        "BatchNorm2d expects {expected} channels, got {}",
                        shape[1]
                    )));
                }
            }
            Ok(shape.to_vec())
        }
        ShapeRule::Flatten => {
            let rank = shape.len() as i64;
            let start = attrs.optional_int("start_dim")?.unwrap_or(1);
            let end = attrs.optional_int("end_dim")?.unwrap_or(-1);
            let start = if start < 0 { checked(start.checked_add(rank))? } else { start };
            let end = if end < 0 { checked(end.checked_add(rank))? } else { end };
            if start < 0 || end >= rank || start > end {
                return Err(NodeError::ShapeMismatch(format!(
                    "cannot flatten dimensions {start}..={end} of {shape:?}"
                )));
            }
            let (start, end) = (start as usize, end as usize);
            let mut output = shape[..start].to_vec();
            let merged = shape[start..=end].iter().try_fold(1i64, |acc, dim| acc.checked_mul(*dim));
            output.push(checked(merged)?);
            output.extend_from_slice(&shape[end + 1..]);
            Ok(output)
        }
    }
}

fn conv_shape(spatial: usize, shape: &[i64], attrs: &dyn AttributeSource) -> Result<Vec<i64>, NodeError> {
    expect_rank(shape, spatial + 2)?;
    let channels = shape[1];
    if let Some(expected) = attrs.optional_int("in_channels")? {
        if expected != channels {
            return Err(NodeError::ShapeMismatch(format!(
                "expected {expected} input channels, got {channels}"
            )));
        }
    }
    let groups = attrs.optional_int("groups")?.unwrap_or(1);
    if groups < 1 || channels % groups != 0 {
        return Err(NodeError::ShapeMismatch(format!(
            "{channels} channels cannot be split into {groups} groups"
        )));
    }

    let kernel = attrs.ints("kernel_size", spatial)?;
    let padding = attrs.ints("padding", spatial)?;
    let dilation = attrs.ints("dilation", spatial)?;
    let stride = attrs.ints("stride", spatial)?;
    let transposed = attrs.flag("transposed")?;
    let output_padding = attrs
        .optional_ints("output_padding", spatial)?
        .unwrap_or_else(|| vec![0; spatial]);

    let mut output = vec![shape[0], attrs.optional_int("out_channels")?.unwrap_or(channels)];
    for axis in 0..spatial {
        let input = shape[axis + 2];
        let size = if transposed {
            let size = transposed_size(input, kernel[axis], padding[axis], dilation[axis], stride[axis], output_padding[axis]);
            Some(checked(size)?).filter(|size| *size > 0)
        } else {
            window(input, kernel[axis], padding[axis], dilation[axis], stride[axis], false)?
        };
        output.push(size.ok_or_else(|| too_small(shape, &kernel))?);
    }
    Ok(output)
}

fn pool_shape(spatial: usize, shape: &[i64], attrs: &dyn AttributeSource, max: bool) -> Result<Vec<i64>, NodeError> {
    expect_rank(shape, spatial + 2)?;
    let kernel = attrs.ints("kernel_size", spatial)?;
    let stride = attrs.optional_ints("stride", spatial)?.unwrap_or_else(|| kernel.clone());
    let padding = attrs.ints("padding", spatial)?;
    let dilation = if max {
        attrs.ints("dilation", spatial)?
    } else {
        vec![1; spatial]
    };
    let ceil_mode = attrs.flag("ceil_mode")?;

    let mut output = shape[..2].to_vec();
    for axis in 0..spatial {
        if padding[axis].checked_mul(2).map_or(true, |double| double > kernel[axis]) {
            return Err(NodeError::ShapeMismatch(format!(
                "padding {} is more than half the kernel {}",
                padding[axis], kernel[axis]
            )));
        }
        let size = window(shape[axis + 2], kernel[axis], padding[axis], dilation[axis], stride[axis], ceil_mode)?;
        output.push(size.ok_or_else(|| too_small(shape, &kernel))?);
    }
    Ok(output)
}

/// Number of positions a dilated window fits along one axis
fn window(
    input: i64,
    kernel: i64,
    padding: i64,
    dilation: i64,
    stride: i64,
    ceil_mode: bool,
) -> Result<Option<i64>, NodeError> {
    if stride < 1 || kernel < 1 || dilation < 1 {
        return Ok(None);
    }
    let reach = checked(dilation.checked_mul(kernel - 1).and_then(|reach| reach.checked_add(1)))?;
    let padded = checked(padding.checked_mul(2).and_then(|both| input.checked_add(both)))?;
    let span = checked(padded.checked_sub(reach))?;
    if span < 0 {
        return Ok(None);
    }
    let steps = if ceil_mode {
        checked(span.checked_add(stride - 1))? / stride
    } else {
        span / stride
    };
    let mut size = checked(steps.checked_add(1))?;
    // the last window must start inside the input or left padding
    if ceil_mode && checked(steps.checked_mul(stride))? >= checked(input.checked_add(padding))? {
        size -= 1;
    }
    Ok(Some(size))
}

/// `(input - 1) * stride - 2 * padding + dilation * (kernel - 1) + output_padding + 1`, or `None` on overflow
fn transposed_size(input: i64, kernel: i64, padding: i64, dilation: i64, stride: i64, output_padding: i64) -> Option<i64> {
    input
        .checked_sub(1)?
        .checked_mul(stride)?
        .checked_sub(padding.checked_mul(2)?)?
        .checked_add(dilation.checked_mul(kernel.checked_sub(1)?)?)?
        .checked_add(output_padding)?
        .checked_add(1)
}

fn checked(value: Option<i64>) -> Result<i64, NodeError> {
    value.ok_or_else(|| NodeError::ShapeMismatch("shape arithmetic overflows".into()))
}

fn expect_rank(shape: &[i64], rank: usize) -> Result<(), NodeError> {
    if shape.len() == rank {
        Ok(())
    } else {
        Err(NodeError::ShapeMismatch(format!(
            "expected a {rank}d input, got {shape:?}"
        )))
    }
}

fn too_small(shape: &[i64], kernel: &[i64]) -> NodeError {
    NodeError::ShapeMismatch(format!("input {shape:?} is too small for kernel {kernel:?}"))
}

fn invalid_property(name: &str, reason: impl Into<String>) -> NodeError {
    NodeError::InvalidProperty {
        name: name.to_string(),
        reason: reason.into(),
    }
}

/// Typed access to layer attributes
pub trait AttributeSource {
    /// Raw attribute value
    fn attribute(&self, name: &str) -> Option<&Value>;

    /// Integer attribute; unset when missing, null or empty
    fn optional_int(&self, name: &str) -> Result<Option<i64>, NodeError> {
        match self.attribute(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) if text.is_empty() => Ok(None),
            Some(value) => int(name, value).map(Some),
        }
    }

    /// Per-axis integers; a scalar or one-element list applies to every axis
    fn optional_ints(&self, name: &str, axes: usize) -> Result<Option<Vec<i64>>, NodeError> {
        let values = match self.attribute(name) {
            None | Some(Value::Null) => return Ok(None),
            Some(Value::String(text)) if text.is_empty() => return Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| int(name, item))
                .collect::<Result<Vec<_>, _>>()?,
            Some(value) => vec![int(name, value)?],
        };
        match values.len() {
            1 => Ok(Some(vec![values[0]; axes])),
            len if len == axes => Ok(Some(values)),
            len => Err(invalid_property(name, format!("expected {axes} values, got {len}"))),
        }
    }

    /// Required per-axis integers
    fn ints(&self, name: &str, axes: usize) -> Result<Vec<i64>, NodeError> {
        self.optional_ints(name, axes)?
            .ok_or_else(|| invalid_property(name, "missing"))
    }

    /// Boolean attribute, false when unset
    fn flag(&self, name: &str) -> Result<bool, NodeError> {
        match self.attribute(name) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::String(text)) if text.is_empty() => Ok(false),
            Some(Value::Bool(flag)) => Ok(*flag),
            Some(other) => Err(invalid_property(name, format!("expected true or false, got {other}"))),
        }
    }
}

impl AttributeSource for serde_json::Map<String, Value> {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.get(name)
    }
}

struct Attrs<'c, 'a>(&'c NodeContext<'a>);

impl AttributeSource for Attrs<'_, '_> {
    fn attribute(&self, name: &str) -> Option<&Value> {
        self.0.property(name)
    }
}

fn int(name: &str, value: &Value) -> Result<i64, NodeError> {
    let number = super::as_number(name, value)?;
    if number.fract() != 0.0 {
        return Err(invalid_property(name, format!("{number} is not an integer")));
    }
    // -i64::MIN is 2^63, the first f64 past i64::MAX
    let limit = -(i64::MIN as f64);
    if !(-limit..limit).contains(&number) {
        return Err(invalid_property(name, format!("{number} is out of range")));
    }
    Ok(number as i64)
}
