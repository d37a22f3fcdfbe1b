//! Translators from intercepted host operations to graph nodes. Each one
//! reads the active call record, resolves its operands to graph handles and
//! binds the eager output to the node it emits.
mod getitem;

use crate::host::keys;
use crate::network::{ActivationOp, ElementwiseOp, ReduceOp, UnaryOp, Values};
use crate::trace::registry::Registry;
use crate::trace::{broadcast, ArgValue, TraceContext};
use crate::Error;

/// The standard registry: every key the host dispatches under, with detach
/// as the one helper registration.
pub fn registry() -> Registry {
  let mut reg = Registry::new();
  reg.register(keys::ADD, convert_add);
  reg.register(keys::MUL, convert_mul);
  reg.register(keys::MAX, convert_max);
  reg.register(keys::SUM, convert_sum);
  reg.register(keys::NEG, convert_neg);
  reg.register(keys::RELU, convert_relu);
  reg.register(keys::PRELU, convert_prelu);
  reg.register(keys::GETITEM, getitem::convert_getitem);
  reg.register_helper(keys::DETACH, convert_detach);
  reg
}

fn binary_operands(ctx: &TraceContext) -> Result<[ArgValue; 2], Error> {
  let call = ctx.call()?;
  match (call.args.get(0), call.args.get(1)) {
    (Some(a), Some(b)) => Ok([a.clone(), b.clone()]),
    _ => Err(Error::UnresolvedOperand {
      what: format!("{} needs two operands", call.key),
    }),
  }
}

fn convert_elementwise(ctx: &mut TraceContext, op: ElementwiseOp) -> Result<(), Error> {
  let operands = binary_operands(ctx)?;
  let pair = broadcast::resolve(ctx, &operands)?;
  let out = ctx.network.add_elementwise(&pair[0], &pair[1], op);
  ctx.bind_output(out)
}

fn convert_add(ctx: &mut TraceContext) -> Result<(), Error> {
  convert_elementwise(ctx, ElementwiseOp::Sum)
}

fn convert_mul(ctx: &mut TraceContext) -> Result<(), Error> {
  convert_elementwise(ctx, ElementwiseOp::Prod)
}

/// Reduction dims map to an axis bitmask over graph dimensions. Fixed-batch
/// mode shifts every dim down by one; the batch axis itself cannot be
/// reduced there.
fn axes_bitmask(dims: &[i64], dynamic_shape: bool) -> Result<u32, Error> {
  let mut axes = 0u32;
  for d in dims {
    let shifted = if dynamic_shape { *d } else { *d - 1 };
    if shifted < 0 {
      return Err(Error::Unsupported {
        what: format!("reduction over dim {} (batch axis is implicit)", d),
      });
    }
    if shifted > 31 {
      return Err(Error::Unsupported {
        what: format!("reduction dim {} out of axis range", d),
      });
    }
    axes |= 1 << shifted;
  }
  Ok(axes)
}

fn default_reduce_dims(rank: usize, dynamic_shape: bool) -> Vec<i64> {
  if dynamic_shape {
    (0..rank as i64).collect()
  } else {
    (1..rank as i64).collect()
  }
}

fn convert_reduce(ctx: &mut TraceContext, op: ReduceOp) -> Result<(), Error> {
  let call = ctx.call()?.clone();
  let input = call.tensor_arg("input", 0)?;
  let dims = call
    .ints_arg("dim", 1)?
    .unwrap_or_else(|| default_reduce_dims(input.rank(), ctx.dynamic_shape));
  let keep = call.bool_arg("keepdim", 2, false)?;
  let handle = broadcast::resolve1(ctx, &ArgValue::Tensor(input))?;
  let axes = axes_bitmask(&dims, ctx.dynamic_shape)?;
  let out = ctx.network.add_reduce(&handle, op, axes, keep);
  ctx.bind_output(out)
}

fn convert_sum(ctx: &mut TraceContext) -> Result<(), Error> {
  convert_reduce(ctx, ReduceOp::Sum)
}

/// Elementwise when called with two tensors, reduction otherwise.
fn convert_max(ctx: &mut TraceContext) -> Result<(), Error> {
  let second_is_tensor = matches!(ctx.call()?.args.get(1), Some(ArgValue::Tensor(_)));
  if second_is_tensor {
    convert_elementwise(ctx, ElementwiseOp::Max)
  } else {
    convert_reduce(ctx, ReduceOp::Max)
  }
}

fn convert_neg(ctx: &mut TraceContext) -> Result<(), Error> {
  let input = ctx.call()?.tensor_arg("input", 0)?;
  let handle = broadcast::resolve1(ctx, &ArgValue::Tensor(input))?;
  let out = ctx.network.add_unary(&handle, UnaryOp::Neg);
  ctx.bind_output(out)
}

fn convert_relu(ctx: &mut TraceContext) -> Result<(), Error> {
  let input = ctx.call()?.tensor_arg("input", 0)?;
  let handle = broadcast::resolve1(ctx, &ArgValue::Tensor(input))?;
  let out = ctx.network.add_activation(&handle, ActivationOp::Relu);
  ctx.bind_output(out)
}

/// relu(x) + (-w) * relu(-x), with the negated weight emitted as a fresh
/// constant leaf shaped to broadcast along the channel dimension.
fn convert_prelu(ctx: &mut TraceContext) -> Result<(), Error> {
  let call = ctx.call()?.clone();
  let input = call.tensor_arg("input", 0)?;
  let weight = call.tensor_arg("weight", 1)?;
  let negated: Vec<f32> = match weight.values() {
    Values::F32(v) => v.iter().map(|w| -w).collect(),
    other => {
      return Err(Error::UnresolvedOperand {
        what: format!("prelu weight must be float, got {:?}", other.dtype()),
      })
    }
  };
  let graph_rank = if ctx.dynamic_shape {
    input.rank()
  } else {
    input.rank() - 1
  };
  let mut wshape = vec![1i64; graph_rank.max(1)];
  let channel_axis = if ctx.dynamic_shape { 1 } else { 0 };
  let axis = channel_axis.min(wshape.len() - 1);
  wshape[axis] = negated.len() as i64;

  let handle = broadcast::resolve1(ctx, &ArgValue::Tensor(input))?;
  let w = ctx
    .network
    .add_constant(wshape, std::rc::Rc::new(Values::F32(negated)));
  let pos = ctx.network.add_activation(&handle, ActivationOp::Relu);
  let flipped = ctx.network.add_unary(&handle, UnaryOp::Neg);
  let clipped = ctx.network.add_activation(&flipped, ActivationOp::Relu);
  let scaled = ctx.network.add_elementwise(&clipped, &w, ElementwiseOp::Prod);
  let out = ctx.network.add_elementwise(&pos, &scaled, ElementwiseOp::Sum);
  ctx.bind_output(out)
}

/// Helper: no node emitted, the output aliases the input's handle.
fn convert_detach(ctx: &mut TraceContext) -> Result<(), Error> {
  let input = ctx.call()?.tensor_arg("input", 0)?;
  let handle = broadcast::to_network(ctx, &input)?;
  ctx.bind_output(handle)
}
