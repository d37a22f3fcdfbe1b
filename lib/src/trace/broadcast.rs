//! Operand resolution for translators: host tensors and plain scalars come
//! in, graph handles of a common dtype and rank come out. Unbound tensors
//! materialize as constant leaves exactly once per tensor identity.
use std::rc::Rc;

use tracing::trace;

use crate::host::Tensor;
use crate::network::{Dtype, TensorRef, Values};
use crate::Error;

use super::{ArgValue, TraceContext};

/// Graph handle for a host tensor: the existing binding when the tensor was
/// produced by a recorded operation, a new constant leaf otherwise. The leaf
/// keeps the tensor's full host shape and is bound, so resolving the same
/// tensor again returns the same node.
pub fn to_network(ctx: &mut TraceContext, tensor: &Tensor) -> Result<TensorRef, Error> {
  if let Some(handle) = ctx.binding(tensor) {
    return Ok(handle);
  }
  trace!(id = ?tensor.id(), shape = ?tensor.shape(), "materializing constant leaf");
  let shape: Vec<i64> = tensor.shape().iter().map(|d| *d as i64).collect();
  let handle = ctx.network.add_constant(shape, tensor.values_rc());
  ctx.bind(tensor, handle.clone());
  Ok(handle)
}

fn common_dtype(operands: &[ArgValue]) -> Result<Dtype, Error> {
  let mut dtype: Option<Dtype> = None;
  for operand in operands {
    if let ArgValue::Tensor(t) = operand {
      match dtype {
        None => dtype = Some(t.dtype()),
        Some(d) if d == t.dtype() => {}
        Some(d) => {
          return Err(Error::DtypeMismatch {
            left: d,
            right: t.dtype(),
          })
        }
      }
    }
  }
  if dtype.is_none() {
    for operand in operands {
      match operand {
        ArgValue::Float(_) => {
          dtype = Some(Dtype::Float32);
          break;
        }
        ArgValue::Int(_) => dtype = Some(Dtype::Int32),
        _ => {}
      }
    }
  }
  dtype.ok_or_else(|| Error::UnresolvedOperand {
    what: "no operand determines a dtype".to_string(),
  })
}

fn scalar_leaf(ctx: &mut TraceContext, operand: &ArgValue, dtype: Dtype) -> Result<TensorRef, Error> {
  let values = match (operand, dtype) {
    (ArgValue::Float(x), Dtype::Float32) => Values::F32(vec![*x as f32]),
    (ArgValue::Float(x), Dtype::Int32) => Values::I32(vec![*x as i32]),
    (ArgValue::Int(x), Dtype::Float32) => Values::F32(vec![*x as f32]),
    (ArgValue::Int(x), Dtype::Int32) => Values::I32(vec![*x as i32]),
    _ => {
      return Err(Error::UnresolvedOperand {
        what: format!("operand {:?} cannot join a {:?} operation", operand, dtype),
      })
    }
  };
  Ok(ctx.network.add_constant(vec![1], Rc::new(values)))
}

/// Resolves a set of operands for one elementwise operation: common dtype,
/// then handles, then rank alignment by left-padding unit dimensions with
/// reshape nodes. The padding reshape is not bound back to any host tensor.
pub fn resolve(ctx: &mut TraceContext, operands: &[ArgValue]) -> Result<Vec<TensorRef>, Error> {
  let dtype = common_dtype(operands)?;
  let mut handles = Vec::with_capacity(operands.len());
  for operand in operands {
    let handle = match operand {
      ArgValue::Tensor(t) => to_network(ctx, t)?,
      ArgValue::Float(_) | ArgValue::Int(_) => scalar_leaf(ctx, operand, dtype)?,
      other => {
        return Err(Error::UnresolvedOperand {
          what: format!("operand {:?} is neither a tensor nor a scalar", other),
        })
      }
    };
    handles.push(handle);
  }

  let target_rank = operands
    .iter()
    .zip(&handles)
    .filter(|(o, _)| matches!(o, ArgValue::Tensor(_)))
    .map(|(_, h)| h.rank())
    .max()
    .unwrap_or(1);

  let mut aligned = Vec::with_capacity(handles.len());
  for handle in handles {
    if handle.rank() < target_rank {
      let mut dims = vec![1i64; target_rank - handle.rank()];
      dims.extend_from_slice(&handle.shape);
      aligned.push(ctx.network.add_reshape(&handle, dims));
    } else {
      aligned.push(handle);
    }
  }
  Ok(aligned)
}

/// Single-operand convenience over [`resolve`].
pub fn resolve1(ctx: &mut TraceContext, operand: &ArgValue) -> Result<TensorRef, Error> {
  let mut handles = resolve(ctx, std::slice::from_ref(operand))?;
  Ok(handles.remove(0))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn constant_leaf_materializes_once() {
    let mut ctx = TraceContext::new(true);
    let t = Tensor::from_f32(vec![2, 3], vec![0.; 6]);
    let a = to_network(&mut ctx, &t).unwrap();
    let b = to_network(&mut ctx, &t).unwrap();
    assert_eq!(a.node, b.node);
    assert_eq!(ctx.network.node_count(), 1);
    assert_eq!(a.shape, vec![2, 3]);
  }

  #[test]
  fn forked_tensor_gets_its_own_leaf() {
    let mut ctx = TraceContext::new(true);
    let t = Tensor::from_f32(vec![2], vec![1., 2.]);
    let a = to_network(&mut ctx, &t).unwrap();
    let b = to_network(&mut ctx, &t.fork()).unwrap();
    assert_ne!(a.node, b.node);
  }

  #[test]
  fn resolve_pads_ranks_to_match() {
    let mut ctx = TraceContext::new(true);
    let big = Tensor::from_f32(vec![2, 3, 4], vec![0.; 24]);
    let small = Tensor::from_f32(vec![4], vec![0.; 4]);
    let handles = resolve(
      &mut ctx,
      &[ArgValue::Tensor(big), ArgValue::Tensor(small)],
    )
    .unwrap();
    assert_eq!(handles[0].rank(), 3);
    assert_eq!(handles[1].rank(), 3);
    assert_eq!(handles[1].shape, vec![1, 1, 4]);
  }

  #[test]
  fn scalar_adopts_float_when_any_operand_is_float() {
    let mut ctx = TraceContext::new(true);
    let t = Tensor::from_f32(vec![2, 2], vec![0.; 4]);
    let handles = resolve(&mut ctx, &[ArgValue::Tensor(t), ArgValue::Int(3)]).unwrap();
    assert_eq!(handles[1].dtype, Dtype::Float32);
    assert_eq!(handles[1].shape, vec![1, 1]);
  }

  #[test]
  fn mixed_tensor_dtypes_are_rejected() {
    let mut ctx = TraceContext::new(true);
    let f = Tensor::from_f32(vec![2], vec![0.; 2]);
    let i = Tensor::from_i32(vec![2], vec![0; 2]);
    assert!(matches!(
      resolve(&mut ctx, &[ArgValue::Tensor(f), ArgValue::Tensor(i)]),
      Err(Error::DtypeMismatch { .. })
    ));
  }
}
