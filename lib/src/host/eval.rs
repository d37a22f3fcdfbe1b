//! Eager kernels. Every intercepted operation runs one of these for real so
//! the program always sees concrete values; recording happens around them.
//! Compound kernels (prelu) are built from dispatched primitives on purpose,
//! which is what drives reentrant interception.
use crate::network::{Dtype, Values};
use crate::trace::ArgValue;
use crate::Error;

use super::index;
use super::{Host, Tensor};

fn tensor_arg<'a>(args: &'a [ArgValue], pos: usize) -> Result<&'a Tensor, Error> {
  match args.get(pos) {
    Some(ArgValue::Tensor(t)) => Ok(t),
    other => Err(Error::UnresolvedOperand {
      what: format!("expected tensor at argument {}, got {:?}", pos, other),
    }),
  }
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
  let mut strides = vec![1; shape.len()];
  for d in (0..shape.len().saturating_sub(1)).rev() {
    strides[d] = strides[d + 1] * shape[d + 1];
  }
  strides
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>, Error> {
  let rank = a.len().max(b.len());
  let mut out = vec![0usize; rank];
  for i in 0..rank {
    let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
    let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
    if da != db && da != 1 && db != 1 {
      return Err(Error::UnresolvedOperand {
        what: format!("shapes {:?} and {:?} do not broadcast", a, b),
      });
    }
    out[i] = da.max(db);
  }
  Ok(out)
}

/// Flat index into `shape` for an output coordinate, broadcasting size-1 and
/// missing leading dimensions.
fn broadcast_index(coord: &[usize], shape: &[usize]) -> usize {
  let strides = row_major_strides(shape);
  let off = coord.len() - shape.len();
  let mut flat = 0usize;
  for (d, dim) in shape.iter().enumerate() {
    let c = if *dim == 1 { 0 } else { coord[off + d] };
    flat += c * strides[d];
  }
  flat
}

fn for_each_coord(shape: &[usize], mut f: impl FnMut(&[usize])) {
  if shape.iter().any(|d| *d == 0) {
    return;
  }
  let mut coord = vec![0usize; shape.len()];
  loop {
    f(&coord);
    let mut d = shape.len();
    loop {
      if d == 0 {
        return;
      }
      d -= 1;
      coord[d] += 1;
      if coord[d] < shape[d] {
        break;
      }
      coord[d] = 0;
    }
  }
}

fn binary(
  a: &Tensor,
  b: &Tensor,
  f: fn(f32, f32) -> f32,
  g: fn(i32, i32) -> i32,
) -> Result<Tensor, Error> {
  if a.dtype() != b.dtype() {
    return Err(Error::DtypeMismatch {
      left: a.dtype(),
      right: b.dtype(),
    });
  }
  let shape = broadcast_shape(a.shape(), b.shape())?;
  let values = match (a.values(), b.values()) {
    (Values::F32(av), Values::F32(bv)) => {
      let mut out = Vec::with_capacity(shape.iter().product());
      for_each_coord(&shape, |coord| {
        out.push(f(
          av[broadcast_index(coord, a.shape())],
          bv[broadcast_index(coord, b.shape())],
        ));
      });
      Values::F32(out)
    }
    (Values::I32(av), Values::I32(bv)) => {
      let mut out = Vec::with_capacity(shape.iter().product());
      for_each_coord(&shape, |coord| {
        out.push(g(
          av[broadcast_index(coord, a.shape())],
          bv[broadcast_index(coord, b.shape())],
        ));
      });
      Values::I32(out)
    }
    _ => {
      return Err(Error::UnresolvedOperand {
        what: "arithmetic on bool tensors is not supported".to_string(),
      })
    }
  };
  Ok(Tensor::new(shape, values))
}

/// Turn a scalar operand into a rank-0 tensor of the other operand's dtype.
fn scalarize(arg: &ArgValue, dtype: Dtype) -> Result<Tensor, Error> {
  let values = match (arg, dtype) {
    (ArgValue::Float(x), Dtype::Float32) => Values::F32(vec![*x as f32]),
    (ArgValue::Float(x), Dtype::Int32) => Values::I32(vec![*x as i32]),
    (ArgValue::Int(x), Dtype::Float32) => Values::F32(vec![*x as f32]),
    (ArgValue::Int(x), Dtype::Int32) => Values::I32(vec![*x as i32]),
    _ => {
      return Err(Error::UnresolvedOperand {
        what: format!("operand {:?} is not usable as a {:?} scalar", arg, dtype),
      })
    }
  };
  Ok(Tensor::new(vec![], values))
}

fn binary_args(
  args: &[ArgValue],
  f: fn(f32, f32) -> f32,
  g: fn(i32, i32) -> i32,
) -> Result<Tensor, Error> {
  let a = tensor_arg(args, 0)?;
  let b = match args.get(1) {
    Some(ArgValue::Tensor(t)) => t.clone(),
    Some(other) => scalarize(other, a.dtype())?,
    None => {
      return Err(Error::UnresolvedOperand {
        what: "binary operation needs a second operand".to_string(),
      })
    }
  };
  binary(a, &b, f, g)
}

pub(crate) fn add(
  _host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  binary_args(args, |a, b| a + b, |a, b| a + b)
}

pub(crate) fn mul(
  _host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  binary_args(args, |a, b| a * b, |a, b| a * b)
}

fn unary(x: &Tensor, f: fn(f32) -> f32, g: fn(i32) -> i32) -> Result<Tensor, Error> {
  let values = match x.values() {
    Values::F32(v) => Values::F32(v.iter().map(|a| f(*a)).collect()),
    Values::I32(v) => Values::I32(v.iter().map(|a| g(*a)).collect()),
    Values::Bool(_) => {
      return Err(Error::UnresolvedOperand {
        what: "arithmetic on bool tensors is not supported".to_string(),
      })
    }
  };
  Ok(Tensor::new(x.shape().to_vec(), values))
}

pub(crate) fn neg(
  _host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  unary(tensor_arg(args, 0)?, |a| -a, |a| -a)
}

pub(crate) fn relu(
  _host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  unary(tensor_arg(args, 0)?, |a| a.max(0.0), |a| a.max(0))
}

fn reduce_dims(kwargs: &[(&'static str, ArgValue)], rank: usize) -> Result<Vec<usize>, Error> {
  for (name, value) in kwargs {
    if *name != "dim" {
      continue;
    }
    let dims: Vec<i64> = match value {
      ArgValue::Int(d) => vec![*d],
      ArgValue::Ints(ds) => ds.clone(),
      ArgValue::None => break,
      other => {
        return Err(Error::UnresolvedOperand {
          what: format!("reduction dims {:?} are not integers", other),
        })
      }
    };
    let mut out = Vec::with_capacity(dims.len());
    for d in dims {
      if d < 0 || d as usize >= rank {
        return Err(Error::UnresolvedOperand {
          what: format!("reduction dim {} out of range for rank {}", d, rank),
        });
      }
      out.push(d as usize);
    }
    return Ok(out);
  }
  Ok((0..rank).collect())
}

fn keep_dims(kwargs: &[(&'static str, ArgValue)]) -> bool {
  for (name, value) in kwargs {
    if *name == "keepdim" {
      if let ArgValue::Bool(b) = value {
        return *b;
      }
    }
  }
  false
}

enum Acc {
  Sum,
  Max,
}

fn reduce(x: &Tensor, dims: &[usize], keep: bool, acc: Acc) -> Result<Tensor, Error> {
  let mut out_shape = Vec::new();
  for (d, dim) in x.shape().iter().enumerate() {
    if dims.contains(&d) {
      if keep {
        out_shape.push(1);
      }
    } else {
      out_shape.push(*dim);
    }
  }
  // accumulation runs over a keep-dims view, then the shape is fixed up
  let view: Vec<usize> = x
    .shape()
    .iter()
    .enumerate()
    .map(|(d, dim)| if dims.contains(&d) { 1 } else { *dim })
    .collect();
  let view_strides = row_major_strides(&view);
  let values = match x.values() {
    Values::F32(v) => {
      let mut out = vec![
        match acc {
          Acc::Sum => 0.0f32,
          Acc::Max => f32::NEG_INFINITY,
        };
        view.iter().product()
      ];
      for_each_coord(x.shape(), |coord| {
        let mut flat = 0usize;
        for (d, c) in coord.iter().enumerate() {
          if !dims.contains(&d) {
            flat += c * view_strides[d];
          }
        }
        let v = v[flat_index(coord, x.shape())];
        out[flat] = match acc {
          Acc::Sum => out[flat] + v,
          Acc::Max => out[flat].max(v),
        };
      });
      Values::F32(out)
    }
    Values::I32(v) => {
      let mut out = vec![
        match acc {
          Acc::Sum => 0i32,
          Acc::Max => i32::MIN,
        };
        view.iter().product()
      ];
      for_each_coord(x.shape(), |coord| {
        let mut flat = 0usize;
        for (d, c) in coord.iter().enumerate() {
          if !dims.contains(&d) {
            flat += c * view_strides[d];
          }
        }
        let v = v[flat_index(coord, x.shape())];
        out[flat] = match acc {
          Acc::Sum => out[flat] + v,
          Acc::Max => out[flat].max(v),
        };
      });
      Values::I32(out)
    }
    Values::Bool(_) => {
      return Err(Error::UnresolvedOperand {
        what: "arithmetic on bool tensors is not supported".to_string(),
      })
    }
  };
  Ok(Tensor::new(out_shape, values))
}

fn flat_index(coord: &[usize], shape: &[usize]) -> usize {
  let strides = row_major_strides(shape);
  coord.iter().zip(strides).map(|(c, s)| c * s).sum()
}

pub(crate) fn sum(
  _host: &mut Host,
  args: &[ArgValue],
  kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  let x = tensor_arg(args, 0)?;
  let dims = reduce_dims(kwargs, x.rank())?;
  reduce(x, &dims, keep_dims(kwargs), Acc::Sum)
}

/// Elementwise form when the second positional argument is a tensor,
/// reduction form otherwise (over one dim, or over all of them).
pub(crate) fn max(
  _host: &mut Host,
  args: &[ArgValue],
  kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  if let Some(ArgValue::Tensor(_)) = args.get(1) {
    return binary_args(args, |a, b| a.max(b), |a, b| a.max(b));
  }
  let x = tensor_arg(args, 0)?;
  let dims = match args.get(1) {
    Some(ArgValue::Int(d)) => {
      if *d < 0 || *d as usize >= x.rank() {
        return Err(Error::UnresolvedOperand {
          what: format!("reduction dim {} out of range for rank {}", d, x.rank()),
        });
      }
      vec![*d as usize]
    }
    _ => (0..x.rank()).collect(),
  };
  reduce(x, &dims, keep_dims(kwargs), Acc::Max)
}

/// Built from dispatched primitives: relu(x) + (-w) * relu(-x). Nested calls
/// go back through the host funnel, so the recorder sees them while locked.
pub(crate) fn prelu(
  host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  let x = tensor_arg(args, 0)?.clone();
  let w = tensor_arg(args, 1)?;
  if x.rank() < 2 {
    return Err(Error::UnresolvedOperand {
      what: format!("prelu input must have a channel dimension, got rank {}", x.rank()),
    });
  }
  let channels = x.shape()[1];
  if w.len() != 1 && w.len() != channels {
    return Err(Error::UnresolvedOperand {
      what: format!("prelu weight has {} entries for {} channels", w.len(), channels),
    });
  }
  let mut wshape = vec![1usize; x.rank()];
  wshape[1] = w.len();
  let w = w.reshaped(wshape);

  let neg_x = host.neg(&x)?;
  let clipped = host.relu(&neg_x)?;
  let neg_w = host.neg(&w)?;
  let scaled = host.mul(&clipped, &neg_w)?;
  let pos = host.relu(&x)?;
  host.add(&pos, &scaled)
}

pub(crate) fn getitem(
  _host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  let x = tensor_arg(args, 0)?;
  match args.get(1) {
    Some(ArgValue::Index(expr)) => index::eval(x, expr),
    other => Err(Error::UnresolvedOperand {
      what: format!("expected index expression, got {:?}", other),
    }),
  }
}

/// Identity on values; only its recording side differs from a real op.
pub(crate) fn detach(
  _host: &mut Host,
  args: &[ArgValue],
  _kwargs: &[(&'static str, ArgValue)],
) -> Result<Tensor, Error> {
  Ok(tensor_arg(args, 0)?.fork())
}
