//! Multi-dimensional index expressions: the raw element forms a program can
//! write, normalization against a tensor rank, and the eager evaluation used
//! while the program runs. The graph-side decomposition of the same
//! expression lives in the converter layer and shares the helpers here.
use crate::network::Values;
use crate::Error;

use super::Tensor;

#[derive(Debug, Clone)]
pub enum IndexElem {
  /// Single position along one dimension; the dimension is removed.
  At(i64),
  /// Half-open strided range; `None` fields take the python defaults.
  Span {
    start: Option<i64>,
    stop: Option<i64>,
    step: Option<i64>,
  },
  /// Expands to as many full spans as needed to cover the tensor rank.
  Ellipsis,
  /// Inserts a unit dimension.
  NewAxis,
  /// Index tensor; integer dtype selects rows along its dimension.
  Mask(Tensor),
}

impl IndexElem {
  pub fn full() -> IndexElem {
    IndexElem::Span {
      start: None,
      stop: None,
      step: None,
    }
  }

  pub fn range(start: i64, stop: i64) -> IndexElem {
    IndexElem::Span {
      start: Some(start),
      stop: Some(stop),
      step: None,
    }
  }

  pub fn strided(start: Option<i64>, stop: Option<i64>, step: i64) -> IndexElem {
    IndexElem::Span {
      start,
      stop,
      step: Some(step),
    }
  }

  pub fn is_span(&self) -> bool {
    matches!(self, IndexElem::Span { .. })
  }

  /// Whether the element addresses one dimension of the indexed tensor.
  pub fn consumes_dim(&self) -> bool {
    matches!(
      self,
      IndexElem::At(_) | IndexElem::Span { .. } | IndexElem::Mask(_)
    )
  }
}

/// Expand the (at most one) ellipsis and right-pad with full spans so the
/// dimension-consuming elements cover every tensor dimension.
pub fn normalize(expr: &[IndexElem], rank: usize) -> Result<Vec<IndexElem>, Error> {
  let ellipses = expr
    .iter()
    .filter(|e| matches!(e, IndexElem::Ellipsis))
    .count();
  if ellipses > 1 {
    return Err(Error::MalformedIndex {
      reason: "more than one ellipsis in index expression".to_string(),
    });
  }
  let consuming = expr.iter().filter(|e| e.consumes_dim()).count();
  if consuming > rank {
    return Err(Error::MalformedIndex {
      reason: format!(
        "index expression consumes {} dimensions but tensor has {}",
        consuming, rank
      ),
    });
  }
  let missing = rank - consuming;

  let mut out = Vec::with_capacity(expr.len() + missing);
  for e in expr {
    match e {
      IndexElem::Ellipsis => {
        for _ in 0..missing {
          out.push(IndexElem::full());
        }
      }
      other => out.push(other.clone()),
    }
  }
  if ellipses == 0 {
    for _ in 0..missing {
      out.push(IndexElem::full());
    }
  }
  Ok(out)
}

/// Resolve one span against a dimension size into a (start, size, stride)
/// triple. Size follows `floor((stop - start - 1) / stride) + 1`; reversed
/// (negative-step) and negative-bound spans are rejected outright.
pub fn span_parts(
  dim_size: i64,
  start: Option<i64>,
  stop: Option<i64>,
  step: Option<i64>,
) -> Result<(i64, i64, i64), Error> {
  let stride = step.unwrap_or(1);
  if stride <= 0 {
    return Err(Error::MalformedIndex {
      reason: format!("slice step {} is not supported", stride),
    });
  }
  let start = start.unwrap_or(0);
  let stop = stop.unwrap_or(dim_size).min(dim_size);
  if start < 0 || stop < 0 {
    return Err(Error::MalformedIndex {
      reason: "negative slice bounds are not supported".to_string(),
    });
  }
  if start >= dim_size {
    return Err(Error::MalformedIndex {
      reason: format!(
        "slice start {} out of range for dimension of size {}",
        start, dim_size
      ),
    });
  }
  let size = (stop - start - 1).div_euclid(stride) + 1;
  if size <= 0 {
    return Err(Error::MalformedIndex {
      reason: format!("empty slice ({}..{})", start, stop),
    });
  }
  Ok((start, size, stride))
}

fn row_major_strides(shape: &[usize]) -> Vec<usize> {
  let mut strides = vec![1; shape.len()];
  for d in (0..shape.len().saturating_sub(1)).rev() {
    strides[d] = strides[d + 1] * shape[d + 1];
  }
  strides
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

fn take(values: &Values, idxs: &[usize]) -> Values {
  match values {
    Values::F32(v) => Values::F32(idxs.iter().map(|i| v[*i]).collect()),
    Values::I32(v) => Values::I32(idxs.iter().map(|i| v[*i]).collect()),
    Values::Bool(v) => Values::Bool(idxs.iter().map(|i| v[*i]).collect()),
  }
}

fn gather_dim(
  values: &Values,
  shape: &[usize],
  dim: usize,
  indices: &[i32],
) -> (Values, Vec<usize>) {
  let mut out_shape = shape.to_vec();
  out_shape[dim] = indices.len();
  let in_strides = row_major_strides(shape);
  let mut idxs = Vec::new();
  for_each_coord(&out_shape, |coord| {
    let mut flat = 0usize;
    for (d, c) in coord.iter().enumerate() {
      let cc = if d == dim { indices[*c] as usize } else { *c };
      flat += cc * in_strides[d];
    }
    idxs.push(flat);
  });
  (take(values, &idxs), out_shape)
}

/// Eager evaluation of an index expression, used as the real result of the
/// intercepted operation. Semantics match the graph decomposition: strided
/// selection per consumed dimension, then gathers for integer index tensors,
/// then the rank fix-up for integers/newaxes.
pub(crate) fn eval(x: &Tensor, expr: &[IndexElem]) -> Result<Tensor, Error> {
  let norm = normalize(expr, x.rank())?;

  let mut sel: Vec<(i64, i64, i64)> = Vec::new();
  let mut cursor = 0usize;
  for e in &norm {
    match e {
      IndexElem::Span { start, stop, step } => {
        sel.push(span_parts(x.shape()[cursor] as i64, *start, *stop, *step)?);
        cursor += 1;
      }
      IndexElem::At(i) => {
        let dim = x.shape()[cursor] as i64;
        if *i < 0 || *i >= dim {
          return Err(Error::MalformedIndex {
            reason: format!("index {} out of range for dimension of size {}", i, dim),
          });
        }
        sel.push((*i, 1, 1));
        cursor += 1;
      }
      IndexElem::Mask(_) => {
        sel.push((0, x.shape()[cursor] as i64, 1));
        cursor += 1;
      }
      IndexElem::NewAxis | IndexElem::Ellipsis => {}
    }
  }

  let sliced_shape: Vec<usize> = sel.iter().map(|(_, size, _)| *size as usize).collect();
  let in_strides = row_major_strides(x.shape());
  let mut idxs = Vec::new();
  for_each_coord(&sliced_shape, |coord| {
    let mut flat = 0usize;
    for (d, c) in coord.iter().enumerate() {
      let (start, _, stride) = sel[d];
      flat += (start as usize + c * stride as usize) * in_strides[d];
    }
    idxs.push(flat);
  });
  let mut values = take(x.values(), &idxs);
  let mut shape = sliced_shape;

  let mut dim = 0usize;
  for e in &norm {
    match e {
      IndexElem::Mask(t) => {
        if t.rank() != 1 {
          return Err(Error::MalformedIndex {
            reason: "only rank-1 index tensors are supported".to_string(),
          });
        }
        let indices = match t.values() {
          Values::I32(v) => v.clone(),
          Values::Bool(_) => {
            return Err(Error::MalformedIndex {
              reason: "boolean mask indexing is not supported".to_string(),
            })
          }
          Values::F32(_) => {
            return Err(Error::MalformedIndex {
              reason: "index tensor must have an integer dtype".to_string(),
            })
          }
        };
        for i in &indices {
          if *i < 0 || *i as usize >= shape[dim] {
            return Err(Error::MalformedIndex {
              reason: format!(
                "gather index {} out of range for dimension of size {}",
                i, shape[dim]
              ),
            });
          }
        }
        let (v, s) = gather_dim(&values, &shape, dim, &indices);
        values = v;
        shape = s;
        dim += 1;
      }
      IndexElem::At(_) | IndexElem::Span { .. } => dim += 1,
      IndexElem::NewAxis | IndexElem::Ellipsis => {}
    }
  }

  let mut final_shape = Vec::new();
  let mut c = 0usize;
  for e in &norm {
    match e {
      IndexElem::Span { .. } | IndexElem::Mask(_) => {
        final_shape.push(shape[c]);
        c += 1;
      }
      IndexElem::At(_) => c += 1,
      IndexElem::NewAxis => final_shape.push(1),
      IndexElem::Ellipsis => {}
    }
  }
  Ok(Tensor::new(final_shape, values))
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn t(shape: Vec<usize>, data: Vec<f32>) -> Tensor {
    Tensor::new(shape, Values::F32(data))
  }

  #[test]
  fn normalize_pads_right() {
    let norm = normalize(&[IndexElem::At(1)], 3).unwrap();
    assert_eq!(norm.len(), 3);
    assert!(matches!(norm[0], IndexElem::At(1)));
    assert!(norm[1].is_span() && norm[2].is_span());
  }

  #[test]
  fn normalize_expands_ellipsis_to_full_rank() {
    // one span + newaxis + ellipsis over a rank-4 tensor
    let expr = vec![IndexElem::full(), IndexElem::NewAxis, IndexElem::Ellipsis];
    let norm = normalize(&expr, 4).unwrap();
    let consumed = norm.iter().filter(|e| e.consumes_dim()).count();
    let newaxes = norm
      .iter()
      .filter(|e| matches!(e, IndexElem::NewAxis))
      .count();
    assert_eq!(consumed, 4);
    assert_eq!(newaxes, 1);
    assert!(norm.iter().all(|e| !matches!(e, IndexElem::Ellipsis)));
  }

  #[test]
  fn normalize_rejects_double_ellipsis() {
    let expr = vec![IndexElem::Ellipsis, IndexElem::At(0), IndexElem::Ellipsis];
    assert!(matches!(
      normalize(&expr, 3),
      Err(Error::MalformedIndex { .. })
    ));
  }

  #[test]
  fn normalize_rejects_overconsumption() {
    let expr = vec![IndexElem::At(0), IndexElem::At(0), IndexElem::At(0)];
    assert!(matches!(
      normalize(&expr, 2),
      Err(Error::MalformedIndex { .. })
    ));
  }

  #[test]
  fn span_sizes_match_known_cases() {
    assert_eq!(span_parts(5, Some(0), Some(5), Some(1)).unwrap().1, 5);
    assert_eq!(span_parts(5, Some(1), None, Some(2)).unwrap().1, 2);
    assert_eq!(span_parts(5, Some(1), Some(3), Some(2)).unwrap().1, 1);
    assert_eq!(span_parts(4, Some(0), Some(3), Some(4)).unwrap().1, 1);
  }

  #[test]
  fn span_rejects_negative_step() {
    assert!(matches!(
      span_parts(5, None, None, Some(-1)),
      Err(Error::MalformedIndex { .. })
    ));
  }

  #[test]
  fn eval_strided_slice() {
    let x = t(vec![1, 5], vec![0., 1., 2., 3., 4.]);
    let y = eval(
      &x,
      &[IndexElem::full(), IndexElem::strided(Some(1), None, 2)],
    )
    .unwrap();
    assert_eq!(y.shape(), &[1, 2]);
    assert_eq!(y.values(), &Values::F32(vec![1., 3.]));
  }

  #[test]
  fn eval_integer_removes_dim() {
    let x = t(vec![2, 3], vec![0., 1., 2., 3., 4., 5.]);
    let y = eval(&x, &[IndexElem::At(1)]).unwrap();
    assert_eq!(y.shape(), &[3]);
    assert_eq!(y.values(), &Values::F32(vec![3., 4., 5.]));
  }

  #[test]
  fn eval_newaxis_inserts_dim() {
    let x = t(vec![2, 3], vec![0., 1., 2., 3., 4., 5.]);
    let y = eval(
      &x,
      &[IndexElem::full(), IndexElem::full(), IndexElem::NewAxis],
    )
    .unwrap();
    assert_eq!(y.shape(), &[2, 3, 1]);
  }

  #[test]
  fn eval_gather_with_index_tensor() {
    let x = t(vec![1, 5], vec![10., 11., 12., 13., 14.]);
    let idx = Tensor::new(vec![2], Values::I32(vec![4, 1]));
    let y = eval(&x, &[IndexElem::full(), IndexElem::Mask(idx)]).unwrap();
    assert_eq!(y.shape(), &[1, 2]);
    assert_eq!(y.values(), &Values::F32(vec![14., 11.]));
  }

  #[test]
  fn eval_rejects_boolean_mask() {
    let x = t(vec![3], vec![0., 1., 2.]);
    let mask = Tensor::new(vec![3], Values::Bool(vec![true, false, true]));
    assert!(matches!(
      eval(&x, &[IndexElem::Mask(mask)]),
      Err(Error::MalformedIndex { .. })
    ));
  }

  #[test]
  fn eval_weird_combo() {
    // x[:, 0:3:4, None, None, 1, ...] on shape (1, 5, 4, 3)
    let data: Vec<f32> = (0..60).map(|i| i as f32).collect();
    let x = t(vec![1, 5, 4, 3], data);
    let y = eval(
      &x,
      &[
        IndexElem::full(),
        IndexElem::strided(Some(0), Some(3), 4),
        IndexElem::NewAxis,
        IndexElem::NewAxis,
        IndexElem::At(1),
        IndexElem::Ellipsis,
      ],
    )
    .unwrap();
    assert_eq!(y.shape(), &[1, 1, 1, 1, 3]);
    assert_eq!(y.values(), &Values::F32(vec![3., 4., 5.]));
  }

  proptest! {
    #[test]
    fn span_size_formula_matches_enumeration(
      dim in 1i64..40,
      start in 0i64..40,
      stop in 1i64..48,
      step in 1i64..6,
    ) {
      prop_assume!(start < dim);
      let clamped = stop.min(dim);
      prop_assume!(clamped > start);
      let (s, size, stride) = span_parts(dim, Some(start), Some(stop), Some(step)).unwrap();
      let oracle = (s..clamped).step_by(stride as usize).count() as i64;
      prop_assert_eq!(size, oracle);
    }
  }
}
