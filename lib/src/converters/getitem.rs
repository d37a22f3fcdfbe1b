//! Indexing translator. One index expression becomes at most three graph
//! stages: a strided slice over the consumed dimensions, a gather per
//! integer index tensor, and a single reshape to the real output shape when
//! integers, newaxes or index tensors changed the rank.
use crate::host::index::{self, IndexElem};
use crate::network::Dtype;
use crate::trace::{broadcast, TraceContext};
use crate::Error;

pub(super) fn convert_getitem(ctx: &mut TraceContext) -> Result<(), Error> {
  let call = ctx.call()?.clone();
  let input = call.tensor_arg("input", 0)?;
  let expr = call.index_arg("index", 1)?;

  let handle = broadcast::to_network(ctx, &input)?;
  let norm = index::normalize(&expr, input.rank())?;
  // fixed-batch mode: a handle bound to the batch-stripped graph shape has
  // no axis for the leading element to address, so that element is dropped.
  // Leaf constants keep their full host shape and are sliced as-is.
  let strip = !ctx.dynamic_shape && handle.rank() < input.rank() && !norm.is_empty();
  let work: &[IndexElem] = if strip { &norm[1..] } else { &norm[..] };

  let mut starts = Vec::new();
  let mut sizes = Vec::new();
  let mut strides = Vec::new();
  let mut cursor = 0usize;
  for elem in work {
    let dim = match handle.shape.get(cursor) {
      Some(d) => *d,
      None => break,
    };
    match elem {
      IndexElem::Span { start, stop, step } => {
        let (start, size, stride) = index::span_parts(dim, *start, *stop, *step)?;
        starts.push(start);
        sizes.push(size);
        strides.push(stride);
        cursor += 1;
      }
      IndexElem::At(i) => {
        starts.push(*i);
        sizes.push(1);
        strides.push(1);
        cursor += 1;
      }
      // index tensors keep their dimension intact here; the gather below
      // does the selection
      IndexElem::Mask(_) => {
        starts.push(0);
        sizes.push(dim);
        strides.push(1);
        cursor += 1;
      }
      IndexElem::NewAxis | IndexElem::Ellipsis => {}
    }
  }
  let mut out = ctx.network.add_slice(&handle, starts, sizes, strides);

  // the gather axis indexes the slice output, so it counts only the
  // elements that consumed a dimension; newaxes have no axis yet
  let mut axis = 0usize;
  for elem in work {
    match elem {
      IndexElem::Mask(indices) => {
        match indices.dtype() {
          Dtype::Int32 => {}
          Dtype::Bool => {
            return Err(Error::MalformedIndex {
              reason: "boolean mask indexing is not supported".to_string(),
            })
          }
          Dtype::Float32 => {
            return Err(Error::MalformedIndex {
              reason: "index tensor must have an integer dtype".to_string(),
            })
          }
        }
        let idx_handle = broadcast::to_network(ctx, indices)?;
        out = ctx.network.add_gather(&out, &idx_handle, axis);
        axis += 1;
      }
      IndexElem::At(_) | IndexElem::Span { .. } => axis += 1,
      IndexElem::NewAxis | IndexElem::Ellipsis => {}
    }
  }

  // fix up to the real output shape when the rank changed, and in
  // fixed-batch mode whenever the sliced handle still carries the batch axis
  let rank_changed = work.iter().any(|e| !e.is_span());
  let keeps_batch = !ctx.dynamic_shape && !strip;
  if rank_changed || keeps_batch {
    let output = &call.output;
    let skip = if ctx.dynamic_shape { 0 } else { 1 };
    let from = skip.min(output.rank());
    let dims: Vec<i64> = output.shape()[from..].iter().map(|d| *d as i64).collect();
    out = ctx.network.add_reshape(&out, dims);
  }
  ctx.bind_output(out)
}
