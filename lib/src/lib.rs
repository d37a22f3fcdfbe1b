//! Trace-based graph recorder. A host tensor program runs eagerly, exactly
//! as it would untraced, while every intercepted operation is also
//! translated into nodes of a static dataflow graph. The result is the
//! recorded [`network::Network`] plus named inputs and outputs.
pub mod converters;
pub mod demos;
pub mod host;
pub mod network;
pub mod trace;
pub mod utils;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;
use tracing::info;

pub use host::{Host, Tensor};
pub use network::{Dtype, Network, Values};

use trace::{TraceContext, TraceHooks};

#[derive(Debug)]
pub enum Error {
  /// Operands of one operation disagree on element type; no promotion is
  /// attempted.
  DtypeMismatch { left: Dtype, right: Dtype },
  /// An argument could not be turned into a graph operand.
  UnresolvedOperand { what: String },
  /// An index expression the decomposition cannot express.
  MalformedIndex { reason: String },
  /// Valid host operation with no graph equivalent under the current mode.
  Unsupported { what: String },
  /// A translator ran with no intercepted call active.
  NoActiveCall,
  /// Translator failure, annotated with the operation it was translating.
  Conversion {
    key: &'static str,
    arg_shapes: Vec<Vec<usize>>,
    source: Box<Error>,
  },
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Error::DtypeMismatch { left, right } => {
        write!(f, "dtype mismatch: {:?} vs {:?}", left, right)
      }
      Error::UnresolvedOperand { what } => write!(f, "unresolved operand: {}", what),
      Error::MalformedIndex { reason } => write!(f, "malformed index expression: {}", reason),
      Error::Unsupported { what } => write!(f, "unsupported: {}", what),
      Error::NoActiveCall => write!(f, "translator invoked outside an intercepted call"),
      Error::Conversion {
        key,
        arg_shapes,
        source,
      } => write!(
        f,
        "translating {} (arg shapes {:?}): {}",
        key, arg_shapes, source
      ),
    }
  }
}

impl std::error::Error for Error {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    match self {
      Error::Conversion { source, .. } => Some(source.as_ref()),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TraceOptions {
  /// Keep the batch dimension in the graph. When false the recorder runs in
  /// fixed-batch mode: inputs are cut to a single batch entry, graph shapes
  /// drop the leading dimension and reduction axes shift down by one.
  pub dynamic_shape: bool,
  pub input_names: Option<Vec<String>>,
  pub output_names: Option<Vec<String>>,
}

impl Default for TraceOptions {
  fn default() -> TraceOptions {
    TraceOptions {
      dynamic_shape: true,
      input_names: None,
      output_names: None,
    }
  }
}

/// Serializable summary of a recorded graph.
#[derive(Debug, Serialize)]
pub struct Metadata {
  pub input_names: Vec<String>,
  pub output_names: Vec<String>,
  pub dynamic_shape: bool,
  pub node_count: usize,
}

#[derive(Debug)]
pub struct TracedProgram {
  pub network: Network,
  pub input_names: Vec<String>,
  pub output_names: Vec<String>,
  pub dynamic_shape: bool,
}

impl TracedProgram {
  pub fn metadata(&self) -> Metadata {
    Metadata {
      input_names: self.input_names.clone(),
      output_names: self.output_names.clone(),
      dynamic_shape: self.dynamic_shape,
      node_count: self.network.node_count(),
    }
  }
}

/// Runs `program` over (copies of) `inputs` with recording hooks installed
/// and returns the graph it traced out. The program receives the host to
/// dispatch through and the prepared input tensors; whatever it returns
/// becomes the graph outputs, which must all descend from recorded
/// operations.
#[tracing::instrument(skip(program, inputs, options))]
pub fn trace<F>(program: F, inputs: &[Tensor], options: TraceOptions) -> Result<TracedProgram, Error>
where
  F: FnOnce(&mut Host, &[Tensor]) -> Result<Vec<Tensor>, Error>,
{
  let registry = Rc::new(converters::registry());
  let ctx = Rc::new(RefCell::new(TraceContext::new(options.dynamic_shape)));

  // fresh identities, so shadow bindings never attach to caller tensors
  let inputs: Vec<Tensor> = if options.dynamic_shape {
    inputs.iter().map(|t| t.fork()).collect()
  } else {
    inputs
      .iter()
      .map(|t| t.batch_head())
      .collect::<Result<_, _>>()?
  };

  let input_names = options
    .input_names
    .unwrap_or_else(|| (0..inputs.len()).map(|i| format!("input_{}", i)).collect());
  {
    let mut c = ctx.borrow_mut();
    for (tensor, name) in inputs.iter().zip(&input_names) {
      let shape: Vec<i64> = if options.dynamic_shape {
        tensor.shape().iter().map(|d| *d as i64).collect()
      } else {
        tensor.shape()[1..].iter().map(|d| *d as i64).collect()
      };
      let handle = c.network.add_input(name, shape, tensor.dtype());
      c.bind(tensor, handle);
    }
  }

  let mut host = Host::new();
  host.install(TraceHooks::new(registry, ctx.clone()));
  let result = program(&mut host, &inputs);
  host.uninstall();
  let outputs = result?;

  let output_names = options
    .output_names
    .unwrap_or_else(|| (0..outputs.len()).map(|i| format!("output_{}", i)).collect());
  {
    let mut c = ctx.borrow_mut();
    for (tensor, name) in outputs.iter().zip(&output_names) {
      let handle = c.binding(tensor).ok_or_else(|| Error::UnresolvedOperand {
        what: format!(
          "output `{}` does not descend from a recorded operation",
          name
        ),
      })?;
      c.network.mark_output(&handle, name);
    }
  }

  let ctx = match Rc::try_unwrap(ctx) {
    Ok(cell) => cell.into_inner(),
    Err(_) => {
      return Err(Error::UnresolvedOperand {
        what: "recording hooks outlived the trace".to_string(),
      })
    }
  };
  info!(
    nodes = ctx.network.node_count(),
    outputs = output_names.len(),
    "trace complete"
  );
  Ok(TracedProgram {
    network: ctx.network,
    input_names,
    output_names,
    dynamic_shape: options.dynamic_shape,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::host::index::IndexElem;
  use crate::network::Layer;

  fn legacy() -> TraceOptions {
    TraceOptions {
      dynamic_shape: false,
      ..TraceOptions::default()
    }
  }

  #[test]
  fn traces_a_demo_end_to_end() {
    let _guard = utils::init_logging_tests();
    let inputs = demos::demo_inputs(7);
    let traced = trace(demos::demo_mix, &inputs, TraceOptions::default()).unwrap();
    assert_eq!(traced.input_names, vec!["input_0"]);
    assert_eq!(traced.output_names, vec!["output_0"]);
    assert_eq!(traced.network.outputs().len(), 1);
    assert!(traced.network.node_count() > 5);
  }

  #[test]
  fn legacy_mode_strips_batch_from_graph_inputs() {
    let x = Tensor::from_f32(vec![2, 3], vec![0.; 6]);
    let traced = trace(
      |host, inputs| Ok(vec![host.relu(&inputs[0])?]),
      &[x],
      legacy(),
    )
    .unwrap();
    let has_input = traced
      .network
      .graph
      .node_weights()
      .any(|l| matches!(l, Layer::Input { .. }));
    assert!(has_input);
    assert_eq!(traced.network.node_count(), 2);
  }

  #[test]
  fn legacy_mode_cuts_inputs_to_one_batch_entry() {
    let x = Tensor::from_f32(vec![2, 2], vec![1., 2., 3., 4.]);
    trace(
      |host, inputs| {
        assert_eq!(inputs[0].shape(), &[1, 2]);
        assert_eq!(inputs[0].values(), &Values::F32(vec![1., 2.]));
        Ok(vec![host.relu(&inputs[0])?])
      },
      &[x],
      legacy(),
    )
    .unwrap();
  }

  #[test]
  fn untraced_output_is_rejected() {
    let x = Tensor::from_f32(vec![1, 2], vec![0.; 2]);
    let err = trace(
      |_host, _inputs| Ok(vec![Tensor::from_f32(vec![1], vec![42.0])]),
      &[x],
      TraceOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::UnresolvedOperand { .. }));
  }

  #[test]
  fn program_error_propagates_after_uninstall() {
    let x = Tensor::from_f32(vec![1, 2], vec![0.; 2]);
    let err = trace(
      |host, inputs| {
        host.relu(&inputs[0])?;
        Err(Error::Unsupported {
          what: "giving up".to_string(),
        })
      },
      &[x],
      TraceOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, Error::Unsupported { .. }));
  }

  #[test]
  fn custom_names_are_honored() {
    let x = Tensor::from_f32(vec![1, 2], vec![1., 2.]);
    let traced = trace(
      |host, inputs| Ok(vec![host.relu(&inputs[0])?]),
      &[x],
      TraceOptions {
        dynamic_shape: true,
        input_names: Some(vec!["pixels".to_string()]),
        output_names: Some(vec!["logits".to_string()]),
      },
    )
    .unwrap();
    assert_eq!(traced.output_names, vec!["logits"]);
    let named = traced
      .network
      .graph
      .node_weights()
      .any(|l| matches!(l, Layer::Input { name, .. } if name == "pixels"));
    assert!(named);
  }

  #[test]
  fn metadata_serializes() {
    let x = Tensor::from_f32(vec![1, 2], vec![1., 2.]);
    let traced = trace(
      |host, inputs| Ok(vec![host.relu(&inputs[0])?]),
      &[x],
      TraceOptions::default(),
    )
    .unwrap();
    let json = serde_json::to_string(&traced.metadata()).unwrap();
    assert!(json.contains("\"node_count\":2"));
  }

  #[test]
  fn getitem_chain_marks_output() {
    let x = Tensor::from_f32(vec![1, 5, 4], (0..20).map(|i| i as f32).collect());
    let traced = trace(
      |host, inputs| {
        let sliced = host.getitem(
          &inputs[0],
          vec![
            IndexElem::full(),
            IndexElem::strided(Some(0), None, 2),
            IndexElem::At(1),
          ],
        )?;
        let bumped = host.add_scalar(&sliced, 1.0)?;
        Ok(vec![bumped])
      },
      &[x],
      legacy(),
    )
    .unwrap();
    assert_eq!(traced.network.outputs().len(), 1);
    let has_slice = traced
      .network
      .graph
      .node_weights()
      .any(|l| matches!(l, Layer::Slice { .. }));
    let has_reshape = traced
      .network
      .graph
      .node_weights()
      .any(|l| matches!(l, Layer::Reshape { .. }));
    assert!(has_slice && has_reshape);
  }
}
