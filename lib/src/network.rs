//! Target dataflow graph under construction: primitive layers held as node
//! weights of a petgraph DAG, with shape and dtype inference done at
//! node-insertion time. The recorder only ever appends; nodes are never
//! rewritten once emitted.
use std::error::Error as StdError;
use std::fs::File;
use std::io::Write;
use std::rc::Rc;

use petgraph::stable_graph::{NodeIndex, StableGraph};

/// Marker for a dimension whose size is not known until execution.
pub const DYNAMIC: i64 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dtype {
  Float32,
  Int32,
  Bool,
}

/// Concrete element storage, shared between host tensors and constant layers.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
  F32(Vec<f32>),
  I32(Vec<i32>),
  Bool(Vec<bool>),
}

impl Values {
  pub fn len(&self) -> usize {
    match self {
      Values::F32(v) => v.len(),
      Values::I32(v) => v.len(),
      Values::Bool(v) => v.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn dtype(&self) -> Dtype {
    match self {
      Values::F32(_) => Dtype::Float32,
      Values::I32(_) => Dtype::Int32,
      Values::Bool(_) => Dtype::Bool,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementwiseOp {
  Sum,
  Prod,
  Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
  Sum,
  Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOp {
  Relu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
  Neg,
}

/// One primitive node of the target graph.
#[derive(Debug, Clone)]
pub enum Layer {
  Input { name: String, dtype: Dtype },
  Constant { values: Rc<Values> },
  /// Strided window per leading dimension; trailing dimensions without a
  /// (start, size, stride) triple pass through whole.
  Slice {
    starts: Vec<i64>,
    sizes: Vec<i64>,
    strides: Vec<i64>,
  },
  Gather { axis: usize },
  Reshape { dims: Vec<i64> },
  Elementwise(ElementwiseOp),
  Reduce { op: ReduceOp, axes: u32, keep_dims: bool },
  Activation(ActivationOp),
  Unary(UnaryOp),
}

/// Edge weight: which input slot of the target node this edge feeds.
#[derive(Debug, Clone, Copy)]
pub struct Flow {
  pub input_order: u8,
}

/// Reference to one node output. Shape may contain [`DYNAMIC`] entries.
/// Cheap to clone; the node itself is owned by the [`Network`].
#[derive(Debug, Clone)]
pub struct TensorRef {
  pub node: NodeIndex,
  pub shape: Vec<i64>,
  pub dtype: Dtype,
}

impl TensorRef {
  pub fn rank(&self) -> usize {
    self.shape.len()
  }
}

#[derive(Debug, Default)]
pub struct Network {
  pub graph: StableGraph<Layer, Flow>,
  outputs: Vec<(NodeIndex, String)>,
}

impl Network {
  pub fn new() -> Self {
    Self::default()
  }

  fn add_layer(
    &mut self,
    layer: Layer,
    inputs: &[&TensorRef],
    shape: Vec<i64>,
    dtype: Dtype,
  ) -> TensorRef {
    let node = self.graph.add_node(layer);
    for (i, input) in inputs.iter().enumerate() {
      self.graph.add_edge(
        input.node,
        node,
        Flow {
          input_order: i as u8,
        },
      );
    }
    TensorRef { node, shape, dtype }
  }

  pub fn add_input(&mut self, name: &str, shape: Vec<i64>, dtype: Dtype) -> TensorRef {
    self.add_layer(
      Layer::Input {
        name: name.to_string(),
        dtype,
      },
      &[],
      shape,
      dtype,
    )
  }

  pub fn add_constant(&mut self, shape: Vec<i64>, values: Rc<Values>) -> TensorRef {
    debug_assert_eq!(element_count(&shape), Some(values.len() as i64));
    let dtype = values.dtype();
    self.add_layer(Layer::Constant { values }, &[], shape, dtype)
  }

  /// Triples apply positionally from dimension 0; dimensions past the last
  /// triple are passed through untouched.
  pub fn add_slice(
    &mut self,
    input: &TensorRef,
    starts: Vec<i64>,
    sizes: Vec<i64>,
    strides: Vec<i64>,
  ) -> TensorRef {
    let mut shape = sizes.clone();
    shape.extend_from_slice(&input.shape[sizes.len().min(input.shape.len())..]);
    let dtype = input.dtype;
    self.add_layer(
      Layer::Slice {
        starts,
        sizes,
        strides,
      },
      &[input],
      shape,
      dtype,
    )
  }

  /// Output shape splices the index shape in place of the gathered axis.
  pub fn add_gather(
    &mut self,
    input: &TensorRef,
    indices: &TensorRef,
    axis: usize,
  ) -> TensorRef {
    let mut shape: Vec<i64> = input.shape[..axis].to_vec();
    shape.extend_from_slice(&indices.shape);
    shape.extend_from_slice(&input.shape[axis + 1..]);
    let dtype = input.dtype;
    self.add_layer(Layer::Gather { axis }, &[input, indices], shape, dtype)
  }

  pub fn add_reshape(&mut self, input: &TensorRef, dims: Vec<i64>) -> TensorRef {
    let shape = dims.clone();
    let dtype = input.dtype;
    self.add_layer(Layer::Reshape { dims }, &[input], shape, dtype)
  }

  pub fn add_elementwise(
    &mut self,
    a: &TensorRef,
    b: &TensorRef,
    op: ElementwiseOp,
  ) -> TensorRef {
    let shape = broadcast_shape(&a.shape, &b.shape);
    let dtype = a.dtype;
    self.add_layer(Layer::Elementwise(op), &[a, b], shape, dtype)
  }

  /// `axes` is a bitmask over input dimensions; reduced dimensions are kept
  /// as size 1 when `keep_dims` is set, dropped otherwise.
  pub fn add_reduce(
    &mut self,
    input: &TensorRef,
    op: ReduceOp,
    axes: u32,
    keep_dims: bool,
  ) -> TensorRef {
    let mut shape = vec![];
    for (d, dim) in input.shape.iter().enumerate() {
      if axes & (1 << d) != 0 {
        if keep_dims {
          shape.push(1);
        }
      } else {
        shape.push(*dim);
      }
    }
    let dtype = input.dtype;
    self.add_layer(
      Layer::Reduce { op, axes, keep_dims },
      &[input],
      shape,
      dtype,
    )
  }

  pub fn add_activation(&mut self, input: &TensorRef, op: ActivationOp) -> TensorRef {
    let shape = input.shape.clone();
    let dtype = input.dtype;
    self.add_layer(Layer::Activation(op), &[input], shape, dtype)
  }

  pub fn add_unary(&mut self, input: &TensorRef, op: UnaryOp) -> TensorRef {
    let shape = input.shape.clone();
    let dtype = input.dtype;
    self.add_layer(Layer::Unary(op), &[input], shape, dtype)
  }

  pub fn mark_output(&mut self, tensor: &TensorRef, name: &str) {
    self.outputs.push((tensor.node, name.to_string()));
  }

  pub fn outputs(&self) -> &[(NodeIndex, String)] {
    &self.outputs
  }

  pub fn node_count(&self) -> usize {
    self.graph.node_count()
  }
}

fn element_count(shape: &[i64]) -> Option<i64> {
  let mut n = 1;
  for dim in shape {
    if *dim == DYNAMIC {
      return None;
    }
    n *= dim;
  }
  Some(n)
}

/// Right-aligned broadcast of two shapes; DYNAMIC is absorbing.
fn broadcast_shape(a: &[i64], b: &[i64]) -> Vec<i64> {
  let rank = a.len().max(b.len());
  let mut shape = vec![0; rank];
  for i in 0..rank {
    let da = if i < rank - a.len() { 1 } else { a[i - (rank - a.len())] };
    let db = if i < rank - b.len() { 1 } else { b[i - (rank - b.len())] };
    shape[i] = if da == DYNAMIC || db == DYNAMIC {
      DYNAMIC
    } else {
      da.max(db)
    };
  }
  shape
}

pub fn save_graphviz(path: String, network: &Network) -> Result<(), Box<dyn StdError>> {
  use petgraph::dot::Dot;
  let dot = Dot::with_config(&network.graph, &[]);
  let mut file = File::create(path)?;
  write!(file, "{:?}", dot)?;
  Ok(())
}

pub fn graphml_string(network: &Network) -> Result<String, Box<dyn StdError>> {
  use petgraph_graphml::GraphMl;
  let gml = GraphMl::new(&network.graph).pretty_print(true);
  let mut buf: Vec<u8> = vec![];
  gml.to_writer(&mut buf)?;
  Ok(String::from_utf8(buf)?)
}
