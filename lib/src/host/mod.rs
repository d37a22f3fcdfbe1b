//! Host side of the recorder: concrete tensors, and the single dispatch
//! funnel every interceptable operation goes through. With no hooks
//! installed the funnel is a plain call into the eager kernel; with hooks it
//! drives the gate/translate protocol around that same kernel.
pub mod eval;
pub mod index;

use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use itertools::Itertools;
use tracing::{debug, warn};

use crate::network::{Dtype, Values};
use crate::trace::{ArgValue, TraceHooks};
use crate::Error;

use index::IndexElem;

/// Identity of a host tensor while tracing. Fresh per tensor object, never
/// reused; recorded bindings key on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorId(u64);

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

impl TensorId {
  fn fresh() -> TensorId {
    TensorId(NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed))
  }
}

/// Concrete host tensor. Cloning shares both the identity and the element
/// storage; [`Tensor::fork`] makes a copy with a fresh identity.
#[derive(Debug, Clone)]
pub struct Tensor {
  id: TensorId,
  shape: Vec<usize>,
  values: Rc<Values>,
}

impl Tensor {
  pub fn new(shape: Vec<usize>, values: Values) -> Tensor {
    debug_assert_eq!(shape.iter().product::<usize>(), values.len());
    Tensor {
      id: TensorId::fresh(),
      shape,
      values: Rc::new(values),
    }
  }

  pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Tensor {
    Tensor::new(shape, Values::F32(data))
  }

  pub fn from_i32(shape: Vec<usize>, data: Vec<i32>) -> Tensor {
    Tensor::new(shape, Values::I32(data))
  }

  pub fn id(&self) -> TensorId {
    self.id
  }

  pub fn shape(&self) -> &[usize] {
    &self.shape
  }

  pub fn rank(&self) -> usize {
    self.shape.len()
  }

  pub fn len(&self) -> usize {
    self.values.len()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }

  pub fn dtype(&self) -> Dtype {
    self.values.dtype()
  }

  pub fn values(&self) -> &Values {
    &self.values
  }

  pub(crate) fn values_rc(&self) -> Rc<Values> {
    self.values.clone()
  }

  /// Same storage, fresh identity.
  pub fn fork(&self) -> Tensor {
    Tensor {
      id: TensorId::fresh(),
      shape: self.shape.clone(),
      values: self.values.clone(),
    }
  }

  /// Same storage viewed under a different shape; element count must agree.
  pub(crate) fn reshaped(&self, shape: Vec<usize>) -> Tensor {
    debug_assert_eq!(
      shape.iter().product::<usize>(),
      self.values.len()
    );
    Tensor {
      id: TensorId::fresh(),
      shape,
      values: self.values.clone(),
    }
  }

  /// First entry along the leading (batch) dimension, batch kept as size 1.
  pub(crate) fn batch_head(&self) -> Result<Tensor, Error> {
    if self.shape.is_empty() {
      return Err(Error::UnresolvedOperand {
        what: "fixed-batch tracing needs a leading batch dimension".to_string(),
      });
    }
    let per: usize = self.shape[1..].iter().product();
    let mut shape = self.shape.clone();
    shape[0] = 1;
    let values = match self.values.as_ref() {
      Values::F32(v) => Values::F32(v[..per].to_vec()),
      Values::I32(v) => Values::I32(v[..per].to_vec()),
      Values::Bool(v) => Values::Bool(v[..per].to_vec()),
    };
    Ok(Tensor::new(shape, values))
  }
}

type EagerFn = fn(&mut Host, &[ArgValue], &[(&'static str, ArgValue)]) -> Result<Tensor, Error>;

/// Keys under which operations dispatch and translators register.
pub mod keys {
  pub const ADD: &str = "tensor.add";
  pub const MUL: &str = "tensor.mul";
  pub const MAX: &str = "tensor.max";
  pub const SUM: &str = "tensor.sum";
  pub const NEG: &str = "tensor.neg";
  pub const GETITEM: &str = "tensor.getitem";
  pub const DETACH: &str = "tensor.detach";
  pub const RELU: &str = "nn.relu";
  pub const PRELU: &str = "nn.prelu";

  pub const ALL: &[&str] = &[ADD, MUL, MAX, SUM, NEG, GETITEM, DETACH, RELU, PRELU];
}

/// Executes tensor operations eagerly; while hooks are installed, also feeds
/// each top-level operation to the recorder.
#[derive(Default)]
pub struct Host {
  hooks: Option<TraceHooks>,
}

impl Host {
  pub fn new() -> Host {
    Host::default()
  }

  /// Installs recording hooks. Registry keys no operation dispatches under
  /// are flagged here rather than silently never firing.
  pub fn install(&mut self, hooks: TraceHooks) {
    let unknown = hooks
      .registry
      .keys()
      .filter(|key| !keys::ALL.contains(key))
      .sorted()
      .join(", ");
    if !unknown.is_empty() {
      warn!(
        keys = unknown.as_str(),
        "translators registered for keys no operation dispatches"
      );
    }
    self.hooks = Some(hooks);
  }

  pub fn uninstall(&mut self) -> Option<TraceHooks> {
    self.hooks.take()
  }

  pub fn is_tracing(&self) -> bool {
    self.hooks.is_some()
  }

  fn dispatch(
    &mut self,
    key: &'static str,
    args: Vec<ArgValue>,
    kwargs: Vec<(&'static str, ArgValue)>,
    eager: EagerFn,
  ) -> Result<Tensor, Error> {
    let hooks = match &self.hooks {
      Some(h) => h.clone(),
      None => return eager(self, &args, &kwargs),
    };
    let registration = hooks.registry.get(key).copied();
    let (skip, acquired) = match &registration {
      None => {
        debug!(key, "no translator registered, passing through untraced");
        (true, false)
      }
      Some(reg) => hooks.ctx.borrow_mut().gate_enter(reg.is_real),
    };

    let output = match eager(self, &args, &kwargs) {
      Ok(output) => output,
      Err(e) => {
        if acquired {
          hooks.ctx.borrow_mut().gate_release();
        }
        return Err(e);
      }
    };
    if skip {
      return Ok(output);
    }

    let reg = match registration {
      Some(reg) => reg,
      None => return Ok(output),
    };
    let mut ctx = hooks.ctx.borrow_mut();
    ctx.begin_call(key, args, kwargs, output.clone());
    let converted = (reg.convert)(&mut ctx);
    let record = ctx.end_call();
    if acquired {
      ctx.gate_release();
    }
    drop(ctx);
    if let Err(source) = converted {
      let arg_shapes = record.map(|r| r.arg_shapes()).unwrap_or_default();
      return Err(Error::Conversion {
        key,
        arg_shapes,
        source: Box::new(source),
      });
    }
    Ok(output)
  }

  pub fn add(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::ADD,
      vec![ArgValue::Tensor(a.clone()), ArgValue::Tensor(b.clone())],
      vec![],
      eval::add,
    )
  }

  pub fn add_scalar(&mut self, a: &Tensor, b: f64) -> Result<Tensor, Error> {
    self.dispatch(
      keys::ADD,
      vec![ArgValue::Tensor(a.clone()), ArgValue::Float(b)],
      vec![],
      eval::add,
    )
  }

  pub fn mul(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::MUL,
      vec![ArgValue::Tensor(a.clone()), ArgValue::Tensor(b.clone())],
      vec![],
      eval::mul,
    )
  }

  pub fn mul_scalar(&mut self, a: &Tensor, b: f64) -> Result<Tensor, Error> {
    self.dispatch(
      keys::MUL,
      vec![ArgValue::Tensor(a.clone()), ArgValue::Float(b)],
      vec![],
      eval::mul,
    )
  }

  /// Elementwise maximum of two tensors.
  pub fn max(&mut self, a: &Tensor, b: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::MAX,
      vec![ArgValue::Tensor(a.clone()), ArgValue::Tensor(b.clone())],
      vec![],
      eval::max,
    )
  }

  /// Maximum over one dimension.
  pub fn max_dim(&mut self, x: &Tensor, dim: i64, keep_dims: bool) -> Result<Tensor, Error> {
    self.dispatch(
      keys::MAX,
      vec![ArgValue::Tensor(x.clone()), ArgValue::Int(dim)],
      vec![("keepdim", ArgValue::Bool(keep_dims))],
      eval::max,
    )
  }

  /// Maximum over all dimensions.
  pub fn max_all(&mut self, x: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::MAX,
      vec![ArgValue::Tensor(x.clone())],
      vec![],
      eval::max,
    )
  }

  /// Sum over the given dimensions, or over all of them when `dims` is None.
  pub fn sum(
    &mut self,
    x: &Tensor,
    dims: Option<&[i64]>,
    keep_dims: bool,
  ) -> Result<Tensor, Error> {
    let mut kwargs = Vec::new();
    if let Some(dims) = dims {
      kwargs.push(("dim", ArgValue::Ints(dims.to_vec())));
    }
    kwargs.push(("keepdim", ArgValue::Bool(keep_dims)));
    self.dispatch(
      keys::SUM,
      vec![ArgValue::Tensor(x.clone())],
      kwargs,
      eval::sum,
    )
  }

  pub fn neg(&mut self, x: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::NEG,
      vec![ArgValue::Tensor(x.clone())],
      vec![],
      eval::neg,
    )
  }

  pub fn relu(&mut self, x: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::RELU,
      vec![ArgValue::Tensor(x.clone())],
      vec![],
      eval::relu,
    )
  }

  /// Parametric relu with a per-channel (or single) weight.
  pub fn prelu(&mut self, x: &Tensor, weight: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::PRELU,
      vec![ArgValue::Tensor(x.clone()), ArgValue::Tensor(weight.clone())],
      vec![],
      eval::prelu,
    )
  }

  pub fn getitem(&mut self, x: &Tensor, expr: Vec<IndexElem>) -> Result<Tensor, Error> {
    self.dispatch(
      keys::GETITEM,
      vec![ArgValue::Tensor(x.clone()), ArgValue::Index(expr)],
      vec![],
      eval::getitem,
    )
  }

  /// Identity on values; recorded without emitting a graph node.
  pub fn detach(&mut self, x: &Tensor) -> Result<Tensor, Error> {
    self.dispatch(
      keys::DETACH,
      vec![ArgValue::Tensor(x.clone())],
      vec![],
      eval::detach,
    )
  }
}
