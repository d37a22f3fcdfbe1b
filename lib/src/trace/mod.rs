//! Recording state shared by the host funnel and the translators: the
//! reentrancy gate, the active call record with its argument bag, and the
//! shadow bindings from host tensors to graph handles.
pub mod broadcast;
pub mod registry;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::host::index::IndexElem;
use crate::host::{Tensor, TensorId};
use crate::network::{Network, TensorRef};
use crate::Error;

/// Reentrancy gate. Locked while a real translator's eager kernel runs, so
/// primitives it is composed of execute without being recorded themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
  Free,
  Locked,
}

/// One argument of an intercepted call.
#[derive(Debug, Clone)]
pub enum ArgValue {
  Tensor(Tensor),
  Int(i64),
  Float(f64),
  Bool(bool),
  Ints(Vec<i64>),
  Index(Vec<IndexElem>),
  None,
}

impl ArgValue {
  pub fn as_tensor(&self) -> Option<&Tensor> {
    match self {
      ArgValue::Tensor(t) => Some(t),
      _ => None,
    }
  }
}

/// The call a translator is currently looking at: positional and keyword
/// arguments exactly as dispatched, plus the already-computed eager output.
#[derive(Debug, Clone)]
pub struct CallRecord {
  pub key: &'static str,
  pub args: Vec<ArgValue>,
  pub kwargs: Vec<(&'static str, ArgValue)>,
  pub output: Tensor,
}

impl CallRecord {
  /// Keyword lookup first, positional fallback. An explicit
  /// [`ArgValue::None`] is reported as absent.
  pub fn arg(&self, name: &str, pos: usize) -> Option<&ArgValue> {
    let found = self
      .kwargs
      .iter()
      .find(|(n, _)| *n == name)
      .map(|(_, v)| v)
      .or_else(|| self.args.get(pos));
    match found {
      Some(ArgValue::None) | None => None,
      some => some,
    }
  }

  pub fn tensor_arg(&self, name: &str, pos: usize) -> Result<Tensor, Error> {
    match self.arg(name, pos) {
      Some(ArgValue::Tensor(t)) => Ok(t.clone()),
      other => Err(Error::UnresolvedOperand {
        what: format!(
          "argument `{}` of {} is {:?}, expected a tensor",
          name, self.key, other
        ),
      }),
    }
  }

  pub fn int_arg(&self, name: &str, pos: usize, default: i64) -> Result<i64, Error> {
    match self.arg(name, pos) {
      Some(ArgValue::Int(i)) => Ok(*i),
      None => Ok(default),
      other => Err(Error::UnresolvedOperand {
        what: format!(
          "argument `{}` of {} is {:?}, expected an integer",
          name, self.key, other
        ),
      }),
    }
  }

  pub fn ints_arg(&self, name: &str, pos: usize) -> Result<Option<Vec<i64>>, Error> {
    match self.arg(name, pos) {
      Some(ArgValue::Ints(v)) => Ok(Some(v.clone())),
      Some(ArgValue::Int(i)) => Ok(Some(vec![*i])),
      None => Ok(None),
      other => Err(Error::UnresolvedOperand {
        what: format!(
          "argument `{}` of {} is {:?}, expected integers",
          name, self.key, other
        ),
      }),
    }
  }

  pub fn bool_arg(&self, name: &str, pos: usize, default: bool) -> Result<bool, Error> {
    match self.arg(name, pos) {
      Some(ArgValue::Bool(b)) => Ok(*b),
      None => Ok(default),
      other => Err(Error::UnresolvedOperand {
        what: format!(
          "argument `{}` of {} is {:?}, expected a bool",
          name, self.key, other
        ),
      }),
    }
  }

  pub fn index_arg(&self, name: &str, pos: usize) -> Result<Vec<IndexElem>, Error> {
    match self.arg(name, pos) {
      Some(ArgValue::Index(expr)) => Ok(expr.clone()),
      other => Err(Error::UnresolvedOperand {
        what: format!(
          "argument `{}` of {} is {:?}, expected an index expression",
          name, self.key, other
        ),
      }),
    }
  }

  pub(crate) fn arg_shapes(&self) -> Vec<Vec<usize>> {
    self
      .args
      .iter()
      .filter_map(|a| a.as_tensor())
      .map(|t| t.shape().to_vec())
      .collect()
  }
}

/// State of one recording session.
pub struct TraceContext {
  pub network: Network,
  /// Dynamic-shape mode keeps the batch dimension in the graph; fixed-batch
  /// (legacy) mode strips it and shifts reduction axes accordingly.
  pub dynamic_shape: bool,
  gate: Gate,
  call: Option<CallRecord>,
  bindings: HashMap<TensorId, TensorRef>,
}

impl TraceContext {
  pub fn new(dynamic_shape: bool) -> TraceContext {
    TraceContext {
      network: Network::new(),
      dynamic_shape,
      gate: Gate::Free,
      call: None,
      bindings: HashMap::new(),
    }
  }

  pub fn gate(&self) -> Gate {
    self.gate
  }

  /// Returns (skip, acquired). A locked gate skips translation outright;
  /// otherwise a real operation takes the gate for the duration of its
  /// eager run, while a helper leaves it free.
  pub(crate) fn gate_enter(&mut self, is_real: bool) -> (bool, bool) {
    match self.gate {
      Gate::Locked => (true, false),
      Gate::Free => {
        if is_real {
          self.gate = Gate::Locked;
          (false, true)
        } else {
          (false, false)
        }
      }
    }
  }

  pub(crate) fn gate_release(&mut self) {
    self.gate = Gate::Free;
  }

  pub(crate) fn begin_call(
    &mut self,
    key: &'static str,
    args: Vec<ArgValue>,
    kwargs: Vec<(&'static str, ArgValue)>,
    output: Tensor,
  ) {
    self.call = Some(CallRecord {
      key,
      args,
      kwargs,
      output,
    });
  }

  /// Clears the active call back to the no-call sentinel.
  pub(crate) fn end_call(&mut self) -> Option<CallRecord> {
    self.call.take()
  }

  pub fn call(&self) -> Result<&CallRecord, Error> {
    self.call.as_ref().ok_or(Error::NoActiveCall)
  }

  pub fn binding(&self, tensor: &Tensor) -> Option<TensorRef> {
    self.bindings.get(&tensor.id()).cloned()
  }

  pub fn bind(&mut self, tensor: &Tensor, handle: TensorRef) {
    self.bindings.insert(tensor.id(), handle);
  }

  /// Binds the active call's eager output to a graph handle.
  pub fn bind_output(&mut self, handle: TensorRef) -> Result<(), Error> {
    let output = self.call()?.output.clone();
    self.bind(&output, handle);
    Ok(())
  }
}

/// Everything the host funnel needs while recording.
#[derive(Clone)]
pub struct TraceHooks {
  pub registry: Rc<registry::Registry>,
  pub ctx: Rc<RefCell<TraceContext>>,
}

impl TraceHooks {
  pub fn new(registry: Rc<registry::Registry>, ctx: Rc<RefCell<TraceContext>>) -> TraceHooks {
    TraceHooks { registry, ctx }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::network::Dtype;

  #[test]
  fn gate_skips_while_locked() {
    let mut ctx = TraceContext::new(true);
    assert_eq!(ctx.gate_enter(true), (false, true));
    assert_eq!(ctx.gate(), Gate::Locked);
    assert_eq!(ctx.gate_enter(true), (true, false));
    assert_eq!(ctx.gate_enter(false), (true, false));
    ctx.gate_release();
    assert_eq!(ctx.gate(), Gate::Free);
  }

  #[test]
  fn helper_leaves_gate_free() {
    let mut ctx = TraceContext::new(true);
    assert_eq!(ctx.gate_enter(false), (false, false));
    assert_eq!(ctx.gate(), Gate::Free);
    assert_eq!(ctx.gate_enter(true), (false, true));
  }

  #[test]
  fn call_record_prefers_keywords() {
    let out = Tensor::from_f32(vec![1], vec![0.0]);
    let record = CallRecord {
      key: "tensor.sum",
      args: vec![ArgValue::Tensor(out.clone()), ArgValue::Int(0)],
      kwargs: vec![("dim", ArgValue::Int(2))],
      output: out,
    };
    assert_eq!(record.int_arg("dim", 1, -1).unwrap(), 2);
    assert_eq!(record.int_arg("keepdim", 5, -1).unwrap(), -1);
    assert!(record.tensor_arg("input", 0).is_ok());
  }

  #[test]
  fn explicit_none_counts_as_absent() {
    let out = Tensor::from_f32(vec![1], vec![0.0]);
    let record = CallRecord {
      key: "tensor.sum",
      args: vec![ArgValue::Tensor(out.clone())],
      kwargs: vec![("dim", ArgValue::None)],
      output: out,
    };
    assert!(record.ints_arg("dim", 1).unwrap().is_none());
  }

  #[test]
  fn no_active_call_is_an_error() {
    let ctx = TraceContext::new(true);
    assert!(matches!(ctx.call(), Err(Error::NoActiveCall)));
  }

  #[test]
  fn bindings_key_on_identity() {
    let mut ctx = TraceContext::new(true);
    let t = Tensor::from_f32(vec![2], vec![1.0, 2.0]);
    let handle = ctx.network.add_input("x", vec![2], Dtype::Float32);
    ctx.bind(&t, handle);
    assert!(ctx.binding(&t).is_some());
    assert!(ctx.binding(&t.clone()).is_some());
    assert!(ctx.binding(&t.fork()).is_none());
  }
}
