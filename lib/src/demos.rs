//! Small bundled host programs, used by the CLI and the integration tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::host::index::IndexElem;
use crate::host::{Host, Tensor};
use crate::Error;

pub type Program = fn(&mut Host, &[Tensor]) -> Result<Vec<Tensor>, Error>;

pub const DEMOS: &[(&str, Program)] = &[("mix", demo_mix), ("gather", demo_gather)];

pub fn by_name(name: &str) -> Option<Program> {
  DEMOS
    .iter()
    .find(|entry| entry.0 == name)
    .map(|entry| entry.1)
}

/// One shape-(2, 4, 3) float input with reproducible values.
pub fn demo_inputs(seed: u64) -> Vec<Tensor> {
  let mut rng = StdRng::seed_from_u64(seed);
  let data: Vec<f32> = (0..24).map(|_| rng.gen_range(-1.0..1.0)).collect();
  vec![Tensor::from_f32(vec![2, 4, 3], data)]
}

/// prelu into a channel slice into a reduction, scaled at the end. Touches
/// the composite translator, the indexing decomposition and a scalar
/// operand.
pub fn demo_mix(host: &mut Host, inputs: &[Tensor]) -> Result<Vec<Tensor>, Error> {
  let x = &inputs[0];
  let w = Tensor::from_f32(vec![4], vec![0.1, 0.2, 0.3, 0.4]);
  let h = host.prelu(x, &w)?;
  let top = host.getitem(
    &h,
    vec![IndexElem::full(), IndexElem::range(0, 2), IndexElem::full()],
  )?;
  let s = host.sum(&top, Some(&[2]), false)?;
  let y = host.mul_scalar(&s, 0.5)?;
  Ok(vec![y])
}

/// Index-tensor selection followed by a per-dim maximum.
pub fn demo_gather(host: &mut Host, inputs: &[Tensor]) -> Result<Vec<Tensor>, Error> {
  let x = &inputs[0];
  let idx = Tensor::from_i32(vec![2], vec![3, 0]);
  let picked = host.getitem(
    x,
    vec![
      IndexElem::full(),
      IndexElem::Mask(idx),
      IndexElem::full(),
    ],
  )?;
  let m = host.max_dim(&picked, 2, false)?;
  Ok(vec![m])
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{trace, TraceOptions};

  #[test]
  fn demos_trace_in_both_modes() {
    for (name, program) in DEMOS {
      for dynamic in [true, false].iter() {
        let options = TraceOptions {
          dynamic_shape: *dynamic,
          ..TraceOptions::default()
        };
        let traced = trace(*program, &demo_inputs(11), options)
          .unwrap_or_else(|e| panic!("demo {} failed: {}", name, e));
        assert!(!traced.output_names.is_empty());
      }
    }
  }

  #[test]
  fn demo_lookup() {
    assert!(by_name("mix").is_some());
    assert!(by_name("nope").is_none());
  }
}
