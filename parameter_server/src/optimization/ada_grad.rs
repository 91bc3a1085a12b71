use comms::config::StringMap;

use super::{
    Result,
    rule::{Rule, parse_checked, unknown_key},
};

/// Per parameter learning rates scaled by the accumulated squared gradient.
#[derive(Debug, Clone)]
pub struct AdaGrad {
    alpha: f32,
    beta: f32,
}

impl Default for AdaGrad {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            beta: 1e-5,
        }
    }
}

impl Rule for AdaGrad {
    const NAME: &'static str = "adagrad";
    const SLOTS: usize = 1;

    type Schedule = ();
    type Step = ();

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "alpha" => self.alpha = parse_checked(key, value, |v: &f32| *v > 0. && v.is_finite())?,
            "beta" => self.beta = parse_checked(key, value, |v: &f32| *v > 0. && v.is_finite())?,
            _ => return Err(unknown_key::<Self>(key)),
        }

        Ok(())
    }

    fn config(&self) -> StringMap {
        StringMap::from([
            ("alpha".to_string(), self.alpha.to_string()),
            ("beta".to_string(), self.beta.to_string()),
        ])
    }

    fn schedule(&self) {}

    fn begin(&self, _: &mut ()) {}

    fn apply(&self, _: &(), grad: &[f32], w: &mut [f32], n: &mut [f32]) {
        let Self { alpha, beta } = *self;

        w.iter_mut().zip(grad).zip(n.iter_mut()).for_each(|((w, g), n)| {
            *n += g * g;
            *w -= g / (*n + beta).sqrt() * alpha;
        });
    }
}
