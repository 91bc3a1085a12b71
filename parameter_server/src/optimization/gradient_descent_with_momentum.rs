use comms::config::StringMap;

use super::{
    Result,
    rule::{Rule, parse_checked, unknown_key},
};

/// Gradient descent with a velocity slot per parameter.
#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    rho: f32,
    alpha: f32,
}

impl Default for GradientDescentWithMomentum {
    fn default() -> Self {
        Self { rho: 0.5, alpha: 0.1 }
    }
}

impl Rule for GradientDescentWithMomentum {
    const NAME: &'static str = "momentum";
    const SLOTS: usize = 1;

    type Schedule = ();
    type Step = ();

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "rho" => self.rho = parse_checked(key, value, |v: &f32| *v > 0. && *v < 1.)?,
            "alpha" => self.alpha = parse_checked(key, value, |v: &f32| *v > 0. && v.is_finite())?,
            _ => return Err(unknown_key::<Self>(key)),
        }

        Ok(())
    }

    fn config(&self) -> StringMap {
        StringMap::from([
            ("rho".to_string(), self.rho.to_string()),
            ("alpha".to_string(), self.alpha.to_string()),
        ])
    }

    fn schedule(&self) {}

    fn begin(&self, _: &mut ()) {}

    fn apply(&self, _: &(), grad: &[f32], w: &mut [f32], velocity: &mut [f32]) {
        let Self { rho, alpha } = *self;

        w.iter_mut()
            .zip(grad)
            .zip(velocity.iter_mut())
            .for_each(|((w, g), v)| {
                *v = (rho * *v) + g;
                *w -= alpha * *v;
            });
    }
}
