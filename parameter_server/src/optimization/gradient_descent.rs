use std::io;

use comms::{ByteReader, Deserialize, Serialize, config::StringMap};

use super::{
    Result,
    rule::{Rule, parse_checked, unknown_key},
};

/// Plain stochastic gradient descent with a stepwise decaying learning rate.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    alpha: f32,
    min_alpha: f32,
    batch_decay: u32,
    batch_decay_rate: f32,
}

impl Default for GradientDescent {
    fn default() -> Self {
        Self {
            alpha: 0.01,
            min_alpha: 1e-6,
            batch_decay: 128,
            batch_decay_rate: 0.95,
        }
    }
}

/// The decayed learning rate and the amount of updates seen so far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decay {
    real_batch: u32,
    real_alpha: f32,
}

impl Serialize for Decay {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.real_batch.serialize(buf);
        self.real_alpha.serialize(buf);
    }
}

impl<'a> Deserialize<'a> for Decay {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        Ok(Self {
            real_batch: reader.read()?,
            real_alpha: reader.read()?,
        })
    }
}

impl Rule for GradientDescent {
    const NAME: &'static str = "sgd";
    const SLOTS: usize = 0;

    type Schedule = Decay;
    type Step = f32;

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "alpha" => self.alpha = parse_checked(key, value, |v: &f32| *v > 0. && v.is_finite())?,
            "min_alpha" => self.min_alpha = parse_checked(key, value, |v: &f32| *v >= 0. && v.is_finite())?,
            "batch_decay" => self.batch_decay = parse_checked(key, value, |_: &u32| true)?,
            "batch_decay_rate" => {
                self.batch_decay_rate = parse_checked(key, value, |v: &f32| *v > 0. && *v <= 1.)?
            }
            _ => return Err(unknown_key::<Self>(key)),
        }

        Ok(())
    }

    fn config(&self) -> StringMap {
        StringMap::from([
            ("alpha".to_string(), self.alpha.to_string()),
            ("min_alpha".to_string(), self.min_alpha.to_string()),
            ("batch_decay".to_string(), self.batch_decay.to_string()),
            ("batch_decay_rate".to_string(), self.batch_decay_rate.to_string()),
        ])
    }

    fn schedule(&self) -> Decay {
        Decay {
            real_batch: 0,
            real_alpha: self.alpha,
        }
    }

    /// Returns the current learning rate, it decays every `batch_decay` updates
    /// without going under `min_alpha`.
    fn begin(&self, decay: &mut Decay) -> f32 {
        let alpha = decay.real_alpha;
        decay.real_batch = decay.real_batch.wrapping_add(1);

        if self.batch_decay > 0 && decay.real_batch % self.batch_decay == 0 {
            decay.real_alpha = (decay.real_alpha * self.batch_decay_rate).max(self.min_alpha);
        }

        alpha
    }

    fn apply(&self, &alpha: &f32, grad: &[f32], w: &mut [f32], _: &mut [f32]) {
        for (w, g) in w.iter_mut().zip(grad) {
            *w -= alpha * g;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimization::OptimizerErr;

    #[test]
    fn alpha_decays_stepwise() {
        let mut sgd = GradientDescent::default();
        sgd.set("alpha", "1").unwrap();
        sgd.set("batch_decay", "2").unwrap();
        sgd.set("batch_decay_rate", "0.5").unwrap();
        sgd.set("min_alpha", "0.3").unwrap();

        let mut decay = sgd.schedule();
        let alphas: Vec<f32> = (0..6).map(|_| sgd.begin(&mut decay)).collect();
        assert_eq!(alphas, [1., 1., 0.5, 0.5, 0.3, 0.3]);
    }

    #[test]
    fn zero_batch_decay_keeps_alpha() {
        let mut sgd = GradientDescent::default();
        sgd.set("batch_decay", "0").unwrap();

        let mut decay = sgd.schedule();
        for _ in 0..1000 {
            assert_eq!(sgd.begin(&mut decay), 0.01);
        }
    }

    #[test]
    fn rejects_bad_config() {
        let mut sgd = GradientDescent::default();
        assert!(matches!(sgd.set("alpha", "-1"), Err(OptimizerErr::InvalidValue { .. })));
        assert!(matches!(sgd.set("batch_decay_rate", "1.5"), Err(OptimizerErr::InvalidValue { .. })));
        assert!(matches!(sgd.set("rho", "0.5"), Err(OptimizerErr::UnknownKey { .. })));
    }

    #[test]
    fn apply_steps_against_the_gradient() {
        let sgd = GradientDescent::default();
        let mut w = [1., 1.];
        sgd.apply(&0.5, &[2., -2.], &mut w, &mut []);
        assert_eq!(w, [0., 2.]);
    }
}
