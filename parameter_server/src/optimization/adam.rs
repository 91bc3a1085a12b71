use std::io;

use comms::{ByteReader, Deserialize, Serialize, config::StringMap};

use super::{
    Result,
    rule::{Rule, parse_checked, unknown_key},
};

/// Adam, with a first and a second moment slot per parameter.
#[derive(Debug, Clone)]
pub struct Adam {
    rho1: f32,
    rho2: f32,
    alpha: f32,
    beta: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            rho1: 0.9,
            rho2: 0.999,
            alpha: 0.001,
            beta: 1e-5,
        }
    }
}

/// The powers of the decay rates at the current update.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Powers {
    rho1_t: f32,
    rho2_t: f32,
}

impl Default for Powers {
    fn default() -> Self {
        Self {
            rho1_t: 1.,
            rho2_t: 1.,
        }
    }
}

impl Serialize for Powers {
    fn serialize(&self, buf: &mut Vec<u8>) {
        self.rho1_t.serialize(buf);
        self.rho2_t.serialize(buf);
    }
}

impl<'a> Deserialize<'a> for Powers {
    fn deserialize(reader: &mut ByteReader<'a>) -> io::Result<Self> {
        Ok(Self {
            rho1_t: reader.read()?,
            rho2_t: reader.read()?,
        })
    }
}

impl Rule for Adam {
    const NAME: &'static str = "adam";
    const SLOTS: usize = 2;

    type Schedule = Powers;
    type Step = f32;

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let fraction = |v: &f32| *v > 0. && *v <= 1.;
        let positive = |v: &f32| *v > 0. && v.is_finite();

        match key {
            "rho1" => self.rho1 = parse_checked(key, value, fraction)?,
            "rho2" => self.rho2 = parse_checked(key, value, fraction)?,
            "alpha" => self.alpha = parse_checked(key, value, positive)?,
            "beta" => self.beta = parse_checked(key, value, positive)?,
            _ => return Err(unknown_key::<Self>(key)),
        }

        Ok(())
    }

    fn config(&self) -> StringMap {
        StringMap::from([
            ("rho1".to_string(), self.rho1.to_string()),
            ("rho2".to_string(), self.rho2.to_string()),
            ("alpha".to_string(), self.alpha.to_string()),
            ("beta".to_string(), self.beta.to_string()),
        ])
    }

    fn schedule(&self) -> Powers {
        Powers::default()
    }

    /// Advances the powers and returns the bias corrected step size.
    fn begin(&self, powers: &mut Powers) -> f32 {
        powers.rho1_t *= self.rho1;
        powers.rho2_t *= self.rho2;

        let bc1 = 1. - powers.rho1_t;
        let bc2 = 1. - powers.rho2_t;

        if bc1 == 0. {
            return 0.;
        }

        self.alpha * (bc2.sqrt() / bc1)
    }

    fn apply(&self, &step: &f32, grad: &[f32], w: &mut [f32], aux: &mut [f32]) {
        let Self { rho1, rho2, beta, .. } = *self;
        let (m, v) = aux.split_at_mut(w.len());

        w.iter_mut()
            .zip(grad)
            .zip(m.iter_mut())
            .zip(v.iter_mut())
            .for_each(|(((w, g), m), v)| {
                *m = rho1 * *m + (1. - rho1) * g;
                *v = rho2 * *v + (1. - rho2) * g.powi(2);
                *w -= step * *m / (v.sqrt() + beta);
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_step_moves_by_alpha() {
        let adam = Adam::default();
        let mut powers = adam.schedule();
        let step = adam.begin(&mut powers);

        let mut w = [0., 0.];
        let mut aux = [0.; 4];
        adam.apply(&step, &[3., -3.], &mut w, &mut aux);

        assert!((w[0] + 0.001).abs() < 1e-5);
        assert!((w[1] - 0.001).abs() < 1e-5);
        assert_eq!(powers.rho1_t, 0.9);
    }

    #[test]
    fn rho_of_one_never_steps() {
        let mut adam = Adam::default();
        adam.set("rho1", "1").unwrap();

        let mut powers = adam.schedule();
        assert_eq!(adam.begin(&mut powers), 0.);
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut adam = Adam::default();
        assert!(adam.set("momentum", "0.9").is_err());
        assert!(adam.set("rho2", "0").is_err());
    }
}
