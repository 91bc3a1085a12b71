use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal, Uniform};
use serde::Deserialize;

use comms::proto::Id;

use super::{RandErr, Result};

/// Spreads consecutive ids over the seed space.
const ID_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// How the values of a parameter are initialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Initializer {
    #[default]
    Zeros,
    Constant {
        value: f32,
    },
    Uniform {
        low: f32,
        high: f32,
    },
    Normal {
        mean: f32,
        std_dev: f32,
    },
    XavierUniform {
        fan_in: usize,
        fan_out: usize,
    },
    LecunUniform {
        fan_in: usize,
    },
    Kaiming {
        fan_in: usize,
    },
}

impl Initializer {
    /// Checks that a sampler can be built from this initializer.
    ///
    /// # Returns
    /// A `RandErr` if the parameters of the distribution are invalid.
    pub fn validate(&self) -> Result<()> {
        self.sampler().map(drop)
    }

    /// Builds the sampler of this initializer.
    ///
    /// # Returns
    /// A new `Sampler` or a `RandErr` if the parameters of the distribution are invalid.
    pub fn sampler(&self) -> Result<Sampler> {
        let sampler = match *self {
            Self::Zeros => Sampler::Const(0.),
            Self::Constant { value } => Sampler::Const(value),
            Self::Uniform { low, high } => Sampler::Uniform(Uniform::new(low, high)?),
            Self::Normal { mean, std_dev } => Sampler::Normal(Normal::new(mean, std_dev)?),
            Self::XavierUniform { fan_in, fan_out } => {
                let range = (6. / positive_fan(fan_in + fan_out)? as f32).sqrt();
                Sampler::Uniform(Uniform::new(-range, range)?)
            }
            Self::LecunUniform { fan_in } => {
                let range = (3. / positive_fan(fan_in)? as f32).sqrt();
                Sampler::Uniform(Uniform::new(-range, range)?)
            }
            Self::Kaiming { fan_in } => {
                let std_dev = (2. / positive_fan(fan_in)? as f32).sqrt();
                Sampler::Normal(Normal::new(0., std_dev)?)
            }
        };

        Ok(sampler)
    }
}

fn positive_fan(fan: usize) -> Result<usize> {
    if fan == 0 {
        return Err(RandErr::new("the fan of a layer must be positive"));
    }

    Ok(fan)
}

/// A validated, ready to sample `Initializer`.
#[derive(Debug, Clone)]
pub enum Sampler {
    Const(f32),
    Uniform(Uniform<f32>),
    Normal(Normal<f32>),
}

impl Sampler {
    /// Fills `out` with samples drawn from `rng`.
    pub fn fill<R: Rng + ?Sized>(&self, rng: &mut R, out: &mut [f32]) {
        match self {
            Sampler::Const(value) => out.fill(*value),
            Sampler::Uniform(dist) => out.iter_mut().for_each(|x| *x = dist.sample(rng)),
            Sampler::Normal(dist) => out.iter_mut().for_each(|x| *x = dist.sample(rng)),
        }
    }

    /// Fills the sparse row `id` of a table.
    ///
    /// The generator is seeded by `seed` and `id` only, so the initial value of a row
    /// doesn't depend on which connection happened to create it.
    ///
    /// # Arguments
    /// * `seed` - The seed of the table.
    /// * `id` - The id of the row.
    /// * `out` - The row to fill.
    pub fn fill_row(&self, seed: u64, id: Id, out: &mut [f32]) {
        if let Sampler::Const(value) = self {
            out.fill(*value);
            return;
        }

        let mut rng = StdRng::seed_from_u64(seed ^ id.wrapping_mul(ID_MIX));
        self.fill(&mut rng, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_zeros() {
        let mut out = [1.; 4];
        Initializer::default()
            .sampler()
            .unwrap()
            .fill(&mut rand::rng(), &mut out);

        assert_eq!(out, [0.; 4]);
    }

    #[test]
    fn invalid_parameters_fail_fast() {
        assert!(Initializer::Uniform { low: 1., high: 1. }.validate().is_err());
        assert!(Initializer::Normal { mean: 0., std_dev: -1. }.validate().is_err());
        assert!(Initializer::Kaiming { fan_in: 0 }.validate().is_err());
        assert!(Initializer::XavierUniform { fan_in: 0, fan_out: 0 }.validate().is_err());
        assert!(Initializer::LecunUniform { fan_in: 3 }.validate().is_ok());
    }

    #[test]
    fn rows_only_depend_on_seed_and_id() {
        let sampler = Initializer::Normal { mean: 0., std_dev: 1. }.sampler().unwrap();

        let mut a = [0.; 8];
        let mut b = [0.; 8];
        let mut c = [0.; 8];
        sampler.fill_row(7, 42, &mut a);
        sampler.fill_row(7, 42, &mut b);
        sampler.fill_row(7, 43, &mut c);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn uniform_stays_in_range() {
        let sampler = Initializer::XavierUniform { fan_in: 4, fan_out: 2 }.sampler().unwrap();
        let range = 1f32;

        let mut out = [0.; 256];
        sampler.fill(&mut StdRng::seed_from_u64(1), &mut out);
        assert!(out.iter().all(|x| (-range..range).contains(x)));
    }

    #[test]
    fn parse_tagged() {
        let init: Initializer =
            serde_json::from_str(r#"{"type": "constant", "value": 0.5}"#).unwrap();
        assert_eq!(init, Initializer::Constant { value: 0.5 });

        let init: Initializer = serde_json::from_str(r#"{"type": "kaiming", "fan_in": 8}"#).unwrap();
        assert_eq!(init, Initializer::Kaiming { fan_in: 8 });
    }
}
