mod ada_grad;
mod adam;
mod error;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;
mod registry;
mod rule;

pub use ada_grad::AdaGrad;
pub use adam::Adam;
pub use error::{OptimizerErr, Result};
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::Optimizer;
pub use registry::new_optimizer;
pub use rule::{Rule, RuleOptimizer};
