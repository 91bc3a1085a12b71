use super::{
    AdaGrad, Adam, GradientDescent, GradientDescentWithMomentum, Optimizer, OptimizerErr, Result,
    RuleOptimizer,
};

/// Builds an optimizer out of its registered name.
///
/// # Arguments
/// * `name` - Either the short name, like `adam`, or the long one, like `AdamOptimizer`.
///
/// # Returns
/// A fresh optimizer with default hyperparameters or `OptimizerErr::UnknownOptimizer`.
pub fn new_optimizer(name: &str) -> Result<Box<dyn Optimizer>> {
    let optimizer: Box<dyn Optimizer> = match name {
        "sgd" | "SGDOptimizer" => Box::new(RuleOptimizer::<GradientDescent>::default()),
        "momentum" | "MomentumOptimizer" => {
            Box::new(RuleOptimizer::<GradientDescentWithMomentum>::default())
        }
        "adagrad" | "ada_grad" | "AdaGradOptimizer" => Box::new(RuleOptimizer::<AdaGrad>::default()),
        "adam" | "AdamOptimizer" => Box::new(RuleOptimizer::<Adam>::default()),
        _ => return Err(OptimizerErr::UnknownOptimizer(name.to_string())),
    };

    Ok(optimizer)
}
