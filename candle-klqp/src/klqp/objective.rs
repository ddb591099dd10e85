use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};

/// Loss and gradients handed to an external optimizer.
///
/// Both are built from the same Monte Carlo batch.
pub struct Objective {
    /// Scalar loss: negative ELBO, or its equivalent under the estimator
    pub loss: Tensor,
    /// (gradient, parameter) pairs
    pub grads_and_vars: Vec<(Tensor, Var)>,
}

impl Objective {
    pub fn new(loss: Tensor, grads_and_vars: Vec<(Tensor, Var)>) -> Self {
        Self {
            loss,
            grads_and_vars,
        }
    }

    /// Loss as a host scalar
    pub fn loss_value(&self) -> Result<f32> {
        self.loss.to_dtype(DType::F32)?.to_scalar::<f32>()
    }

    /// Gradient paired with `var`, if any
    pub fn gradient(&self, var: &Var) -> Option<&Tensor> {
        let id = var.as_tensor().id();
        self.grads_and_vars
            .iter()
            .find(|(_, v)| v.as_tensor().id() == id)
            .map(|(g, _)| g)
    }

    /// Pack the gradients into a `GradStore` for `candle_nn::Optimizer::step`
    pub fn to_grad_store(&self) -> Result<GradStore> {
        // a constant has no graph, so its store holds nothing but itself
        let mut store = self.loss.zeros_like()?.backward()?;
        for (grad, var) in self.grads_and_vars.iter() {
            store.insert(var.as_tensor(), grad.clone());
        }
        Ok(store)
    }
}

/// Differentiate the scalar `expr` with respect to each of `var_list`.
///
/// Parameters `expr` does not depend on get a zero gradient.
pub fn gradients(expr: &Tensor, var_list: &[Var]) -> Result<Vec<(Tensor, Var)>> {
    let store = expr.backward()?;
    var_list
        .iter()
        .map(|var| {
            let grad = match store.get(var.as_tensor()) {
                Some(g) => g.clone(),
                None => var.as_tensor().zeros_like()?,
            };
            Ok((grad, var.clone()))
        })
        .collect()
}
