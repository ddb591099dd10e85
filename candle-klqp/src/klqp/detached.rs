use candle_core::Tensor;

/// A tensor cut out of the computation graph.
///
/// Back-propagation treats it as a constant. Score-function estimators
/// evaluate `log q` on `Detached` samples so that gradients reach the
/// parameters of q only through the density, never through the
/// sampling path.
#[derive(Debug, Clone)]
pub struct Detached(Tensor);

impl Detached {
    pub fn new(tensor: &Tensor) -> Self {
        Self(tensor.detach())
    }

    pub fn as_tensor(&self) -> &Tensor {
        &self.0
    }

    pub fn into_inner(self) -> Tensor {
        self.0
    }
}

impl AsRef<Tensor> for Detached {
    fn as_ref(&self) -> &Tensor {
        &self.0
    }
}
