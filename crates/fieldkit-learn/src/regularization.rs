/// L1/L2 penalty weights on the flat weight vector `w`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Regularization {
    pub l1: f64,
    pub l2: f64,
}

impl Regularization {
    pub fn new(l1: f64, l2: f64) -> Self {
        Self { l1, l2 }
    }

    pub fn none() -> Self {
        Self { l1: 0.0, l2: 0.0 }
    }

    pub fn penalty(&self, w: &[f64]) -> f64 {
        let l1: f64 = w.iter().map(|x| x.abs()).sum::<f64>() * self.l1;
        let l2: f64 = w.iter().map(|x| x * x).sum::<f64>() * 0.5 * self.l2;
        l1 + l2
    }

    /// Subgradient of the penalty: `sign(w)` scaled by `l1`, plus `l2 * w`.
    /// Uses `sign(0) = 0`, a valid subgradient choice at the kink.
    pub fn subgradient(&self, w: &[f64]) -> Vec<f64> {
        w.iter()
            .map(|&x| {
                let sign = if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                };
                self.l1 * sign + self.l2 * x
            })
            .collect()
    }
}

impl Default for Regularization {
    fn default() -> Self {
        Self::none()
    }
}
