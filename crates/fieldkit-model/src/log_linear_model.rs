use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use fieldkit_error::{FieldResult, field_err};
use fieldkit_utils::Tensor;

use crate::markov_net::MarkovNet;

/// Dimensions of the flat weight vector `w = concat(vec(W), vec(W_e))`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WeightLayout {
    pub d_u: usize,
    pub d_e: usize,
    pub k: usize,
}

impl WeightLayout {
    #[inline]
    pub fn unary_len(&self) -> usize {
        self.d_u * self.k
    }

    #[inline]
    pub fn edge_len(&self) -> usize {
        self.d_e * self.k * self.k
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.unary_len() + self.edge_len()
    }
}

/// A pairwise MRF whose unary and edge potentials are linear in a shared
/// feature/weight decomposition, `φ_v = Wᵀf_v` and `ψ_{uv} = reshape(W_eᵀf_{uv})`.
///
/// Composes over [`MarkovNet`] (via `Deref`/`DerefMut`) rather than
/// wrapping it opaquely, so graph-structure operations (`declare_variable`,
/// `set_edge_factor`, `create_matrices`, ...) are still available directly.
/// Two coexisting ways to populate factors are supported, matching
/// reference fixtures that mix them freely: per-variable weight matrices
/// set via [`set_unary_weights`](Self::set_unary_weights), and a single
/// tied weight vector set via [`set_weights`](Self::set_weights) that
/// applies the same `W`/`W_e` to every declared variable/edge that has a
/// feature vector.
pub struct LogLinearModel {
    net: MarkovNet,
    unary_features: BTreeMap<usize, Vec<f64>>,
    edge_features: BTreeMap<(usize, usize), Vec<f64>>,
    /// Per-variable weight matrices, shape `(d_u, k_v)`, for the legacy
    /// per-factor path.
    unary_weights: BTreeMap<usize, Tensor<f64>>,
    d_u: Option<usize>,
    d_e: Option<usize>,
    /// Tied weight matrix, shape `(d_u, K)`, set by `set_weights`.
    w_u: Option<Tensor<f64>>,
    /// Tied weight matrix, shape `(d_e, K*K)`, set by `set_weights`.
    w_e: Option<Tensor<f64>>,
}

fn canonical(u: usize, v: usize) -> (usize, usize) {
    if u < v { (u, v) } else { (v, u) }
}

impl LogLinearModel {
    pub fn new() -> Self {
        Self {
            net: MarkovNet::new(),
            unary_features: BTreeMap::new(),
            edge_features: BTreeMap::new(),
            unary_weights: BTreeMap::new(),
            d_u: None,
            d_e: None,
            w_u: None,
            w_e: None,
        }
    }

    pub fn net(&self) -> &MarkovNet {
        &self.net
    }

    pub fn net_mut(&mut self) -> &mut MarkovNet {
        &mut self.net
    }

    pub fn set_unary_features(&mut self, v: usize, f: Vec<f64>) -> FieldResult<()> {
        self.net.cardinality(v)?;
        match self.d_u {
            Some(d) => fieldkit_error::ensure!(
                f.len() == d,
                InvalidConfig: "unary feature vector for variable {} has length {}, expected {}", v, f.len(), d
            ),
            None => self.d_u = Some(f.len()),
        }
        self.unary_features.insert(v, f);
        Ok(())
    }

    pub fn set_edge_features(&mut self, edge: (usize, usize), f: Vec<f64>) -> FieldResult<()> {
        let key = canonical(edge.0, edge.1);
        match self.d_e {
            Some(d) => fieldkit_error::ensure!(
                f.len() == d,
                InvalidConfig: "edge feature vector for ({}, {}) has length {}, expected {}", key.0, key.1, f.len(), d
            ),
            None => self.d_e = Some(f.len()),
        }
        self.edge_features.insert(key, f);
        Ok(())
    }

    pub fn unary_features(&self, v: usize) -> Option<&Vec<f64>> {
        self.unary_features.get(&v)
    }

    pub fn edge_features(&self, edge: (usize, usize)) -> Option<&Vec<f64>> {
        self.edge_features.get(&canonical(edge.0, edge.1))
    }

    /// Legacy per-factor path: stores `W_v` (shape `d_u x k_v`) and
    /// immediately computes `φ_v = f_vᵀW_v` if a feature vector is already
    /// present, so a model exercised one variable at a time stays in sync.
    pub fn set_unary_weights(&mut self, v: usize, w_v: Tensor<f64>) -> FieldResult<()> {
        let k = self.net.cardinality(v)?;
        let d_u = self
            .d_u
            .ok_or_else(|| field_err!(InvalidConfig: "unary feature dimension is unknown; call set_unary_features first"))?;
        fieldkit_error::ensure!(
            w_v.dims() == [d_u, k],
            InvalidConfig: "unary weight matrix for variable {} has shape {:?}, expected [{}, {}]", v, w_v.dims(), d_u, k
        );
        self.unary_weights.insert(v, w_v);
        if self.unary_features.contains_key(&v) {
            self.refresh_unary_factor(v)?;
        }
        Ok(())
    }

    fn refresh_unary_factor(&mut self, v: usize) -> FieldResult<()> {
        let k = self.net.cardinality(v)?;
        let f = self
            .unary_features
            .get(&v)
            .ok_or_else(|| field_err!(InvalidConfig: "no feature vector recorded for variable {}", v))?;
        let w_v = self
            .unary_weights
            .get(&v)
            .ok_or_else(|| field_err!(InvalidConfig: "no weight matrix recorded for variable {}", v))?;
        let d_u = f.len();
        let mut phi = vec![0.0; k];
        for s in 0..k {
            let mut acc = 0.0;
            for j in 0..d_u {
                acc += f[j] * w_v[[j, s]];
            }
            phi[s] = acc;
        }
        self.net.set_unary_factor(v, phi)
    }

    /// Recomputes every unary factor that has both a feature vector and a
    /// weight matrix on record. Safe to call repeatedly.
    pub fn set_all_unary_factors(&mut self) -> FieldResult<()> {
        let vars: Vec<usize> = self
            .unary_weights
            .keys()
            .filter(|v| self.unary_features.contains_key(v))
            .copied()
            .collect();
        for v in vars {
            self.refresh_unary_factor(v)?;
        }
        Ok(())
    }

    pub fn weight_layout(&self) -> FieldResult<WeightLayout> {
        let d_u = self
            .d_u
            .ok_or_else(|| field_err!(InvalidConfig: "unary feature dimension is unknown"))?;
        let d_e = self
            .d_e
            .ok_or_else(|| field_err!(InvalidConfig: "edge feature dimension is unknown"))?;
        let k = self.net.max_cardinality();
        fieldkit_error::ensure!(k > 0, InvalidConfig: "model has no declared variables");
        Ok(WeightLayout { d_u, d_e, k })
    }

    /// Decomposes `w` into tied `W`/`W_e` matrices and refreshes every
    /// declared variable's and edge's log-potential from them, via
    /// `update_unary_matrix`/`update_edge_tensor`, then rebuilds `U`/`Φ`.
    pub fn set_weights(&mut self, w: &[f64]) -> FieldResult<()> {
        let layout = self.weight_layout()?;
        fieldkit_error::ensure!(
            w.len() == layout.total_len(),
            InvalidConfig: "weight vector has length {}, expected {}", w.len(), layout.total_len()
        );

        let (unary_part, edge_part) = w.split_at(layout.unary_len());
        self.w_u = Some(Tensor::new(unary_part.to_vec(), (layout.d_u, layout.k)));
        self.w_e = Some(Tensor::new(
            edge_part.to_vec(),
            (layout.d_e, layout.k * layout.k),
        ));

        self.update_unary_matrix()?;
        self.update_edge_tensor()?;
        self.net.create_matrices()
    }

    /// `φ_v = Wᵀf_v` for every declared variable with a feature vector on
    /// record, using the tied weight matrix from the last `set_weights`.
    pub fn update_unary_matrix(&mut self) -> FieldResult<()> {
        let w_u = self
            .w_u
            .as_ref()
            .ok_or_else(|| field_err!(InvalidConfig: "set_weights has not been called"))?
            .clone();
        let d_u = w_u.dims()[0];
        let vars: Vec<usize> = self.net.variables().collect();
        for v in vars {
            let k = self.net.cardinality(v)?;
            let f = self
                .unary_features
                .get(&v)
                .ok_or_else(|| field_err!(InvalidConfig: "no unary feature vector recorded for variable {}", v))?;
            fieldkit_error::ensure!(
                f.len() == d_u,
                InvalidConfig: "unary feature vector for variable {} has length {}, expected {}", v, f.len(), d_u
            );
            let mut phi = vec![0.0; k];
            for s in 0..k {
                let mut acc = 0.0;
                for j in 0..d_u {
                    acc += f[j] * w_u[[j, s]];
                }
                phi[s] = acc;
            }
            self.net.set_unary_factor(v, phi)?;
        }
        Ok(())
    }

    /// `ψ_{uv} = reshape(W_eᵀf_{uv}, (K, K))` for every declared edge with
    /// a feature vector on record.
    pub fn update_edge_tensor(&mut self) -> FieldResult<()> {
        let w_e = self
            .w_e
            .as_ref()
            .ok_or_else(|| field_err!(InvalidConfig: "set_weights has not been called"))?
            .clone();
        let d_e = w_e.dims()[0];
        let k = self.net.max_cardinality();
        let edges: Vec<(usize, usize)> = self.net.edges().collect();
        for (u, v) in edges {
            let ku = self.net.cardinality(u)?;
            let kv = self.net.cardinality(v)?;
            let f = self
                .edge_features
                .get(&(u, v))
                .ok_or_else(|| field_err!(InvalidConfig: "no edge feature vector recorded for ({}, {})", u, v))?;
            fieldkit_error::ensure!(
                f.len() == d_e,
                InvalidConfig: "edge feature vector for ({}, {}) has length {}, expected {}", u, v, f.len(), d_e
            );
            let mut psi = Tensor::zeros((ku, kv));
            for a in 0..ku {
                for b in 0..kv {
                    let mut acc = 0.0;
                    for j in 0..d_e {
                        acc += f[j] * w_e[[j, a * k + b]];
                    }
                    psi[[a, b]] = acc;
                }
            }
            self.net.set_edge_factor((u, v), psi)?;
        }
        Ok(())
    }

    /// Inverse of `set_weights`: populate the dictionary factor view from
    /// the current `U`/`Φ`. Delegates to the underlying net; provided here
    /// too so callers holding only a `LogLinearModel` don't need to reach
    /// through `net_mut`.
    pub fn load_factors_from_matrices(&mut self) -> FieldResult<()> {
        self.net.load_factors_from_matrices()
    }
}

impl Default for LogLinearModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for LogLinearModel {
    type Target = MarkovNet;

    fn deref(&self) -> &Self::Target {
        &self.net
    }
}

impl DerefMut for LogLinearModel {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.net
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_path_computes_unary_factor_from_features_and_weights() {
        let mut model = LogLinearModel::new();
        model.declare_variable(0, 2).unwrap();
        model.set_unary_features(0, vec![1.0, 2.0]).unwrap();
        // W_0: d_u=2, k=2 -> phi = f^T W = [1*1+2*3, 1*2+2*4] = [7, 10]
        model
            .set_unary_weights(0, Tensor::new(vec![1.0, 2.0, 3.0, 4.0], (2, 2)))
            .unwrap();
        let phi = model.net().evaluate_state(
            &[(0, 1)].into_iter().collect::<std::collections::BTreeMap<_, _>>(),
        );
        assert!((phi.unwrap() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn tied_weights_populate_every_declared_factor() {
        let mut model = LogLinearModel::new();
        model.declare_variable(0, 2).unwrap();
        model.declare_variable(1, 2).unwrap();
        model.set_edge_factor((0, 1), Tensor::zeros((2, 2))).unwrap();

        model.set_unary_features(0, vec![1.0, 0.0]).unwrap();
        model.set_unary_features(1, vec![0.0, 1.0]).unwrap();
        model.set_edge_features((0, 1), vec![1.0]).unwrap();

        let layout = model.weight_layout().unwrap();
        assert_eq!(layout.d_u, 2);
        assert_eq!(layout.d_e, 1);
        assert_eq!(layout.k, 2);

        let w = vec![0.0; layout.total_len()];
        model.set_weights(&w).unwrap();
        let mv = model.net().matrices().unwrap();
        assert_eq!(mv.num_vars(), 2);
        assert_eq!(mv.num_edges(), 1);
    }

    #[test]
    fn set_weights_rejects_wrong_length() {
        let mut model = LogLinearModel::new();
        model.declare_variable(0, 2).unwrap();
        model.set_unary_features(0, vec![1.0]).unwrap();
        model.d_e = Some(1);
        assert!(model.set_weights(&[0.0]).is_err());
    }
}
