use fieldkit_error::{FieldResult, field_err};
use fieldkit_model::Topology;
use fieldkit_utils::Tensor;

use crate::counting::CountingNumbers;
use crate::math::{logsumexp, nan_to_num};
use crate::HalfEdge;

/// Lifecycle of a single `infer` call, mirroring the driver's expectations
/// about when beliefs may be read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BpState {
    Uninitialized,
    Iterating,
    Converged,
    MaxIter,
}

impl BpState {
    /// Beliefs may be extracted once inference has left `Uninitialized`.
    pub fn is_terminal(self) -> bool {
        matches!(self, BpState::Converged | BpState::MaxIter)
    }
}

/// How much the inference loop reports per iteration via `tracing`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DisplayMode {
    #[default]
    Off,
    Final,
    Iter,
    /// Additionally computes the dual objective and inconsistency every
    /// iteration — useful for diagnosing slow or oscillating convergence,
    /// expensive enough that it should not be the default.
    Full,
}

/// Outcome of one `infer` call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InferenceReport {
    pub state: BpState,
    pub iterations: usize,
    pub final_change: f64,
}

/// Counting-number-parameterized loopy belief propagation over a fixed
/// graph topology. Owns its own message, belief, and conditioning buffers;
/// takes the current unary/edge potentials (`U`, `Φ`) as explicit
/// arguments to every call that needs them rather than holding a
/// reference to the originating model, so it can outlive any particular
/// borrow of it.
pub struct BeliefPropagator {
    topology: Topology,
    counting: CountingNumbers,
    /// `K x 2m`, half-edge-major: half-edge `e`'s message occupies
    /// `messages[e*k .. (e+1)*k]`.
    messages: Tensor<f64>,
    /// `K x |V|`, variable-major.
    beliefs: Tensor<f64>,
    /// `K x K x m`, forward-edge-major. The reverse half-edge's pairwise
    /// belief is the transpose of its forward counterpart, so only the
    /// forward half is stored.
    pair_beliefs: Tensor<f64>,
    /// `K x |V|`, variable-major; `0` everywhere except observed
    /// variables, whose row is `-∞` except at the observed state.
    conditioning: Tensor<f64>,
    conditioned: Vec<bool>,
    fully_conditioned: bool,
    beliefs_computed: bool,
    state: BpState,
}

impl BeliefPropagator {
    pub fn new(topology: Topology, counting: CountingNumbers) -> Self {
        let k = topology.k;
        let n = topology.num_vars;
        let m = topology.num_edges;
        Self {
            messages: Tensor::from_elem(2 * m * k, 0.0),
            beliefs: Tensor::from_elem(n * k, 0.0),
            pair_beliefs: Tensor::from_elem(m * k * k, 0.0),
            conditioning: Tensor::from_elem(n * k, 0.0),
            conditioned: vec![false; n],
            fully_conditioned: false,
            beliefs_computed: false,
            topology,
            counting,
            state: BpState::Uninitialized,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn state(&self) -> BpState {
        self.state
    }

    pub fn is_fully_conditioned(&self) -> bool {
        self.fully_conditioned
    }

    /// Observes `x_v = state`: masks every other state of `v` to `-∞` in
    /// the conditioning buffer. Once every variable has been observed,
    /// further `compute_beliefs` calls are a no-op, per the E-step
    /// contract: beliefs are computed once and frozen.
    pub fn observe(&mut self, v: usize, state: usize) -> FieldResult<()> {
        fieldkit_error::ensure!(
            v < self.topology.num_vars,
            InvalidConfig: "variable index {} out of range (|V|={})", v, self.topology.num_vars
        );
        let k = self.topology.k;
        fieldkit_error::ensure!(
            state < k,
            InvalidConfig: "observed state {} out of range (K={})", state, k
        );
        let row = &mut self.conditioning.data_mut()[v * k..(v + 1) * k];
        for (s, val) in row.iter_mut().enumerate() {
            *val = if s == state { 0.0 } else { f64::NEG_INFINITY };
        }
        self.conditioned[v] = true;
        self.fully_conditioned = self.conditioned.iter().all(|&c| c);
        Ok(())
    }

    #[inline]
    fn incoming_sum(&self, v: usize) -> Vec<f64> {
        let k = self.topology.k;
        let mut acc = vec![0.0; k];
        for &e in &self.topology.incoming[v] {
            let msg = &self.messages.data()[e * k..(e + 1) * k];
            for s in 0..k {
                acc[s] += msg[s];
            }
        }
        acc
    }

    fn new_message(&self, e: HalfEdge, unary: &Tensor<f64>, edge_pot: &Tensor<f64>) -> Vec<f64> {
        let k = self.topology.k;
        let u = self.topology.from[e];
        let ebar = self.topology.reverse(e);
        let c_uv = self.counting.edge_count(e);

        let incoming_u = self.incoming_sum(u);
        let u_col = &unary.data()[u * k..(u + 1) * k];
        let cond = &self.conditioning.data()[u * k..(u + 1) * k];
        let rev_msg = &self.messages.data()[ebar * k..(ebar + 1) * k];

        let mut s = vec![0.0; k];
        for i in 0..k {
            s[i] = nan_to_num(u_col[i] + incoming_u[i] + cond[i] - rev_msg[i]);
        }

        let phi = &edge_pot.data()[e * k * k..(e + 1) * k * k];
        let mut raw = vec![0.0; k];
        for j in 0..k {
            let mut terms = vec![0.0; k];
            for i in 0..k {
                terms[i] = phi[i * k + j] / c_uv + s[i];
            }
            raw[j] = c_uv * logsumexp(&terms);
        }

        let norm = logsumexp(&raw);
        raw.iter().map(|&x| nan_to_num(x - norm)).collect()
    }

    /// Runs the message-passing loop to convergence or `max_iter`, then
    /// computes beliefs from the final messages.
    pub fn infer(
        &mut self,
        unary: &Tensor<f64>,
        edge_pot: &Tensor<f64>,
        tol: f64,
        max_iter: usize,
        display: DisplayMode,
    ) -> FieldResult<InferenceReport> {
        let k = self.topology.k;
        let m = self.topology.num_edges;
        self.state = BpState::Iterating;

        if self.fully_conditioned {
            self.compute_beliefs(unary, edge_pot)?;
            self.state = BpState::Converged;
            return Ok(InferenceReport {
                state: self.state,
                iterations: 0,
                final_change: 0.0,
            });
        }

        let mut change = f64::INFINITY;
        let mut iterations = 0;
        for iter in 0..max_iter {
            iterations = iter + 1;
            let mut new_messages = vec![0.0; 2 * m * k];
            for e in 0..2 * m {
                let msg = self.new_message(e, unary, edge_pot);
                new_messages[e * k..(e + 1) * k].copy_from_slice(&msg);
            }

            change = self
                .messages
                .data()
                .iter()
                .zip(new_messages.iter())
                .map(|(old, new)| (old - new).abs())
                .sum();

            self.messages = Tensor::new(new_messages, 2 * m * k);

            match display {
                DisplayMode::Iter => {
                    tracing::debug!(iteration = iterations, change, "belief propagation iteration");
                }
                DisplayMode::Full => {
                    self.compute_beliefs(unary, edge_pot)?;
                    let dual = self.dual_objective(unary, edge_pot)?;
                    let inconsistency = self.inconsistency();
                    tracing::debug!(
                        iteration = iterations,
                        change,
                        dual,
                        inconsistency,
                        "belief propagation iteration"
                    );
                    self.beliefs_computed = false;
                }
                DisplayMode::Off | DisplayMode::Final => {}
            }

            if change <= tol {
                self.state = BpState::Converged;
                break;
            }
        }

        if self.state != BpState::Converged {
            self.state = BpState::MaxIter;
        }

        self.compute_beliefs(unary, edge_pot)?;

        if matches!(display, DisplayMode::Final | DisplayMode::Iter | DisplayMode::Full) {
            let state = self.state;
            tracing::info!(?state, iterations, change, "belief propagation finished");
        }

        Ok(InferenceReport {
            state: self.state,
            iterations,
            final_change: change,
        })
    }

    /// Computes variable beliefs `B` and forward pairwise beliefs `P` from
    /// the current messages. A no-op once `fully_conditioned` beliefs have
    /// been computed once, per the frozen-E-step contract.
    pub fn compute_beliefs(&mut self, unary: &Tensor<f64>, edge_pot: &Tensor<f64>) -> FieldResult<()> {
        if self.fully_conditioned && self.beliefs_computed {
            return Ok(());
        }

        let k = self.topology.k;
        let n = self.topology.num_vars;
        let m = self.topology.num_edges;

        let mut beliefs = vec![0.0; n * k];
        for v in 0..n {
            let incoming = self.incoming_sum(v);
            let u_col = &unary.data()[v * k..(v + 1) * k];
            let cond = &self.conditioning.data()[v * k..(v + 1) * k];
            let mut row: Vec<f64> = (0..k)
                .map(|s| nan_to_num(u_col[s] + incoming[s] + cond[s]))
                .collect();
            let z = logsumexp(&row);
            for s in &mut row {
                *s = nan_to_num(*s - z);
            }
            beliefs[v * k..(v + 1) * k].copy_from_slice(&row);
        }
        self.beliefs = Tensor::new(beliefs, n * k);

        let mut pair = vec![0.0; m * k * k];
        for e in 0..m {
            let u = self.topology.from[e];
            let v = self.topology.to[e];
            let ebar = self.topology.reverse(e);
            let phi = &edge_pot.data()[e * k * k..(e + 1) * k * k];
            let b_u = &self.beliefs.data()[u * k..(u + 1) * k];
            let b_v = &self.beliefs.data()[v * k..(v + 1) * k];
            let m_ebar = &self.messages.data()[ebar * k..(ebar + 1) * k];
            let m_e = &self.messages.data()[e * k..(e + 1) * k];

            let mut block = vec![0.0; k * k];
            for a in 0..k {
                for b in 0..k {
                    block[a * k + b] = nan_to_num(
                        phi[a * k + b] + (b_u[a] - m_ebar[a]) + (b_v[b] - m_e[b]),
                    );
                }
            }
            let z = logsumexp(&block);
            for x in &mut block {
                *x = nan_to_num(*x - z);
            }
            pair[e * k * k..(e + 1) * k * k].copy_from_slice(&block);
        }
        self.pair_beliefs = Tensor::new(pair, m * k * k);

        self.beliefs_computed = true;
        Ok(())
    }

    pub fn beliefs(&self) -> FieldResult<&Tensor<f64>> {
        if !self.beliefs_computed {
            return Err(field_err!(InvalidConfig: "beliefs have not been computed yet"));
        }
        Ok(&self.beliefs)
    }

    pub fn pairwise_beliefs(&self) -> FieldResult<&Tensor<f64>> {
        if !self.beliefs_computed {
            return Err(field_err!(InvalidConfig: "beliefs have not been computed yet"));
        }
        Ok(&self.pair_beliefs)
    }

    pub fn belief(&self, v: usize) -> &[f64] {
        let k = self.topology.k;
        &self.beliefs.data()[v * k..(v + 1) * k]
    }

    pub fn pairwise_belief(&self, forward_edge: usize) -> &[f64] {
        let k = self.topology.k;
        &self.pair_beliefs.data()[forward_edge * k * k..(forward_edge + 1) * k * k]
    }

    pub fn messages(&self) -> &Tensor<f64> {
        &self.messages
    }

    /// `Σ_e ⟨Φ_e, exp(P_e)⟩ + ⟨U, exp(B)⟩`, summed over forward edges only.
    pub fn energy(&self, unary: &Tensor<f64>, edge_pot: &Tensor<f64>) -> f64 {
        let k = self.topology.k;
        let m = self.topology.num_edges;
        let n = self.topology.num_vars;

        let mut energy = 0.0;
        for i in 0..n * k {
            energy += nan_to_num(unary.data()[i] * self.beliefs.data()[i].exp());
        }
        for e in 0..m {
            let phi = &edge_pot.data()[e * k * k..(e + 1) * k * k];
            let p = &self.pair_beliefs.data()[e * k * k..(e + 1) * k * k];
            for i in 0..k * k {
                energy += nan_to_num(phi[i] * p[i].exp());
            }
        }
        energy
    }

    /// Bethe/convex entropy under the propagator's counting numbers. `0`
    /// for a fully-conditioned model, since there's no residual
    /// uncertainty to measure.
    pub fn entropy(&self) -> f64 {
        if self.fully_conditioned {
            return 0.0;
        }
        let k = self.topology.k;
        let m = self.topology.num_edges;
        let n = self.topology.num_vars;

        let mut entropy = 0.0;
        for e in 0..m {
            let c = self.counting.edge_count(e);
            let p = &self.pair_beliefs.data()[e * k * k..(e + 1) * k * k];
            let term: f64 = p.iter().map(|&x| nan_to_num(x * x.exp())).sum();
            entropy -= c * term;
        }
        for v in 0..n {
            let c = self.counting.var_count(v);
            let b = &self.beliefs.data()[v * k..(v + 1) * k];
            let term: f64 = b.iter().map(|&x| nan_to_num(x * x.exp())).sum();
            entropy -= c * term;
        }
        entropy
    }

    /// Energy + entropy: the Bethe/convex free-energy approximation whose
    /// minimum the message-passing fixed point targets.
    pub fn energy_functional(&self, unary: &Tensor<f64>, edge_pot: &Tensor<f64>) -> f64 {
        self.energy(unary, edge_pot) + self.entropy()
    }

    /// For forward edge `e = (u, v)`, the marginal of `v` implied by the
    /// pairwise belief (summing over `u`'s states), in exp space.
    fn marginal_to_from_forward(&self, e: usize) -> Vec<f64> {
        let k = self.topology.k;
        let p = &self.pair_beliefs.data()[e * k * k..(e + 1) * k * k];
        (0..k)
            .map(|b| (0..k).map(|a| nan_to_num(p[a * k + b].exp())).sum())
            .collect()
    }

    /// For forward edge `e = (u, v)`, the marginal of `u` implied by the
    /// pairwise belief (summing over `v`'s states), in exp space.
    fn marginal_from_from_forward(&self, e: usize) -> Vec<f64> {
        let k = self.topology.k;
        let p = &self.pair_beliefs.data()[e * k * k..(e + 1) * k * k];
        (0..k)
            .map(|a| (0..k).map(|b| nan_to_num(p[a * k + b].exp())).sum())
            .collect()
    }

    /// `exp(B[:, to[e]]) - marginal` for directed half-edge `e`, in exp
    /// space, at the "to" endpoint of that direction.
    fn inconsistency_vector(&self) -> Vec<f64> {
        let k = self.topology.k;
        let m = self.topology.num_edges;
        let mut iv = vec![0.0; 2 * m * k];
        for e in 0..m {
            let v = self.topology.to[e];
            let marginal_v = self.marginal_to_from_forward(e);
            let b_v = &self.beliefs.data()[v * k..(v + 1) * k];
            for s in 0..k {
                iv[e * k + s] = nan_to_num(b_v[s].exp()) - marginal_v[s];
            }

            let ebar = self.topology.reverse(e);
            let u = self.topology.from[e];
            let marginal_u = self.marginal_from_from_forward(e);
            let b_u = &self.beliefs.data()[u * k..(u + 1) * k];
            for s in 0..k {
                iv[ebar * k + s] = nan_to_num(b_u[s].exp()) - marginal_u[s];
            }
        }
        iv
    }

    /// Sum of absolute marginal mismatches between variable beliefs and
    /// the marginals implied by their incident pairwise beliefs, across
    /// all directed half-edges.
    pub fn inconsistency(&self) -> f64 {
        self.inconsistency_vector().iter().map(|x| x.abs()).sum()
    }

    /// `energy_functional + ⟨M, inconsistency_vector⟩`.
    pub fn dual_objective(&self, unary: &Tensor<f64>, edge_pot: &Tensor<f64>) -> FieldResult<f64> {
        let iv = self.inconsistency_vector();
        let dot: f64 = self
            .messages
            .data()
            .iter()
            .zip(iv.iter())
            .map(|(m, i)| m * i)
            .sum();
        Ok(self.energy_functional(unary, edge_pot) + dot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldkit_model::MarkovNet;

    fn two_node_net(psi: Tensor<f64>) -> (Topology, Tensor<f64>, Tensor<f64>) {
        let mut mn = MarkovNet::new();
        mn.declare_variable(0, 2).unwrap();
        mn.declare_variable(1, 2).unwrap();
        mn.set_unary_factor(0, vec![0.0, 0.0]).unwrap();
        mn.set_unary_factor(1, vec![0.0, 0.0]).unwrap();
        mn.set_edge_factor((0, 1), psi).unwrap();
        mn.create_matrices().unwrap();
        let mv = mn.matrices().unwrap();
        (mv.topology.clone(), mv.unary.clone(), mv.edge_pot.clone())
    }

    #[test]
    fn uniform_potentials_give_uniform_beliefs() {
        let (topo, unary, edge_pot) = two_node_net(Tensor::zeros((2, 2)));
        let counting = CountingNumbers::bethe(&topo).unwrap();
        let mut bp = BeliefPropagator::new(topo, counting);
        let report = bp.infer(&unary, &edge_pot, 1e-10, 100, DisplayMode::Off).unwrap();
        assert_eq!(report.state, BpState::Converged);
        for &b in bp.belief(0) {
            assert!((b.exp() - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn strong_attraction_favors_matching_states() {
        let psi = Tensor::new(vec![5.0, 0.0, 0.0, 5.0], (2, 2));
        let (topo, unary, edge_pot) = two_node_net(psi);
        let counting = CountingNumbers::bethe(&topo).unwrap();
        let mut bp = BeliefPropagator::new(topo, counting);
        bp.infer(&unary, &edge_pot, 1e-10, 200, DisplayMode::Off).unwrap();
        let belief0 = bp.belief(0).to_vec();
        let belief1 = bp.belief(1).to_vec();
        let argmax = |b: &[f64]| if b[0] > b[1] { 0 } else { 1 };
        assert_eq!(argmax(&belief0), argmax(&belief1));
    }

    #[test]
    fn fully_observed_model_skips_iteration() {
        let (topo, unary, edge_pot) = two_node_net(Tensor::zeros((2, 2)));
        let counting = CountingNumbers::bethe(&topo).unwrap();
        let mut bp = BeliefPropagator::new(topo, counting);
        bp.observe(0, 0).unwrap();
        bp.observe(1, 1).unwrap();
        assert!(bp.is_fully_conditioned());
        let report = bp.infer(&unary, &edge_pot, 1e-10, 100, DisplayMode::Off).unwrap();
        assert_eq!(report.iterations, 0);
        assert!((bp.belief(0)[0].exp() - 1.0).abs() < 1e-9);
        assert!((bp.belief(1)[1].exp() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn converged_pairwise_beliefs_marginalize_to_variable_beliefs() {
        let psi = Tensor::new(vec![1.0, -0.5, -0.5, 1.0], (2, 2));
        let (topo, unary, edge_pot) = two_node_net(psi);
        let counting = CountingNumbers::bethe(&topo).unwrap();
        let mut bp = BeliefPropagator::new(topo, counting);
        bp.infer(&unary, &edge_pot, 1e-12, 500, DisplayMode::Off).unwrap();
        assert!(bp.inconsistency() < 1e-6);
    }
}
