use fieldkit_error::{FieldResult, field_err};
use fieldkit_model::Topology;

use crate::HalfEdge;

/// Edge and variable counting numbers that unify Bethe belief propagation,
/// tree-reweighted BP, and general convex BP behind one message-passing
/// algorithm. `c_uv` weights an edge's entropy term and must be strictly
/// positive (it appears as a divisor in the message update); `c_v` weights
/// a variable's entropy term and is unconstrained in sign — Bethe's
/// `c_v = 1 - deg(v)` is typically negative.
#[derive(Clone, Debug, PartialEq)]
pub struct CountingNumbers {
    /// Indexed by forward edge id `0..m`; shared by a half-edge and its
    /// reverse.
    c_edges: Vec<f64>,
    /// Indexed by variable index `0..|V|`.
    c_vars: Vec<f64>,
}

impl CountingNumbers {
    fn validate(c_edges: Vec<f64>, c_vars: Vec<f64>, num_edges: usize, num_vars: usize) -> FieldResult<Self> {
        fieldkit_error::ensure!(
            c_edges.len() == num_edges,
            InvalidConfig: "edge counting numbers has length {}, expected {}", c_edges.len(), num_edges
        );
        fieldkit_error::ensure!(
            c_vars.len() == num_vars,
            InvalidConfig: "variable counting numbers has length {}, expected {}", c_vars.len(), num_vars
        );
        for (e, &c) in c_edges.iter().enumerate() {
            fieldkit_error::ensure!(
                c > 0.0,
                InvalidParameter: "edge counting number c_uv must be positive, got {} at edge {}", c, e
            );
        }
        Ok(Self { c_edges, c_vars })
    }

    /// Bethe approximation: `c_uv = 1`, `c_v = 1 - deg(v)`.
    pub fn bethe(topology: &Topology) -> FieldResult<Self> {
        let c_edges = vec![1.0; topology.num_edges];
        let c_vars = topology
            .degrees
            .iter()
            .map(|&d| 1.0 - d as f64)
            .collect();
        Self::validate(c_edges, c_vars, topology.num_edges, topology.num_vars)
    }

    /// Tree-reweighted BP: `c_uv = ρ_uv`, an edge appearance probability
    /// under some spanning-tree distribution over the graph, and
    /// `c_v = 1 - Σ_{u ∈ N(v)} ρ_uv`.
    pub fn trbp(topology: &Topology, edge_appearance: &[f64]) -> FieldResult<Self> {
        fieldkit_error::ensure!(
            edge_appearance.len() == topology.num_edges,
            InvalidConfig: "edge appearance probabilities has length {}, expected {}", edge_appearance.len(), topology.num_edges
        );
        for (e, &rho) in edge_appearance.iter().enumerate() {
            fieldkit_error::ensure!(
                rho > 0.0 && rho <= 1.0,
                InvalidParameter: "edge appearance probability must be in (0, 1], got {} at edge {}", rho, e
            );
        }

        let c_vars = (0..topology.num_vars)
            .map(|v| {
                let incident: f64 = topology.incoming[v]
                    .iter()
                    .map(|&e| edge_appearance[forward_id(topology, e)])
                    .sum();
                1.0 - incident
            })
            .collect();

        Self::validate(edge_appearance.to_vec(), c_vars, topology.num_edges, topology.num_vars)
    }

    /// General convex BP with caller-chosen counting numbers. Only the
    /// edge counts are mechanically validated (positivity); choosing a
    /// `c_v` combination that keeps the entropy concave is the caller's
    /// responsibility.
    pub fn convex(topology: &Topology, c_edges: Vec<f64>, c_vars: Vec<f64>) -> FieldResult<Self> {
        Self::validate(c_edges, c_vars, topology.num_edges, topology.num_vars)
    }

    #[inline]
    pub fn edge_count(&self, e: HalfEdge) -> f64 {
        self.c_edges[e % self.c_edges.len().max(1)]
    }

    #[inline]
    pub fn var_count(&self, v: usize) -> f64 {
        self.c_vars[v]
    }
}

#[inline]
fn forward_id(topology: &Topology, e: HalfEdge) -> HalfEdge {
    if topology.is_forward(e) { e } else { topology.reverse(e) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldkit_model::MarkovNet;

    fn chain_topology() -> Topology {
        let mut mn = MarkovNet::new();
        mn.declare_variable(0, 2).unwrap();
        mn.declare_variable(1, 2).unwrap();
        mn.declare_variable(2, 2).unwrap();
        mn.set_edge_factor((0, 1), fieldkit_utils::Tensor::zeros((2, 2)))
            .unwrap();
        mn.set_edge_factor((1, 2), fieldkit_utils::Tensor::zeros((2, 2)))
            .unwrap();
        mn.create_matrices().unwrap();
        mn.topology().unwrap()
    }

    #[test]
    fn bethe_uses_unit_edge_counts_and_degree_based_var_counts() {
        let topo = chain_topology();
        let cn = CountingNumbers::bethe(&topo).unwrap();
        assert_eq!(cn.edge_count(0), 1.0);
        assert_eq!(cn.edge_count(topo.num_edges), 1.0);
        // endpoints have degree 1, middle has degree 2.
        assert_eq!(cn.var_count(0), 0.0);
        assert_eq!(cn.var_count(1), -1.0);
        assert_eq!(cn.var_count(2), 0.0);
    }

    #[test]
    fn trbp_rejects_out_of_range_probability() {
        let topo = chain_topology();
        assert!(CountingNumbers::trbp(&topo, &[1.5, 0.5]).is_err());
    }

    #[test]
    fn trbp_on_a_tree_with_unit_probabilities_matches_bethe() {
        let topo = chain_topology();
        let trbp = CountingNumbers::trbp(&topo, &[1.0, 1.0]).unwrap();
        let bethe = CountingNumbers::bethe(&topo).unwrap();
        for v in 0..topo.num_vars {
            assert_eq!(trbp.var_count(v), bethe.var_count(v));
        }
    }

    #[test]
    fn convex_rejects_nonpositive_edge_count() {
        let topo = chain_topology();
        assert!(CountingNumbers::convex(&topo, vec![0.0, 1.0], vec![0.0, 0.0, 0.0]).is_err());
    }
}
