use std::collections::{BTreeMap, BTreeSet};

use fieldkit_error::{FieldResult, field_err};
use fieldkit_utils::Tensor;

/// A directed half-edge index into `2m` half-edges: `0..m` are forward
/// (lower variable id -> higher), `m..2m` are their reverses.
pub type HalfEdge = usize;

/// The small, owned slice of a [`MarkovNet`]'s structure that a belief
/// propagator needs. Cloning this is cheap (a handful of `usize` vectors)
/// and lets the propagator outlive any particular borrow of the net, per
/// the topology-ownership resolution in the design notes: BP takes `U`/`Φ`
/// as explicit per-call arguments instead of holding a reference to the net.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    pub num_vars: usize,
    pub num_edges: usize,
    pub k: usize,
    pub from: Vec<usize>,
    pub to: Vec<usize>,
    /// `incoming[v]` lists the half-edges whose target is `v` — the
    /// row-sparse equivalent of the `message_to_map` aggregator.
    pub incoming: Vec<Vec<HalfEdge>>,
    pub degrees: Vec<usize>,
    /// `forward_pairs[e]` is the `(u, v)` variable pair for forward
    /// half-edge `e`, in the stable order used to build `Φ`'s forward half.
    pub forward_pairs: Vec<(usize, usize)>,
}

impl Topology {
    /// `reverse[e]` is the half-edge opposite `e`.
    #[inline]
    pub fn reverse(&self, e: HalfEdge) -> HalfEdge {
        let m = self.num_edges;
        if e < m { e + m } else { e - m }
    }

    #[inline]
    pub fn is_forward(&self, e: HalfEdge) -> bool {
        e < self.num_edges
    }
}

/// Dense matrix view materialized by [`MarkovNet::create_matrices`]. Once
/// built it is authoritative: further factor changes must go through the
/// matrix-level setters (`set_unary_column`, `set_edge_slice`) or the
/// dictionary view and the matrix view will diverge.
pub struct MatrixView {
    pub var_index: Vec<usize>,
    pub index_of: BTreeMap<usize, usize>,
    pub k: usize,
    /// `K x |V|`.
    pub unary: Tensor<f64>,
    /// `K x K x 2m`.
    pub edge_pot: Tensor<f64>,
    pub topology: Topology,
}

impl MatrixView {
    #[inline]
    pub fn num_vars(&self) -> usize {
        self.var_index.len()
    }

    #[inline]
    pub fn num_edges(&self) -> usize {
        self.topology.num_edges
    }

    /// Column `i` of `U`, i.e. `U[:, i]`.
    pub fn unary_column(&self, i: usize) -> &[f64] {
        let k = self.k;
        &self.unary.data()[i * k..(i + 1) * k]
    }

    pub fn set_unary_column(&mut self, i: usize, column: &[f64]) {
        let k = self.k;
        self.unary.data_mut()[i * k..(i + 1) * k].copy_from_slice(column);
    }

    /// Slice `e` of `Φ`, i.e. `Φ[:, :, e]`, as a `K x K` row-major block.
    pub fn edge_slice(&self, e: HalfEdge) -> &[f64] {
        let kk = self.k * self.k;
        &self.edge_pot.data()[e * kk..(e + 1) * kk]
    }

    pub fn set_edge_slice(&mut self, e: HalfEdge, slice: &[f64]) {
        let kk = self.k * self.k;
        self.edge_pot.data_mut()[e * kk..(e + 1) * kk].copy_from_slice(slice);
    }
}

/// Holds the graph topology, per-variable cardinalities, unary and edge
/// log-potentials, and — once [`create_matrices`](Self::create_matrices) is
/// called — the dense matrix/tensor layout the inference engine consumes.
#[derive(Default)]
pub struct MarkovNet {
    cardinalities: BTreeMap<usize, usize>,
    unary_factors: BTreeMap<usize, Vec<f64>>,
    edge_factors: BTreeMap<(usize, usize), Tensor<f64>>,
    neighbors: BTreeMap<usize, BTreeSet<usize>>,
    matrices: Option<MatrixView>,
}

fn canonical(u: usize, v: usize) -> (usize, usize) {
    if u < v { (u, v) } else { (v, u) }
}

impl MarkovNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare_variable(&mut self, v: usize, k: usize) -> FieldResult<()> {
        fieldkit_error::ensure!(k >= 1, InvalidConfig: "variable {} must have cardinality >= 1, got {}", v, k);
        if self.cardinalities.contains_key(&v) {
            return Err(field_err!(InvalidConfig: "variable {} already declared", v));
        }
        self.cardinalities.insert(v, k);
        self.neighbors.entry(v).or_default();
        self.matrices = None;
        Ok(())
    }

    pub fn cardinality(&self, v: usize) -> FieldResult<usize> {
        self.cardinalities
            .get(&v)
            .copied()
            .ok_or_else(|| field_err!(InvalidConfig: "undeclared variable {}", v))
    }

    pub fn variables(&self) -> impl Iterator<Item = usize> + '_ {
        self.cardinalities.keys().copied()
    }

    pub fn num_variables(&self) -> usize {
        self.cardinalities.len()
    }

    pub fn max_cardinality(&self) -> usize {
        self.cardinalities.values().copied().max().unwrap_or(0)
    }

    pub fn num_edges(&self) -> usize {
        self.edge_factors.len()
    }

    pub fn set_unary_factor(&mut self, v: usize, phi: Vec<f64>) -> FieldResult<()> {
        let k = self.cardinality(v)?;
        fieldkit_error::ensure!(
            phi.len() == k,
            InvalidConfig: "unary factor for variable {} has length {}, expected {}", v, phi.len(), k
        );
        self.unary_factors.insert(v, phi);
        self.matrices = None;
        Ok(())
    }

    pub fn set_edge_factor(&mut self, edge: (usize, usize), psi: Tensor<f64>) -> FieldResult<()> {
        let (u, v) = canonical(edge.0, edge.1);
        fieldkit_error::ensure!(u != v, InvalidConfig: "self-loop edge ({}, {}) is not allowed", u, v);
        let ku = self.cardinality(u)?;
        let kv = self.cardinality(v)?;
        fieldkit_error::ensure!(
            psi.dims() == [ku, kv],
            InvalidConfig: "edge factor for ({}, {}) has shape {:?}, expected [{}, {}]", u, v, psi.dims(), ku, kv
        );

        self.neighbors.entry(u).or_default().insert(v);
        self.neighbors.entry(v).or_default().insert(u);
        self.edge_factors.insert((u, v), psi);
        self.matrices = None;
        Ok(())
    }

    pub fn get_neighbors(&self, v: usize) -> FieldResult<&BTreeSet<usize>> {
        self.neighbors
            .get(&v)
            .ok_or_else(|| field_err!(InvalidConfig: "undeclared variable {}", v))
    }

    pub fn edges(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.edge_factors.keys().copied()
    }

    pub fn edge_factor(&self, edge: (usize, usize)) -> Option<&Tensor<f64>> {
        self.edge_factors.get(&canonical(edge.0, edge.1))
    }

    /// `Σ_v log φ_v(x_v) + Σ_{uv} log ψ_{uv}(x_u, x_v)` for a full assignment.
    pub fn evaluate_state(&self, assignment: &BTreeMap<usize, usize>) -> FieldResult<f64> {
        let mut total = 0.0;
        for (&v, &state) in assignment {
            let k = self.cardinality(v)?;
            fieldkit_error::ensure!(state < k, InvalidConfig: "state {} out of range for variable {} (k={})", state, v, k);
            if let Some(phi) = self.unary_factors.get(&v) {
                total += phi[state];
            }
        }
        for (&(u, v), psi) in &self.edge_factors {
            let su = *assignment
                .get(&u)
                .ok_or_else(|| field_err!(InvalidConfig: "assignment missing variable {} for edge ({}, {})", u, u, v))?;
            let sv = *assignment
                .get(&v)
                .ok_or_else(|| field_err!(InvalidConfig: "assignment missing variable {} for edge ({}, {})", v, u, v))?;
            total += psi[[su, sv]];
        }
        Ok(total)
    }

    /// Build `U`, `Φ`, and the topology index arrays. Idempotent: calling
    /// this again fully rebuilds the matrix view from the current
    /// dictionary factors.
    pub fn create_matrices(&mut self) -> FieldResult<()> {
        let k = self.max_cardinality();
        let var_index: Vec<usize> = self.cardinalities.keys().copied().collect();
        let index_of: BTreeMap<usize, usize> = var_index
            .iter()
            .enumerate()
            .map(|(i, &v)| (v, i))
            .collect();

        // Flat `|V| * K` buffer, K contiguous states per variable, so that
        // `unary_column`/`set_unary_column` can slice it directly.
        let mut unary = Tensor::from_elem(var_index.len() * k, f64::NEG_INFINITY);

        for (i, &v) in var_index.iter().enumerate() {
            let kv = self.cardinality(v)?;
            let phi = self
                .unary_factors
                .get(&v)
                .cloned()
                .unwrap_or_else(|| vec![0.0; kv]);
            fieldkit_error::ensure!(
                phi.len() == kv,
                InvalidConfig: "unary factor for variable {} has length {}, expected {}", v, phi.len(), kv
            );
            for (s, &val) in phi.iter().enumerate() {
                unary.data_mut()[i * k + s] = val;
            }
        }

        let forward_pairs: Vec<(usize, usize)> = self.edge_factors.keys().copied().collect();
        let m = forward_pairs.len();
        let mut edge_pot = Tensor::from_elem(2 * m * k * k, f64::NEG_INFINITY);

        let mut from = vec![0usize; 2 * m];
        let mut to = vec![0usize; 2 * m];

        for (e, &(u, v)) in forward_pairs.iter().enumerate() {
            let ku = self.cardinality(u)?;
            let kv = self.cardinality(v)?;
            let psi = self.edge_factors.get(&(u, v)).expect("edge present");

            let iu = index_of[&u];
            let iv = index_of[&v];
            from[e] = iu;
            to[e] = iv;
            from[e + m] = iv;
            to[e + m] = iu;

            for a in 0..ku {
                for b in 0..kv {
                    let val = psi[[a, b]];
                    edge_pot.data_mut()[e * k * k + a * k + b] = val;
                    edge_pot.data_mut()[(e + m) * k * k + b * k + a] = val;
                }
            }
        }

        let mut incoming = vec![Vec::new(); var_index.len()];
        for e in 0..2 * m {
            incoming[to[e]].push(e);
        }
        let degrees: Vec<usize> = var_index
            .iter()
            .map(|&v| self.get_neighbors(v).map(|n| n.len()))
            .collect::<FieldResult<Vec<_>>>()?;

        let topology = Topology {
            num_vars: var_index.len(),
            num_edges: m,
            k,
            from,
            to,
            incoming,
            degrees,
            forward_pairs,
        };

        self.matrices = Some(MatrixView {
            var_index,
            index_of,
            k,
            unary,
            edge_pot,
            topology,
        });

        Ok(())
    }

    pub fn matrices(&self) -> FieldResult<&MatrixView> {
        self.matrices
            .as_ref()
            .ok_or_else(|| field_err!(InvalidConfig: "create_matrices has not been called"))
    }

    pub fn matrices_mut(&mut self) -> FieldResult<&mut MatrixView> {
        self.matrices
            .as_mut()
            .ok_or_else(|| field_err!(InvalidConfig: "create_matrices has not been called"))
    }

    pub fn topology(&self) -> FieldResult<Topology> {
        Ok(self.matrices()?.topology.clone())
    }

    /// Populate the dictionary factor view from the current `U`/`Φ`. The
    /// inverse of `create_matrices`, used by reference implementations and
    /// tests that want to compare the matrix and dictionary views.
    pub fn load_factors_from_matrices(&mut self) -> FieldResult<()> {
        let mv = self
            .matrices
            .as_ref()
            .ok_or_else(|| field_err!(InvalidConfig: "create_matrices has not been called"))?;
        let k = mv.k;

        for (i, &v) in mv.var_index.iter().enumerate() {
            let kv = self.cardinality(v)?;
            let column = mv.unary_column(i);
            self.unary_factors.insert(v, column[..kv].to_vec());
        }

        for (e, &(u, v)) in mv.topology.forward_pairs.iter().enumerate() {
            let ku = self.cardinality(u)?;
            let kv = self.cardinality(v)?;
            let slice = mv.edge_slice(e);
            let mut data = Vec::with_capacity(ku * kv);
            for a in 0..ku {
                for b in 0..kv {
                    data.push(slice[a * k + b]);
                }
            }
            self.edge_factors
                .insert((u, v), Tensor::new(data, (ku, kv)));
        }

        Ok(())
    }
}
