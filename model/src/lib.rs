//! Matrix capsule networks with EM routing on `ndarray`.
//!
//! [`model::ModelBuilder`] turns a [`model::NetworkConfig`] (a named preset or
//! a JSON file) into a [`model::CapsNet`]. The forward pass returns class
//! activations and poses plus the per-layer routing statistics an external
//! training driver needs; parameters are exposed through
//! [`model::CapsNet::visit_parameters`].

pub mod model;
