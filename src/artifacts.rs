//! Side-table of per-parameter results of one extended backward pass
//!
//! Results are keyed by [`ParamId`] and never attached to layers. Each pass builds a
//! fresh table, so nothing stale survives from an earlier batch.

use crate::curvature::Curvature;
use crate::error::{BackpropError, Result};
use crate::layers::ParamId;
use crate::utils::tensor::{numel, reshape, Tensor};
use ndarray::{Array1, Array2};
use std::collections::HashMap;

/// Everything computed for one parameter.
#[derive(Debug, Clone, Default)]
pub struct ParamArtifacts {
    /// Per-example gradients `[N, *shape]`.
    pub grad_batch: Option<Tensor>,
    /// `Σₙ gₙ²`, `[*shape]`.
    pub sum_grad_squared: Option<Tensor>,
    /// Diagonal of the Hessian, `[*shape]`.
    pub diag_h: Option<Tensor>,
    /// Curvature block over the flattened parameter.
    pub curvature: Option<Curvature>,
}

#[derive(Debug, Clone, Default)]
pub struct Artifacts {
    entries: HashMap<ParamId, ParamArtifacts>,
    shapes: HashMap<ParamId, Vec<usize>>,
}

impl Artifacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&mut self, id: ParamId, shape: Vec<usize>) -> &mut ParamArtifacts {
        self.shapes.insert(id, shape);
        self.entries.entry(id).or_default()
    }

    pub fn get(&self, id: ParamId) -> Option<&ParamArtifacts> {
        self.entries.get(&id)
    }

    /// Identities with at least one stored artifact, in layer order.
    pub fn param_ids(&self) -> Vec<ParamId> {
        let mut ids: Vec<ParamId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn shape(&self, id: ParamId) -> Option<&[usize]> {
        self.shapes.get(&id).map(Vec::as_slice)
    }

    fn lookup<'a, T>(
        &'a self,
        id: ParamId,
        artifact: &'static str,
        select: impl Fn(&'a ParamArtifacts) -> Option<&'a T>,
    ) -> Result<&'a T> {
        self.entries
            .get(&id)
            .and_then(select)
            .ok_or_else(|| BackpropError::MissingArtifact {
                param: id.to_string(),
                artifact,
            })
    }

    pub fn grad_batch(&self, id: ParamId) -> Result<&Tensor> {
        self.lookup(id, "grad_batch", |a| a.grad_batch.as_ref())
    }

    pub fn sum_grad_squared(&self, id: ParamId) -> Result<&Tensor> {
        self.lookup(id, "sum_grad_squared", |a| a.sum_grad_squared.as_ref())
    }

    pub fn diag_h(&self, id: ParamId) -> Result<&Tensor> {
        self.lookup(id, "diag_h", |a| a.diag_h.as_ref())
    }

    pub fn curvature(&self, id: ParamId) -> Result<&Curvature> {
        self.lookup(id, "curvature", |a| a.curvature.as_ref())
    }

    /// Dense curvature block `[P, P]` over the flattened parameter.
    pub fn hessian(&self, id: ParamId) -> Result<Array2<f64>> {
        Ok(self.curvature(id)?.to_dense())
    }

    /// Curvature-vector product for a parameter-shaped vector.
    pub fn hvp(&self, id: ParamId, v: &Tensor) -> Result<Tensor> {
        let curvature = self.curvature(id)?;
        let shape = self.shapes.get(&id).cloned().unwrap_or_else(|| v.shape().to_vec());
        if v.shape() != shape.as_slice() || numel(&shape) != curvature.dim() {
            return Err(BackpropError::shape(format!(
                "hvp for {}: expected vector of shape {:?}, got {:?}",
                id,
                shape,
                v.shape()
            )));
        }
        let flat: Array1<f64> = v.iter().copied().collect();
        reshape(&curvature.matvec(&flat)?.into_dyn(), &shape)
    }

    pub fn clear_grad_batch(&mut self) {
        self.entries.values_mut().for_each(|a| a.grad_batch = None);
    }

    pub fn clear_sum_grad_squared(&mut self) {
        self.entries
            .values_mut()
            .for_each(|a| a.sum_grad_squared = None);
    }

    pub fn clear_diag_h(&mut self) {
        self.entries.values_mut().for_each(|a| a.diag_h = None);
    }

    pub fn clear_curvature(&mut self) {
        self.entries.values_mut().for_each(|a| a.curvature = None);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.shapes.clear();
    }
}
