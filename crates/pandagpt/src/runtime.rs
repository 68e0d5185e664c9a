//! Seams to the externally hosted PandaGPT implementation.
//!
//! The adapter never links the model code itself: whoever constructs it
//! hands in a [`PandaGptRuntime`] able to resolve the project checkout,
//! build the model and report on accelerators.

use crate::config::ModelArgs;
use crate::placement::{
    DevicePlacement, GreedyPlacementSolver, MemoryBudget, ModuleNode, PlacementError,
    PlacementSolver,
};
use crate::request::GenerationRequest;
use candle_core::Tensor;
use std::path::Path;

/// A constructed, weight-populated model.
pub trait MultimodalModel {
    fn parameter_names(&self) -> Vec<String>;

    /// Overwrite the named parameters. Every name is one of
    /// [`MultimodalModel::parameter_names`].
    fn load_parameters(&mut self, tensors: Vec<(String, Tensor)>) -> anyhow::Result<()>;

    /// Top-level modules in declaration order.
    fn modules(&self) -> Vec<ModuleNode>;

    fn dispatch(&mut self, placement: &DevicePlacement) -> anyhow::Result<()>;

    /// Switch to inference mode.
    fn eval(&mut self);

    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<String>;
}

pub trait PandaGptRuntime {
    type Model: MultimodalModel;

    /// Resolve the project's entry points under `code_dir`.
    fn locate(&self, code_dir: &Path) -> anyhow::Result<()>;

    /// Build the base model. This reads the ImageBind and Vicuna checkpoints.
    fn build(&self, args: &ModelArgs) -> anyhow::Result<Self::Model>;

    fn empty_cache(&self);

    fn device_count(&self) -> usize;

    fn solve_placement(
        &self,
        modules: &[ModuleNode],
        budget: &MemoryBudget,
        no_split: &[&str],
    ) -> Result<DevicePlacement, PlacementError> {
        GreedyPlacementSolver.solve(modules, budget, no_split)
    }
}
