use crate::checkpoint::{self, LoadReport};
use crate::config::{
    code_dir, ModelArgs, ModelVariant, PandaGptConfig, LM_HEAD_MODULE, MAX_MEMORY_PER_DEVICE,
    NO_SPLIT_MODULE_CLASSES, PROJECTION_MODULE,
};
use crate::params::GenerationParams;
use crate::placement::{DevicePair, DevicePlacement, MemoryBudget, PlacementError};
use crate::request::GenerationRequest;
use crate::runtime::{MultimodalModel, PandaGptRuntime};
use crate::{PandaGptError, PandaGptResult};
use ai::{AIModel, Message, Model, VisionLanguageInput, VisionLanguageModel, VisionLanguageOutput};
use anyhow::anyhow;
use tracing::{debug, info, warn};

/// PandaGPT behind the uniform "message in, text out" interface.
pub struct PandaGpt<M> {
    variant: ModelVariant,
    model: M,
    params: GenerationParams,
    devices: DevicePair,
    placement: DevicePlacement,
    load_report: LoadReport,
}

impl<M: MultimodalModel> PandaGpt<M> {
    /// Build the model, apply the delta checkpoint and spread it over the
    /// process's device pair.
    #[tracing::instrument(name = "PandaGpt::new", err(Debug), skip_all, fields(name = %config.name, rank = ?config.rank))]
    pub fn new<R>(runtime: &R, config: &PandaGptConfig) -> PandaGptResult<Self>
    where
        R: PandaGptRuntime<Model = M>,
    {
        let variant = config.variant()?;
        let root = config.root()?;
        let params = GenerationParams::from_overrides(&config.generation)?;

        let code_dir = code_dir(root);
        let located = if code_dir.is_dir() {
            runtime.locate(&code_dir)
        } else {
            Err(anyhow!("{} is not a directory", code_dir.display()))
        };
        if let Err(source) = located {
            return Err(PandaGptError::DependencyMissing { code_dir, source });
        }

        let args = ModelArgs::for_variant(variant, root);
        if let Some(missing) = args.checkpoint_paths().into_iter().find(|p| !p.exists()) {
            return Err(PandaGptError::checkpoint(
                missing,
                anyhow!("no such file or directory"),
            ));
        }

        info!("building {} from {}", variant, root.display());
        let mut model = runtime.build(&args).map_err(PandaGptError::Build)?;

        let delta = checkpoint::load_state_dict(&args.delta_ckpt_path)?;
        let (matching, load_report) =
            checkpoint::partition_non_strict(delta, &model.parameter_names());
        debug!(
            loaded = load_report.loaded.len(),
            missing = load_report.missing_keys.len(),
            unexpected = load_report.unexpected_keys.len(),
            "delta checkpoint loaded"
        );
        model
            .load_parameters(matching)
            .map_err(|e| PandaGptError::checkpoint(&args.delta_ckpt_path, e))?;

        runtime.empty_cache();

        let devices = DevicePair::checked(config.rank(), runtime.device_count())?;
        let budget = MemoryBudget::for_pair(devices, MAX_MEMORY_PER_DEVICE);
        let modules = model.modules();
        let mut placement = runtime.solve_placement(&modules, &budget, NO_SPLIT_MODULE_CLASSES)?;

        // the head and the projection meet where image and text features fuse
        placement.pin(LM_HEAD_MODULE, devices.primary);
        placement.pin(PROJECTION_MODULE, devices.primary);
        placement.validate(&modules)?;
        info!(?placement, "device placement resolved");

        model
            .dispatch(&placement)
            .map_err(PlacementError::Dispatch)?;
        model.eval();

        warn!(?params, "using generation config");

        Ok(Self {
            variant,
            model,
            params,
            devices,
            placement,
            load_report,
        })
    }

    /// Generate a response for `message`. `dataset` is accepted for parity
    /// with other adapters and does not change the prompt.
    #[tracing::instrument(name = "PandaGpt::generate", err(Debug), skip_all, fields(dataset = dataset))]
    pub fn generate(&self, message: &Message, dataset: Option<&str>) -> PandaGptResult<String> {
        let input = message.to_prompt_image()?;
        let request = GenerationRequest::new(input, self.params.clone());

        self.model
            .generate(&request)
            .map_err(PandaGptError::Generation)
    }

    pub fn variant(&self) -> ModelVariant {
        self.variant
    }

    pub fn params(&self) -> &GenerationParams {
        &self.params
    }

    pub fn devices(&self) -> DevicePair {
        self.devices
    }

    pub fn placement(&self) -> &DevicePlacement {
        &self.placement
    }

    pub fn load_report(&self) -> &LoadReport {
        &self.load_report
    }

    pub fn model(&self) -> &M {
        &self.model
    }
}

impl<M> Model for PandaGpt<M>
where
    M: MultimodalModel + Send,
{
    type Item = VisionLanguageInput;
    type Output = VisionLanguageOutput;

    fn batch_size_limit(&self) -> usize {
        1
    }

    async fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> anyhow::Result<Vec<anyhow::Result<Self::Output>>> {
        let results = items
            .into_iter()
            .map(|item| {
                self.generate(&item.message, item.dataset.as_deref())
                    .map_err(anyhow::Error::from)
            })
            .collect();

        Ok(results)
    }
}

/// Construct PandaGPT on a dedicated worker and return a handle that
/// serializes generation calls.
pub async fn spawn_vision_language_model<R>(
    runtime: R,
    config: PandaGptConfig,
) -> anyhow::Result<VisionLanguageModel>
where
    R: PandaGptRuntime + Send + 'static,
    R::Model: Send + 'static,
{
    AIModel::new(config.name.clone(), move || async move {
        Ok(PandaGpt::new(&runtime, &config)?)
    })
    .await
}
