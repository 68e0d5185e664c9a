mod vision_language;

use crate::HandlerPayload;
use std::fmt::Debug;
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
pub use vision_language::*;

pub trait Model {
    type Item;
    type Output;

    fn process(
        &mut self,
        items: Vec<Self::Item>,
    ) -> impl Future<Output = anyhow::Result<Vec<anyhow::Result<Self::Output>>>> + Send;

    fn batch_size_limit(&self) -> usize;
}

pub type BatchHandlerTx<Item, Output> = mpsc::Sender<HandlerPayload<Item, Output>>;

/// Handle to a model owned by a dedicated worker thread.
///
/// The model is built once when the handle is created and dropped when the
/// last clone of the handle goes away. Batches are executed strictly one at
/// a time, so concurrent callers never reach the model simultaneously.
#[derive(Debug)]
pub struct AIModel<TItem, TOutput> {
    model_id: String, // for better logging
    tx: BatchHandlerTx<TItem, TOutput>,
}

impl<TItem, TOutput> Clone for AIModel<TItem, TOutput> {
    fn clone(&self) -> Self {
        Self {
            model_id: self.model_id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<TItem, TOutput> AIModel<TItem, TOutput>
where
    TItem: Send + Sync + Clone + Debug + 'static,
    TOutput: Send + Sync + Debug + 'static,
{
    pub async fn new<T, TFut, TFn>(model_id: String, create_model: TFn) -> anyhow::Result<Self>
    where
        T: Model<Item = TItem, Output = TOutput> + 'static,
        TFut: Future<Output = anyhow::Result<T>> + 'static,
        TFn: FnOnce() -> TFut + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<HandlerPayload<TItem, TOutput>>(512);
        let (ready_tx, ready_rx) = oneshot::channel::<anyhow::Result<()>>();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let worker_model_id = model_id.clone();
        std::thread::spawn(move || {
            let local = tokio::task::LocalSet::new();

            local.spawn_local(async move {
                let mut model = match create_model().await {
                    Ok(model) => {
                        tracing::info!(model_id = %worker_model_id, "model ready");
                        let _ = ready_tx.send(Ok(()));
                        model
                    }
                    Err(e) => {
                        tracing::error!(model_id = %worker_model_id, "failed to load model: {:?}", e);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Some((items, result_tx)) = rx.recv().await {
                    // If channel closed,
                    // we have no way to response, just ignore task.
                    if result_tx.is_closed() {
                        tracing::debug!("result receiver dropped, skip batch");
                        continue;
                    }

                    let results = process_in_chunks(&mut model, items).await;

                    if result_tx.send(results).is_err() {
                        tracing::error!("failed to send results");
                    }
                }

                // all tx has been dropped
                tracing::info!(model_id = %worker_model_id, "all handles dropped, release model");
            });

            rt.block_on(local);
        });

        match ready_rx.await {
            Ok(result) => result?,
            Err(e) => anyhow::bail!("model worker exited before ready: {:?}", e),
        }

        Ok(Self { model_id, tx })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    #[tracing::instrument(name = "AIModel::process", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process(&self, items: Vec<TItem>) -> anyhow::Result<Vec<anyhow::Result<TOutput>>> {
        let (result_tx, rx) = oneshot::channel();
        match self.tx.send((items, result_tx)).await {
            Ok(_) => {
                tracing::debug!("items sent to model");
            }
            Err(e) => {
                anyhow::bail!("failed to send items: {:?}", e);
            }
        }

        match rx.await {
            Ok(result) => result,
            Err(e) => {
                anyhow::bail!("failed to receive results: {:?}", e);
            }
        }
    }

    #[tracing::instrument(name = "AIModel::process_single", err(Debug), skip_all, fields(model_id=%self.model_id))]
    pub async fn process_single(&self, item: TItem) -> anyhow::Result<TOutput> {
        let results = self.process(vec![item]).await?;
        let result = results
            .into_iter()
            .next()
            .ok_or(anyhow::anyhow!("no result"))??;
        Ok(result)
    }
}

async fn process_in_chunks<T: Model>(
    model: &mut T,
    mut items: Vec<T::Item>,
) -> anyhow::Result<Vec<anyhow::Result<T::Output>>> {
    let limit = model.batch_size_limit().max(1);
    let mut results = Vec::with_capacity(items.len());

    while !items.is_empty() {
        let rest = items.split_off(limit.min(items.len()));
        results.extend(model.process(items).await?);
        items = rest;
    }

    Ok(results)
}
