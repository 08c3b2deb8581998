//! One-time model loading shared by every request.
//!
//! The first caller moves the loader from `Unloaded` (or `Failed`) to
//! `Loading` under the slot lock and spawns the load on its own task; every
//! other caller subscribes to the same outcome channel. The slot is updated
//! before the outcome is published, so a woken waiter never observes a
//! half-finished transition.

use crate::error::{Error, Result};
use crate::model::{ModelHandle, ModelProvider};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::watch;

type LoadOutcome = std::result::Result<Arc<ModelHandle>, String>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ModelState {
    Unloaded,
    Loading,
    Loaded,
    Failed(String),
}

enum Slot {
    Unloaded,
    Loading(watch::Receiver<Option<LoadOutcome>>),
    Loaded(Arc<ModelHandle>),
    Failed(String),
}

#[derive(Clone)]
pub struct ModelLoader {
    inner: Arc<LoaderInner>,
}

struct LoaderInner {
    provider: Arc<dyn ModelProvider>,
    slot: Mutex<Slot>,
}

enum Join {
    Ready(Arc<ModelHandle>),
    Wait(watch::Receiver<Option<LoadOutcome>>),
}

impl ModelLoader {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                provider,
                slot: Mutex::new(Slot::Unloaded),
            }),
        }
    }

    pub fn state(&self) -> ModelState {
        match &*self.inner.lock_slot() {
            Slot::Unloaded => ModelState::Unloaded,
            Slot::Loading(_) => ModelState::Loading,
            Slot::Loaded(_) => ModelState::Loaded,
            Slot::Failed(reason) => ModelState::Failed(reason.clone()),
        }
    }

    /// The handle if loading already finished successfully.
    pub fn loaded(&self) -> Option<Arc<ModelHandle>> {
        match &*self.inner.lock_slot() {
            Slot::Loaded(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub async fn ensure_loaded(&self) -> Result<Arc<ModelHandle>> {
        let mut rx = match self.join_or_start() {
            Join::Ready(handle) => return Ok(handle),
            Join::Wait(rx) => rx,
        };
        let outcome = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::ModelLoad("model load ended without an outcome".into()))?
            .clone();
        match outcome {
            Some(Ok(handle)) => Ok(handle),
            Some(Err(reason)) => Err(Error::ModelLoad(reason)),
            None => Err(Error::ModelLoad("model load ended without an outcome".into())),
        }
    }

    fn join_or_start(&self) -> Join {
        let mut slot = self.inner.lock_slot();
        match &*slot {
            Slot::Loaded(handle) => return Join::Ready(handle.clone()),
            Slot::Loading(rx) => return Join::Wait(rx.clone()),
            Slot::Unloaded | Slot::Failed(_) => {}
        }
        let (tx, rx) = watch::channel(None);
        *slot = Slot::Loading(rx.clone());
        drop(slot);

        // Detached so a caller dropping its future cannot strand `Loading`.
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.run_load(tx).await });
        Join::Wait(rx)
    }
}

impl LoaderInner {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn run_load(&self, tx: watch::Sender<Option<LoadOutcome>>) {
        let provider = self.provider.clone();
        let source = provider.describe();
        log::info!("Loading recognition model from {source}");
        let started = Instant::now();

        let outcome: LoadOutcome = match tokio::task::spawn_blocking(move || {
            let handle = provider.load()?;
            handle.warm_up()?;
            Ok::<_, Error>(handle)
        })
        .await
        {
            Ok(Ok(handle)) => Ok(Arc::new(handle)),
            Ok(Err(err)) => Err(err.to_string()),
            Err(err) => Err(format!("model load task failed: {err}")),
        };

        match &outcome {
            Ok(handle) => log::info!(
                "Loaded and warmed model from {source} in {}ms ({}, {} labels)",
                started.elapsed().as_millis(),
                handle.provider_label(),
                handle.labels().len()
            ),
            Err(reason) => log::warn!("Failed to load model from {source}: {reason}"),
        }

        {
            let mut slot = self.lock_slot();
            *slot = match &outcome {
                Ok(handle) => Slot::Loaded(handle.clone()),
                Err(reason) => Slot::Failed(reason.clone()),
            };
        }
        tx.send_replace(Some(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedProvider;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_calls_load_once() {
        let provider = Arc::new(ScriptedProvider::new(vec![0.2, 0.8]).with_delay(Duration::from_millis(150)));
        let loader = ModelLoader::new(provider.clone());

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move { loader.ensure_loaded().await }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap().unwrap());
        }

        assert_eq!(provider.loads(), 1);
        assert_eq!(provider.predictions(), 1, "warm-up runs exactly once");
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(loader.state(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn loaded_handle_is_reused() {
        let provider = Arc::new(ScriptedProvider::new(vec![1.0]));
        let loader = ModelLoader::new(provider.clone());
        assert_eq!(loader.state(), ModelState::Unloaded);
        assert!(loader.loaded().is_none());

        let first = loader.ensure_loaded().await.unwrap();
        let second = loader.ensure_loaded().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(loader.loaded().is_some());
        assert_eq!(provider.loads(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn failure_reaches_every_waiter_then_retries() {
        let provider = Arc::new(
            ScriptedProvider::new(vec![0.5])
                .with_delay(Duration::from_millis(100))
                .failing_first(1),
        );
        let loader = ModelLoader::new(provider.clone());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let loader = loader.clone();
            tasks.push(tokio::spawn(async move { loader.ensure_loaded().await }));
        }
        for task in tasks {
            let res = task.await.unwrap();
            assert!(matches!(res, Err(Error::ModelLoad(_))));
        }
        assert_eq!(provider.loads(), 1);
        assert!(matches!(loader.state(), ModelState::Failed(_)));

        let handle = loader.ensure_loaded().await;
        assert!(handle.is_ok());
        assert_eq!(provider.loads(), 2);
        assert_eq!(loader.state(), ModelState::Loaded);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn abandoned_caller_does_not_strand_the_load() {
        let provider = Arc::new(ScriptedProvider::new(vec![0.5]).with_delay(Duration::from_millis(100)));
        let loader = ModelLoader::new(provider.clone());

        let early = {
            let loader = loader.clone();
            tokio::spawn(async move { loader.ensure_loaded().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        early.abort();

        let handle = loader.ensure_loaded().await;
        assert!(handle.is_ok());
        assert_eq!(provider.loads(), 1);
    }

    #[tokio::test]
    async fn warm_up_failure_counts_as_load_failure() {
        let provider = Arc::new(ScriptedProvider::failing_backend());
        let loader = ModelLoader::new(provider.clone());
        let res = loader.ensure_loaded().await;
        assert!(matches!(res, Err(Error::ModelLoad(_))));
        assert!(matches!(loader.state(), ModelState::Failed(_)));
    }
}
