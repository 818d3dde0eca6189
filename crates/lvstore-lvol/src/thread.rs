//! Completion-callback front end
//!
//! Every lifecycle operation on an `LvolThread` is checked synchronously
//! and then posted as one unit of work to a single worker task. A request
//! that fails its synchronous check returns `Err` and its callback is never
//! called; a request that is accepted calls its callback exactly once, from
//! the worker, in posting order.
//!
//! Resize is the one exception: the blob store resizes synchronously, so a
//! blob store failure there is both returned and delivered to the callback.

use crate::error::{LvolError, LvolResult, Step};
use crate::lvol::Lvol;
use crate::lvs::{LvolStore, Teardown};
use crate::manager::{LvolManager, check_device};
use futures::future::{BoxFuture, FutureExt};
use lvstore_blob::BsDev;
use lvstore_common::LvsOpts;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

type Unit = BoxFuture<'static, ()>;

/// Serialized executor for lvol and store lifecycle requests
pub struct LvolThread {
    manager: Arc<LvolManager>,
    tx: mpsc::UnboundedSender<Unit>,
    worker: JoinHandle<()>,
}

impl LvolThread {
    /// Start the worker on the current runtime
    #[must_use]
    pub fn spawn(manager: Arc<LvolManager>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Unit>();
        let worker = tokio::spawn(async move {
            while let Some(unit) = rx.recv().await {
                unit.await;
            }
            debug!("Lvol thread stopped");
        });
        Self {
            manager,
            tx,
            worker,
        }
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<LvolManager> {
        &self.manager
    }

    /// Run everything already posted, then stop the worker
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker.await {
            debug!("Lvol thread ended abnormally: {}", e);
        }
    }

    fn post<F>(&self, unit: F) -> LvolResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tx
            .send(unit.boxed())
            .map_err(|_| LvolError::invalid_argument("lvol thread has stopped"))
    }

    /// Initialize a new store on `dev`
    pub fn lvs_init<F>(
        &self,
        dev: Option<Arc<dyn BsDev>>,
        opts: LvsOpts,
        cb: F,
    ) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<Arc<LvolStore>>) + Send + 'static,
    {
        let dev = dev.ok_or_else(|| LvolError::invalid_argument("no device given"))?;
        check_device(dev.as_ref())?;
        let manager = Arc::clone(&self.manager);
        self.post(async move { cb(manager.init(dev, &opts).await) })
    }

    /// Load the store found on `dev`
    pub fn lvs_load<F>(&self, dev: Option<Arc<dyn BsDev>>, cb: F) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<Arc<LvolStore>>) + Send + 'static,
    {
        let dev = dev.ok_or_else(|| LvolError::invalid_argument("no device given"))?;
        let manager = Arc::clone(&self.manager);
        self.post(async move { cb(manager.load(dev).await) })
    }

    pub fn lvs_unload<F>(&self, lvs: Option<Arc<LvolStore>>, cb: F) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<()>) + Send + 'static,
    {
        let lvs = lvs.ok_or(LvolError::NoDevice {
            step: Step::BsUnload,
            status: None,
        })?;
        lvs.check_teardown_allowed(Teardown::Unload)?;
        let manager = Arc::clone(&self.manager);
        self.post(async move { cb(manager.unload(&lvs).await) })
    }

    pub fn lvs_destroy<F>(
        &self,
        lvs: Option<Arc<LvolStore>>,
        unmap_device: bool,
        cb: F,
    ) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<()>) + Send + 'static,
    {
        let lvs = lvs.ok_or(LvolError::NoDevice {
            step: Step::BsDestroy,
            status: None,
        })?;
        lvs.check_teardown_allowed(Teardown::Destroy)?;
        let manager = Arc::clone(&self.manager);
        self.post(async move { cb(manager.destroy(&lvs, unmap_device).await) })
    }

    /// Create an lvol; the callback receives it open once
    pub fn lvol_create<F>(
        &self,
        lvs: Option<Arc<LvolStore>>,
        size_bytes: u64,
        cb: F,
    ) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<Arc<Lvol>>) + Send + 'static,
    {
        let lvs = lvs.ok_or_else(|| LvolError::invalid_argument("no lvol store given"))?;
        lvs.check_create(size_bytes)?;
        self.post(async move { cb(lvs.create_lvol(size_bytes).await) })
    }

    pub fn lvol_open<F>(&self, lvol: &Arc<Lvol>, cb: F) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<()>) + Send + 'static,
    {
        lvol.check_open()?;
        let lvol = Arc::clone(lvol);
        self.post(async move { cb(lvol.open().await) })
    }

    pub fn lvol_close<F>(&self, lvol: &Arc<Lvol>, cb: F) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<()>) + Send + 'static,
    {
        lvol.check_close()?;
        let lvol = Arc::clone(lvol);
        self.post(async move { cb(lvol.close().await) })
    }

    pub fn lvol_resize<F>(&self, lvol: &Arc<Lvol>, size_bytes: u64, cb: F) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<()>) + Send + 'static,
    {
        let pending = match lvol.begin_resize(size_bytes) {
            Ok(pending) => pending,
            Err(e @ LvolError::Backend { .. }) => {
                let status = e.clone();
                self.post(async move { cb(Err(status)) })?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let lvol = Arc::clone(lvol);
        self.post(async move { cb(lvol.finish_resize(pending).await) })
    }

    pub fn lvol_destroy<F>(&self, lvol: &Arc<Lvol>, cb: F) -> LvolResult<()>
    where
        F: FnOnce(LvolResult<()>) + Send + 'static,
    {
        lvol.check_destroy()?;
        let lvol = Arc::clone(lvol);
        self.post(async move { cb(lvol.destroy().await) })
    }
}
