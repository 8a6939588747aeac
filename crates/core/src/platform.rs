use std::{
    future::Future,
    path::PathBuf,
    sync::atomic::{AtomicBool, Ordering},
};

use directories::ProjectDirs;
use futures::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Resolves the folder transmissions overflow into.
pub trait FolderProvider: Send + Sync {
    /// `None` when no usable folder exists.
    fn folder(&self) -> Option<PathBuf>;
}

/// A fixed directory, created on first use.
#[derive(Debug, Clone)]
pub struct DirectoryFolderProvider {
    path: Option<PathBuf>,
}

impl DirectoryFolderProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// The platform's local data directory for this library.
    pub fn platform_default() -> Self {
        let path = ProjectDirs::from("", "", "telemetry-channel")
            .map(|dirs| dirs.data_local_dir().join("transmissions"));
        if path.is_none() {
            tracing::warn!("No home directory found, transmission storage is disabled");
        }
        Self { path }
    }
}

impl FolderProvider for DirectoryFolderProvider {
    fn folder(&self) -> Option<PathBuf> {
        let path = self.path.as_ref()?;
        match std::fs::create_dir_all(path) {
            Ok(()) => Some(path.clone()),
            Err(error) => {
                tracing::debug!(?path, %error, "Transmission folder is not accessible");
                None
            }
        }
    }
}

/// Reports whether the host currently has network connectivity.
pub trait NetworkStatus: Send + Sync {
    fn is_available(&self) -> anyhow::Result<bool>;

    /// Notified every time availability may have changed.
    fn subscribe(&self) -> Option<watch::Receiver<()>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAvailable;

impl NetworkStatus for AlwaysAvailable {
    fn is_available(&self) -> anyhow::Result<bool> {
        Ok(true)
    }

    fn subscribe(&self) -> Option<watch::Receiver<()>> {
        None
    }
}

/// Availability driven by the host application, e.g. from OS notifications.
pub struct ManualNetworkStatus {
    available: AtomicBool,
    changed: watch::Sender<()>,
}

impl ManualNetworkStatus {
    pub fn new(available: bool) -> Self {
        let (changed, _) = watch::channel(());
        Self {
            available: AtomicBool::new(available),
            changed,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        self.changed.send_replace(());
    }
}

impl Default for ManualNetworkStatus {
    fn default() -> Self {
        Self::new(true)
    }
}

impl NetworkStatus for ManualNetworkStatus {
    fn is_available(&self) -> anyhow::Result<bool> {
        Ok(self.available.load(Ordering::SeqCst))
    }

    fn subscribe(&self) -> Option<watch::Receiver<()>> {
        Some(self.changed.subscribe())
    }
}

type StoppingHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Process shutdown notification.
///
/// Handlers run once, in registration order, and `stop` returns only after
/// each of them completed.
#[derive(Default)]
pub struct ApplicationLifecycle {
    handlers: Mutex<Vec<StoppingHandler>>,
    stopping: AtomicBool,
}

impl ApplicationLifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stopping<F, Fut>(&self, handler: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.handlers
            .lock()
            .push(Box::new(move || handler().boxed()));
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    pub async fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        let handlers = std::mem::take(&mut *self.handlers.lock());
        tracing::debug!(handlers = handlers.len(), "Application stopping");
        for handler in handlers {
            handler().await;
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::sync::Arc;

    use super::*;

    /// A probe that always fails.
    pub(crate) struct BrokenNetworkStatus;

    impl NetworkStatus for BrokenNetworkStatus {
        fn is_available(&self) -> anyhow::Result<bool> {
            anyhow::bail!("network list manager unavailable")
        }

        fn subscribe(&self) -> Option<watch::Receiver<()>> {
            None
        }
    }

    #[test]
    fn test_directory_provider_creates_folder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("transmissions");
        let provider = DirectoryFolderProvider::new(&path);
        assert_eq!(provider.folder(), Some(path.clone()));
        assert!(path.is_dir());
    }

    #[test]
    fn test_directory_provider_unusable_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let provider = DirectoryFolderProvider::new(file.join("transmissions"));
        assert_eq!(provider.folder(), None);
    }

    #[tokio::test]
    async fn test_manual_network_status_notifies() {
        let status = ManualNetworkStatus::new(true);
        let mut changes = status.subscribe().unwrap();
        status.set_available(false);
        changes.changed().await.unwrap();
        assert!(!status.is_available().unwrap());
    }

    #[tokio::test]
    async fn test_lifecycle_runs_handlers_in_order_once() {
        let lifecycle = ApplicationLifecycle::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            lifecycle.on_stopping(move || async move {
                tokio::task::yield_now().await;
                order.lock().push(i);
            });
        }

        lifecycle.stop().await;
        lifecycle.stop().await;

        assert!(lifecycle.is_stopping());
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }
}
