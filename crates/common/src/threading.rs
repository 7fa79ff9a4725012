use anyhow::{Result, anyhow};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Default)]
struct ThreadRegistryInner {
    next_id: AtomicUsize,
    threads: Mutex<BTreeMap<usize, String>>,
}

/// Names every worker thread the daemon starts so shutdown can report stragglers.
#[derive(Clone, Default)]
pub struct ThreadRegistry {
    inner: Arc<ThreadRegistryInner>,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, name: impl Into<String>, f: F) -> Result<ThreadHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        let join_handle = thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| anyhow!("failed to spawn thread '{name}': {e}"))?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .threads
            .lock()
            .expect("thread registry mutex poisoned")
            .insert(id, name.clone());

        Ok(ThreadHandle {
            name,
            id,
            handle: Some(join_handle),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Names of threads whose handles have not been joined or dropped, in spawn order.
    pub fn active_thread_names(&self) -> Vec<String> {
        self.inner
            .threads
            .lock()
            .expect("thread registry mutex poisoned")
            .values()
            .cloned()
            .collect()
    }
}

pub struct ThreadHandle {
    name: String,
    id: usize,
    handle: Option<JoinHandle<()>>,
    inner: Arc<ThreadRegistryInner>,
}

impl ThreadHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    pub fn join(mut self) -> std::thread::Result<()> {
        self.unregister();
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }

    fn unregister(&self) {
        self.inner
            .threads
            .lock()
            .expect("thread registry mutex poisoned")
            .remove(&self.id);
    }
}

impl Drop for ThreadHandle {
    fn drop(&mut self) {
        // Dropping the JoinHandle detaches the thread.
        self.unregister();
    }
}
