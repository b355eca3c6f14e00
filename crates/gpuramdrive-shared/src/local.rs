//! In-process named objects
//!
//! Mirrors the semantics of the Windows object namespace inside a single
//! process: a name exists while at least one handle to it is open, creating
//! an existing section fails, creating an existing event opens it. Used to
//! run the server against a simulated driver on any platform.

use crate::channel::{ChannelError, Namespace, ServerLock, SharedMapping, Signal};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

/// Namespace backed by a process-wide registry
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalNamespace;

#[derive(Default)]
struct Registry {
    mappings: HashMap<String, Weak<LocalRegion>>,
    locks: HashMap<String, Weak<()>>,
    signals: HashMap<String, Weak<LocalSignal>>,
}

fn registry() -> MutexGuard<'static, Registry> {
    static REGISTRY: OnceLock<Mutex<Registry>> = OnceLock::new();
    REGISTRY
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Zeroed heap region addressed only through raw pointers, so handles on
/// different threads never hold overlapping references to it
struct LocalRegion {
    base: *mut u8,
    len: usize,
}

impl LocalRegion {
    fn new(size: usize) -> Self {
        let data = vec![0u8; size].into_boxed_slice();
        let len = data.len();
        let base = Box::into_raw(data) as *mut u8;
        Self { base, len }
    }
}

impl Drop for LocalRegion {
    fn drop(&mut self) {
        // SAFETY: `base` and `len` came from `Box::into_raw` in `new`
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                self.base, self.len,
            )));
        }
    }
}

// SAFETY: access to the bytes is turn-based through the request/response
// events, the same discipline a real cross-process section relies on.
unsafe impl Send for LocalRegion {}
unsafe impl Sync for LocalRegion {}

struct LocalMapping {
    region: Arc<LocalRegion>,
}

impl SharedMapping for LocalMapping {
    fn base(&self) -> *mut u8 {
        self.region.base
    }

    fn len(&self) -> usize {
        self.region.len
    }
}

struct LocalServerLock {
    _token: Arc<()>,
}

impl ServerLock for LocalServerLock {}

/// Auto-reset event
struct LocalSignal {
    name: String,
    set: Mutex<bool>,
    cond: Condvar,
}

impl Signal for LocalSignal {
    fn wait(&self, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let guard = self.set.lock().unwrap_or_else(PoisonError::into_inner);
        let mut guard = match timeout {
            None => self
                .cond
                .wait_while(guard, |set| !*set)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => {
                let (guard, result) = self
                    .cond
                    .wait_timeout_while(guard, timeout, |set| !*set)
                    .unwrap_or_else(PoisonError::into_inner);
                if result.timed_out() && !*guard {
                    return Err(ChannelError::Timeout(self.name.clone()));
                }
                guard
            }
        };
        *guard = false;
        Ok(())
    }

    fn set(&self) -> Result<(), ChannelError> {
        *self.set.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.cond.notify_one();
        Ok(())
    }
}

impl Namespace for LocalNamespace {
    fn create_mapping(
        &self,
        name: &str,
        size: usize,
    ) -> Result<Box<dyn SharedMapping>, ChannelError> {
        let mut registry = registry();
        registry.mappings.retain(|_, region| region.strong_count() > 0);
        if registry.mappings.contains_key(name) {
            return Err(ChannelError::AlreadyRunning(name.to_string()));
        }

        let region = Arc::new(LocalRegion::new(size));
        registry
            .mappings
            .insert(name.to_string(), Arc::downgrade(&region));
        Ok(Box::new(LocalMapping { region }))
    }

    fn create_server_lock(&self, name: &str) -> Result<Box<dyn ServerLock>, ChannelError> {
        let mut registry = registry();
        registry.locks.retain(|_, token| token.strong_count() > 0);
        if registry.locks.contains_key(name) {
            return Err(ChannelError::AlreadyRunning(name.to_string()));
        }

        let token = Arc::new(());
        registry.locks.insert(name.to_string(), Arc::downgrade(&token));
        Ok(Box::new(LocalServerLock { _token: token }))
    }

    fn create_signal(&self, name: &str) -> Result<Arc<dyn Signal>, ChannelError> {
        let mut registry = registry();
        if let Some(existing) = registry.signals.get(name).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        registry.signals.retain(|_, signal| signal.strong_count() > 0);

        let signal = Arc::new(LocalSignal {
            name: name.to_string(),
            set: Mutex::new(false),
            cond: Condvar::new(),
        });
        registry
            .signals
            .insert(name.to_string(), Arc::downgrade(&signal));
        Ok(signal)
    }

    fn open_mapping(&self, name: &str) -> Result<Box<dyn SharedMapping>, ChannelError> {
        let registry = registry();
        registry
            .mappings
            .get(name)
            .and_then(Weak::upgrade)
            .map(|region| Box::new(LocalMapping { region }) as Box<dyn SharedMapping>)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))
    }

    fn open_signal(&self, name: &str) -> Result<Arc<dyn Signal>, ChannelError> {
        let registry = registry();
        registry
            .signals
            .get(name)
            .and_then(Weak::upgrade)
            .map(|signal| signal as Arc<dyn Signal>)
            .ok_or_else(|| ChannelError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(prefix: &str) -> String {
        use std::sync::atomic::{AtomicU32, Ordering};
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        format!("{}{}", prefix, COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    #[test]
    fn test_mapping_shared_between_handles() {
        let name = unique_name("LocalMap");
        let created = LocalNamespace.create_mapping(&name, 64).unwrap();
        let opened = LocalNamespace.open_mapping(&name).unwrap();
        assert_eq!(created.len(), 64);

        unsafe { *created.base().add(10) = 0x42 };
        assert_eq!(unsafe { *opened.base().add(10) }, 0x42);
    }

    #[test]
    fn test_handles_see_same_view() {
        let name = unique_name("LocalMap");
        let created = LocalNamespace.create_mapping(&name, 4096).unwrap();
        let opened = LocalNamespace.open_mapping(&name).unwrap();
        assert_eq!(created.base(), opened.base());
        assert_eq!(opened.len(), 4096);

        // zeroed on creation, writable up to the last byte
        let last = unsafe { created.base().add(4095) };
        assert_eq!(unsafe { *last }, 0);
        unsafe { *last = 0xEE };
        assert_eq!(unsafe { *opened.base().add(4095) }, 0xEE);
    }

    #[test]
    fn test_mapping_name_lives_while_any_handle_open() {
        let name = unique_name("LocalMap");
        let created = LocalNamespace.create_mapping(&name, 16).unwrap();
        let opened = LocalNamespace.open_mapping(&name).unwrap();
        drop(created);

        assert!(matches!(
            LocalNamespace.create_mapping(&name, 16),
            Err(ChannelError::AlreadyRunning(_))
        ));
        drop(opened);
        assert!(LocalNamespace.create_mapping(&name, 16).is_ok());
    }

    #[test]
    fn test_server_lock_exclusive() {
        let name = unique_name("LocalLock");
        let lock = LocalNamespace.create_server_lock(&name).unwrap();
        assert!(LocalNamespace.create_server_lock(&name).is_err());
        drop(lock);
        assert!(LocalNamespace.create_server_lock(&name).is_ok());
    }

    #[test]
    fn test_signal_auto_reset() {
        let name = unique_name("LocalEvent");
        let signal = LocalNamespace.create_signal(&name).unwrap();
        let opened = LocalNamespace.open_signal(&name).unwrap();

        opened.set().unwrap();
        signal.wait(Some(Duration::from_millis(10))).unwrap();
        // consumed by the first wait
        assert!(matches!(
            signal.wait(Some(Duration::from_millis(10))),
            Err(ChannelError::Timeout(_))
        ));
    }

    #[test]
    fn test_signal_wakes_blocked_waiter() {
        let name = unique_name("LocalEvent");
        let signal = LocalNamespace.create_signal(&name).unwrap();
        let waiter = {
            let signal = signal.clone();
            std::thread::spawn(move || signal.wait(None))
        };

        std::thread::sleep(Duration::from_millis(10));
        signal.set().unwrap();
        assert!(waiter.join().unwrap().is_ok());
    }
}
