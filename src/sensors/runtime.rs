//! In-process host for the built-in sensor modules.

use super::producer::SensorModule;
use crate::lifecycle::{LaunchError, ModuleRuntime};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

type Factory = Box<dyn Fn() -> Box<dyn SensorModule> + Send + Sync>;

/// Starts and stops registered sensor modules by id.
///
/// Every start builds a fresh module from its factory. Settings fixed at
/// build time, such as the device id, take effect on the next start;
/// `debug_db_slow` is read by each buffer at flush time.
#[derive(Default)]
pub struct SensorRuntime {
    factories: BTreeMap<String, Factory>,
    active: Mutex<HashMap<String, Box<dyn SensorModule>>>,
}

impl SensorRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module factory under `id`, replacing any previous one.
    pub fn register<F>(mut self, id: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn SensorModule> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Box::new(factory));
        self
    }

    pub fn registered(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn is_active(&self, module: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(module)
    }

    /// Ids of modules currently running, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Stop every running module.
    pub fn stop_all(&self) {
        let drained: Vec<(String, Box<dyn SensorModule>)> = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (id, mut module) in drained {
            module.stop();
            debug!(module = %id, "sensor module stopped");
        }
    }
}

impl ModuleRuntime for SensorRuntime {
    fn start(&self, module: &str) -> Result<(), LaunchError> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains_key(module) {
            return Ok(());
        }
        let factory = self.factories.get(module).ok_or(LaunchError::NotFound)?;
        let mut instance = factory();
        instance.start()?;
        active.insert(module.to_string(), instance);
        info!(module, "sensor module started");
        Ok(())
    }

    fn stop(&self, module: &str) -> Result<bool, LaunchError> {
        let instance = self
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
        match instance {
            Some(mut instance) => {
                instance.stop();
                info!(module, "sensor module stopped");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn is_running(&self, module: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(module)
            .is_some_and(|instance| instance.is_running())
    }
}

impl Drop for SensorRuntime {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Flag {
        running: bool,
        absent: bool,
        starts: Arc<AtomicUsize>,
    }

    impl SensorModule for Flag {
        fn start(&mut self) -> Result<(), LaunchError> {
            if self.absent {
                return Err(LaunchError::HardwareAbsent("test".to_string()));
            }
            self.starts.fetch_add(1, Ordering::SeqCst);
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.running = false;
        }

        fn is_running(&self) -> bool {
            self.running
        }
    }

    fn runtime(starts: Arc<AtomicUsize>) -> SensorRuntime {
        let present = starts.clone();
        SensorRuntime::new()
            .register("barometer", move || {
                Box::new(Flag {
                    running: false,
                    absent: false,
                    starts: present.clone(),
                })
            })
            .register("gyroscope", move || {
                Box::new(Flag {
                    running: false,
                    absent: true,
                    starts: starts.clone(),
                })
            })
    }

    #[test]
    fn test_start_is_idempotent() {
        let starts = Arc::new(AtomicUsize::new(0));
        let rt = runtime(starts.clone());

        rt.start("barometer").unwrap();
        rt.start("barometer").unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(rt.active(), vec!["barometer".to_string()]);
    }

    #[test]
    fn test_stop_reports_whether_running() {
        let rt = runtime(Arc::new(AtomicUsize::new(0)));
        rt.start("barometer").unwrap();
        assert!(rt.is_running("barometer"));
        assert_eq!(rt.stop("barometer"), Ok(true));
        assert_eq!(rt.stop("barometer"), Ok(false));
        assert!(!rt.is_active("barometer"));
        assert!(!rt.is_running("barometer"));
    }

    #[test]
    fn test_unknown_and_absent_modules() {
        let rt = runtime(Arc::new(AtomicUsize::new(0)));
        assert_eq!(rt.start("light"), Err(LaunchError::NotFound));
        assert!(matches!(
            rt.start("gyroscope"),
            Err(LaunchError::HardwareAbsent(_))
        ));
        assert!(rt.active().is_empty());
    }
}
