//! Controller registry. An explicit object owned by the process entry
//! point and passed by handle to every lookup; there is no global mutable
//! state anywhere in this stack.

use std::sync::{Arc, Mutex};

use crate::sdmmc::{SdmmcConfig, SdmmcController, SdmmcError};
use crate::sdmmc_traits::SdmmcHardware;

#[derive(Default)]
pub struct SdmmcRegistry {
    controllers: Mutex<Vec<Arc<SdmmcController>>>,
}

impl SdmmcRegistry {
    pub fn new() -> Arc<SdmmcRegistry> {
        Arc::new(SdmmcRegistry::default())
    }

    /// Attach a controller and record it. The index into the registry is
    /// stable for the registry's lifetime.
    pub fn attach(
        &self,
        config: SdmmcConfig,
        hardware: Box<dyn SdmmcHardware + Send>,
    ) -> Result<Arc<SdmmcController>, SdmmcError> {
        let controller = SdmmcController::attach(config, hardware)?;
        self.controllers.lock().unwrap().push(controller.clone());
        Ok(controller)
    }

    /// Snapshot of the attached controllers, O(n).
    pub fn controllers(&self) -> Vec<Arc<SdmmcController>> {
        self.controllers.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.controllers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Arc<SdmmcController>> {
        self.controllers.lock().unwrap().get(index).cloned()
    }

    /// Detach a controller, waiting for any pending removal teardown to
    /// finish first.
    pub fn detach(&self, index: usize) -> Result<(), SdmmcError> {
        let controller = {
            let mut controllers = self.controllers.lock().unwrap();
            if index >= controllers.len() {
                return Err(SdmmcError::EINVAL);
            }
            controllers.remove(index)
        };
        controller.wait_teardown();
        Ok(())
    }
}
