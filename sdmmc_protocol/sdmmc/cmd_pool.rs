use std::sync::Mutex;

use crate::sdmmc::{SdmmcCmd, SdmmcError};

/// Fixed-capacity command allocator.
///
/// Commands are handed to exactly one caller at a time and must come back
/// through [`CmdPool::free`] from that same caller, timeout or not. An
/// empty pool is reported as `ENOMEM` with nothing committed.
pub struct CmdPool {
    free: Mutex<Vec<Box<SdmmcCmd>>>,
    capacity: usize,
}

impl CmdPool {
    pub fn new(capacity: usize) -> CmdPool {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            free.push(Box::new(SdmmcCmd::idle()));
        }
        CmdPool {
            free: Mutex::new(free),
            capacity,
        }
    }

    pub fn alloc(&self) -> Result<Box<SdmmcCmd>, SdmmcError> {
        self.free
            .lock()
            .unwrap()
            .pop()
            .ok_or(SdmmcError::ENOMEM)
    }

    pub fn free(&self, mut cmd: Box<SdmmcCmd>) {
        cmd.reset();
        let mut free = self.free.lock().unwrap();
        debug_assert!(free.len() < self.capacity);
        free.push(cmd);
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
