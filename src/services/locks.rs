use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// One mutex per case id, guarding read-modify-write of its workbook and sidecar.
#[derive(Debug, Default)]
pub struct CaseLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CaseLocks {
    pub fn handle(&self, case_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .lock()
            .entry(case_id.to_string())
            .or_default()
            .clone()
    }

    /// Forgets the mutex of a deleted case.
    pub fn forget(&self, case_id: &str) {
        self.inner.lock().remove(case_id);
    }
}
