//! In-memory window host for tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{WindowContext, WindowError, WindowHost, WindowId, WindowSpec};

#[derive(Debug, Default)]
struct HostState {
    live: HashMap<WindowId, WindowSpec>,
    created: Vec<WindowSpec>,
    updates: HashMap<WindowId, Vec<WindowContext>>,
    focused: Vec<WindowId>,
    fail_next_create: bool,
}

/// Mock window host for testing.
#[derive(Debug, Default)]
pub struct MockWindowHost {
    state: Mutex<HostState>,
}

impl MockWindowHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `create` fail with a native error.
    pub fn fail_next_create(&self) {
        self.state().fail_next_create = true;
    }

    /// Destroys a window without telling the registry.
    pub fn destroy_silently(&self, id: WindowId) {
        self.state().live.remove(&id);
    }

    /// Windows currently open.
    pub fn live(&self) -> Vec<WindowSpec> {
        self.state().live.values().cloned().collect()
    }

    /// Every window ever created, in order.
    pub fn created(&self) -> Vec<WindowSpec> {
        self.state().created.clone()
    }

    /// Contexts pushed to `id`.
    pub fn updates(&self, id: WindowId) -> Vec<WindowContext> {
        self.state().updates.get(&id).cloned().unwrap_or_default()
    }

    /// Number of times `id` was focused.
    pub fn focus_count(&self, id: WindowId) -> usize {
        self.state().focused.iter().filter(|f| **f == id).count()
    }
}

impl WindowHost for MockWindowHost {
    fn create(&self, spec: &WindowSpec) -> Result<(), WindowError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_create) {
            return Err(WindowError::Native("mock create failure".into()));
        }
        state.live.insert(spec.id, spec.clone());
        state.created.push(spec.clone());
        Ok(())
    }

    fn focus(&self, id: WindowId) -> Result<(), WindowError> {
        let mut state = self.state();
        if !state.live.contains_key(&id) {
            return Err(WindowError::Stale(id));
        }
        state.focused.push(id);
        Ok(())
    }

    fn send_update(&self, id: WindowId, context: &WindowContext) -> Result<(), WindowError> {
        let mut state = self.state();
        if !state.live.contains_key(&id) {
            return Err(WindowError::Stale(id));
        }
        state.updates.entry(id).or_default().push(context.clone());
        Ok(())
    }

    fn is_live(&self, id: WindowId) -> bool {
        self.state().live.contains_key(&id)
    }

    fn close(&self, id: WindowId) -> Result<(), WindowError> {
        self.state()
            .live
            .remove(&id)
            .map(|_| ())
            .ok_or(WindowError::Stale(id))
    }
}
