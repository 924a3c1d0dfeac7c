//! One-time initialization handshake with the computational module.

use std::rc::Rc;

use crate::module::ModuleHandle;

/// Lifecycle of the module behind the bridge.
///
/// Readiness is monotonic for the lifetime of one bridge instance: there is no
/// transition out of `Ready` except the terminal `Failed`, and a failed module
/// is never restarted in place (the owning collaborator recreates the whole
/// bridge+module pair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleState {
    /// Module bootstrap is underway. Begins at construction and covers the
    /// window until the internal Initialize round-trip completes, so user
    /// calls accepted here are queued, not dispatched.
    Starting,
    /// Initialize has completed; calls dispatch immediately.
    Ready,
    /// The module signalled a fatal abort. Terminal.
    Failed { reason: String },
}

/// Owns the module handle and the state machine above. The bridge reaches the
/// module only through this controller, never through an ambient global.
pub(crate) struct ModuleLifecycle {
    state: ModuleState,
    module: Option<Rc<dyn ModuleHandle>>,
}

impl ModuleLifecycle {
    pub fn new() -> Self {
        Self {
            state: ModuleState::Starting,
            module: None,
        }
    }

    /// Startup-complete signal: installs the module handle so the internal
    /// Initialize call can be dispatched. The state stays `Starting` until
    /// the Initialize reply is intercepted. Returns `false` for a duplicate
    /// signal or one arriving after `Failed`.
    pub fn module_loaded(&mut self, module: Rc<dyn ModuleHandle>) -> bool {
        if self.module.is_some() || self.state != ModuleState::Starting {
            return false;
        }
        self.module = Some(module);
        true
    }

    /// `Starting -> Ready`, exactly once, and only after `module_loaded`.
    pub fn mark_ready(&mut self) -> bool {
        if self.state != ModuleState::Starting || self.module.is_none() {
            return false;
        }
        self.state = ModuleState::Ready;
        true
    }

    /// Any state but `Failed` -> `Failed`. Drops the module handle: nothing
    /// may call into an aborted module.
    pub fn fail(&mut self, reason: String) -> bool {
        if matches!(self.state, ModuleState::Failed { .. }) {
            return false;
        }
        self.state = ModuleState::Failed { reason };
        self.module = None;
        true
    }

    pub fn is_ready(&self) -> bool {
        self.state == ModuleState::Ready
    }

    pub fn state(&self) -> &ModuleState {
        &self.state
    }

    /// The live module reference. `Some` from `module_loaded` until `fail`.
    pub fn module(&self) -> Option<Rc<dyn ModuleHandle>> {
        self.module.clone()
    }
}
