//! Signal registry: the names this instance is allowed to `emit`.

use dashmap::DashSet;

/// Tracks locally-declared signal names. `emit()` refuses to publish an
/// unregistered name so a typo surfaces immediately rather than as a
/// silently-dropped broadcast.
#[derive(Default)]
pub struct SignalRegistry {
    names: DashSet<String>,
}

impl SignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) {
        self.names.insert(name.to_string());
    }

    pub fn has(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_signal_is_known() {
        let registry = SignalRegistry::new();
        registry.register("signalStateChanged");
        assert!(registry.has("signalStateChanged"));
        assert!(!registry.has("signalUnregistered"));
    }
}
