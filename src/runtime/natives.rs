// retrace_interceptor::runtime::natives
//
// Native Method Registry.  Captures the identity of the unwrapped document
// environment once, before page code runs, so the sandboxes can both invoke
// true native behavior and detect when the engine silently recreated it
// (document.open/write wiping overrides on some engines).
//
// Identity is modelled as the DOM's method generation: the platform bumps it
// whenever the environment is rebuilt, exactly like a replaced function no
// longer comparing equal to the captured one.

use log::debug;

use crate::runtime::dom::Dom;

#[derive(Debug, Default)]
pub struct NativeMethodTable {
    captured_generation: u64,
}

impl NativeMethodTable {
    pub fn capture(dom: &Dom) -> Self {
        NativeMethodTable {
            captured_generation: dom.method_generation,
        }
    }

    /// True while the captured methods are still the live ones.
    pub fn is_document_intact(&self, dom: &Dom) -> bool {
        self.captured_generation == dom.method_generation
    }

    /// Re-capture after a detected environment reset.
    pub fn refresh_document_meths(&mut self, dom: &Dom) {
        if self.captured_generation != dom.method_generation {
            debug!(
                "native method table refreshed: generation {} -> {}",
                self.captured_generation, dom.method_generation
            );
            self.captured_generation = dom.method_generation;
        }
    }
}
