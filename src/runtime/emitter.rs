// retrace_interceptor::runtime::emitter
//
// One typed publish/subscribe utility shared by the sandboxes, instead of a
// hand-rolled emitter per component.  Subscribers are `Rc` closures so a
// handler can be invoked while the emitter's owner is borrowed elsewhere.

use std::rc::Rc;

pub struct Emitter<E> {
    listeners: Vec<Rc<dyn Fn(&E)>>,
}

impl<E> Emitter<E> {
    pub fn new() -> Self {
        Emitter {
            listeners: Vec::new(),
        }
    }

    pub fn on(&mut self, listener: impl Fn(&E) + 'static) {
        self.listeners.push(Rc::new(listener));
    }

    pub fn emit(&self, event: &E) {
        // Clone the list so a listener adding listeners cannot invalidate
        // the iteration.
        let listeners = self.listeners.clone();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl<E> Default for Emitter<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Emitter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
