//! Service types and their registry.
//!
//! The runtime knows nothing about what a service does; it drives instances
//! of [`Service`] created by a named [`ServiceModule`]. Modules are
//! compiled in and registered on the node before bootstrap (the dynamic
//! loader of other runtimes is replaced by this registry).

use std::sync::Arc;

use parking_lot::RwLock;

use crate::{context::ServiceContext, message::Message};

/// One service instance. A single dispatch runs to completion on one
/// worker; the runtime never re-enters a running instance, so `&mut self`
/// is exclusive without further locking.
pub trait Service: Send {
    /// One-time initialisation with the launch parameter string. Failure
    /// retires the address and drains the mailbox with error replies.
    fn init(&mut self, ctx: &ServiceContext, args: &str) -> crate::Result<()>;

    /// Handle one message. Taking the message by value means the instance
    /// owns the payload: forward it by re-sending, or drop it to free it.
    fn dispatch(&mut self, ctx: &ServiceContext, message: Message);

    /// Out-of-band signal (the `SIGNAL` command), delivered between
    /// dispatches. Keep it cheap; a slow handler delays the sender.
    fn signal(&mut self, _signal: i32) {}
}

/// Factory for a named service type.
pub trait ServiceModule: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self) -> Box<dyn Service>;
}

/// The set of service types a node can launch.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RwLock<Vec<Arc<dyn ServiceModule>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module; the first registration of a name wins.
    pub fn insert(&self, module: Arc<dyn ServiceModule>) {
        let mut modules = self.modules.write();
        if modules.iter().any(|m| m.name() == module.name()) {
            return;
        }
        modules.push(module);
    }

    pub fn query(&self, name: &str) -> Option<Arc<dyn ServiceModule>> {
        self.modules
            .read()
            .iter()
            .find(|m| m.name() == name)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    impl Service for Nothing {
        fn init(&mut self, _ctx: &ServiceContext, _args: &str) -> crate::Result<()> {
            Ok(())
        }

        fn dispatch(&mut self, _ctx: &ServiceContext, _message: Message) {}
    }

    struct NothingModule;

    impl ServiceModule for NothingModule {
        fn name(&self) -> &str {
            "nothing"
        }

        fn create(&self) -> Box<dyn Service> {
            Box::new(Nothing)
        }
    }

    #[test]
    fn query_by_name() {
        let registry = ModuleRegistry::new();
        assert!(registry.query("nothing").is_none());
        registry.insert(Arc::new(NothingModule));
        assert!(registry.query("nothing").is_some());
        assert!(registry.query("other").is_none());
    }

    #[test]
    fn first_registration_wins() {
        let registry = ModuleRegistry::new();
        registry.insert(Arc::new(NothingModule));
        registry.insert(Arc::new(NothingModule));
        assert_eq!(registry.modules.read().len(), 1);
    }
}
