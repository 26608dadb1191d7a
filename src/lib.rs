//! A single-process, multi-threaded actor runtime.
//!
//! A node hosts a large number of lightweight *services* that cooperate by
//! exchanging asynchronous messages. The runtime provides the scheduler
//! that drives them (a pool of worker threads fed by a global run queue of
//! mailboxes), a hierarchical timing wheel, an event-driven network
//! reactor owning every socket, and the wire framing used when services
//! talk across sockets or nodes (see the `warren-wire` crate).
//!
//! Services are cooperatively scheduled: one message handler runs to
//! completion on one worker and never yields control mid-dispatch.
//! Request/response across suspension is modelled with session ids, not
//! continuations.
//!
//! ```no_run
//! use warren::{launch, runtime, Node};
//!
//! let node = Node::new(1, warren::services::builtin_modules()).unwrap();
//! launch(&node, "logger", "").unwrap();
//! runtime::start(&node, 8);
//! ```

#![deny(trivial_numeric_casts)]
#![deny(unused_import_braces)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rustdoc::private_intra_doc_links)]

pub mod config;
pub mod context;
pub mod env;
mod error;
pub mod handle;
pub mod harbor;
pub mod memstat;
pub mod message;
pub mod module;
pub mod monitor;
pub mod mq;
pub mod netpack;
pub mod node;
pub mod report;
pub mod runtime;
pub mod service_log;
pub mod services;
pub mod socket;
pub mod timer;

pub use context::{current_handle, launch, ServiceContext};
pub use error::{Error, Result};
pub use handle::Handle;
pub use message::{Message, MessageKind, Payload, SendFlags};
pub use module::{Service, ServiceModule};
pub use node::Node;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use crate::{
        context::{launch, ServiceContext},
        handle::Handle,
        message::{Message, MessageKind},
        module::{ModuleRegistry, Service, ServiceModule},
        node::Node,
    };

    struct Null;

    impl Service for Null {
        fn init(&mut self, _ctx: &ServiceContext, _args: &str) -> crate::Result<()> {
            Ok(())
        }

        fn dispatch(&mut self, _ctx: &ServiceContext, _message: Message) {}
    }

    struct NullModule;

    impl ServiceModule for NullModule {
        fn name(&self) -> &str {
            "null"
        }

        fn create(&self) -> Box<dyn Service> {
            Box::new(Null)
        }
    }

    pub type Received = Arc<Mutex<Vec<(Handle, MessageKind, Vec<u8>)>>>;

    struct Collector {
        received: Received,
    }

    impl Service for Collector {
        fn init(&mut self, _ctx: &ServiceContext, _args: &str) -> crate::Result<()> {
            Ok(())
        }

        fn dispatch(&mut self, _ctx: &ServiceContext, message: Message) {
            self.received.lock().push((
                message.source,
                message.kind,
                message.payload.as_bytes().to_vec(),
            ));
        }
    }

    /// Init queues one message sourced from the handle in `args`, then
    /// fails, so tests can watch the failure path answer pending senders.
    struct Failing;

    impl Service for Failing {
        fn init(&mut self, ctx: &ServiceContext, args: &str) -> crate::Result<()> {
            if let Ok(source) = u32::from_str_radix(args, 16) {
                ctx.push_message(
                    ctx.node(),
                    Message {
                        source,
                        session: 1,
                        kind: MessageKind::Text,
                        payload: crate::message::Payload::Empty,
                    },
                );
            }
            Err(crate::Error::InitFailed("refusing to start".to_owned()))
        }

        fn dispatch(&mut self, _ctx: &ServiceContext, _message: Message) {}
    }

    struct FailingModule;

    impl ServiceModule for FailingModule {
        fn name(&self) -> &str {
            "failing"
        }

        fn create(&self) -> Box<dyn Service> {
            Box::new(Failing)
        }
    }

    /// A node with the test modules registered; no threads are running.
    pub fn test_node() -> Arc<Node> {
        let registry = ModuleRegistry::new();
        registry.insert(Arc::new(NullModule));
        registry.insert(Arc::new(FailingModule));
        Node::new(1, registry).expect("building test node")
    }

    pub fn spawn_null_service(node: &Arc<Node>) -> Arc<ServiceContext> {
        launch(node, "null", "").expect("launching null service")
    }

    /// A context that exists but is not registered anywhere; registry
    /// tests insert it into their own table.
    pub fn bare_context(node: &Arc<Node>) -> Arc<ServiceContext> {
        ServiceContext::new(node.clone(), Box::new(Null))
    }

    /// Launch a collector service and return its context plus the shared
    /// record of everything it dispatched.
    pub fn spawn_collector(node: &Arc<Node>) -> (Arc<ServiceContext>, Received) {
        let received: Received = Arc::new(Mutex::new(Vec::new()));
        let name = format!("collector-{:x}", Arc::as_ptr(&received) as usize);
        struct Named {
            name: String,
            received: Received,
        }
        impl ServiceModule for Named {
            fn name(&self) -> &str {
                &self.name
            }

            fn create(&self) -> Box<dyn Service> {
                Box::new(Collector {
                    received: self.received.clone(),
                })
            }
        }
        node.modules().insert(Arc::new(Named {
            name: name.clone(),
            received: received.clone(),
        }));
        let ctx = launch(node, &name, "").expect("launching collector");
        (ctx, received)
    }

    /// Dispatch everything pending in `ctx`'s mailbox on this thread.
    pub fn drain(ctx: &ServiceContext) {
        ctx.dispatch_all();
    }
}
