//! Service-visible error channel.
//!
//! Runtime errors are formatted and delivered as `Text`-kind messages to
//! the service registered under the name `logger`. While no logger exists
//! the text is dropped (surfaced only on the ambient `log` facade), so
//! early startup never blocks on logging.

use crate::{
    handle::Handle,
    message::{Message, MessageKind, Payload},
    node::Node,
};

/// Deliver one error line to the logger service on behalf of `source`
/// (0 for the runtime itself).
pub fn error(node: &Node, source: Handle, text: String) {
    log::debug!(target: "warren::report", "[:{source:08x}] {text}");

    let logger = node.logger_handle();
    if logger == 0 {
        return;
    }

    let message = Message {
        source,
        session: 0,
        kind: MessageKind::Text,
        payload: Payload::from(text),
    };
    if node.push_to(logger, message).is_err() {
        // logger retired mid-shutdown; nothing left to tell
        node.forget_logger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{spawn_collector, test_node};

    #[test]
    fn dropped_without_logger() {
        let node = test_node();
        // must not panic or queue anything
        error(&node, 0, "early failure".to_owned());
    }

    #[test]
    fn delivered_to_named_logger() {
        let node = test_node();
        let (ctx, received) = spawn_collector(&node);
        assert!(node.handles().bind_name(ctx.handle(), "logger"));

        error(&node, 7, "worker stalled".to_owned());

        // drain the collector's mailbox by hand: no scheduler in this test
        crate::test_support::drain(&ctx);
        let got = received.lock().clone();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, 7);
        assert_eq!(got[0].2, b"worker stalled".to_vec());
    }
}
