//! The log service: sink for the runtime's error channel.
//!
//! Writes one `[:source] text` line per `Text` message to a file (its
//! launch parameter) or stdout, and registers the `logger` name so
//! [`crate::report`] can find it.

use std::fs::File;
use std::io::{LineWriter, Write};
use std::sync::Arc;

use crate::{
    context::ServiceContext,
    message::{Message, MessageKind},
    module::{Service, ServiceModule},
};

enum Output {
    Stdout,
    File(LineWriter<File>),
}

pub struct Logger {
    output: Output,
}

impl Service for Logger {
    fn init(&mut self, ctx: &ServiceContext, args: &str) -> crate::Result<()> {
        if !args.is_empty() {
            self.output = Output::File(LineWriter::new(File::create(args)?));
        }
        ctx.command("REG", ".logger");
        Ok(())
    }

    fn dispatch(&mut self, _ctx: &ServiceContext, message: Message) {
        if message.kind != MessageKind::Text {
            return;
        }
        let text = String::from_utf8_lossy(message.payload.as_bytes());
        let line = format!("[:{:08x}] {text}", message.source);
        match &mut self.output {
            Output::Stdout => println!("{line}"),
            Output::File(file) => {
                let _ = writeln!(file, "{line}");
            }
        }
    }
}

pub struct LoggerModule;

impl ServiceModule for LoggerModule {
    fn name(&self) -> &str {
        "logger"
    }

    fn create(&self) -> Box<dyn Service> {
        Box::new(Logger {
            output: Output::Stdout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::launch;
    use crate::message::{Payload, SendFlags};
    use crate::test_support::test_node;

    #[test]
    fn registers_the_logger_name() {
        let node = test_node();
        node.modules().insert(Arc::new(LoggerModule));
        let path = std::env::temp_dir().join(format!("warren-logger-{}.log", std::process::id()));
        let ctx = launch(&node, "logger", path.to_str().unwrap()).unwrap();
        assert_eq!(node.handles().find_name("logger"), Some(ctx.handle()));

        ctx.send(
            0,
            ctx.handle(),
            MessageKind::Text,
            SendFlags::empty(),
            0,
            Payload::from(b"hello log".to_vec()),
        )
        .unwrap();
        ctx.dispatch_all();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("hello log"));
        std::fs::remove_file(&path).ok();
    }
}
