//! Per-service debug message log.
//!
//! Switched on with the `LOGON` command: every message a service dispatches
//! is appended to `<logpath>/<handle>.log` with its metadata and a hex dump
//! of the payload. Intended for chasing a single misbehaving service; the
//! hot path stays untouched while the log is off.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::{
    handle::Handle,
    message::{Message, Payload},
    node::Node,
    report,
};

#[derive(Debug)]
pub struct MessageLog {
    file: File,
    handle: Handle,
}

impl MessageLog {
    /// Open the log for `handle` under the `logpath` environment key.
    /// Returns `None` (after reporting why) when `logpath` is unset or the
    /// file cannot be created.
    pub fn open(node: &Node, source: Handle, handle: Handle) -> Option<MessageLog> {
        let logpath = node.env().get("logpath")?;
        let path = Path::new(&logpath).join(format!("{handle:08x}.log"));
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(mut file) => {
                let now = node.now();
                let wall = u64::from(node.timer().starttime()) + now / 100;
                report::error(node, source, format!("Open log file {}", path.display()));
                let _ = writeln!(file, "open time: {now} {wall}");
                let _ = file.flush();
                Some(MessageLog { file, handle })
            }
            Err(err) => {
                report::error(
                    node,
                    source,
                    format!("Open log file {} fail: {err}", path.display()),
                );
                None
            }
        }
    }

    pub fn close(mut self, node: &Node, source: Handle) {
        report::error(node, source, format!("Close log file :{:08x}", self.handle));
        let _ = writeln!(self.file, "close time: {}", node.now());
    }

    /// Append one dispatched message.
    pub fn output(&mut self, now: u64, message: &Message) {
        match &message.payload {
            Payload::Socket(sm) => {
                let _ = write!(
                    self.file,
                    "[socket] {} {} {} ",
                    u8::from(sm.kind),
                    sm.id,
                    sm.ud
                );
                let _ = write_blob(&mut self.file, &sm.buffer);
            }
            payload => {
                let _ = write!(
                    self.file,
                    ":{:08x} {} {} {now} ",
                    message.source,
                    u8::from(message.kind),
                    message.session
                );
                let _ = write_blob(&mut self.file, payload.as_bytes());
            }
        }
        let _ = writeln!(self.file);
        let _ = self.file.flush();
    }
}

fn write_blob(file: &mut File, bytes: &[u8]) -> std::io::Result<()> {
    for b in bytes {
        write!(file, "{b:02x}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageKind;
    use crate::test_support::test_node;

    #[test]
    fn logs_messages_when_logpath_set() {
        let dir = std::env::temp_dir().join(format!("warren-log-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let node = test_node();
        node.env().set("logpath", dir.to_str().unwrap());

        let mut log = MessageLog::open(&node, 0, 0xAB).unwrap();
        log.output(
            5,
            &Message {
                source: 0x11,
                session: 2,
                kind: MessageKind::Text,
                payload: Payload::from(b"hi".to_vec()),
            },
        );
        log.close(&node, 0);

        let contents = std::fs::read_to_string(dir.join("000000ab.log")).unwrap();
        assert!(contents.contains(":00000011 0 2 5 6869"));
        assert!(contents.contains("close time:"));
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_logpath_means_no_log() {
        let node = test_node();
        assert!(MessageLog::open(&node, 0, 1).is_none());
    }
}
