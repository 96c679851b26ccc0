//! Per-connection framing and dispatch of named binary commands.
//!
//! Every message on a connection is one frame (see [`crate::wire`]). The
//! channel buffers partial reads per peer, splits off the command name and
//! invokes the handler registered for it with a reader over the rest of the
//! payload. Unknown commands and malformed frames are logged and dropped;
//! they never close the connection.

use crate::{lock_unpoisoned, read_unpoisoned, write_unpoisoned};
use crate::wire::{encode_frame, split_command, CommandReader, CommandWriter, FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use colocate_env::{EnvError, NetworkTransport, PeerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

/// Handler invoked with the sender, a reader positioned after the command
/// name, and the number of payload bytes remaining.
///
/// Handlers run on the task that owns the connection's receive loop and
/// must not block it.
pub type CommandHandler = Arc<dyn Fn(PeerId, &mut CommandReader<'_>, usize) + Send + Sync>;

/// Sends one command frame to a peer.
pub fn send_command<F>(
    transport: &dyn NetworkTransport,
    peer: PeerId,
    command: &str,
    write: F,
) -> Result<(), EnvError>
where
    F: FnOnce(&mut CommandWriter),
{
    let frame = encode_frame(command, write);
    transport.send(peer, frame)
}

/// Command registry plus per-peer frame reassembly.
pub struct CommandChannel {
    handlers: RwLock<HashMap<String, CommandHandler>>,
    decoders: Mutex<HashMap<PeerId, FrameDecoder>>,
    max_frame_len: usize,
}

impl CommandChannel {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            decoders: Mutex::new(HashMap::new()),
            max_frame_len,
        }
    }

    /// Registers `handler` for `command`, replacing any previous one.
    pub fn register<F>(&self, command: &str, handler: F)
    where
        F: Fn(PeerId, &mut CommandReader<'_>, usize) + Send + Sync + 'static,
    {
        let mut handlers = write_unpoisoned(&self.handlers);
        if handlers.insert(command.to_string(), Arc::new(handler)).is_some() {
            warn!("Command handler for '{}' replaced", command);
        }
    }

    pub fn unregister(&self, command: &str) -> bool {
        let mut handlers = write_unpoisoned(&self.handlers);
        handlers.remove(command).is_some()
    }

    pub fn is_registered(&self, command: &str) -> bool {
        let handlers = read_unpoisoned(&self.handlers);
        handlers.contains_key(command)
    }

    /// Sends one command frame to a peer.
    pub fn send<F>(
        &self,
        transport: &dyn NetworkTransport,
        peer: PeerId,
        command: &str,
        write: F,
    ) -> Result<(), EnvError>
    where
        F: FnOnce(&mut CommandWriter),
    {
        send_command(transport, peer, command, write)
    }

    /// Feeds bytes received from `peer` and dispatches every frame they
    /// complete.
    ///
    /// # Returns
    /// Number of frames dispatched to a handler.
    pub fn receive(&self, peer: PeerId, bytes: &[u8]) -> usize {
        let mut frames = Vec::new();
        {
            let mut decoders = lock_unpoisoned(&self.decoders);
            let decoder = decoders
                .entry(peer)
                .or_insert_with(|| FrameDecoder::new(self.max_frame_len));
            decoder.push(bytes);
            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Discarding receive buffer for peer {}: {}", peer, e);
                        break;
                    }
                }
            }
        }

        // Handlers may send; never call them with the decoder table locked
        frames
            .iter()
            .filter(|frame| self.dispatch(peer, frame))
            .count()
    }

    /// Dispatches one complete frame body.
    pub fn dispatch(&self, peer: PeerId, body: &[u8]) -> bool {
        let (command, mut reader) = match split_command(body) {
            Ok(parts) => parts,
            Err(e) => {
                warn!("Malformed command frame from peer {}: {}", peer, e);
                return false;
            }
        };

        let handler = {
            let handlers = read_unpoisoned(&self.handlers);
            handlers.get(&command).cloned()
        };

        match handler {
            Some(handler) => {
                let remaining = reader.remaining();
                debug!("Dispatching '{}' from peer {} ({} bytes)", command, peer, remaining);
                handler(peer, &mut reader, remaining);
                true
            }
            None => {
                warn!("Unknown command '{}' from peer {}; dropped", command, peer);
                false
            }
        }
    }

    /// Drops any partially received frame for a peer.
    pub fn disconnect(&self, peer: PeerId) {
        lock_unpoisoned(&self.decoders).remove(&peer);
    }

    /// Bytes buffered for a peer awaiting the rest of a frame.
    pub fn buffered(&self, peer: PeerId) -> usize {
        lock_unpoisoned(&self.decoders)
            .get(&peer)
            .map(|d| d.buffered())
            .unwrap_or(0)
    }
}

impl Default for CommandChannel {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingTransport;

    fn recorder(channel: &CommandChannel, command: &str) -> Arc<Mutex<Vec<(PeerId, String, usize)>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        channel.register(command, move |peer, reader, remaining| {
            let value = reader.read_string().unwrap_or_default();
            sink.lock().unwrap().push((peer, value, remaining));
        });
        seen
    }

    #[test]
    fn test_byte_at_a_time_delivery_dispatches_once() {
        let channel = CommandChannel::default();
        let seen = recorder(&channel, "Echo");
        let peer = PeerId::from_seed(1);
        let frame = encode_frame("Echo", |w| w.write_str("hi"));

        let mut dispatched = 0;
        for byte in &frame {
            dispatched += channel.receive(peer, std::slice::from_ref(byte));
        }
        assert_eq!(dispatched, 1);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        // "hi" with its one-byte prefix
        assert_eq!(seen[0], (peer, "hi".to_string(), 3));
    }

    #[test]
    fn test_unknown_command_is_dropped_and_stream_continues() {
        let channel = CommandChannel::default();
        let seen = recorder(&channel, "Known");
        let peer = PeerId::from_seed(1);

        let mut bytes = encode_frame("Mystery", |w| w.write_u32(5));
        bytes.extend(encode_frame("Known", |w| w.write_str("after")));
        assert_eq!(channel.receive(peer, &bytes), 1);
        assert_eq!(seen.lock().unwrap()[0].1, "after");
    }

    #[test]
    fn test_partial_frames_are_buffered_per_peer() {
        let channel = CommandChannel::default();
        let seen = recorder(&channel, "Echo");
        let a = PeerId::from_seed(1);
        let b = PeerId::from_seed(2);
        let frame_a = encode_frame("Echo", |w| w.write_str("from-a"));
        let frame_b = encode_frame("Echo", |w| w.write_str("from-b"));

        channel.receive(a, &frame_a[..5]);
        channel.receive(b, &frame_b[..7]);
        channel.receive(a, &frame_a[5..]);
        channel.receive(b, &frame_b[7..]);

        let values: Vec<_> = seen.lock().unwrap().iter().map(|(p, v, _)| (*p, v.clone())).collect();
        assert_eq!(values, vec![(a, "from-a".to_string()), (b, "from-b".to_string())]);
    }

    #[test]
    fn test_disconnect_discards_partial_frame() {
        let channel = CommandChannel::default();
        let seen = recorder(&channel, "Echo");
        let peer = PeerId::from_seed(1);
        let frame = encode_frame("Echo", |w| w.write_str("x"));

        channel.receive(peer, &frame[..4]);
        assert_eq!(channel.buffered(peer), 4);
        channel.disconnect(peer);
        assert_eq!(channel.buffered(peer), 0);

        channel.receive(peer, &frame);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_handler_can_send_reply() {
        let channel = Arc::new(CommandChannel::default());
        let transport = Arc::new(RecordingTransport::new());
        let peer = PeerId::from_seed(3);
        transport.connect_peer(peer);

        let reply_transport = transport.clone();
        channel.register("Ping", move |from, _, _| {
            send_command(reply_transport.as_ref(), from, "Pong", |w| w.write_u8(1)).unwrap();
        });
        channel.receive(peer, &encode_frame("Ping", |_| {}));

        let sent = transport.sent_commands(peer);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "Pong");
    }
}
