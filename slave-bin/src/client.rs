//! This module implements the message client owning the socket to the
//! master. A reader thread decodes inbound frames and hands every event to
//! the single handler supplied at construction; a writer thread drains an
//! unbounded queue in FIFO order, so `queue_message` never blocks and
//! messages queued from one thread reach the master in enqueue order.
//!

use std::io::ErrorKind as IoErrorKind;
use std::net::{Shutdown, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use judge::protocol::{self, Message};

error_chain::error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }

    foreign_links {
        IoError(::std::io::Error);
    }

    links {
        ProtocolError(::judge::Error, ::judge::ErrorKind);
    }
}

/// An inbound event produced by the reader thread.
#[derive(Debug)]
pub enum ClientEvent {
    /// A well-formed message arrived.
    Message(Message),

    /// A frame could not be decoded; the connection is unusable.
    Malformed(String),

    /// The master closed the socket.
    Disconnected,
}

enum Outbound {
    Deliver(Box<Message>),
    Stop,
}

/// The socket-owning client.
pub struct MessageClient {
    queue: Sender<Outbound>,
    stream: TcpStream,
    flushed: Receiver<bool>,
}

impl MessageClient {
    /// Start the reader and writer threads over the given stream. The
    /// handler is invoked on the reader thread, once per inbound event; the
    /// reader stops after the first malformed frame or on EOF.
    pub fn start<H>(stream: TcpStream, handler: H) -> Result<MessageClient>
    where
        H: Fn(ClientEvent) + Send + 'static,
    {
        let mut reader_stream = stream.try_clone()?;
        let mut writer_stream = stream.try_clone()?;
        let (queue_tx, queue_rx) = mpsc::channel::<Outbound>();
        let (flushed_tx, flushed_rx) = mpsc::channel::<bool>();

        std::thread::spawn(move || loop {
            match protocol::read_message(&mut reader_stream) {
                Ok(message) => handler(ClientEvent::Message(message)),
                Err(error) => {
                    if is_disconnect(&error) {
                        handler(ClientEvent::Disconnected);
                    } else {
                        handler(ClientEvent::Malformed(error.to_string()));
                    }
                    break;
                }
            }
        });

        std::thread::spawn(move || {
            let mut clean = true;
            for outbound in queue_rx {
                match outbound {
                    Outbound::Deliver(message) => {
                        if let Err(error) = protocol::write_message(&mut writer_stream, &message) {
                            log::error!("failed to write message to the master: {}", error);
                            clean = false;
                            break;
                        }
                    }
                    Outbound::Stop => break,
                }
            }
            flushed_tx.send(clean).ok();
        });

        Ok(MessageClient {
            queue: queue_tx,
            stream,
            flushed: flushed_rx,
        })
    }

    /// Queue a message for delivery. Never blocks.
    pub fn queue_message(&self, message: Message) {
        if self.queue.send(Outbound::Deliver(Box::new(message))).is_err() {
            log::warn!("message queued after the client stopped; dropped");
        }
    }

    /// Flush pending writes within the given deadline, then close the
    /// socket. Returns whether the queue drained cleanly in time.
    pub fn stop(&self, flush_deadline: Duration) -> bool {
        self.queue.send(Outbound::Stop).ok();
        let flushed = match self.flushed.recv_timeout(flush_deadline) {
            Ok(clean) => clean,
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        };
        if !flushed {
            log::warn!(
                "outbound queue did not drain within {} ms",
                flush_deadline.as_millis()
            );
        }
        self.stream.shutdown(Shutdown::Both).ok();
        flushed
    }
}

/// Test whether a read error means the peer closed the connection rather
/// than sending garbage.
fn is_disconnect(error: &judge::Error) -> bool {
    match error.kind() {
        judge::ErrorKind::Io(io_error) => matches!(
            io_error.kind(),
            IoErrorKind::UnexpectedEof | IoErrorKind::ConnectionReset | IoErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
