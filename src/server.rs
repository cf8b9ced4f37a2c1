use crate::config::{WsOptions, RANDOM_PORT};
use crate::error::Error;
use crate::event::{generate_new_uuid, Event, EventStream, ID};
use crate::handshake::upgrade_connection;
use crate::outbound::OutboundQueue;
use crate::read::ReadState;
use crate::session::SessionWriter;
use crate::stream::WsStream;
use log::{debug, error, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, Sender};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const READ_BUFFER_SIZE: usize = 8192;
const EVENT_CHANNEL_SIZE: usize = 1000;

/// Binds the websocket listener and returns the bound address together with
/// the stream of session events.
///
/// Each accepted connection goes through the TLS and HTTP upgrade exchange
/// under the configured handshake deadline, and is then serviced by two
/// cooperating tasks: a read task feeding the frame decoder and a write
/// task draining the session's outbound queue. The two share nothing but
/// that queue's lock.
pub async fn start_server_with_config(
    opts: WsOptions,
) -> Result<(SocketAddr, EventStream), Error> {
    opts.validate()?;
    if opts.port == 0 {
        return Err(Error::TransportDisabled);
    }
    let port = if opts.port == RANDOM_PORT {
        0
    } else {
        opts.port as u16
    };

    let listener = TcpListener::bind((opts.host.as_str(), port)).await?;
    let local_addr = listener.local_addr()?;
    debug!("websocket transport listening on {}", local_addr);

    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
    tokio::spawn(async move {
        loop {
            // we are using UUID, which is more flexible, and secure than incrementing IDs
            let uuid = generate_new_uuid();
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("accepted websocket connection from {}", peer);
                    let opts = opts.clone();
                    let events = tx.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, uuid, opts, events).await;
                    });
                }
                Err(err) => {
                    error!("error accepting websocket connection: {}", err);
                    if tx.send(Event::Error(uuid, err.into())).await.is_err() {
                        // The broker side dropped the event stream.
                        break;
                    }
                }
            }
        }
    });

    Ok((local_addr, EventStream::new(rx)))
}

pub async fn start_server(port: u16) -> Result<(SocketAddr, EventStream), Error> {
    start_server_with_config(WsOptions {
        port: port as i32,
        ..Default::default()
    })
    .await
}

async fn handle_connection(stream: TcpStream, id: ID, opts: WsOptions, events: Sender<Event>) {
    // The handshake deadline covers the TLS exchange and the HTTP upgrade.
    // Once the 101 is on the wire, read and write pacing belongs to the
    // broker's generic client machinery, so nothing below runs under it.
    let handshake = timeout(opts.handshake_timeout, async {
        let stream = match opts.tls_config.clone() {
            Some(config) => {
                let acceptor = TlsAcceptor::from(config);
                WsStream::Secure(acceptor.accept(stream).await?)
            }
            None => WsStream::Plain(stream),
        };
        upgrade_connection(stream, &opts).await
    })
    .await;

    let handshake = match handshake {
        Ok(result) => result,
        Err(elapsed) => {
            warn!("websocket handshake timed out");
            let _ = events.send(Event::Error(id, elapsed.into())).await;
            return;
        }
    };
    let handshake = match handshake {
        Ok(handshake) => handshake,
        Err(err) => {
            warn!("websocket handshake failed: {}", err);
            let _ = events.send(Event::Error(id, err)).await;
            return;
        }
    };

    let compression = handshake.compression;
    let (read_half, write_half) = tokio::io::split(handshake.stream);
    let queue = Arc::new(OutboundQueue::new());
    let writer = SessionWriter::new(queue.clone(), compression, opts.compression_level);

    if events.send(Event::NewClient(id, writer)).await.is_err() {
        return;
    }

    let write_queue = queue.clone();
    let write_task = tokio::spawn(async move {
        if let Err(err) = write_loop(write_half, write_queue).await {
            debug!("websocket write task ended: {}", err);
        }
    });

    read_loop(read_half, id, &queue, &events).await;

    // Wake the write task so it drains whatever is still queued, the
    // reciprocal Close included, and exits.
    queue.mark_closed();
    let _ = write_task.await;
    let _ = events.send(Event::Disconnect(id)).await;
}

async fn read_loop(
    mut read_half: ReadHalf<WsStream>,
    id: ID,
    queue: &Arc<OutboundQueue>,
    events: &Sender<Event>,
) {
    let mut state = ReadState::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                let _ = events.send(Event::Error(id, err.into())).await;
                break;
            }
        };

        let mut payloads = Vec::new();
        let result = state
            .decode(&mut read_half, &buf[..n], &mut payloads, queue)
            .await;

        // Whatever was decoded before a failure still goes upstream, in
        // wire order, before the session is torn down.
        for payload in payloads {
            if events.send(Event::NewMessage(id, payload)).await.is_err() {
                return;
            }
        }

        match result {
            Ok(()) => {}
            // Clean closure, the reciprocal Close frame is already queued.
            Err(Error::SessionClosed) => break,
            Err(err) => {
                debug!("websocket read task ended: {}", err);
                let _ = events.send(Event::Error(id, err)).await;
                break;
            }
        }
    }
}

async fn write_loop(
    mut write_half: WriteHalf<WsStream>,
    queue: Arc<OutboundQueue>,
) -> Result<(), Error> {
    loop {
        if let Some(collapsed) = queue.collapse() {
            write_half.write_all(&collapsed).await?;
            write_half.flush().await?;
        } else if queue.close_sent() {
            write_half.shutdown().await?;
            return Ok(());
        } else {
            queue.wait_for_data().await;
        }
    }
}
