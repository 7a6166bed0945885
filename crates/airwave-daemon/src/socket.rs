use crate::BroadcastMessage;
use airwave_proto::bus::{Handler, MessageBus};
use airwave_proto::protocol::{
    Action, Context, Envelope, Hello, Message, PlaybackState, Reply, Response, PROTOCOL_VERSION,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

/// Dispatcher of the `popup` context: whatever reaches it is fanned out to
/// every attached client.
struct PopupRelay {
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

#[async_trait]
impl Handler for PopupRelay {
    async fn handle(&mut self, _from: Context, action: Action) -> Response {
        // no receivers just means every client left in the meantime
        let _ = self.broadcast_tx.send(BroadcastMessage::Notice(action));
        Response::Ack
    }
}

/// Attached client count; the popup context lives exactly while it is > 0.
#[derive(Clone)]
struct Attachments {
    bus: MessageBus,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
    count: Arc<Mutex<usize>>,
}

impl Attachments {
    async fn attach(&self) -> usize {
        let mut count = self.count.lock().await;
        *count += 1;
        if *count == 1 {
            let relay = PopupRelay {
                broadcast_tx: self.broadcast_tx.clone(),
            };
            self.bus.on_message(Context::Popup, relay).await;
            info!("popup context attached");
        }
        *count
    }

    async fn detach(&self) -> usize {
        let mut count = self.count.lock().await;
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.bus.unregister(Context::Popup).await;
            info!("popup context detached");
        }
        *count
    }
}

pub fn start_server(
    addr: String,
    bus: MessageBus,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, bus, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    bus: MessageBus,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let attachments = Attachments {
        bus: bus.clone(),
        broadcast_tx: broadcast_tx.clone(),
        count: Arc::new(Mutex::new(0)),
    };
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;

                // subscribe before attaching so nothing sent to popup is missed
                let bcast_rx = broadcast_tx.subscribe();
                let clients = attachments.attach().await;
                info!("Client {} connected from {} ({} attached)", id, peer, clients);

                let bus = bus.clone();
                let attachments = attachments.clone();
                tokio::spawn(async move {
                    handle_client(stream, bus, id, bcast_rx).await;
                    let clients = attachments.detach().await;
                    info!("Client {} disconnected ({} attached)", id, clients);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn write_frame(write_half: &mut OwnedWriteHalf, message: &Message) -> bool {
    match message.encode() {
        Ok(encoded) => write_half.write_all(&encoded).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            true
        }
    }
}

fn notification(action: Action) -> Option<Message> {
    Envelope::new(Context::Popup, &action)
        .map(Message::Envelope)
        .map_err(|e| debug!("Dropping notification: {}", e))
        .ok()
}

async fn handle_client(
    stream: TcpStream,
    bus: MessageBus,
    client_id: usize,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    let state = match bus
        .send(Context::Popup, Context::Background, Action::GetStatus)
        .await
    {
        Reply::Delivered(Response::Status(state)) => state,
        _ => PlaybackState::Stopped,
    };
    let hello = Message::Hello {
        hello: Hello {
            protocol_version: PROTOCOL_VERSION,
            state,
        },
    };
    if !write_frame(&mut write_half, &hello).await {
        return;
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            match Message::decode(&read_buf) {
                                Ok(Some((Message::Envelope(envelope), consumed))) => {
                                    read_buf.drain(..consumed);
                                    debug!(
                                        "Client {} → {}: {}",
                                        client_id, envelope.target, envelope.action
                                    );
                                    let reply = bus.send_envelope(Context::Popup, envelope).await;
                                    if !write_frame(&mut write_half, &Message::Reply { reply }).await {
                                        return;
                                    }
                                }
                                Ok(Some((_, consumed))) => {
                                    read_buf.drain(..consumed);
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Client {} sent a bad frame: {}", client_id, e);
                                    return;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            msg = broadcast_rx.recv() => {
                let action = match msg {
                    Ok(BroadcastMessage::Notice(action)) => action,
                    Ok(BroadcastMessage::Log(line)) => Action::Log(line),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} notifications", client_id, n);
                        continue;
                    }
                    Err(_) => break,
                };
                if let Some(frame) = notification(action) {
                    if !write_frame(&mut write_half, &frame).await {
                        break;
                    }
                }
            }
        }
    }
}
