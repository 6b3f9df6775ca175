use crate::core::DaemonEvent;
use crate::BroadcastMessage;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};
use tvplay_proto::protocol::{Broadcast, Message, PlaybackSnapshot, PROTOCOL_VERSION};

type SharedSnapshot = Arc<RwLock<PlaybackSnapshot>>;

pub fn start_server(
    bind_address: String,
    port: u16,
    snapshot: SharedSnapshot,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);
        serve(listener, snapshot, event_tx, broadcast_tx).await;
    })
}

async fn serve(
    listener: TcpListener,
    snapshot: SharedSnapshot,
    event_tx: mpsc::Sender<DaemonEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
) {
    let mut client_id = 0usize;

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                client_id += 1;
                let id = client_id;
                info!("Client {} connected from {}", id, peer);

                let snap = snapshot.clone();
                let evt_tx = event_tx.clone();
                let bcast_rx = broadcast_tx.subscribe();

                tokio::spawn(async move {
                    handle_client(stream, snap, id, evt_tx, bcast_rx).await;
                    info!("Client {} disconnected", id);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    snapshot: SharedSnapshot,
    client_id: usize,
    event_tx: mpsc::Sender<DaemonEvent>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();

    if let Ok(encoded) = encode_hello(&snapshot).await {
        if write_half.write_all(&encoded).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => break,
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while read_buf.len() >= 4 {
                            match Message::decode(&read_buf) {
                                Ok((Message::Command(cmd), consumed)) => {
                                    read_buf.drain(..consumed);
                                    info!("Client {} sent command: {:?}", client_id, cmd);

                                    if event_tx.send(DaemonEvent::ClientCommand(cmd)).await.is_err() {
                                        warn!("DaemonEvent channel closed");
                                        return;
                                    }
                                }
                                Ok((_, consumed)) => {
                                    read_buf.drain(..consumed);
                                }
                                Err(_) if !frame_complete(&read_buf) => break,
                                Err(e) => {
                                    // complete frame that isn't a command: skip it
                                    warn!("Client {} sent malformed message: {}", client_id, e);
                                    let len = frame_len(&read_buf);
                                    read_buf.drain(..4 + len);
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
                let encoded = match msg {
                    Ok(BroadcastMessage::StateUpdated) => encode_state(&snapshot).await,
                    Ok(BroadcastMessage::Notice(message)) => {
                        Message::Broadcast(Broadcast::Notice { message }).encode()
                    }
                    Ok(BroadcastMessage::WebSurface(url)) => {
                        Message::Broadcast(Broadcast::WebSurface { url }).encode()
                    }
                    Ok(BroadcastMessage::Log(message)) => {
                        Message::Broadcast(Broadcast::Log { message }).encode()
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client {} missed {} broadcast messages", client_id, n);
                        encode_state(&snapshot).await
                    }
                    Err(_) => break,
                };
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn frame_len(buf: &[u8]) -> usize {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize
}

fn frame_complete(buf: &[u8]) -> bool {
    buf.len() >= 4 && buf.len() >= 4 + frame_len(buf)
}

async fn encode_hello(snapshot: &SharedSnapshot) -> anyhow::Result<Vec<u8>> {
    let state = snapshot.read().await.clone();
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        state,
    })
    .encode()
}

async fn encode_state(snapshot: &SharedSnapshot) -> anyhow::Result<Vec<u8>> {
    let data = snapshot.read().await.clone();
    Message::Broadcast(Broadcast::State { data }).encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tvplay_proto::protocol::Command;

    async fn read_message(stream: &mut TcpStream) -> Message {
        let mut len = [0u8; 4];
        stream.read_exact(&mut len).await.unwrap();
        let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.unwrap();
        let mut frame = len.to_vec();
        frame.extend_from_slice(&body);
        Message::decode(&frame).unwrap().0
    }

    #[tokio::test]
    async fn test_client_gets_hello_commands_and_notices() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let snapshot = SharedSnapshot::default();
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let (broadcast_tx, _) = broadcast::channel(8);
        tokio::spawn(serve(listener, snapshot, event_tx, broadcast_tx.clone()));

        let mut client = TcpStream::connect(addr).await.unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version, ..
            }) => assert_eq!(protocol_version, PROTOCOL_VERSION),
            other => panic!("unexpected: {:?}", other),
        }

        // a garbage frame is skipped, the command after it still arrives
        let mut garbage = 2u32.to_be_bytes().to_vec();
        garbage.extend_from_slice(b"{]");
        client.write_all(&garbage).await.unwrap();
        let next = Message::Command(Command::Next).encode().unwrap();
        client.write_all(&next).await.unwrap();
        match event_rx.recv().await {
            Some(DaemonEvent::ClientCommand(Command::Next)) => {}
            other => panic!("unexpected: {:?}", other),
        }

        broadcast_tx
            .send(BroadcastMessage::Notice("Added 'X' to favorites".to_string()))
            .unwrap();
        match read_message(&mut client).await {
            Message::Broadcast(Broadcast::Notice { message }) => {
                assert_eq!(message, "Added 'X' to favorites")
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
