//! WebSocket transport
//!
//! Accepts client connections, upgrades them to WebSocket, and turns their
//! messages into calls on the [`SessionBridge`]. PTY output from the relay
//! loop is pushed to every connected client.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::protocol::{ClientMessage, ErrorCode, ServerMessage};
use crate::bridge::{BridgeError, SessionBridge};
use crate::pty::TerminalSize;

/// Accept loop; runs until a shutdown signal arrives
pub async fn serve(
    listener: TcpListener,
    bridge: SessionBridge,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    match listener.local_addr() {
        Ok(addr) => info!("WebSocket server listening on ws://{}", addr),
        Err(e) => warn!("WebSocket server listening on unknown address: {}", e),
    }

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let bridge = bridge.clone();
                        let shutdown_rx = shutdown_tx.subscribe();

                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, bridge, shutdown_rx).await {
                                error!("Connection error from {}: {}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping accept loop");
                break;
            }
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    bridge: SessionBridge,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    info!("New connection from {}", peer_addr);

    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Subscribe before connecting so the child's first output is not missed
    let mut output_rx = bridge.subscribe_output();

    match bridge.handle_connect().await {
        Ok(outcome) => debug!(?outcome, "Connect handled for {}", peer_addr),
        Err(e) => {
            warn!("Connect from {} failed: {}", peer_addr, e);
            let code = match &e {
                BridgeError::NotRunning => ErrorCode::NotRunning,
                _ => ErrorCode::SpawnFailed,
            };
            let error_json = ServerMessage::error_with_code(e.to_string(), code).to_json()?;
            ws_sender.send(Message::Text(error_json)).await?;
            let _ = ws_sender.send(Message::Close(None)).await;
            return Ok(());
        }
    }

    let welcome = ServerMessage::welcome().to_json()?;
    ws_sender.send(Message::Text(welcome)).await?;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) = handle_message(&text, &bridge).await {
                            ws_sender.send(Message::Text(reply.to_json()?)).await?;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Err(e) = bridge.handle_input(&data).await {
                            let error_json = ServerMessage::error_with_code(e.to_string(), ErrorCode::WriteFailed).to_json()?;
                            ws_sender.send(Message::Text(error_json)).await?;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        info!("Client {} requested close", peer_addr);
                        break;
                    }
                    Some(Err(e)) => {
                        error!("WebSocket error from {}: {}", peer_addr, e);
                        break;
                    }
                    None => {
                        info!("Connection closed by {}", peer_addr);
                        break;
                    }
                }
            }
            output = output_rx.recv() => {
                match output {
                    Ok(chunk) => {
                        let output_json = ServerMessage::pty_output(chunk.data).to_json()?;
                        ws_sender.send(Message::Text(output_json)).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // A gap in the stream would corrupt the client's screen
                        warn!("Client {} lagged, dropped {} output chunks; disconnecting", peer_addr, skipped);
                        let error_json = ServerMessage::error_with_code(
                            format!("output stream lagged, {skipped} chunks dropped"),
                            ErrorCode::OutputLagged,
                        )
                        .to_json()?;
                        let _ = ws_sender.send(Message::Text(error_json)).await;
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, closing connection to {}", peer_addr);
                let _ = ws_sender.send(Message::Close(None)).await;
                break;
            }
        }
    }

    info!("Connection from {} closed", peer_addr);
    Ok(())
}

/// Handle a client text message, returning a reply if one is due
async fn handle_message(text: &str, bridge: &SessionBridge) -> Option<ServerMessage> {
    let message = match ClientMessage::from_json(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Rejected client message: {}", e);
            return Some(e.into());
        }
    };

    match message {
        ClientMessage::PtyInput { input } => {
            debug!(bytes = input.len(), "Received input");
            bridge
                .handle_input(input.as_bytes())
                .await
                .err()
                .map(|e| ServerMessage::error_with_code(e.to_string(), ErrorCode::WriteFailed))
        }
        ClientMessage::Resize {
            rows,
            cols,
            pixel_width,
            pixel_height,
        } => {
            debug!(rows, cols, "Resizing terminal");
            let size = TerminalSize::new(rows, cols).with_pixels(pixel_width, pixel_height);
            bridge
                .handle_resize_to(size)
                .await
                .err()
                .map(|e| ServerMessage::error_with_code(e.to_string(), ErrorCode::ResizeFailed))
        }
        ClientMessage::Ping { seq } => Some(ServerMessage::Pong { seq }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::relay::PtyOutput;
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn started(command: &str, args: &str) -> SessionBridge {
        let config = SessionConfig::new(command).with_args_str(args).unwrap();
        let bridge = SessionBridge::new(config);
        bridge.start().await.unwrap();
        bridge
    }

    async fn next_message(client: &mut Client) -> Option<ServerMessage> {
        loop {
            match timeout(Duration::from_secs(3), client.next()).await.ok()?? {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn connect(bridge: &SessionBridge) -> Client {
        let (mut client, _) = connect_async(bridge.get_url()).await.unwrap();
        match next_message(&mut client).await {
            Some(ServerMessage::Welcome { version, .. }) => assert_eq!(version, 1),
            other => panic!("Expected welcome, got {other:?}"),
        }
        client
    }

    async fn output_until(client: &mut Client, needle: &str) -> String {
        let mut collected = String::new();
        while let Some(message) = next_message(client).await {
            if let ServerMessage::PtyOutput { output } = message {
                collected.push_str(&output);
                if collected.contains(needle) {
                    break;
                }
            }
        }
        collected
    }

    #[tokio::test]
    async fn test_input_is_echoed_as_output() {
        let bridge = started("cat", "").await;
        let mut client = connect(&bridge).await;

        let input = serde_json::to_string(&ClientMessage::pty_input("over the wire\n")).unwrap();
        client.send(Message::Text(input)).await.unwrap();

        let output = output_until(&mut client, "over the wire").await;
        assert!(output.contains("over the wire"));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_binary_frame_is_raw_input() {
        let bridge = started("cat", "").await;
        let mut client = connect(&bridge).await;

        client
            .send(Message::Binary(b"\xffraw bytes\n".to_vec()))
            .await
            .unwrap();

        let output = output_until(&mut client, "raw bytes").await;
        assert!(output.contains("raw bytes"));
        assert!(output.contains(char::REPLACEMENT_CHARACTER));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_resize_message_sets_window_size() {
        let bridge = started("cat", "").await;
        let mut client = connect(&bridge).await;

        let resize = serde_json::to_string(&ClientMessage::resize(33, 101)).unwrap();
        client.send(Message::Text(resize)).await.unwrap();

        // Round-trip a ping so the resize has been processed
        let ping = serde_json::to_string(&ClientMessage::ping(7)).unwrap();
        client.send(Message::Text(ping)).await.unwrap();
        loop {
            match next_message(&mut client).await {
                Some(ServerMessage::Pong { seq }) => {
                    assert_eq!(seq, 7);
                    break;
                }
                Some(_) => continue,
                None => panic!("Connection closed before pong"),
            }
        }

        let session = bridge.session().await.unwrap();
        assert_eq!(session.window_size().await.unwrap(), TerminalSize::new(33, 101));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_large_resize_applied() {
        let bridge = started("cat", "").await;
        bridge.handle_connect().await.unwrap();

        let reply = handle_message(r#"{"type": "resize", "rows": 250, "cols": 600}"#, &bridge).await;
        assert!(reply.is_none(), "unexpected reply {reply:?}");

        let session = bridge.session().await.unwrap();
        assert_eq!(session.window_size().await.unwrap(), TerminalSize::new(250, 600));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_lagging_client_is_disconnected() {
        let bridge = started("cat", "").await;
        let mut client = connect(&bridge).await;

        // Single-threaded runtime: the connection task cannot drain while we fill
        let output_tx = bridge.output_sender();
        for i in 0..1100 {
            let _ = output_tx.send(PtyOutput {
                data: format!("chunk {i}\n"),
            });
        }

        let mut lag_code = None;
        while let Some(message) = next_message(&mut client).await {
            if let ServerMessage::Error { code, .. } = message {
                lag_code = code;
                break;
            }
        }
        assert_eq!(lag_code, Some(ErrorCode::OutputLagged));
        assert!(next_message(&mut client).await.is_none());
        assert!(bridge.is_running());

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_message_returns_error() {
        let bridge = started("cat", "").await;
        let mut client = connect(&bridge).await;

        client
            .send(Message::Text(r#"{"type": "resize", "rows": 0, "cols": 80}"#.to_string()))
            .await
            .unwrap();

        loop {
            match next_message(&mut client).await {
                Some(ServerMessage::Error { code, .. }) => {
                    assert_eq!(code, Some(ErrorCode::InvalidMessage));
                    break;
                }
                Some(_) => continue,
                None => panic!("Connection closed before error"),
            }
        }

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_second_client_shares_session() {
        let bridge = started("cat", "").await;
        let _first = connect(&bridge).await;
        let pid = bridge.child_pid().await;
        assert!(pid.is_some());

        let mut second = connect(&bridge).await;
        assert_eq!(bridge.child_pid().await, pid);

        let input = serde_json::to_string(&ClientMessage::pty_input("shared\n")).unwrap();
        second.send(Message::Text(input)).await.unwrap();
        let output = output_until(&mut second, "shared").await;
        assert!(output.contains("shared"));

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_reported_to_client() {
        let bridge = started("definitely-not-a-real-command-7f3a", "").await;
        let (mut client, _) = connect_async(bridge.get_url()).await.unwrap();

        let mut saw_error = false;
        while let Some(message) = next_message(&mut client).await {
            if let ServerMessage::Error { code, .. } = message {
                assert_eq!(code, Some(ErrorCode::SpawnFailed));
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(bridge.is_running());

        bridge.stop().await;
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let bridge = started("cat", "").await;
        let mut client = connect(&bridge).await;

        bridge.stop().await;

        // Drain until the close frame or end of stream
        let closed = timeout(Duration::from_secs(3), async {
            while let Some(Ok(message)) = client.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());
    }

    #[tokio::test]
    async fn test_handle_message_ping() {
        let bridge = SessionBridge::new(SessionConfig::new("cat"));
        let reply = handle_message(r#"{"type": "ping", "seq": 42}"#, &bridge).await;
        assert_eq!(reply, Some(ServerMessage::Pong { seq: 42 }));
    }

    #[tokio::test]
    async fn test_handle_message_without_session() {
        let bridge = SessionBridge::new(SessionConfig::new("cat"));
        assert!(handle_message(r#"{"type": "pty_input", "input": "x"}"#, &bridge)
            .await
            .is_none());
        assert!(handle_message(r#"{"type": "resize", "rows": 24, "cols": 80}"#, &bridge)
            .await
            .is_none());
    }
}
