//! Built-in message routes.

use game_net::{Request, Server, ServerError};
use tracing::{debug, warn};

/// Message id answered with the request payload.
pub const ECHO_MSG_ID: u32 = 1;

/// Error code sent back for message ids nobody handles.
pub const UNKNOWN_ROUTE_ERR_CODE: u16 = 404;

pub fn register_routes(server: &Server) -> Result<(), ServerError> {
    server.add_router(ECHO_MSG_ID, echo)?;
    server.set_default_router(unknown_route);
    Ok(())
}

async fn echo(request: Request) {
    let conn = request.connection();
    debug!(conn_id = conn.conn_id(), serial = request.serial(), "Echo request");

    if let Err(e) = conn
        .send_msg(ECHO_MSG_ID, request.serial(), 0, request.data().to_vec())
        .await
    {
        warn!(conn_id = conn.conn_id(), "Echo reply failed: {}", e);
    }
}

async fn unknown_route(request: Request) {
    let conn = request.connection();
    warn!(
        conn_id = conn.conn_id(),
        remote_addr = %conn.remote_addr(),
        msg_id = request.msg_id(),
        "No route for message"
    );

    let _ = conn
        .send_msg(request.msg_id(), request.serial(), UNKNOWN_ROUTE_ERR_CODE, Vec::new())
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_net::{DataPack, FrameCodec, Message, ServerConfig};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn round_trip(stream: &mut TcpStream, msg: Message) -> Message {
        let codec = DataPack::new(0);
        stream.write_all(&codec.pack(&msg).unwrap()).await.unwrap();

        let mut head = vec![0u8; codec.head_len()];
        timeout(Duration::from_secs(5), stream.read_exact(&mut head))
            .await
            .unwrap()
            .unwrap();
        let header = codec.unpack(&head).unwrap();
        let mut data = vec![0u8; header.data_len() as usize];
        stream.read_exact(&mut data).await.unwrap();
        Message::new(header.id(), header.serial(), header.err_code(), data)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_echo_and_unknown_routes() {
        let server = Server::new(ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            worker_pool_size: 2,
            ..Default::default()
        });
        register_routes(&server).unwrap();
        let addr = server.start().await.unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();

        let reply = round_trip(&mut client, Message::new(ECHO_MSG_ID, 4, 0, b"ping".to_vec())).await;
        assert_eq!(reply.id(), ECHO_MSG_ID);
        assert_eq!(reply.serial(), 4);
        assert_eq!(reply.data(), b"ping");

        let reply = round_trip(&mut client, Message::new(77, 5, 0, b"?".to_vec())).await;
        assert_eq!(reply.id(), 77);
        assert_eq!(reply.err_code(), UNKNOWN_ROUTE_ERR_CODE);
        assert!(reply.data().is_empty());

        server.stop().await;
    }

    #[test]
    fn test_routes_register_once() {
        let server = Server::new(ServerConfig::default());
        register_routes(&server).unwrap();
        assert!(register_routes(&server).is_err());
    }
}
