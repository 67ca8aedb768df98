use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use netbus::apps::gateway::{
    decode_id_list, encode_group, CommandFrame, KIND_BROADCAST, KIND_LOGIN, KIND_LOGIN_ACK,
};
use netbus::apps::{
    start_presence, GatewayFactory, KIND_ONLINE_LIST, KIND_QUERY_ONLINE, PRESENCE_MODULE_ID,
};
use netbus::service::Server;
use netbus::{setup_local_tracing, LogicalId, RouteBus, ServerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time;

const MAX_PACKAGE: usize = 16 * 1024;
const KIND_PING: u16 = 0x0100;

struct Stack {
    addr: SocketAddr,
    notify_shutdown: broadcast::Sender<()>,
    _shutdown_complete_rx: mpsc::Receiver<()>,
}

async fn start_stack() -> Stack {
    setup_local_tracing().unwrap();
    let config = ServerConfig::default();
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel(1);

    let bus = RouteBus::start(&config.route, &notify_shutdown, shutdown_complete_tx.clone());
    start_presence(&bus, &config, &notify_shutdown, shutdown_complete_tx.clone())
        .await
        .unwrap();
    let server = Server::bind(
        "127.0.0.1:0",
        16,
        notify_shutdown.clone(),
        shutdown_complete_tx,
        GatewayFactory::new(bus, &config),
        config.network.recv_timeout(),
    )
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move { server.run().await });

    Stack {
        addr,
        notify_shutdown,
        _shutdown_complete_rx: shutdown_complete_rx,
    }
}

struct Client {
    stream: TcpStream,
    buf: BytesMut,
}

impl Client {
    async fn login(addr: SocketAddr, id: LogicalId) -> Client {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = Client {
            stream,
            buf: BytesMut::with_capacity(4096),
        };
        client
            .send(CommandFrame::new(KIND_LOGIN, id, 0, Bytes::new()))
            .await;
        let ack = client.read_frame().await.expect("login ack");
        assert_eq!(ack.kind, KIND_LOGIN_ACK);
        assert_eq!(ack.to, id);
        client
    }

    async fn send(&mut self, frame: CommandFrame) {
        self.stream.write_all(&frame.encode()).await.unwrap();
    }

    /// `None` once the server closed the connection.
    async fn read_frame(&mut self) -> Option<CommandFrame> {
        loop {
            if let Some((frame, used)) = CommandFrame::parse(&self.buf, MAX_PACKAGE).unwrap() {
                self.buf.advance(used);
                return Some(frame);
            }
            let read = time::timeout(Duration::from_secs(3), self.stream.read_buf(&mut self.buf))
                .await
                .expect("timed out waiting for a frame");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn online(&mut self) -> Vec<LogicalId> {
        self.send(CommandFrame::new(
            KIND_QUERY_ONLINE,
            0,
            PRESENCE_MODULE_ID,
            Bytes::new(),
        ))
        .await;
        let reply = self.read_frame().await.expect("online list");
        assert_eq!(reply.kind, KIND_ONLINE_LIST);
        assert_eq!(reply.from, PRESENCE_MODULE_ID);
        decode_id_list(&reply.payload).unwrap()
    }
}

#[tokio::test]
async fn ping_reaches_the_addressed_client_once() {
    let stack = start_stack().await;
    let mut a = Client::login(stack.addr, 1007).await;
    let mut b = Client::login(stack.addr, 1009).await;

    a.send(CommandFrame::new(KIND_PING, 0, 1009, "ping")).await;
    let got = b.read_frame().await.unwrap();
    assert_eq!(got, CommandFrame::new(KIND_PING, 1007, 1009, "ping"));

    // nothing else arrives: the next frame b sees is its own presence answer
    assert_eq!(b.online().await, vec![1007, 1009]);
    drop(a);
}

#[tokio::test]
async fn broadcast_reaches_each_online_member() {
    let stack = start_stack().await;
    let mut a = Client::login(stack.addr, 2001).await;
    let mut b = Client::login(stack.addr, 2002).await;
    let mut c = Client::login(stack.addr, 2003).await;

    let payload = encode_group(&[2002, 2003, 2004], b"hello all").unwrap();
    a.send(CommandFrame::new(KIND_BROADCAST, 0, 0, payload)).await;

    for (client, id) in [(&mut b, 2002), (&mut c, 2003)] {
        let frame = client.read_frame().await.unwrap();
        assert_eq!(frame, CommandFrame::new(KIND_BROADCAST, 2001, id, "hello all"));
    }
}

#[tokio::test]
async fn presence_forgets_disconnected_clients() {
    let stack = start_stack().await;
    let mut a = Client::login(stack.addr, 3001).await;
    let b = Client::login(stack.addr, 3002).await;
    assert_eq!(a.online().await, vec![3001, 3002]);

    drop(b);
    let mut online = a.online().await;
    for _ in 0..50 {
        if online == vec![3001] {
            break;
        }
        time::sleep(Duration::from_millis(20)).await;
        online = a.online().await;
    }
    assert_eq!(online, vec![3001]);
}

#[tokio::test]
async fn malformed_frame_closes_the_connection() {
    let stack = start_stack().await;
    let mut a = Client::login(stack.addr, 4001).await;

    // body shorter than the fixed header
    a.stream.write_all(&[0, 0, 0, 3, 1, 2, 3]).await.unwrap();
    assert!(a.read_frame().await.is_none());

    // the server keeps serving others
    let mut b = Client::login(stack.addr, 4002).await;
    assert_eq!(b.online().await, vec![4002]);
}

#[tokio::test]
async fn login_with_reserved_id_is_refused() {
    let stack = start_stack().await;
    let mut stream = TcpStream::connect(stack.addr).await.unwrap();
    stream
        .write_all(&CommandFrame::new(KIND_LOGIN, PRESENCE_MODULE_ID, 0, Bytes::new()).encode())
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let read = time::timeout(Duration::from_secs(3), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));
}

#[tokio::test]
async fn shutdown_closes_client_connections() {
    let stack = start_stack().await;
    let mut a = Client::login(stack.addr, 5001).await;

    stack.notify_shutdown.send(()).unwrap();
    assert!(a.read_frame().await.is_none());
}
