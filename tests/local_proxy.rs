//! End-to-end SOCKS5 through the loopback front end.

use minitunnel::UserPass;
use minitunnel::local::LocalProxy;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

async fn start_proxy(auth: Option<UserPass>) -> SocketAddr {
    let mut proxy = LocalProxy::new("127.0.0.1:0").with_auth(auth);
    let addr = proxy.bind().await.unwrap();
    tokio::spawn(async move { proxy.run().await });
    addr
}

async fn tcp_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
            });
        }
    });
    addr
}

fn request(cmd: u8, addr: SocketAddr) -> Vec<u8> {
    let SocketAddr::V4(v4) = addr else {
        panic!("tests use IPv4 loopback");
    };
    let mut frame = vec![0x05, cmd, 0x00, 0x01];
    frame.extend_from_slice(&v4.ip().octets());
    frame.extend_from_slice(&v4.port().to_be_bytes());
    frame
}

async fn read_reply(client: &mut TcpStream) -> [u8; 10] {
    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();
    reply
}

#[tokio::test]
async fn connect_without_auth_relays_both_ways() {
    let proxy = start_proxy(None).await;
    let echo = tcp_echo().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    client.write_all(&request(0x01, echo)).await.unwrap();
    let reply = read_reply(&mut client).await;
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    client.write_all(b"through the relay").await.unwrap();
    let mut echoed = [0u8; 17];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(&echoed, b"through the relay");
}

#[tokio::test]
async fn userpass_is_negotiated_and_checked() {
    let auth = UserPass {
        username: "user".into(),
        password: "pass".into(),
    };
    let proxy = start_proxy(Some(auth)).await;
    let echo = tcp_echo().await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x02, 0x00, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    client.write_all(b"\x01\x04user\x04pass").await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x00]);

    client.write_all(&request(0x01, echo)).await.unwrap();
    assert_eq!(read_reply(&mut client).await[1], 0x00);
}

#[tokio::test]
async fn wrong_password_is_rejected() {
    let auth = UserPass {
        username: "user".into(),
        password: "pass".into(),
    };
    let proxy = start_proxy(Some(auth)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x02]);

    client.write_all(b"\x01\x04user\x04nope").await.unwrap();
    let mut status = [0u8; 2];
    client.read_exact(&mut status).await.unwrap();
    assert_eq!(status, [0x01, 0x01]);
}

#[tokio::test]
async fn no_acceptable_method() {
    let auth = UserPass {
        username: "user".into(),
        password: "pass".into(),
    };
    let proxy = start_proxy(Some(auth)).await;

    let mut client = TcpStream::connect(proxy).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    client.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);
}

#[tokio::test]
async fn udp_associate_round_trip() {
    let proxy = start_proxy(None).await;

    let echo = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let echo_addr = echo.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = echo.recv_from(&mut buf).await {
            let _ = echo.send_to(&buf[..n], from).await;
        }
    });

    let mut control = TcpStream::connect(proxy).await.unwrap();
    control.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    control.read_exact(&mut choice).await.unwrap();

    // Port 0 is refused by the relay, so announce a concrete client port
    let hint: SocketAddr = "127.0.0.1:1".parse().unwrap();
    control.write_all(&request(0x03, hint)).await.unwrap();
    let reply = read_reply(&mut control).await;
    assert_eq!(reply[1], 0x00);
    let relay = SocketAddr::from((
        [reply[4], reply[5], reply[6], reply[7]],
        u16::from_be_bytes([reply[8], reply[9]]),
    ));

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut datagram = request(0x00, echo_addr);
    datagram[..4].copy_from_slice(&[0x00, 0x00, 0x00, 0x01]);
    datagram.extend_from_slice(b"ping");
    client.send_to(&datagram, relay).await.unwrap();

    let mut buf = [0u8; 1500];
    let (n, _) = tokio::time::timeout(std::time::Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..3], &[0x00, 0x00, 0x00]);
    assert_eq!(&buf[n - 4..n], b"ping");
}
