use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedSender};

use respkit::frame::{self, Frame};
use respkit::FrameStream;

/// Spins up a loopback peer that relays whatever the test sends through the
/// channel onto the socket, closing it when the sender is dropped.
async fn create_tcp_connection() -> Result<(UnboundedSender<Vec<u8>>, TcpStream), std::io::Error> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let local_addr = listener.local_addr()?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            while let Some(data) = rx.recv().await {
                if socket.write_all(&data).await.is_err() {
                    break;
                }
            }
        }
    });

    let stream = TcpStream::connect(local_addr).await?;

    Ok((tx, stream))
}

#[tokio::test]
async fn test_parse_simple_string() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"+OK\r\n".to_vec()).unwrap();

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Simple("OK".to_string())));
}

#[tokio::test]
async fn test_parse_bulk_string() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"$5\r\nhello\r\n".to_vec()).unwrap();

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Bulk(Bytes::from("hello"))));
}

#[tokio::test]
async fn test_parse_array() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx
        .send(b"*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n".to_vec())
        .unwrap();

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(
        actual,
        Some(Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("mykey")),
            Frame::Bulk(Bytes::from("myvalue")),
        ]))
    );
}

#[tokio::test]
async fn test_parse_simple_error() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"-Error message\r\n".to_vec()).unwrap();

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Error(String::from("Error message"))));
}

#[tokio::test]
async fn test_parse_integer() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b":1000\r\n".to_vec()).unwrap();

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Integer(1000)));
}

#[tokio::test]
async fn test_parse_null_bulk_string() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"$-1\r\n".to_vec()).unwrap();

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(actual, Some(Frame::Null));
}

#[tokio::test]
async fn test_parse_multiple_frames_sequentially() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"+OK\r\n".to_vec()).unwrap();
    peer_tx.send(b"$5\r\nhello\r\n".to_vec()).unwrap();
    peer_tx
        .send(b"*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n".to_vec())
        .unwrap();
    peer_tx.send(b"-Error message\r\n".to_vec()).unwrap();
    peer_tx.send(b":1000\r\n".to_vec()).unwrap();

    assert_eq!(
        frames.read_frame().await.unwrap(),
        Some(Frame::Simple("OK".to_string()))
    );
    assert_eq!(
        frames.read_frame().await.unwrap(),
        Some(Frame::Bulk(Bytes::from("hello")))
    );
    assert_eq!(
        frames.read_frame().await.unwrap(),
        Some(Frame::Array(vec![
            Frame::Bulk(Bytes::from("ECHO")),
            Frame::Bulk(Bytes::from("hi")),
        ]))
    );
    assert_eq!(
        frames.read_frame().await.unwrap(),
        Some(Frame::Error(String::from("Error message")))
    );
    assert_eq!(
        frames.read_frame().await.unwrap(),
        Some(Frame::Integer(1000))
    );
}

#[tokio::test]
async fn test_parse_incomplete_frame() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    // Command split into three parts to simulate partial sends.
    // "*3\r\n$3\r\nSET\r\n$5\r\nmykey\r\n$7\r\nmyvalue\r\n"
    let part1 = b"*3\r\n$3\r\nSE";
    let part2 = b"T\r\n$5\r\nmyke";
    let part3 = b"y\r\n$7\r\nmyvalue\r\n";

    tokio::spawn(async move {
        for part in [part1.to_vec(), part2.to_vec(), part3.to_vec()] {
            peer_tx.send(part).unwrap();
            tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        }
    });

    let actual = frames.read_frame().await.unwrap();
    assert_eq!(
        actual,
        Some(Frame::Array(vec![
            Frame::Bulk(Bytes::from("SET")),
            Frame::Bulk(Bytes::from("mykey")),
            Frame::Bulk(Bytes::from("myvalue")),
        ]))
    );
}

#[tokio::test]
async fn test_clean_eof_yields_none() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"+OK\r\n".to_vec()).unwrap();
    drop(peer_tx);

    assert_eq!(
        frames.read_frame().await.unwrap(),
        Some(Frame::Simple("OK".to_string()))
    );
    assert_eq!(frames.read_frame().await.unwrap(), None);
}

#[tokio::test]
async fn test_eof_mid_frame_is_classified() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"$10\r\nhel".to_vec()).unwrap();
    drop(peer_tx);

    let err = frames.read_frame().await.unwrap_err();
    assert!(matches!(err, frame::Error::UnexpectedEof));
}

#[tokio::test]
async fn test_oversize_bulk_header_is_rejected() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    let header = format!("${}\r\n", frame::MAX_BULK_LEN as u64 + 1);
    peer_tx.send(header.into_bytes()).unwrap();

    let err = frames.read_frame().await.unwrap_err();
    assert!(matches!(err, frame::Error::Oversize { .. }));
}

#[tokio::test]
async fn test_unknown_type_byte_is_rejected() {
    let (peer_tx, stream) = create_tcp_connection().await.unwrap();
    let mut frames = FrameStream::new(stream);

    peer_tx.send(b"?bogus\r\n".to_vec()).unwrap();

    let err = frames.read_frame().await.unwrap_err();
    assert!(matches!(err, frame::Error::InvalidTypeByte(b'?')));
}

#[tokio::test]
async fn test_write_frame_round_trips_over_a_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).await.unwrap();
    let (server_side, _) = listener.accept().await.unwrap();

    let mut writer = FrameStream::new(server_side);
    let mut reader = FrameStream::new(client);

    let value = Frame::Array(vec![
        Frame::Simple("meta".to_string()),
        Frame::Bulk(Bytes::from_static(b"binary\r\npayload")),
        Frame::Integer(-7),
        Frame::Null,
    ]);

    writer.write_frame(&value).await.unwrap();

    assert_eq!(reader.read_frame().await.unwrap(), Some(value));
}
