//! End-to-end over the framed TCP transport: frames in, session replies out.

use std::sync::Arc;

use orbit_host::transport;
use orbit_proto::{decode_frame, encode_frame, ErrCode, Msg, MsgOp, PinReq, ValType};
use orbit_testkit::{login_msg, mem_host, pin_msg};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn write_frame(stream: &mut TcpStream, msg: &Msg) {
    let mut buf = Vec::new();
    encode_frame(msg, &mut buf).unwrap();
    stream.write_all(&buf).await.unwrap();
}

async fn read_frame(stream: &mut TcpStream) -> Vec<Msg> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();

    let mut frame = Vec::with_capacity(4 + len);
    frame.extend_from_slice(&len_buf);
    frame.extend_from_slice(&body);
    let (msgs, used) = decode_frame(&frame).unwrap();
    assert_eq!(used, frame.len());
    msgs
}

#[tokio::test]
async fn login_round_trips_over_tcp() {
    let host = mem_host();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = {
        let host = host.clone();
        tokio::spawn(transport::serve_listener(host, listener))
    };

    let mut client = TcpStream::connect(addr).await.unwrap();
    write_frame(&mut client, &login_msg(1, &[0x01])).await;

    let msgs = read_frame(&mut client).await;
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].op, MsgOp::Login);
    assert_eq!(msgs[0].req_id, 1);
    assert_eq!(msgs[0].val_type, ValType::Nil);

    // An unauthorized pin still gets its error frame over the same stream.
    drop(client);
    let mut client = TcpStream::connect(addr).await.unwrap();
    let pin = PinReq {
        pin_cell: 3,
        content_schema: 42,
        ..PinReq::default()
    };
    write_frame(&mut client, &pin_msg(7, &pin)).await;
    let msgs = read_frame(&mut client).await;
    assert_eq!(msgs[0].op, MsgOp::CloseReq);
    assert_eq!(msgs[0].req_id, 7);
    let err = msgs[0].err().unwrap();
    assert_eq!(err.code, ErrCode::InsufficientPermissions);

    host.shutdown();
    let _ = server.await;
}

#[tokio::test]
async fn shutdown_stops_the_accept_loop() {
    let host = mem_host();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut server = tokio::spawn(transport::serve_listener(Arc::clone(&host), listener));

    // The signal is only seen once the accept loop has subscribed, so keep
    // nudging until the task exits.
    let result = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            host.shutdown();
            tokio::select! {
                res = &mut server => break res,
                _ = tokio::time::sleep(std::time::Duration::from_millis(10)) => {}
            }
        }
    })
    .await
    .expect("serve loop did not stop");
    assert!(result.unwrap().is_ok());
}
