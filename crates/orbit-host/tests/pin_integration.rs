//! Pin engine integration: ordering, checkpoints, cancellation, and failure
//! scoping per request.

use std::sync::Arc;

use orbit_proto::{ErrCode, Msg, MsgOp, PinReq, HOST_SESSION_CELL_ID};
use orbit_testkit::{
    expect_err, login_msg, mem_host, pin_msg, recv_reply, recv_until, resolve_msg, simple_defs,
    ScriptStep, ScriptedApp,
};

async fn logged_in_session(
    host: &Arc<orbit_host::Host>,
) -> orbit_host::SessionHandle {
    let mut session = host.start_session();
    session.inbox.send(login_msg(1, &[0x01])).await.unwrap();
    recv_reply(&mut session.outbox).await;
    session
        .inbox
        .send(resolve_msg(2, &simple_defs("filesys/dir", 42)))
        .await
        .unwrap();
    recv_reply(&mut session.outbox).await;
    session
}

fn dir_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::Attr {
            cell_id: 0,
            attr_id: 7,
            value: 1,
        },
        ScriptStep::Insert { cell_id: 101 },
        ScriptStep::Attr {
            cell_id: 101,
            attr_id: 7,
            value: 2,
        },
    ]
}

fn session_pin(req_id: u64) -> Msg {
    pin_msg(
        req_id,
        &PinReq {
            pin_cell: HOST_SESSION_CELL_ID,
            content_schema: 42,
            ..PinReq::default()
        },
    )
}

#[tokio::test]
async fn pin_streams_state_in_order_and_checkpoints() {
    let host = mem_host();
    host.register_app(Arc::new(
        ScriptedApp::new("test/dir/v1", "filesys/dir").with_script(dir_script()),
    ))
    .unwrap();

    let mut session = logged_in_session(&host).await;
    session.inbox.send(session_pin(3)).await.unwrap();

    let msgs = recv_until(&mut session.outbox, 3, MsgOp::CloseReq).await;
    let ops: Vec<MsgOp> = msgs.iter().map(|m| m.op).collect();
    assert_eq!(
        ops,
        vec![
            MsgOp::PinCell,
            MsgOp::PushAttr,
            MsgOp::InsertCell,
            MsgOp::PushAttr,
            MsgOp::Commit,
            MsgOp::CloseReq,
        ]
    );

    // The PinCell reply names the pinned cell.
    assert_eq!(msgs[0].cell_id, HOST_SESSION_CELL_ID);
    // The InsertCell for a child precedes its attr pushes.
    assert_eq!(msgs[2].cell_id, 101);
    assert_eq!(msgs[3].cell_id, 101);
    // The checkpoint commit arrives after every queued push.
    assert!(msgs[4].is_checkpoint());
    // Clean completion: the terminal close carries no error.
    assert!(msgs[5].err().is_none());
    // Every message rides the pin's request ID.
    assert!(msgs.iter().all(|m| m.req_id == 3));
}

#[tokio::test]
async fn unknown_schema_closes_with_type_not_registered() {
    let host = mem_host();
    host.register_app(Arc::new(ScriptedApp::new("test/dir/v1", "filesys/dir")))
        .unwrap();

    let mut session = logged_in_session(&host).await;
    session
        .inbox
        .send(pin_msg(
            4,
            &PinReq {
                pin_cell: 10,
                content_schema: 999,
                ..PinReq::default()
            },
        ))
        .await
        .unwrap();

    // A single terminal CloseReq, no PinCell reply first.
    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(reply.op, MsgOp::CloseReq);
    assert_eq!(reply.req_id, 4);
    assert_eq!(expect_err(&reply).code, ErrCode::TypeNotRegistered);
}

#[tokio::test]
async fn missing_app_closes_with_app_not_found() {
    let host = mem_host();
    // No app registered for "filesys/dir".
    let mut session = logged_in_session(&host).await;
    session.inbox.send(session_pin(3)).await.unwrap();

    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(reply.op, MsgOp::CloseReq);
    assert_eq!(expect_err(&reply).code, ErrCode::AppNotFound);
}

#[tokio::test]
async fn cancel_mid_stream_stops_pushes_and_closes_once() {
    let host = mem_host();
    host.register_app(Arc::new(
        ScriptedApp::new("test/dir/v1", "filesys/dir")
            .with_script(dir_script())
            .lingering(),
    ))
    .unwrap();

    let mut session = logged_in_session(&host).await;
    session.inbox.send(session_pin(3)).await.unwrap();

    // Stream up to the checkpoint; the lingering app keeps the pin open.
    let msgs = recv_until(&mut session.outbox, 3, MsgOp::Commit).await;
    assert!(msgs.last().unwrap().is_checkpoint());

    session.inbox.send(Msg::new(MsgOp::CloseReq, 3)).await.unwrap();

    // The next and last message on the request is the terminal CloseReq.
    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(reply.op, MsgOp::CloseReq);
    assert_eq!(reply.req_id, 3);
    match reply.err() {
        Some(err) => assert_eq!(err.code, ErrCode::ReqCanceled),
        None => {} // an empty close is also a valid cancel ack
    }

    // Afterwards the request ID is free again.
    session.inbox.send(session_pin(3)).await.unwrap();
    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(reply.op, MsgOp::PinCell);
    assert_eq!(reply.req_id, 3);
}

#[tokio::test]
async fn duplicate_live_request_id_fails_invalid_req() {
    let host = mem_host();
    host.register_app(Arc::new(
        ScriptedApp::new("test/dir/v1", "filesys/dir")
            .with_script(dir_script())
            .lingering(),
    ))
    .unwrap();

    let mut session = logged_in_session(&host).await;
    session.inbox.send(session_pin(3)).await.unwrap();
    recv_until(&mut session.outbox, 3, MsgOp::Commit).await;

    // Request 3 is still streaming; reusing it must fail.
    session.inbox.send(session_pin(3)).await.unwrap();
    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(reply.op, MsgOp::CloseReq);
    assert_eq!(reply.req_id, 3);
    assert_eq!(expect_err(&reply).code, ErrCode::InvalidReq);
}

#[tokio::test]
async fn app_failure_closes_the_request_not_the_session() {
    #[derive(Debug)]
    struct FailingApp;

    #[async_trait::async_trait]
    impl orbit_host::App for FailingApp {
        fn app_uri(&self) -> &str {
            "test/fail/v1"
        }
        fn data_model_uris(&self) -> Vec<String> {
            vec!["filesys/dir".to_string()]
        }
        async fn resolve_request(
            &self,
            _req: &mut orbit_host::CellReq,
        ) -> anyhow::Result<()> {
            anyhow::bail!(ErrCode::NotPinnable.err("this cell cannot be pinned"))
        }
        async fn push_cell_state(
            &self,
            _sub: Arc<dyn orbit_host::CellSub>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    let host = mem_host();
    host.register_app(Arc::new(FailingApp)).unwrap();

    let mut session = logged_in_session(&host).await;
    session.inbox.send(session_pin(3)).await.unwrap();

    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(reply.op, MsgOp::CloseReq);
    assert_eq!(expect_err(&reply).code, ErrCode::NotPinnable);

    // The session keeps serving.
    session.inbox.send(Msg::new(MsgOp::CloseReq, 99)).await.unwrap();
    let reply = recv_reply(&mut session.outbox).await;
    assert_eq!(expect_err(&reply).code, ErrCode::ReqNotFound);
}
