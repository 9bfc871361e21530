use std::net::SocketAddr;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

use rudis::client::{processors, DataError};
use rudis::codec::RespCodec;
use rudis::{Client, ClientConfig, Command, CommandExecution, Endpoint, Error, Message};

/// A minimal scripted server speaking just enough RESP to exercise the
/// executor: PING, ECHO, and MULTI/EXEC queueing.
async fn spawn_mock_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve(stream));
        }
    });

    addr
}

async fn serve(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut requests = FramedRead::new(read_half, RespCodec::new(&ClientConfig::default()));

    // Replies queued between MULTI and EXEC.
    let mut queued: Option<Vec<Message>> = None;

    while let Some(Ok(request)) = requests.next().await {
        let reply = respond(&request, &mut queued);
        send(&mut write_half, &reply).await;
    }
}

async fn send(write_half: &mut OwnedWriteHalf, reply: &Message) {
    write_half.write_all(&reply.serialize()).await.unwrap();
    write_half.flush().await.unwrap();
}

fn respond(request: &Message, queued: &mut Option<Vec<Message>>) -> Message {
    let Message::Array(Some(parts)) = request else {
        return Message::Error("ERR expected a command array".to_string());
    };
    let args: Vec<Bytes> = parts
        .iter()
        .filter_map(|part| match part {
            Message::Bulk(Some(bytes)) => Some(bytes.clone()),
            _ => None,
        })
        .collect();
    let name = args
        .first()
        .map(|n| String::from_utf8_lossy(n).to_uppercase())
        .unwrap_or_default();

    match name.as_str() {
        "MULTI" => {
            *queued = Some(Vec::new());
            return Message::Simple("OK".to_string());
        }
        "EXEC" => {
            return match queued.take() {
                Some(replies) => Message::Array(Some(replies)),
                None => Message::Error("ERR EXEC without MULTI".to_string()),
            };
        }
        _ => {}
    }

    let reply = match name.as_str() {
        "PING" => Message::Simple("PONG".to_string()),
        "ECHO" => match args.get(1) {
            Some(arg) => Message::Bulk(Some(arg.clone())),
            None => Message::Error("ERR wrong number of arguments".to_string()),
        },
        _ => Message::Error("ERR unknown command".to_string()),
    };

    match queued.as_mut() {
        Some(pending) => {
            pending.push(reply);
            Message::Simple("QUEUED".to_string())
        }
        None => reply,
    }
}

async fn connect() -> Client {
    let addr = spawn_mock_server().await;
    Client::new(
        Endpoint::new("127.0.0.1", addr.port()),
        ClientConfig::default(),
    )
}

#[tokio::test]
async fn test_ping() {
    let client = connect().await;

    let reply = client
        .execute(Command::new("PING"), processors::simple_string)
        .await
        .unwrap();

    assert_eq!(reply, "PONG");
}

#[tokio::test]
async fn test_echo() {
    let client = connect().await;

    let reply = client
        .execute(Command::new("ECHO").arg("hello"), processors::bulk)
        .await
        .unwrap();

    assert_eq!(reply, Some(Bytes::from("hello")));
}

#[tokio::test]
async fn test_concurrent_tasks_get_their_own_replies() {
    let client = connect().await;

    let mut handles = Vec::new();
    for i in 0..16u32 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let expected = format!("task-{}", i);
            let reply = client
                .execute(
                    Command::new("ECHO").arg(expected.clone().into_bytes()),
                    processors::bulk,
                )
                .await
                .unwrap();
            assert_eq!(reply, Some(Bytes::from(expected)));
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        handle.await.unwrap();
        succeeded += 1;
    }
    assert_eq!(succeeded, 16);
}

#[tokio::test]
async fn test_batch_returns_ordered_replies() {
    let client = connect().await;

    let executions = vec![
        CommandExecution::from(Command::new("ECHO").arg("one")),
        CommandExecution::from(Command::new("ECHO").arg("two")),
        CommandExecution::from(Command::new("ECHO").arg("three")),
    ];
    let replies = client.execute_batch(executions).await.unwrap();

    assert_eq!(
        replies,
        vec![
            Message::Bulk(Some(Bytes::from("one"))),
            Message::Bulk(Some(Bytes::from("two"))),
            Message::Bulk(Some(Bytes::from("three"))),
        ]
    );
}

#[tokio::test]
async fn test_batch_decodes_each_reply_with_its_own_processor() {
    let client = connect().await;

    let executions = vec![
        CommandExecution::new(Command::new("ECHO").arg("one"), processors::bulk),
        CommandExecution::new(Command::new("ECHO").arg("two"), processors::bulk),
    ];
    let replies = client.execute_batch(executions).await.unwrap();

    assert_eq!(
        replies,
        vec![Some(Bytes::from("one")), Some(Bytes::from("two"))]
    );
}

#[tokio::test]
async fn test_batch_processor_failure_leaves_no_stale_replies() {
    let client = connect().await;

    // The second reply is a server error, which its processor turns into a
    // DataError after every reply in the batch has been read.
    let executions = vec![
        CommandExecution::new(Command::new("ECHO").arg("ok"), processors::bulk),
        CommandExecution::new(Command::new("NOPE"), processors::bulk),
    ];
    let err = client.execute_batch(executions).await.unwrap_err();
    assert!(matches!(err, Error::Data(DataError::ServerError(_))));

    // Nothing from the failed batch is left queued: the next exchange pairs
    // with its own reply.
    let reply = client
        .execute(Command::new("ECHO").arg("after"), processors::bulk)
        .await
        .unwrap();
    assert_eq!(reply, Some(Bytes::from("after")));
}

#[tokio::test]
async fn test_execute_reconnects_after_forced_disconnect() {
    let client = connect().await;

    let reply = client
        .execute(Command::new("PING"), processors::simple_string)
        .await
        .unwrap();
    assert_eq!(reply, "PONG");

    client.disconnect().await;

    // The next call connects lazily on the same client.
    let reply = client
        .execute(Command::new("PING"), processors::simple_string)
        .await
        .unwrap();
    assert_eq!(reply, "PONG");
}

#[tokio::test]
async fn test_pipeline() {
    let client = connect().await;

    let mut pipeline = client.pipeline();
    pipeline
        .cmd(Command::new("PING"))
        .cmd(Command::new("ECHO").arg("pipelined"));
    let replies = pipeline.execute().await.unwrap();

    assert_eq!(
        replies,
        vec![
            Message::Simple("PONG".to_string()),
            Message::Bulk(Some(Bytes::from("pipelined"))),
        ]
    );
}

#[tokio::test]
async fn test_transaction_unwraps_exec_reply() {
    let client = connect().await;

    let mut transaction = client.transaction();
    transaction
        .cmd(Command::new("ECHO").arg("first"))
        .cmd(Command::new("ECHO").arg("second"));
    let replies = transaction.execute().await.unwrap();

    assert_eq!(
        replies,
        vec![
            Message::Bulk(Some(Bytes::from("first"))),
            Message::Bulk(Some(Bytes::from("second"))),
        ]
    );
}

#[tokio::test]
async fn test_exclusive_session_runs_dependent_commands() {
    let client = connect().await;

    let mut session = client.exclusive().await;
    let first = session
        .execute(Command::new("ECHO").arg("a"), processors::bulk)
        .await
        .unwrap();
    let second = session
        .execute(Command::new("ECHO").arg("b"), processors::bulk)
        .await
        .unwrap();
    drop(session);

    assert_eq!(first, Some(Bytes::from("a")));
    assert_eq!(second, Some(Bytes::from("b")));

    // The lock is free again: an ordinary call proceeds.
    let reply = client
        .execute(Command::new("PING"), processors::simple_string)
        .await
        .unwrap();
    assert_eq!(reply, "PONG");
}

#[tokio::test]
async fn test_exclusive_session_blocks_other_callers() {
    let client = connect().await;

    let session = client.exclusive().await;

    let contender = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .execute(Command::new("PING"), processors::simple_string)
                .await
        })
    };

    // Give the contender a chance to reach the lock, then release it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!contender.is_finished());
    drop(session);

    assert_eq!(contender.await.unwrap().unwrap(), "PONG");
}

#[tokio::test]
async fn test_data_error_keeps_connection_usable() {
    let client = connect().await;

    let err = client
        .execute(Command::new("NOPE"), processors::integer)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Data(DataError::ServerError(_))));

    // The connection survived the bad reply shape.
    let reply = client
        .execute(Command::new("PING"), processors::simple_string)
        .await
        .unwrap();
    assert_eq!(reply, "PONG");
}
