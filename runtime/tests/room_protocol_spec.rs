use std::sync::Arc;
use std::time::{Duration, Instant};

use capsules_sandbox_exec::testing::{Operation, Script, ScriptedEngine};
use capsules_sandbox_exec::{
    ContainerEngine, LogChannel, SandboxController, SandboxSettings, TIMEOUT_EXIT_CODE,
};
use coderoom_runtime::server::rooms::{
    RoomRegistry, RoomService, RunRequest, ServerMessage, BUSY_MESSAGE, EMPTY_CODE_CHUNK,
    SERVER_ERROR_CHUNK, UNSUPPORTED_LANGUAGE_CHUNK,
};
use coderoom_runtime::testing::RecordingConnection;
use serde_json::json;

fn service(engine: &ScriptedEngine) -> Arc<RoomService> {
    service_with(engine, SandboxSettings::default())
}

fn service_with(engine: &ScriptedEngine, settings: SandboxSettings) -> Arc<RoomService> {
    let sandbox = SandboxController::new(Arc::new(engine.clone()), settings);
    Arc::new(RoomService::new(
        Arc::new(RoomRegistry::new()),
        Arc::new(sandbox),
    ))
}

fn python(code: &str) -> RunRequest {
    RunRequest {
        lang: "python".to_string(),
        code: code.to_string(),
    }
}

fn run_messages(messages: &[ServerMessage]) -> Vec<ServerMessage> {
    messages
        .iter()
        .filter(|message| message.kind().starts_with("run."))
        .cloned()
        .collect()
}

fn stdout_text(messages: &[ServerMessage]) -> String {
    messages
        .iter()
        .filter_map(|message| match message {
            ServerMessage::RunStdout { chunk, .. } => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

fn stderr_chunks(messages: &[ServerMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|message| match message {
            ServerMessage::RunStderr { chunk, .. } => Some(chunk.clone()),
            _ => None,
        })
        .collect()
}

fn exit_codes(messages: &[ServerMessage]) -> Vec<i64> {
    messages
        .iter()
        .filter_map(|message| match message {
            ServerMessage::RunEnd { exit_code, .. } => Some(*exit_code),
            _ => None,
        })
        .collect()
}

fn is_start(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::RunStart { .. })
}

fn is_end(message: &ServerMessage) -> bool {
    matches!(message, ServerMessage::RunEnd { .. })
}

#[tokio::test]
async fn hello_world_streams_to_the_room_and_ends_with_zero() {
    let engine = ScriptedEngine::new(Script::exit(0).stdout("hi\n"));
    let service = service(&engine);
    let a = RecordingConnection::new();
    let b = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;
    service.connect("r1", &b.handle()).await;

    service
        .request_run("r1", &a.handle(), python("print(\"hi\")"))
        .await;

    for member in [&a, &b] {
        let messages = member.messages();
        let run = run_messages(&messages);
        assert_eq!(run.first().map(ServerMessage::kind), Some("run.start"));
        assert_eq!(run.last().map(ServerMessage::kind), Some("run.end"));
        assert_eq!(stdout_text(&messages), "hi\n");
        assert_eq!(exit_codes(&messages), vec![0]);
    }

    let run = run_messages(&a.messages());
    let ServerMessage::RunStart {
        room_id,
        run_id,
        lang,
    } = &run[0]
    else {
        panic!("expected run.start, got {:?}", run[0]);
    };
    assert_eq!(room_id, "r1");
    assert_eq!(lang, "python");
    assert!(run_id.starts_with("run-"));
    assert!(run.iter().all(|message| match message {
        ServerMessage::RunStdout { run_id: id, .. } | ServerMessage::RunEnd { run_id: id, .. } => {
            id == run_id
        }
        _ => true,
    }));
}

#[tokio::test]
async fn join_is_announced_to_every_member() {
    let engine = ScriptedEngine::new(Script::exit(0));
    let service = service(&engine);
    let a = RecordingConnection::new();
    let b = RecordingConnection::new();

    service.connect("r1", &a.handle()).await;
    service.connect("r1", &b.handle()).await;

    assert_eq!(a.kinds(), vec!["room.joined", "room.joined"]);
    assert_eq!(b.kinds(), vec!["room.joined"]);
    assert_eq!(service.registry().member_count("r1"), 2);
}

#[tokio::test]
async fn unsupported_language_is_rejected_without_a_sandbox() {
    let engine = ScriptedEngine::new(Script::exit(0));
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    let request = RunRequest {
        lang: "javascript".to_string(),
        code: "console.log(1)".to_string(),
    };
    service.request_run("r1", &a.handle(), request).await;

    let messages = a.messages();
    assert_eq!(a.kinds(), vec!["room.joined", "run.start", "run.stderr", "run.end"]);
    assert_eq!(stderr_chunks(&messages), vec![UNSUPPORTED_LANGUAGE_CHUNK]);
    assert_eq!(exit_codes(&messages), vec![1]);
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn blank_code_is_rejected_without_a_sandbox() {
    let engine = ScriptedEngine::new(Script::exit(0));
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    service.request_run("r1", &a.handle(), python("  \n\t")).await;

    let messages = a.messages();
    assert_eq!(stderr_chunks(&messages), vec![EMPTY_CODE_CHUNK]);
    assert_eq!(exit_codes(&messages), vec![1]);
    assert!(engine.calls().is_empty());
}

#[tokio::test]
async fn second_request_during_a_run_gets_busy_privately() {
    let engine = ScriptedEngine::new(
        Script::exit(0).step(Duration::from_millis(300), LogChannel::Primary, "done\n"),
    );
    let service = service(&engine);
    let a = RecordingConnection::new();
    let b = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;
    service.connect("r1", &b.handle()).await;

    let first = tokio::spawn({
        let service = Arc::clone(&service);
        let handle = a.handle();
        async move { service.request_run("r1", &handle, python("slow()")).await }
    });
    b.wait_for(is_start).await;

    service.request_run("r1", &b.handle(), python("print(2)")).await;
    service.request_run("r1", &b.handle(), python("print(3)")).await;

    let busy: Vec<_> = b
        .messages()
        .into_iter()
        .filter(|message| matches!(message, ServerMessage::RunBusy { .. }))
        .collect();
    assert_eq!(
        busy,
        vec![
            ServerMessage::RunBusy {
                room_id: "r1".into(),
                message: BUSY_MESSAGE.into(),
            };
            2
        ]
    );
    assert!(!a.kinds().contains(&"run.busy"));

    first.await.unwrap();
    assert_eq!(exit_codes(&a.messages()), vec![0]);
    assert_eq!(engine.created().len(), 1);

    // The gate is free again once run.end went out.
    service.request_run("r1", &b.handle(), python("print(4)")).await;
    assert_eq!(exit_codes(&b.messages()), vec![0, 0]);
    assert_eq!(engine.created().len(), 2);
}

#[tokio::test]
async fn runs_in_different_rooms_do_not_block_each_other() {
    let engine = ScriptedEngine::new(
        Script::exit(0).step(Duration::from_millis(200), LogChannel::Primary, "x\n"),
    );
    let service = service(&engine);
    let a = RecordingConnection::new();
    let b = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;
    service.connect("r2", &b.handle()).await;

    let first = tokio::spawn({
        let service = Arc::clone(&service);
        let handle = a.handle();
        async move { service.request_run("r1", &handle, python("a()")).await }
    });
    a.wait_for(is_start).await;
    service.request_run("r2", &b.handle(), python("b()")).await;
    first.await.unwrap();

    assert!(!b.kinds().contains(&"run.busy"));
    assert_eq!(exit_codes(&b.messages()), vec![0]);
    assert!(!a.messages().iter().any(|message| match message {
        ServerMessage::RunStart { room_id, .. } => room_id == "r2",
        _ => false,
    }));
}

#[tokio::test]
async fn timeout_reports_124_and_leaves_nothing_running() {
    let engine = ScriptedEngine::new(Script::hang().stdout("sleeping\n"));
    let settings = SandboxSettings {
        timeout: Duration::from_millis(300),
        ..SandboxSettings::default()
    };
    let service = service_with(&engine, settings);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    let started = Instant::now();
    service
        .request_run("r1", &a.handle(), python("import time; time.sleep(30)"))
        .await;

    assert!(started.elapsed() < Duration::from_secs(3));
    let messages = a.messages();
    assert_eq!(exit_codes(&messages), vec![TIMEOUT_EXIT_CODE]);
    assert_eq!(stdout_text(&messages), "sleeping\n");
    assert!(engine.list_containers().await.unwrap().is_empty());
}

#[tokio::test]
async fn primary_chunks_keep_their_order() {
    let script = Script::exit(0)
        .step(Duration::from_millis(10), LogChannel::Primary, "1\n")
        .step(Duration::from_millis(10), LogChannel::Secondary, "warn\n")
        .step(Duration::from_millis(10), LogChannel::Primary, "2\n")
        .step(Duration::from_millis(10), LogChannel::Primary, "3\n");
    let engine = ScriptedEngine::new(script);
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    service
        .request_run("r1", &a.handle(), python("for i in (1, 2, 3): print(i)"))
        .await;

    let messages = a.messages();
    assert_eq!(stdout_text(&messages), "1\n2\n3\n");
    assert_eq!(stderr_chunks(&messages), vec!["warn\n"]);
    let end = messages.iter().position(is_end).unwrap();
    assert_eq!(end, messages.len() - 1);
}

#[tokio::test]
async fn engine_failure_surfaces_as_generic_server_error() {
    let engine =
        ScriptedEngine::new(Script::exit(0)).fail_on(Operation::Create, "disk full on node-7");
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    service.request_run("r1", &a.handle(), python("print(1)")).await;

    let messages = a.messages();
    assert_eq!(a.kinds(), vec!["room.joined", "run.start", "run.stderr", "run.end"]);
    assert_eq!(stderr_chunks(&messages), vec![SERVER_ERROR_CHUNK]);
    assert_eq!(exit_codes(&messages), vec![1]);
    assert!(service.registry().try_acquire_run("r1").is_some());
}

#[tokio::test]
async fn wait_failure_is_a_server_error_after_teardown() {
    let engine = ScriptedEngine::new(Script::exit(0).stdout("ok\n"))
        .fail_on(Operation::Wait, "daemon restarted");
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    service.request_run("r1", &a.handle(), python("print('ok')")).await;

    let messages = a.messages();
    assert_eq!(stderr_chunks(&messages).last().map(String::as_str), Some(SERVER_ERROR_CHUNK));
    assert_eq!(exit_codes(&messages), vec![1]);
    assert_eq!(engine.removed().len(), 1);
}

#[tokio::test]
async fn panic_inside_a_run_still_ends_it_and_frees_the_room() {
    let engine = ScriptedEngine::with_responder(|_| panic!("responder exploded"));
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    service.request_run("r1", &a.handle(), python("print(1)")).await;

    let messages = a.messages();
    assert_eq!(stderr_chunks(&messages), vec![SERVER_ERROR_CHUNK]);
    assert_eq!(exit_codes(&messages), vec![1]);
    assert!(service.registry().try_acquire_run("r1").is_some());
}

#[tokio::test]
async fn disconnected_members_stop_receiving_broadcasts() {
    let engine = ScriptedEngine::new(Script::exit(0));
    let service = service(&engine);
    let a = RecordingConnection::new();
    let b = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;
    service.connect("r1", &b.handle()).await;

    service.disconnect("r1", b.id()).await;
    let frame = json!({"type": "chat", "text": "still here?"});
    service.handle_message("r1", &a.handle(), frame.clone()).await;

    assert_eq!(b.kinds(), vec!["room.joined"]);
    assert_eq!(
        a.messages()[2..],
        [
            ServerMessage::RoomLeft {
                room_id: "r1".into()
            },
            ServerMessage::RoomMessage {
                room_id: "r1".into(),
                data: frame,
            },
        ]
    );
}

#[tokio::test]
async fn inbound_text_is_dispatched_by_type() {
    let engine = ScriptedEngine::new(Script::exit(0).stdout("hi\n"));
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    service.handle_text("r1", &a.handle(), "definitely not json").await;
    service
        .handle_text("r1", &a.handle(), r#"{"type":"run.request","code":5}"#)
        .await;
    assert_eq!(a.kinds(), vec!["room.joined"]);

    service
        .handle_text("r1", &a.handle(), r#"{"type":"run.request","code":"print('hi')"}"#)
        .await;
    service.handle_text("r1", &a.handle(), r#"[1,2,3]"#).await;

    let messages = a.messages();
    assert_eq!(stdout_text(&messages), "hi\n");
    assert_eq!(
        messages.last(),
        Some(&ServerMessage::RoomMessage {
            room_id: "r1".into(),
            data: json!([1, 2, 3]),
        })
    );
}

#[tokio::test]
async fn run_outlives_its_requester_and_the_room_is_dropped_afterwards() {
    let engine = ScriptedEngine::new(
        Script::exit(0).step(Duration::from_millis(200), LogChannel::Primary, "late\n"),
    );
    let service = service(&engine);
    let a = RecordingConnection::new();
    service.connect("r1", &a.handle()).await;

    let run = tokio::spawn({
        let service = Arc::clone(&service);
        let handle = a.handle();
        async move { service.request_run("r1", &handle, python("late()")).await }
    });
    a.wait_for(is_start).await;

    service.disconnect("r1", a.id()).await;
    assert_eq!(service.registry().member_count("r1"), 0);
    // Only the held gate keeps the room alive.
    assert_eq!(service.registry().room_count(), 1);

    run.await.unwrap();
    assert_eq!(engine.removed().len(), 1);
    assert_eq!(service.registry().room_count(), 0);
    assert!(!a.messages().iter().any(is_end));
}

#[tokio::test]
async fn members_that_fail_a_send_are_pruned() {
    let engine = ScriptedEngine::new(Script::exit(0).stdout("x\n"));
    let service = service(&engine);
    let a = RecordingConnection::new();
    let broken = RecordingConnection::failing();
    service.connect("r1", &a.handle()).await;
    service.connect("r1", &broken.handle()).await;

    service.request_run("r1", &a.handle(), python("print('x')")).await;

    assert_eq!(exit_codes(&a.messages()), vec![0]);
    assert_eq!(service.registry().member_count("r1"), 1);
}
