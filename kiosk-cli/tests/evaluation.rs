//! MultiEval server and an in-process evaluation worker over loopback.

use kiosk_cli::{EvalExecutor, EvalWorker, ExecutionConfig, ProjectStatus};
use kiosk_core::{ClientConfig, CommunicationClient, MultiEvalConfig, MultiEvalServer, ServerConfig};
use kiosk_ipc::SignalRegistry;
use kiosk_logic::{Step, WaitPolicy};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

const TICK: Duration = Duration::from_millis(20);

fn registry() -> Arc<SignalRegistry> {
    Arc::new(SignalRegistry::with_protocol())
}

fn bind_server() -> MultiEvalServer {
    let config = MultiEvalConfig {
        server: ServerConfig {
            poll_interval: TICK,
            ..Default::default()
        },
        alive_interval: None,
        ..Default::default()
    };
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    MultiEvalServer::bind(addr, config, registry()).unwrap()
}

fn spawn_worker(addr: SocketAddr, command: Vec<String>) -> thread::JoinHandle<(Step, u64)> {
    thread::spawn(move || {
        let config = ClientConfig {
            poll_interval: TICK,
            ..Default::default()
        };
        let client = CommunicationClient::connect(addr, config, registry()).unwrap();
        let mut worker = EvalWorker::new(client, command, TICK).with_reconnect(WaitPolicy::new(2, TICK));
        let step = worker.run();
        (step, worker.evaluated())
    })
}

fn exists_command() -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        "test -e \"$0\"".to_string(),
    ]
}

fn executor(eval_timeout: Duration) -> EvalExecutor {
    EvalExecutor::new(ExecutionConfig {
        eval_timeout,
        poll_interval: TICK,
        queue_on_busy: false,
        show_progress: false,
    })
}

#[test]
fn test_projects_pass_and_fail() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present");
    std::fs::write(&present, "x").unwrap();
    let missing = dir.path().join("missing");

    let mut server = bind_server();
    let worker = spawn_worker(server.local_addr(), exists_command());
    server
        .wait_for_first_connection(1, 100, TICK)
        .unwrap();

    let projects = vec![
        present.display().to_string(),
        missing.display().to_string(),
    ];
    let results = executor(Duration::from_secs(10)).execute(&mut server, &projects);
    server.shutdown();

    assert_eq!(results.len(), 2);
    let status_of = |project: &str| {
        results
            .iter()
            .find(|r| r.project == project)
            .map(|r| r.status)
    };
    assert_eq!(status_of(&projects[0]), Some(ProjectStatus::Passed));
    assert_eq!(status_of(&projects[1]), Some(ProjectStatus::Failed));
    assert!(results.iter().all(|r| r.peer.is_some()));
    assert!(results.iter().all(|r| r.subprocess_pid.is_some()));

    let (step, evaluated) = worker.join().unwrap();
    assert_eq!(step, Step::Stop);
    assert_eq!(evaluated, 2);
}

#[test]
fn test_overdue_project_times_out() {
    let mut server = bind_server();
    let command = vec!["sleep".to_string()];
    let worker = spawn_worker(server.local_addr(), command);
    server
        .wait_for_first_connection(1, 100, TICK)
        .unwrap();

    // `sleep 2` outlives the 300 ms limit
    let results = executor(Duration::from_millis(300)).execute(&mut server, &["2".to_string()]);

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].status, ProjectStatus::TimedOut);
    server.shutdown();
    let _ = worker.join();
}

#[test]
fn test_padded_project_name_is_answered() {
    let dir = tempfile::tempdir().unwrap();
    let present = dir.path().join("present");
    std::fs::write(&present, "x").unwrap();

    let mut server = bind_server();
    let worker = spawn_worker(server.local_addr(), exists_command());
    server
        .wait_for_first_connection(1, 100, TICK)
        .unwrap();

    let projects = vec![format!(" {} ", present.display())];
    let results = executor(Duration::from_secs(10)).execute(&mut server, &projects);
    server.shutdown();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].project, projects[0]);
    assert_eq!(results[0].status, ProjectStatus::Passed);
    let (step, evaluated) = worker.join().unwrap();
    assert_eq!(step, Step::Stop);
    assert_eq!(evaluated, 1);
}

#[test]
fn test_worker_ends_when_server_vanishes() {
    let mut server = bind_server();
    let worker = spawn_worker(server.local_addr(), exists_command());
    server
        .wait_for_first_connection(1, 100, TICK)
        .unwrap();
    // Closed without Exit
    drop(server);

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(worker.join());
    });
    let (step, evaluated) = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(step, Step::Error("connection lost".to_string()));
    assert_eq!(evaluated, 0);
}
