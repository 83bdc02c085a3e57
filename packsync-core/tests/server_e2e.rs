use chrono::Utc;
use packsync_core::checksum::Checksum;
use packsync_core::config::{ClientConfig, ExposedDirectory, SecurityConfig, ServerConfig};
use packsync_core::download::{Downloader, SyncStatus};
use packsync_core::manifest::{DirectoryEntry, FileEntry, Manifest, SyncType};
use packsync_core::progress::{NoProgress, ProgressSink};
use packsync_core::security::password::hash_password;
use packsync_core::security::signed::Authority;
use packsync_core::security::{
    self, ConnectionSecurity, PasswordSecurity, Role, SignedIdentitySecurity, AUTHENTICATION,
    CHALLENGE,
};
use packsync_core::server::{self, ServerHandle};
use packsync_core::SyncError;
use reqwest::StatusCode;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use uuid::Uuid;

const PASSWORD: &str = "hunter2";

fn exposed(name: &str, path: &str, target: &str, sync_type: SyncType) -> ExposedDirectory {
    ExposedDirectory {
        name: name.into(),
        path: path.into(),
        target_path: Some(target.into()),
        sync_type,
        recursive: false,
        remove_dangling_files: false,
        exclude: Vec::new(),
    }
}

fn start(root: &Path, directories: Vec<ExposedDirectory>, security: SecurityConfig) -> ServerHandle {
    let cfg = ServerConfig {
        root: root.to_path_buf(),
        listen_addr: "127.0.0.1:0".into(),
        directories,
        security,
        ..ServerConfig::default()
    };
    let provider = security::from_config(&cfg.security, Role::Server).unwrap();
    server::spawn(cfg, provider).unwrap()
}

fn password_config() -> SecurityConfig {
    SecurityConfig::Password { password: PASSWORD.into() }
}

fn client_config(root: &Path, server: &ServerHandle) -> ClientConfig {
    ClientConfig {
        root: root.to_path_buf(),
        remote_server: server.url(),
        stall_timeout_secs: 10,
        ..ClientConfig::default()
    }
}

fn downloader(cfg: ClientConfig, provider: Arc<dyn ConnectionSecurity>) -> Downloader {
    Downloader::new(cfg, provider, Arc::new(NoProgress)).unwrap()
}

fn password_client(password: &str) -> Arc<dyn ConnectionSecurity> {
    Arc::new(PasswordSecurity::new(password).unwrap())
}

/// `servermods/a.jar` (100 bytes) exposed as client-loaded `mods`.
fn mods_server(server_root: &Path) -> ServerHandle {
    fs::create_dir_all(server_root.join("servermods")).unwrap();
    fs::write(server_root.join("servermods/a.jar"), vec![0xAAu8; 100]).unwrap();
    start(
        server_root,
        vec![exposed("mods", "servermods", "mods", SyncType::ClientOnly)],
        password_config(),
    )
}

#[test]
fn first_sync_downloads_verifies_and_reports_roots() {
    let td = tempfile::tempdir().unwrap();
    let server = mods_server(&td.path().join("server"));
    let client_root = td.path().join("client");
    fs::create_dir_all(client_root.join("mods")).unwrap();

    let outcome =
        downloader(client_config(&client_root, &server), password_client(PASSWORD)).sync().unwrap();
    assert_eq!(outcome.downloaded, 1);
    assert_eq!(outcome.skipped, 0);
    assert_eq!(outcome.content_roots, vec![client_root.join("mods")]);

    let got = fs::read(client_root.join("mods/a.jar")).unwrap();
    assert_eq!(got, vec![0xAAu8; 100]);
    let entry = outcome.manifest.directory("mods").unwrap().file("a.jar").unwrap();
    assert_eq!(entry.checksum, Some(Checksum::of_bytes(&got)));

    let copy = fs::read_to_string(client_root.join("spl/servermanifest-copy.json")).unwrap();
    assert_eq!(Manifest::from_json(&copy).unwrap(), outcome.manifest);
}

#[test]
fn second_sync_downloads_nothing() {
    let td = tempfile::tempdir().unwrap();
    let server = mods_server(&td.path().join("server"));
    let client_root = td.path().join("client");
    fs::create_dir_all(client_root.join("mods")).unwrap();
    fs::write(client_root.join("mods/a.jar"), vec![0xAAu8; 100]).unwrap();

    let status =
        downloader(client_config(&client_root, &server), password_client(PASSWORD)).run();
    let outcome = match status {
        SyncStatus::Synced(outcome) => outcome,
        SyncStatus::Degraded(reason) => panic!("sync degraded: {reason}"),
    };
    assert_eq!(outcome.downloaded, 0);
    assert_eq!(outcome.skipped, 1);
    assert_eq!(outcome.content_roots, vec![client_root.join("mods")]);
}

#[test]
fn wrong_password_is_rejected_everywhere() {
    let td = tempfile::tempdir().unwrap();
    let server = mods_server(&td.path().join("server"));
    let client_root = td.path().join("client");

    let err = downloader(client_config(&client_root, &server), password_client("hunter3"))
        .sync()
        .unwrap_err();
    assert!(matches!(err, SyncError::Authentication(_)), "{err}");
    assert!(!client_root.join("mods/a.jar").exists());

    let http = reqwest::blocking::Client::new();
    let wrong = format!("Basic {}", hash_password("hunter3"));
    for path in ["servermanifest.json", "files/servermods/a.jar"] {
        let resp = http
            .get(format!("{}{path}", server.url()))
            .header(AUTHENTICATION, wrong.as_str())
            .send()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{path}");
        assert!(resp.headers().get(CHALLENGE).is_some(), "{path}");
        let resp = http.get(format!("{}{path}", server.url())).send().unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "{path}");
    }
}

#[test]
fn endpoints_answer_with_the_expected_statuses() {
    let td = tempfile::tempdir().unwrap();
    let server = mods_server(&td.path().join("server"));
    let http = reqwest::blocking::Client::new();
    let auth = format!("Basic {}", hash_password(PASSWORD));
    let get = |path: &str| {
        http.get(format!("{}{path}", server.url()))
            .header(AUTHENTICATION, auth.as_str())
            .send()
            .unwrap()
    };

    // Password mode has no handshake endpoint.
    let resp = get("authenticate");
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert!(resp.headers().get(CHALLENGE).is_some());

    let resp = get("servermanifest.json");
    assert_eq!(resp.status(), StatusCode::OK);
    let mf = Manifest::from_json(&resp.text().unwrap()).unwrap();
    assert_eq!(mf.directories.len(), 1);

    let resp = get("files/servermods/a.jar");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get("filename").unwrap(), "servermods/a.jar");
    assert_eq!(resp.headers().get("content-length").unwrap(), "100");
    assert_eq!(resp.bytes().unwrap().len(), 100);

    assert_eq!(get("files/servermods/missing.jar").status(), StatusCode::NOT_FOUND);
    assert_eq!(get("files/..%2F..%2Fetc%2Fpasswd").status(), StatusCode::NOT_FOUND);
    assert_eq!(get("files/a.jar").status(), StatusCode::NOT_FOUND);
    assert_eq!(get("nothing-here").status(), StatusCode::NOT_FOUND);

    let resp = http
        .post(format!("{}servermanifest.json", server.url()))
        .header(AUTHENTICATION, auth.as_str())
        .send()
        .unwrap();
    assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

    for path in ["servermanifest.json", "files/servermods/a.jar"] {
        let resp = http
            .head(format!("{}{path}", server.url()))
            .header(AUTHENTICATION, auth.as_str())
            .send()
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED, "{path}");
    }
}

#[test]
fn sync_types_control_overwrite_and_cleanup() {
    let td = tempfile::tempdir().unwrap();
    let server_root = td.path().join("server");
    fs::create_dir_all(server_root.join("serverconfig")).unwrap();
    fs::create_dir_all(server_root.join("defaults")).unwrap();
    fs::write(server_root.join("serverconfig/forced.toml"), b"server forced").unwrap();
    fs::write(server_root.join("defaults/initial.toml"), b"server initial").unwrap();

    let mut forced = exposed("forced", "serverconfig", "config", SyncType::ForceAlways);
    forced.remove_dangling_files = true;
    let initial = exposed("initial", "defaults", "defaults", SyncType::InitialOnly);
    let server = start(&server_root, vec![forced, initial], password_config());

    let client_root = td.path().join("client");
    fs::create_dir_all(client_root.join("config")).unwrap();
    fs::create_dir_all(client_root.join("defaults")).unwrap();
    fs::write(client_root.join("config/forced.toml"), b"local edit").unwrap();
    fs::write(client_root.join("config/stale.toml"), b"left over").unwrap();
    fs::write(client_root.join("defaults/initial.toml"), b"local edit").unwrap();
    fs::write(client_root.join("defaults/mine.toml"), b"kept").unwrap();

    let outcome =
        downloader(client_config(&client_root, &server), password_client(PASSWORD)).sync().unwrap();
    assert_eq!(outcome.downloaded, 1);
    assert_eq!(outcome.deleted, 1);
    assert!(outcome.content_roots.is_empty());

    assert_eq!(fs::read(client_root.join("config/forced.toml")).unwrap(), b"server forced");
    assert!(!client_root.join("config/stale.toml").exists());
    assert_eq!(fs::read(client_root.join("defaults/initial.toml")).unwrap(), b"local edit");
    assert!(client_root.join("defaults/mine.toml").exists());
}

#[test]
fn rebuilt_manifest_is_served_without_restart() {
    let td = tempfile::tempdir().unwrap();
    let server_root = td.path().join("server");
    let server = mods_server(&server_root);
    let client_root = td.path().join("client");

    fs::write(server_root.join("servermods/b.jar"), b"second").unwrap();
    server.store().rebuild().unwrap();

    let outcome =
        downloader(client_config(&client_root, &server), password_client(PASSWORD)).sync().unwrap();
    assert_eq!(outcome.downloaded, 2);
    assert_eq!(fs::read(client_root.join("mods/b.jar")).unwrap(), b"second");
}

#[test]
fn signed_identity_end_to_end() {
    let td = tempfile::tempdir().unwrap();
    let server_root = td.path().join("server");
    fs::create_dir_all(server_root.join("servermods")).unwrap();
    fs::write(server_root.join("servermods/a.jar"), vec![1u8; 100]).unwrap();
    fs::write(server_root.join("servermods/b.jar"), vec![2u8; 200]).unwrap();

    let authority = Authority::generate();
    let member = Uuid::new_v4();
    let server = start(
        &server_root,
        vec![exposed("mods", "servermods", "mods", SyncType::ClientOnly)],
        SecurityConfig::SignedIdentity {
            identity_file: None,
            authority_public_key: Some(authority.public_key_b64()),
            allow_list: vec![member],
            allow_any: false,
        },
    );
    let expires = Utc::now() + chrono::Duration::days(1);

    let client_root = td.path().join("client");
    let identity = authority.issue(member, expires);
    let client: Arc<dyn ConnectionSecurity> =
        Arc::new(SignedIdentitySecurity::client(identity).unwrap());
    let outcome = downloader(client_config(&client_root, &server), client).sync().unwrap();
    assert_eq!(outcome.downloaded, 2);
    assert_eq!(fs::read(client_root.join("mods/b.jar")).unwrap(), vec![2u8; 200]);

    let outsider_root = td.path().join("outsider");
    let outsider = authority.issue(Uuid::new_v4(), expires);
    let client: Arc<dyn ConnectionSecurity> =
        Arc::new(SignedIdentitySecurity::client(outsider).unwrap());
    let err = downloader(client_config(&outsider_root, &server), client).sync().unwrap_err();
    assert!(matches!(err, SyncError::Authentication(_)), "{err}");
    assert!(!outsider_root.join("mods/a.jar").exists());
}

#[test]
fn unreachable_server_degrades_instead_of_failing() {
    let td = tempfile::tempdir().unwrap();
    let cfg = ClientConfig {
        root: td.path().to_path_buf(),
        remote_server: "http://127.0.0.1:1/".into(),
        stall_timeout_secs: 5,
        overall_timeout_secs: Some(30),
        ..ClientConfig::default()
    };
    let status = downloader(cfg, password_client(PASSWORD)).run();
    assert!(matches!(status, SyncStatus::Degraded(_)), "{status:?}");
    assert!(status.content_roots().is_empty());
}

/// Bare HTTP/1.1 responder for misbehaving-server cases. Each connection gets its own thread;
/// `handle` receives the stream and the request path.
fn raw_server(handle: impl Fn(TcpStream, String) + Send + Sync + 'static) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = Arc::new(handle);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { continue };
            let handle = Arc::clone(&handle);
            thread::spawn(move || {
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap() == 0 || line == "\r\n" {
                        break;
                    }
                }
                let path = request_line.split_whitespace().nth(1).unwrap_or("/").to_string();
                (*handle)(stream, path);
            });
        }
    });
    addr
}

fn respond(mut stream: TcpStream, status: &str, body: &[u8]) {
    let head = format!(
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

fn single_file_manifest(data: &[u8], remove_dangling: bool) -> String {
    Manifest {
        directories: vec![DirectoryEntry {
            name: "mods".into(),
            path: "servermods".into(),
            target_path: "mods".into(),
            file_data: vec![FileEntry {
                relative_path: "a.jar".into(),
                size: data.len() as u64,
                checksum: Some(Checksum::of_bytes(data)),
            }],
            sync_type: SyncType::ClientOnly,
            should_remove_dangling_files: remove_dangling,
        }],
    }
    .to_json()
    .unwrap()
}

fn raw_client_config(root: &Path, addr: SocketAddr) -> ClientConfig {
    ClientConfig {
        root: root.to_path_buf(),
        remote_server: format!("http://{addr}/"),
        stall_timeout_secs: 20,
        ..ClientConfig::default()
    }
}

#[test]
fn corrupted_download_fails_the_run() {
    let promised = vec![1u8; 64];
    let manifest = single_file_manifest(&promised, false);
    let addr = raw_server(move |stream, path| match path.as_str() {
        "/servermanifest.json" => respond(stream, "200 OK", manifest.as_bytes()),
        "/files/servermods/a.jar" => respond(stream, "200 OK", &[2u8; 64]),
        _ => respond(stream, "404 Not Found", b""),
    });

    let td = tempfile::tempdir().unwrap();
    let err = downloader(raw_client_config(td.path(), addr), password_client(PASSWORD))
        .sync()
        .unwrap_err();
    match err {
        SyncError::Integrity { path, expected, .. } => {
            assert_eq!(path, td.path().join("mods/a.jar"));
            assert_eq!(expected, Checksum::of_bytes(&promised).to_string());
        }
        other => panic!("expected an integrity failure, got {other}"),
    }
}

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<(String, u64, u64)>>,
}

impl ProgressSink for Recording {
    fn on_progress(&self, file: &str, done: u64, total: u64) {
        self.events.lock().unwrap().push((file.to_string(), done, total));
    }
}

#[test]
fn progress_covers_the_whole_run() {
    let td = tempfile::tempdir().unwrap();
    let server_root = td.path().join("server");
    fs::create_dir_all(server_root.join("servermods")).unwrap();
    fs::write(server_root.join("servermods/a.jar"), vec![1u8; 100_000]).unwrap();
    fs::write(server_root.join("servermods/b.jar"), vec![2u8; 200_000]).unwrap();
    let server = start(
        &server_root,
        vec![exposed("mods", "servermods", "mods", SyncType::ClientOnly)],
        password_config(),
    );

    let sink = Arc::new(Recording::default());
    let cfg = client_config(&td.path().join("client"), &server);
    let outcome = Downloader::new(cfg, password_client(PASSWORD), Arc::clone(&sink) as Arc<dyn ProgressSink>)
        .unwrap()
        .sync()
        .unwrap();
    assert_eq!(outcome.downloaded, 2);

    let events = sink.events.lock().unwrap();
    assert!(!events.is_empty());
    assert!(events.iter().all(|(_, _, total)| *total == 300_000));
    assert!(events.iter().all(|(file, _, _)| file == "a.jar" || file == "b.jar"));
    assert_eq!(events.iter().map(|(_, done, _)| *done).max(), Some(300_000));
}

#[test]
fn stalled_server_hits_the_deadline() {
    let addr = raw_server(|stream, _path| {
        // Accept the request and never answer.
        thread::sleep(Duration::from_secs(30));
        drop(stream);
    });

    let td = tempfile::tempdir().unwrap();
    let cfg = ClientConfig {
        overall_timeout_secs: Some(1),
        ..raw_client_config(td.path(), addr)
    };
    let started = Instant::now();
    let status = downloader(cfg, password_client(PASSWORD)).run();
    let elapsed = started.elapsed();

    match &status {
        SyncStatus::Degraded(reason) => assert!(reason.contains("timed out"), "{reason}"),
        SyncStatus::Synced(_) => panic!("stalled server cannot produce a sync"),
    }
    assert!(status.content_roots().is_empty());
    assert!(elapsed < Duration::from_secs(10), "deadline ignored: {elapsed:?}");
}

#[test]
fn abandoned_run_leaves_the_client_tree_alone() {
    let data = vec![7u8; 32];
    let manifest = single_file_manifest(&data, true);
    let served = data.clone();
    let addr = raw_server(move |stream, path| match path.as_str() {
        "/servermanifest.json" => respond(stream, "200 OK", manifest.as_bytes()),
        "/files/servermods/a.jar" => {
            // Answer only after the host has given up.
            thread::sleep(Duration::from_millis(2500));
            respond(stream, "200 OK", &served);
        }
        _ => respond(stream, "404 Not Found", b""),
    });

    let td = tempfile::tempdir().unwrap();
    fs::create_dir_all(td.path().join("mods")).unwrap();
    fs::write(td.path().join("mods/stale.jar"), b"old").unwrap();
    let cfg = ClientConfig {
        overall_timeout_secs: Some(1),
        ..raw_client_config(td.path(), addr)
    };
    let status = downloader(cfg, password_client(PASSWORD)).run();
    assert!(matches!(status, SyncStatus::Degraded(_)), "{status:?}");

    // Long enough for the late response to arrive and the abandoned run to react to it.
    thread::sleep(Duration::from_secs(4));
    assert!(!td.path().join("mods/a.jar").exists());
    assert!(td.path().join("mods/stale.jar").exists());
}
