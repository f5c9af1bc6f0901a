//! End-to-end tests driving the public Server API

use std::net::IpAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rozd::accounts::{challenge_digest, PermissionState};
use rozd::admission::{LoginRequest, SessionClient, SignupRequest};
use rozd::config::Config;
use rozd::{ResultCode, Server};
use tempfile::TempDir;

struct TestClient {
    disconnects: Mutex<Vec<String>>,
}

impl TestClient {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            disconnects: Mutex::new(Vec::new()),
        })
    }

    fn last_disconnect(&self) -> Option<String> {
        self.disconnects.lock().unwrap().last().cloned()
    }
}

impl SessionClient for TestClient {
    fn disconnect(&self, reason: &str) {
        self.disconnects.lock().unwrap().push(reason.to_string());
    }
}

fn test_config(data_dir: &Path) -> Config {
    Config {
        data_dir: data_dir.to_path_buf(),
        ..Config::default()
    }
}

async fn started_server(data_dir: &Path) -> Server {
    let server = Server::new(test_config(data_dir));
    server.start().await.expect("Failed to start server");
    server
}

fn source_ip() -> IpAddr {
    IpAddr::from([192, 168, 1, 50])
}

const PASSWORD_HASH: [u8; 32] = [7u8; 32];

async fn signup(server: &Server, username: &str) -> ResultCode {
    server
        .signup(&SignupRequest {
            username: username.to_string(),
            password_hash: PASSWORD_HASH,
            source: source_ip(),
        })
        .await
}

fn login_request(username: &str) -> LoginRequest {
    let hash_time = chrono::Utc::now().timestamp();
    LoginRequest {
        username: username.to_string(),
        submitted_hash: challenge_digest(&PASSWORD_HASH, hash_time).to_vec(),
        hash_time,
        source: source_ip(),
    }
}

async fn login(server: &Server, username: &str) -> (ResultCode, Arc<TestClient>) {
    let client = TestClient::new();
    let attached = client.clone();
    let code = server
        .login(&login_request(username), move || {
            Ok(attached as Arc<dyn SessionClient>)
        })
        .await;
    (code, client)
}

#[tokio::test]
async fn test_registry_closes_at_start() {
    let dir = TempDir::new().unwrap();
    let server = Server::new(test_config(dir.path()));

    server
        .register_permission("rozd.teleport", "Teleport anywhere", "warp-plugin")
        .await
        .expect("Pre-start registration failed");

    server.start().await.expect("Failed to start server");

    // Registry is closed now, even for a perfectly valid key
    assert!(server
        .register_permission("rozd.fly", "Fly", "warp-plugin")
        .await
        .is_err());
}

#[tokio::test]
async fn test_signup_and_duplicate() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;

    assert_eq!(signup(&server, "alice").await, ResultCode::NoError);
    assert_eq!(signup(&server, "ALICE").await, ResultCode::AccountNameTaken);
    assert_eq!(
        signup(&server, "bad name!").await,
        ResultCode::AccountNameInvalid
    );
}

#[tokio::test]
async fn test_login_logout_cycle() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    let (code, _client) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);
    assert!(server.is_online("Alice").await);
    assert_eq!(server.session_count().await, 1);

    assert!(server.logout("alice").await);
    assert!(!server.is_online("alice").await);

    // A second login after logout works
    let (code, _client) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);
}

#[tokio::test]
async fn test_wrong_password_rejected() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    let hash_time = chrono::Utc::now().timestamp();
    let req = LoginRequest {
        username: "alice".to_string(),
        submitted_hash: challenge_digest(&[9u8; 32], hash_time).to_vec(),
        hash_time,
        source: source_ip(),
    };
    let code = server
        .login(&req, || Ok(TestClient::new() as Arc<dyn SessionClient>))
        .await;
    assert_eq!(code, ResultCode::IncorrectLogin);
    assert!(!server.is_online("alice").await);
}

#[tokio::test]
async fn test_second_login_evicts_first() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    let (_, first) = login(&server, "alice").await;
    let (code, _second) = login(&server, "alice").await;

    assert_eq!(code, ResultCode::NoError);
    assert_eq!(
        first.last_disconnect().as_deref(),
        Some("replaced by new login")
    );
    assert_eq!(server.session_count().await, 1);
}

#[tokio::test]
async fn test_ban_blocks_and_evicts() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;
    let (_, client) = login(&server, "alice").await;

    assert!(server.ban_user("Alice").await);
    assert_eq!(client.last_disconnect().as_deref(), Some("banned"));
    assert!(!server.is_online("alice").await);

    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::Banned);
    assert_eq!(signup(&server, "alice2").await, ResultCode::NoError);

    assert!(server.unban_user("alice").await);
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);
}

#[tokio::test]
async fn test_ip_ban() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    server.ban_ip(source_ip()).await;
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::Banned);
    assert_eq!(signup(&server, "bob").await, ResultCode::Banned);
}

#[tokio::test]
async fn test_whitelist_enforcement() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.whitelist = true;
    let server = Server::new(config);
    server.start().await.expect("Failed to start server");

    assert_eq!(signup(&server, "alice").await, ResultCode::NotOnWhitelist);

    server.whitelist_add("Alice").await;
    assert_eq!(signup(&server, "alice").await, ResultCode::NoError);
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);

    server.whitelist_remove("alice").await;
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NotOnWhitelist);
}

#[tokio::test]
async fn test_group_and_override_resolution() {
    let dir = TempDir::new().unwrap();
    let server = Server::new(test_config(dir.path()));
    server
        .register_permission("rozd.build.place", "Place blocks", "builder")
        .await
        .unwrap();
    server
        .register_permission("rozd.build.destroy", "Destroy blocks", "builder")
        .await
        .unwrap();
    server.start().await.unwrap();

    signup(&server, "alice").await;

    server.create_group("mods").await.unwrap();
    server.add_group_permission("mods", "rozd.build.*").await.unwrap();
    server.set_account_group("alice", "mods").await.unwrap();

    assert!(server.has_permission("alice", "rozd.build.place").await);
    assert!(server.has_permission("alice", "rozd.build.destroy").await);
    assert!(!server.has_permission("alice", "rozd.kick").await);

    // A deny override beats the group grant
    server
        .set_override("alice", "rozd.build.destroy", PermissionState::Denied)
        .await
        .unwrap();
    assert!(!server.has_permission("alice", "rozd.build.destroy").await);
    assert!(server.has_permission("alice", "rozd.build.place").await);

    // Clearing the override falls back to the group
    server
        .set_override("alice", "rozd.build.destroy", PermissionState::Unset)
        .await
        .unwrap();
    assert!(server.has_permission("alice", "rozd.build.destroy").await);
}

#[tokio::test]
async fn test_new_accounts_get_default_group_baseline() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    assert!(server.has_permission("alice", "rozd.say").await);
    assert!(server.has_permission("alice", "rozd.me").await);
    assert!(!server.has_permission("alice", "rozd.ban").await);
}

#[tokio::test]
async fn test_server_account_bypasses_checks() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;

    assert!(server.has_permission("server", "rozd.kick").await);
    assert!(server.has_permission("server", "rozd.say.server").await);
    // The server account is not loggable-into
    let (code, _) = login(&server, "server").await;
    assert_eq!(code, ResultCode::IncorrectLogin);
}

#[tokio::test]
async fn test_rename_group_retargets_members() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    server.create_group("mods").await.unwrap();
    server.add_group_permission("mods", "rozd.kick").await.unwrap();
    server.set_account_group("alice", "mods").await.unwrap();
    assert!(server.has_permission("alice", "rozd.kick").await);

    server.rename_group("mods", "staff").await.unwrap();
    assert!(server.has_permission("alice", "rozd.kick").await);
    server.set_account_group("alice", "staff").await.unwrap();
}

#[tokio::test]
async fn test_account_management_guards_live_sessions() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;
    let (_, _client) = login(&server, "alice").await;

    assert!(server.delete_account("alice").await.is_err());
    assert!(server.rename_account("alice", "alicia").await.is_err());

    server.logout("alice").await;
    server.rename_account("alice", "alicia").await.unwrap();
    assert!(server.delete_account("alicia").await.unwrap());
    assert_eq!(signup(&server, "alicia").await, ResultCode::NoError);
}

#[tokio::test]
async fn test_bot_holds_name_against_login() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;

    let bot = TestClient::new();
    assert_eq!(
        server.register_bot("alice", bot).await,
        ResultCode::NoError
    );
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::AccountNameTaken);

    server.logout("alice").await;
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);
}

#[tokio::test]
async fn test_kick_disconnects_with_reason() {
    let dir = TempDir::new().unwrap();
    let server = started_server(dir.path()).await;
    signup(&server, "alice").await;
    let (_, client) = login(&server, "alice").await;

    assert!(server.kick("alice", "be nice").await);
    assert_eq!(client.last_disconnect().as_deref(), Some("be nice"));
    assert!(!server.is_online("alice").await);
    assert!(!server.kick("alice", "again").await);
}

#[tokio::test]
async fn test_synthesized_record_references_loaded_default_group() {
    let dir = TempDir::new().unwrap();
    let perm_dir = dir.path().join("permissions");
    let accounts_dir = dir.path().join("accounts");
    tokio::fs::create_dir_all(&perm_dir).await.unwrap();
    tokio::fs::create_dir_all(&accounts_dir).await.unwrap();

    // A persisted default group whose name differs from the configured
    // one, and an account that predates per-account permission records
    tokio::fs::write(
        perm_dir.join("group-members.json"),
        r#"{"name":"members","isDefault":true,"permissions":["rozd.say"]}"#,
    )
    .await
    .unwrap();
    tokio::fs::write(
        accounts_dir.join("alice.alice.json"),
        format!(
            concat!(
                r#"{{"username":"alice","displayName":"alice","passwordHash":"{}","#,
                r#""creationDate":"2024-01-01T00:00:00Z","creationIp":"10.0.0.1"}}"#,
            ),
            hex::encode(PASSWORD_HASH)
        ),
    )
    .await
    .unwrap();

    let server = started_server(dir.path()).await;

    let record = tokio::fs::read_to_string(perm_dir.join("player-alice.json"))
        .await
        .expect("Missing synthesized permission record");
    let json: serde_json::Value = serde_json::from_str(&record).unwrap();
    assert_eq!(json["group"], "members");

    assert!(server.has_permission("alice", "rozd.say").await);
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = TempDir::new().unwrap();

    {
        let server = Server::new(test_config(dir.path()));
        server
            .register_permission("rozd.build.place", "Place blocks", "builder")
            .await
            .unwrap();
        server.start().await.unwrap();

        signup(&server, "alice").await;
        server.create_group("mods").await.unwrap();
        server.add_group_permission("mods", "rozd.build.*").await.unwrap();
        server.set_account_group("alice", "mods").await.unwrap();
        server
            .set_override("alice", "rozd.say", PermissionState::Denied)
            .await
            .unwrap();
        server.ban_user("mallory").await;
        server.save_all().await;
    }

    let server = Server::new(test_config(dir.path()));
    server
        .register_permission("rozd.build.place", "Place blocks", "builder")
        .await
        .unwrap();
    server.start().await.unwrap();

    assert!(server.has_permission("alice", "rozd.build.place").await);
    assert!(!server.has_permission("alice", "rozd.say").await);
    assert_eq!(signup(&server, "alice").await, ResultCode::AccountNameTaken);
    let (code, _) = login(&server, "alice").await;
    assert_eq!(code, ResultCode::NoError);

    let req = SignupRequest {
        username: "mallory".to_string(),
        password_hash: PASSWORD_HASH,
        source: IpAddr::from([10, 9, 8, 7]),
    };
    assert_eq!(server.signup(&req).await, ResultCode::Banned);
}
