use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn, Level};

use chatio::LineReader;

mod admin;
mod auth;
mod registry;
mod throttle;

use auth::{AuthOutcome, Authenticator, CredentialStore, PasswordScheme};
use registry::{broadcast, Conn, Registry};

/// Historical clients sent at most 1024 bytes per message; keep that bound.
const MAX_LINE_LEN: usize = 1024;

fn usage_and_exit() -> ! {
    eprintln!(
        "relayd (line chat relay)\n\n\
USAGE:\n  relayd [--bind HOST:PORT] [--users-path PATH]\n\n\
ENV:\n  RELAYD_BIND             default 0.0.0.0:12345\n  RELAYD_USERS_PATH       default users.txt\n  RELAYD_ADMIN_BIND       default 127.0.0.1:12350 (local admin JSON)\n  RELAYD_PASSWORD_SCHEME  plain | argon2; default plain. `plain` keeps the\n                          historical cleartext store format and is NOT safe\n                          against anyone who can read the users file.\n"
    );
    std::process::exit(2);
}

#[derive(Clone, Debug)]
struct Config {
    bind: SocketAddr,
    admin_bind: SocketAddr,
    users_path: PathBuf,
    password_scheme: PasswordScheme,
}

fn parse_args() -> Config {
    let mut bind: SocketAddr = std::env::var("RELAYD_BIND")
        .unwrap_or_else(|_| "0.0.0.0:12345".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let admin_bind: SocketAddr = std::env::var("RELAYD_ADMIN_BIND")
        .unwrap_or_else(|_| "127.0.0.1:12350".to_string())
        .parse()
        .unwrap_or_else(|_| usage_and_exit());

    let mut users_path: PathBuf = std::env::var("RELAYD_USERS_PATH")
        .unwrap_or_else(|_| "users.txt".to_string())
        .into();

    let password_scheme = match std::env::var("RELAYD_PASSWORD_SCHEME") {
        Ok(v) => PasswordScheme::parse(&v).unwrap_or_else(|| usage_and_exit()),
        Err(_) => PasswordScheme::Plain,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--bind" => {
                let v = it.next().unwrap_or_else(|| usage_and_exit());
                bind = v.parse().unwrap_or_else(|_| usage_and_exit());
            }
            "--users-path" => {
                users_path = it.next().unwrap_or_else(|| usage_and_exit()).into();
            }
            "-h" | "--help" => usage_and_exit(),
            _ => usage_and_exit(),
        }
    }

    Config {
        bind,
        admin_bind,
        users_path,
        password_scheme,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,relayd=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::INFO)
        .init();

    let cfg = parse_args();
    let listener = TcpListener::bind(cfg.bind).await?;
    let admin_listener = TcpListener::bind(cfg.admin_bind).await?;

    let registry = Arc::new(Registry::new());
    let auth = Arc::new(Authenticator::new(
        CredentialStore::new(cfg.users_path.clone()),
        cfg.password_scheme,
    ));

    tokio::spawn(admin::serve_admin(admin_listener, registry.clone()));

    if cfg.password_scheme == PasswordScheme::Plain {
        warn!(
            users_path = %cfg.users_path.display(),
            "credential store uses cleartext secrets (historical format; set RELAYD_PASSWORD_SCHEME=argon2 to hash new registrations)"
        );
    }

    info!(
        bind = %cfg.bind,
        admin_bind = %cfg.admin_bind,
        users_path = %cfg.users_path.display(),
        "chat relay listening"
    );

    serve(listener, registry, auth).await
}

/// Accept loop: blocks only on accept, one task per connection. A session
/// error is logged here and never takes the process down.
async fn serve(
    listener: TcpListener,
    registry: Arc<Registry>,
    auth: Arc<Authenticator>,
) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        let auth = auth.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_conn(stream, peer, registry, auth).await {
                warn!(peer = %peer, err = %e, "connection ended with error");
            }
        });
    }
}

async fn handle_conn(
    stream: TcpStream,
    peer: SocketAddr,
    registry: Arc<Registry>,
    auth: Arc<Authenticator>,
) -> anyhow::Result<()> {
    let (rd, wr) = stream.into_split();
    let mut reader = LineReader::new(rd).max_line_len(MAX_LINE_LEN);
    let mut writer: registry::BoxedWriter = Box::new(wr);

    let outcome = auth.handshake(&mut reader, &mut writer, peer.ip()).await?;
    let Some(username) = outcome.username().map(str::to_string) else {
        info!(peer = %peer, "authentication rejected");
        return Ok(());
    };
    if matches!(outcome, AuthOutcome::Registered(_)) {
        info!(peer = %peer, username = %username, "registered new user");
    }

    let (conn, disconnect_rx) = Conn::new(username.clone(), peer, writer);
    let id = conn.id;
    registry.register(conn.clone()).await;
    info!(conn = %id, peer = %conn.peer, username = %username, "joined");
    broadcast(&registry, &format!("{username} joined the chat"), Some(id)).await;

    let res = read_loop(&mut reader, &registry, &conn, disconnect_rx).await;

    // Single finalization path: clean close, reset, oversize line, and admin
    // kick all land here, exactly once. If the broadcaster already evicted
    // this connection, the unregister is a no-op and nobody is re-announced.
    if registry.unregister(id).await.is_some() {
        broadcast(&registry, &format!("{username} left the chat"), None).await;
    }
    conn.shutdown().await;
    info!(conn = %id, username = %username, "left");
    res
}

async fn read_loop(
    reader: &mut LineReader<tokio::net::tcp::OwnedReadHalf>,
    registry: &Registry,
    conn: &Conn,
    mut disconnect_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    loop {
        let line = tokio::select! {
            res = reader.read_line() => res?,
            _ = disconnect_rx.changed() => None,
        };
        let Some(line) = line else {
            return Ok(());
        };

        let text = String::from_utf8_lossy(&line).trim().to_string();
        if text.is_empty() {
            continue;
        }

        let rendered = render_chat_line(&conn.username, &text, Utc::now());
        info!(conn = %conn.id, username = %conn.username, text = %text, "relay");
        broadcast(registry, &rendered, Some(conn.id)).await;
    }
}

/// `[HH:MM:SS] <username>: <text>`. Join/leave announcements deliberately do
/// not match this shape so clients can tell them apart.
fn render_chat_line(username: &str, text: &str, now: DateTime<Utc>) -> String {
    format!("[{}] {username}: {text}", now.format("%H:%M:%S"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{LOGIN_PROMPT, PASSWORD_PROMPT};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct TestServer {
        addr: SocketAddr,
        admin_addr: SocketAddr,
        registry: Arc<Registry>,
        users_path: PathBuf,
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.users_path);
        }
    }

    async fn spawn_server() -> TestServer {
        let mut b = [0u8; 8];
        getrandom::getrandom(&mut b).unwrap();
        let users_path = std::env::temp_dir().join(format!(
            "relayd-scenario-{:016x}.txt",
            u64::from_be_bytes(b)
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let admin_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let admin_addr = admin_listener.local_addr().unwrap();

        let registry = Arc::new(Registry::new());
        let auth = Arc::new(Authenticator::new(
            CredentialStore::new(users_path.clone()),
            PasswordScheme::Plain,
        ));
        tokio::spawn(admin::serve_admin(admin_listener, registry.clone()));
        tokio::spawn(serve(listener, registry.clone(), auth));

        TestServer {
            addr,
            admin_addr,
            registry,
            users_path,
        }
    }

    async fn read_exact_string(s: &mut TcpStream, n: usize) -> String {
        let mut buf = vec![0u8; n];
        s.read_exact(&mut buf).await.unwrap();
        String::from_utf8(buf).unwrap()
    }

    async fn read_line_string(s: &mut TcpStream) -> String {
        let mut out = Vec::new();
        loop {
            let mut b = [0u8; 1];
            let n = s.read(&mut b).await.unwrap();
            if n == 0 || b[0] == b'\n' {
                break;
            }
            out.push(b[0]);
        }
        String::from_utf8(out).unwrap()
    }

    async fn connect_and_auth(
        addr: SocketAddr,
        username: &str,
        password: &str,
    ) -> (TcpStream, String) {
        let mut s = TcpStream::connect(addr).await.unwrap();
        assert_eq!(
            read_exact_string(&mut s, LOGIN_PROMPT.len()).await,
            "login: "
        );
        s.write_all(format!("{username}\n").as_bytes()).await.unwrap();
        assert_eq!(
            read_exact_string(&mut s, PASSWORD_PROMPT.len()).await,
            "password: "
        );
        s.write_all(format!("{password}\n").as_bytes()).await.unwrap();
        let resp = read_line_string(&mut s).await;
        (s, resp)
    }

    async fn wait_for_len(registry: &Registry, n: usize) {
        for _ in 0..200 {
            if registry.len().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("registry never reached len {n}");
    }

    fn assert_chat_line(line: &str, username: &str, text: &str) {
        let (ts, rest) = line.split_once("] ").expect("timestamp prefix");
        assert_eq!(rest, format!("{username}: {text}"));
        let ts = ts.strip_prefix('[').expect("opening bracket");
        assert_eq!(ts.len(), 8);
        assert!(ts
            .chars()
            .enumerate()
            .all(|(i, c)| if i == 2 || i == 5 { c == ':' } else { c.is_ascii_digit() }));
    }

    #[test]
    fn renders_timestamped_chat_lines() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap();
        assert_eq!(
            render_chat_line("alice", "hello", now),
            "[12:34:56] alice: hello"
        );
    }

    #[tokio::test]
    async fn fresh_user_registers_then_logs_back_in() {
        let srv = spawn_server().await;

        let (s1, resp) = connect_and_auth(srv.addr, "alice", "pw1").await;
        assert_eq!(resp, "registered and logged in as alice");
        assert_eq!(
            std::fs::read_to_string(&srv.users_path).unwrap(),
            "alice:pw1\n"
        );

        drop(s1);
        wait_for_len(&srv.registry, 0).await;

        let (_s2, resp) = connect_and_auth(srv.addr, "alice", "pw1").await;
        assert_eq!(resp, "logged in as alice");
        // Login does not append a second record.
        assert_eq!(
            std::fs::read_to_string(&srv.users_path).unwrap(),
            "alice:pw1\n"
        );
    }

    #[tokio::test]
    async fn wrong_password_is_rejected_without_registering() {
        let srv = spawn_server().await;

        let (s1, _) = connect_and_auth(srv.addr, "alice", "pw1").await;
        drop(s1);
        wait_for_len(&srv.registry, 0).await;

        let (mut s2, resp) = connect_and_auth(srv.addr, "alice", "pw2").await;
        assert_eq!(resp, "invalid password");
        assert!(srv.registry.is_empty().await);
        assert_eq!(
            std::fs::read_to_string(&srv.users_path).unwrap(),
            "alice:pw1\n"
        );

        // Server closes its side after a rejection.
        let mut buf = [0u8; 1];
        assert_eq!(s2.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn messages_relay_to_peers_but_not_the_sender() {
        let srv = spawn_server().await;

        let (mut alice, _) = connect_and_auth(srv.addr, "alice", "pw1").await;
        let (mut bob, _) = connect_and_auth(srv.addr, "bob", "pw2").await;
        assert_eq!(read_line_string(&mut alice).await, "bob joined the chat");

        alice.write_all(b"hello\n").await.unwrap();
        assert_chat_line(&read_line_string(&mut bob).await, "alice", "hello");

        let mut buf = [0u8; 1];
        let got = tokio::time::timeout(Duration::from_millis(200), alice.read(&mut buf)).await;
        assert!(got.is_err(), "sender must not see her own message");
    }

    #[tokio::test]
    async fn same_sender_messages_arrive_in_order() {
        let srv = spawn_server().await;

        let (mut alice, _) = connect_and_auth(srv.addr, "alice", "pw1").await;
        let (mut bob, _) = connect_and_auth(srv.addr, "bob", "pw2").await;
        assert_eq!(read_line_string(&mut alice).await, "bob joined the chat");

        alice.write_all(b"one\ntwo\nthree\n").await.unwrap();
        assert_chat_line(&read_line_string(&mut bob).await, "alice", "one");
        assert_chat_line(&read_line_string(&mut bob).await, "alice", "two");
        assert_chat_line(&read_line_string(&mut bob).await, "alice", "three");
    }

    #[tokio::test]
    async fn abrupt_disconnect_announces_leave_and_cleans_registry() {
        let srv = spawn_server().await;

        let (mut alice, _) = connect_and_auth(srv.addr, "alice", "pw1").await;
        let (bob, _) = connect_and_auth(srv.addr, "bob", "pw2").await;
        assert_eq!(read_line_string(&mut alice).await, "bob joined the chat");

        // Reset rather than FIN: linger zero drops the connection hard.
        bob.set_linger(Some(Duration::ZERO)).unwrap();
        drop(bob);

        assert_eq!(read_line_string(&mut alice).await, "bob left the chat");
        wait_for_len(&srv.registry, 1).await;
        assert_eq!(srv.registry.usernames().await, vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn admin_kick_closes_the_session() {
        let srv = spawn_server().await;

        let (mut alice, _) = connect_and_auth(srv.addr, "alice", "pw1").await;
        wait_for_len(&srv.registry, 1).await;

        let mut s = TcpStream::connect(srv.admin_addr).await.unwrap();
        s.write_all(b"{\"type\":\"kick\",\"username\":\"alice\"}\n")
            .await
            .unwrap();
        let resp = read_line_string(&mut s).await;
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["kicked"], 1);

        // The kicked session runs its normal finalization and closes.
        let mut buf = [0u8; 1];
        assert_eq!(alice.read(&mut buf).await.unwrap(), 0);
        wait_for_len(&srv.registry, 0).await;
    }
}
