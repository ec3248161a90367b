//! The login/registration handshake and the flat-file credential store.

use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Instant;

use argon2::Argon2;
use password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

use chatio::{write_line, LineReader};

use crate::throttle::{wait_seconds, LoginThrottle};

/// Separator between username and secret in a store line. Usernames may not
/// contain it; secrets may, because the split takes the FIRST separator.
pub const CRED_SEP: char = ':';

pub const LOGIN_PROMPT: &[u8] = b"login: ";
pub const PASSWORD_PROMPT: &[u8] = b"password: ";

/// Flat-file credential store, one `username:secret` record per line.
///
/// The file is re-read in full on every authentication attempt; there is no
/// in-memory cache. `append` only ever adds lines, it never rewrites.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Parse the store. A missing file means nobody has registered yet.
    ///
    /// Lines without the separator are skipped. Duplicate usernames resolve
    /// to the last line, since the map is assembled by sequential overwrite.
    pub fn load(&self) -> io::Result<HashMap<String, String>> {
        let s = match std::fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(e) => return Err(e),
        };

        let mut users = HashMap::new();
        for line in s.lines() {
            if let Some((name, secret)) = line.trim().split_once(CRED_SEP) {
                users.insert(name.to_string(), secret.to_string());
            }
        }
        Ok(users)
    }

    /// Append one record, creating the file if absent.
    ///
    /// No uniqueness check here; callers gate on `load`. Two racing
    /// first-time registrations of the same name can therefore both append,
    /// and the later line wins on the next `load` (documented limitation).
    pub fn append(&self, username: &str, secret: &str) -> io::Result<()> {
        use std::io::Write;

        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(f, "{username}{CRED_SEP}{secret}")?;
        Ok(())
    }
}

/// How a NEW registration's secret is written to the store.
///
/// `Plain` keeps the historical cleartext format and is a known weakness,
/// preserved for compatibility with existing store files. `Argon2` writes a
/// salted PHC hash instead; the handshake is identical under both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordScheme {
    Plain,
    Argon2,
}

impl PasswordScheme {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" => Some(Self::Plain),
            "argon2" => Some(Self::Argon2),
            _ => None,
        }
    }

    pub fn protect(self, password: &str) -> anyhow::Result<String> {
        match self {
            PasswordScheme::Plain => Ok(password.to_string()),
            PasswordScheme::Argon2 => {
                let salt = SaltString::generate(&mut password_hash::rand_core::OsRng);
                let hash = Argon2::default()
                    .hash_password(password.as_bytes(), &salt)
                    .map_err(|e| anyhow::anyhow!("hash_password failed: {e}"))?
                    .to_string();
                Ok(hash)
            }
        }
    }
}

/// Stored secrets are self-describing: PHC strings verify via argon2,
/// anything else compares as cleartext.
pub fn verify_secret(password: &str, stored: &str) -> bool {
    if stored.starts_with("$argon2") {
        match PasswordHash::new(stored) {
            Ok(ph) => Argon2::default()
                .verify_password(password.as_bytes(), &ph)
                .is_ok(),
            Err(_) => false,
        }
    } else {
        stored == password
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Existing user, secret verified.
    LoggedIn(String),
    /// Unknown user; the pair was persisted as a new record.
    Registered(String),
    /// Explicit rejection; the reason was already written to the peer.
    Rejected,
}

impl AuthOutcome {
    pub fn username(&self) -> Option<&str> {
        match self {
            AuthOutcome::LoggedIn(u) | AuthOutcome::Registered(u) => Some(u),
            AuthOutcome::Rejected => None,
        }
    }
}

/// Drives the two-step handshake over a fresh connection.
///
/// Unknown usernames register on the spot: login and signup are one prompt
/// sequence, at the cost of typos creating unintended accounts.
pub struct Authenticator {
    store: CredentialStore,
    scheme: PasswordScheme,
    throttle: tokio::sync::Mutex<LoginThrottle>,
}

impl Authenticator {
    pub fn new(store: CredentialStore, scheme: PasswordScheme) -> Self {
        Self {
            store,
            scheme,
            throttle: tokio::sync::Mutex::new(LoginThrottle::default()),
        }
    }

    /// Prompt for username and password, then accept, register, or reject.
    ///
    /// An I/O error anywhere in the exchange aborts the session before it is
    /// ever registered; no partial state is left behind.
    pub async fn handshake<R, W>(
        &self,
        reader: &mut LineReader<R>,
        writer: &mut W,
        peer_ip: IpAddr,
    ) -> anyhow::Result<AuthOutcome>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        writer.write_all(LOGIN_PROMPT).await?;
        let Some(raw) = reader.read_line().await? else {
            anyhow::bail!("peer closed at login prompt");
        };
        let username = String::from_utf8_lossy(&raw).trim().to_string();

        writer.write_all(PASSWORD_PROMPT).await?;
        let Some(raw) = reader.read_line().await? else {
            anyhow::bail!("peer closed at password prompt");
        };
        let mut password = String::from_utf8_lossy(&raw).trim().to_string();

        let res = self.decide(&username, &password, writer, peer_ip).await;
        password.zeroize();
        res
    }

    async fn decide<W>(
        &self,
        username: &str,
        password: &str,
        writer: &mut W,
        peer_ip: IpAddr,
    ) -> anyhow::Result<AuthOutcome>
    where
        W: AsyncWrite + Unpin,
    {
        // A name containing the separator would corrupt the store on append.
        if username.is_empty() || username.contains(CRED_SEP) {
            write_line(writer, b"invalid login").await?;
            return Ok(AuthOutcome::Rejected);
        }

        let now = Instant::now();
        let wait = { self.throttle.lock().await.wait(peer_ip, username, now) };
        if !wait.is_zero() {
            let msg = format!("try again in {}s", wait_seconds(wait));
            write_line(writer, msg.as_bytes()).await?;
            return Ok(AuthOutcome::Rejected);
        }

        let users = self.store.load()?;
        match users.get(username) {
            Some(stored) if verify_secret(password, stored) => {
                self.throttle.lock().await.note_success(peer_ip, username);
                let msg = format!("logged in as {username}");
                write_line(writer, msg.as_bytes()).await?;
                Ok(AuthOutcome::LoggedIn(username.to_string()))
            }
            Some(_) => {
                self.throttle
                    .lock()
                    .await
                    .note_failure(peer_ip, username, now);
                write_line(writer, b"invalid password").await?;
                Ok(AuthOutcome::Rejected)
            }
            None => {
                self.store.append(username, &self.scheme.protect(password)?)?;
                let msg = format!("registered and logged in as {username}");
                write_line(writer, msg.as_bytes()).await?;
                Ok(AuthOutcome::Registered(username.to_string()))
            }
        }
    }
}
