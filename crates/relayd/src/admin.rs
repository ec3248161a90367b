//! Local operator endpoint: one JSON request line per connection, one JSON
//! response line back. Bind this to loopback only.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use crate::registry::Registry;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AdminReq {
    ListSessions {},
    Kick { username: String },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AdminResp {
    Ok { kicked: u64 },
    OkSessions { usernames: Vec<String> },
    Err { message: String },
}

pub async fn serve_admin(listener: TcpListener, registry: Arc<Registry>) -> anyhow::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_admin_conn(stream, registry).await {
                warn!(peer = %peer, err = %e, "admin request failed");
            }
        });
    }
}

async fn handle_admin_conn(stream: TcpStream, registry: Arc<Registry>) -> anyhow::Result<()> {
    let (rd, mut wr) = stream.into_split();
    let mut rd = BufReader::new(rd);
    let mut line = String::new();
    rd.read_line(&mut line).await?;

    let resp = match serde_json::from_str::<AdminReq>(line.trim()) {
        Ok(AdminReq::ListSessions {}) => AdminResp::OkSessions {
            usernames: registry.usernames().await,
        },
        Ok(AdminReq::Kick { username }) => {
            let conns = registry.find_by_username(&username).await;
            let kicked = conns.len() as u64;
            for conn in &conns {
                // The owning session sees the signal and runs its normal
                // finalization, leave announcement included.
                conn.request_disconnect();
            }
            info!(username = %username, kicked, "admin kick");
            AdminResp::Ok { kicked }
        }
        Err(e) => AdminResp::Err {
            message: e.to_string(),
        },
    };

    wr.write_all(serde_json::to_string(&resp)?.as_bytes()).await?;
    wr.write_all(b"\n").await?;
    Ok(())
}
