//! The client's single control connection (§4.3-§4.5, §5 "one control
//! reader"): logs in once, then for as long as the process runs reads
//! framed messages and fans the per-proxy ones (`NewProxyResp`,
//! `CloseProxy`, `UpdateCert`) out to whichever [`crate::wrapper`] asked to
//! hear about them. Also the one place that dials fresh work connections,
//! since both the wrapper's topped-up pool and a reactive retry need the
//! exact same handshake.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use revtun_common::error::RevtunError;
use revtun_common::frame::{read_msg, write_msg};
use revtun_common::logging::{LogMessage, Logger};
use revtun_common::msg::{Login, LoginResp, Message, NewProxy, NewWorkConn};
use revtun_common::proxy::ProxyConfig;
use revtun_common::runid::RunId;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::transport::{self, BoxedConn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One control-plane event addressed to a specific proxy's wrapper.
#[derive(Clone, Debug)]
pub enum ServerEvent {
  StartOk { remote_addr: String },
  StartErr { error: String },
  CloseProxy,
  UpdateCert { crt_base64: String, key_base64: String },
}

pub struct ControlClient {
  config: Arc<ClientConfig>,
  outbox: mpsc::UnboundedSender<Message>,
  subscribers: RwLock<HashMap<String, mpsc::UnboundedSender<ServerEvent>>>,
  run_id: RwLock<Option<RunId>>,
  logger: Logger,
  shutdown: CancellationToken,
}

impl ControlClient {
  /// Dials the server, performs the login handshake, and spawns the
  /// reader/writer/heartbeat tasks that keep the control connection alive
  /// for the rest of the process.
  pub async fn connect(config: Arc<ClientConfig>, logger: Logger, shutdown: CancellationToken) -> Result<Arc<Self>, RevtunError> {
    let mut conn = transport::dial(&config).await?;

    let login = Login {
      version: config.version.clone(),
      hostname: config.hostname.clone(),
      os: config.os().to_string(),
      arch: config.arch().to_string(),
      user: config.user.clone(),
      run_id: config.run_id.clone(),
      metas: config.metas.clone(),
      privilege_key: config.token.clone(),
      timestamp: now_unix(),
      pool_count: config.pool_count,
      client_specs: config.proxies.iter().map(|p| p.config.proxy_type().as_str().to_string()).collect(),
    };
    write_msg(&mut conn, &Message::Login(login)).await.map_err(|e| RevtunError::Transient(format!("login write failed: {e}")))?;

    let resp = match read_msg(&mut conn).await {
      Ok(Message::LoginResp(resp)) => resp,
      Ok(_) => return Err(RevtunError::Protocol("server did not reply with LoginResp".into())),
      Err(err) => return Err(RevtunError::Transient(format!("login read failed: {err}"))),
    };
    if !resp.error.is_empty() {
      return Err(RevtunError::Auth(resp.error));
    }

    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<Message>();
    let client = Arc::new(Self {
      config,
      outbox: outbox_tx,
      subscribers: RwLock::new(HashMap::new()),
      run_id: RwLock::new(Some(resp.run_id.clone())),
      logger: logger.clone(),
      shutdown: shutdown.clone(),
    });

    let (read_half, write_half) = tokio::io::split(conn);
    tokio::spawn(writer_loop(write_half, outbox_rx, logger.clone()));
    tokio::spawn(reader_loop(read_half, client.clone()));
    tokio::spawn(heartbeat_loop(client.clone()));

    logger.send(LogMessage::info(format!("control connection established: run_id={}", resp.run_id))).await.ok();
    Ok(client)
  }

  pub async fn run_id(&self) -> Option<RunId> {
    self.run_id.read().await.clone()
  }

  /// Registers interest in events addressed to `proxy_name`; the returned
  /// receiver yields every `NewProxyResp`/`CloseProxy`/`UpdateCert` the
  /// server sends for that proxy until the wrapper drops it.
  pub async fn subscribe(&self, proxy_name: &str) -> mpsc::UnboundedReceiver<ServerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    self.subscribers.write().await.insert(proxy_name.to_string(), tx);
    rx
  }

  pub async fn unsubscribe(&self, proxy_name: &str) {
    self.subscribers.write().await.remove(proxy_name);
  }

  pub fn send_new_proxy(&self, proxy_name: String, config: ProxyConfig) {
    self.outbox.send(Message::NewProxy(NewProxy { proxy_name, config })).ok();
  }

  pub fn send_close_proxy(&self, proxy_name: String) {
    self.outbox.send(Message::CloseProxy(revtun_common::msg::CloseProxy { proxy_name })).ok();
  }

  /// Dials a brand new connection to the server and offers it as a work
  /// connection for `proxy_name` (§4.6, §6 `NewWorkConn`). The connection
  /// is handed back ready for the caller to bridge to a local backend —
  /// no further handshake happens on it; the server claims it directly.
  pub async fn dial_work_conn(&self, proxy_name: &str) -> Result<BoxedConn, RevtunError> {
    let run_id = self.run_id().await.ok_or_else(|| RevtunError::Transient("no run_id yet".into()))?;
    let mut conn = transport::dial(&self.config).await?;
    let msg = Message::NewWorkConn(NewWorkConn {
      run_id,
      proxy_name: proxy_name.to_string(),
      timestamp: now_unix(),
      privilege_key: self.config.token.clone(),
    });
    write_msg(&mut conn, &msg).await.map_err(|e| RevtunError::Transient(format!("NewWorkConn write failed: {e}")))?;
    Ok(conn)
  }

  async fn dispatch(&self, proxy_name: &str, event: ServerEvent) {
    let subscribers = self.subscribers.read().await;
    if let Some(tx) = subscribers.get(proxy_name) {
      tx.send(event).ok();
    }
  }
}

async fn writer_loop<W>(mut write_half: W, mut rx: mpsc::UnboundedReceiver<Message>, logger: Logger)
where
  W: tokio::io::AsyncWrite + Unpin,
{
  while let Some(message) = rx.recv().await {
    if write_msg(&mut write_half, &message).await.is_err() {
      break;
    }
  }
  logger.send(LogMessage::info("control writer task ended".to_string())).await.ok();
}

async fn reader_loop<R>(mut read_half: R, client: Arc<ControlClient>)
where
  R: tokio::io::AsyncRead + Unpin,
{
  loop {
    tokio::select! {
      _ = client.shutdown.cancelled() => return,
      message = read_msg(&mut read_half) => {
        match message {
          Ok(Message::Pong) => {}
          Ok(Message::NewProxyResp(resp)) => {
            let event = if resp.error.is_empty() {
              ServerEvent::StartOk { remote_addr: resp.remote_addr }
            } else {
              ServerEvent::StartErr { error: resp.error }
            };
            client.dispatch(&resp.proxy_name, event).await;
          }
          Ok(Message::CloseProxy(req)) => client.dispatch(&req.proxy_name, ServerEvent::CloseProxy).await,
          Ok(Message::UpdateCert(update)) => {
            client
              .dispatch(&update.proxy_name, ServerEvent::UpdateCert { crt_base64: update.crt_base64, key_base64: update.key_base64 })
              .await;
          }
          Ok(_) => {
            client.logger.send(LogMessage::info("control connection: unexpected message, ignoring".to_string())).await.ok();
          }
          Err(err) => {
            client.logger.send(LogMessage::error(format!("control connection closed: {err}"))).await.ok();
            client.shutdown.cancel();
            return;
          }
        }
      }
    }
  }
}

async fn heartbeat_loop(client: Arc<ControlClient>) {
  let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
  loop {
    tokio::select! {
      _ = client.shutdown.cancelled() => return,
      _ = ticker.tick() => {
        if client.outbox.send(Message::Ping).is_err() {
          return;
        }
      }
    }
  }
}

fn now_unix() -> i64 {
  std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}
