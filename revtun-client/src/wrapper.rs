//! Client proxy wrapper state machine (§4.8): New → WaitStart → Running →
//! CheckFailed → Closed, one instance (and one task) per configured proxy
//! (§5 "one wrapper-loop task per proxy"). Transitions are serialised by
//! running the whole state machine on a single task rather than behind a
//! lock shared with other tasks; the health monitor and the control
//! connection's event fan-out are the only other parties involved, and both
//! talk to this task over channels rather than touching its state directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use revtun_common::logging::{LogMessage, Logger};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyWrapperConfig;
use crate::control::{ControlClient, ServerEvent};
use crate::{forwarder, health, https_plugin};

const WAIT_START_RESEND: Duration = Duration::from_secs(20);
const START_ERR_RETRY: Duration = Duration::from_secs(30);
const TICK: Duration = Duration::from_secs(3);

#[derive(Debug)]
enum Phase {
  New,
  WaitStart { last_send: Instant },
  StartErr { last_error: Instant, message: String },
  Running { remote_addr: String },
  CheckFailed,
  Closed,
}

pub struct ProxyWrapper {
  proxy: Arc<ProxyWrapperConfig>,
  control: Arc<ControlClient>,
  pool_count: u32,
  logger: Logger,
  close: CancellationToken,
}

impl ProxyWrapper {
  pub fn new(proxy: ProxyWrapperConfig, control: Arc<ControlClient>, pool_count: u32, logger: Logger) -> Self {
    Self { proxy: Arc::new(proxy), control, pool_count, logger, close: CancellationToken::new() }
  }

  /// A handle that, when cancelled, drives this wrapper to `Closed`: emits
  /// `CloseProxy`, stops the local forwarder, and ends the run loop.
  pub fn close_handle(&self) -> CancellationToken {
    self.close.clone()
  }

  /// Runs until `close_handle()` is cancelled or the control connection's
  /// own shutdown token fires. Spawns and owns this proxy's health-monitor
  /// task, plugin (if any), and forwarder tasks for the whole of its life.
  pub async fn run(self) {
    let proxy_name = self.proxy.name.clone();
    let mut events = self.control.subscribe(&proxy_name).await;

    let health_flag = Arc::new(AtomicBool::new(true));
    let (health_tx, mut health_rx) = mpsc::channel::<()>(1);
    let health_task = tokio::spawn(health::run(self.proxy.clone(), health_flag.clone(), health_tx, self.close.clone()));

    let plugin_handle = if self.proxy.https_plugin.is_some() {
      match https_plugin::spawn(self.proxy.clone(), self.logger.clone(), self.close.clone()).await {
        Ok(handle) => Some(handle),
        Err(err) => {
          self.logger.send(LogMessage::error(format!("proxy {proxy_name}: failed to start https plugin: {err}"))).await.ok();
          None
        }
      }
    } else {
      None
    };

    let mut phase = Phase::New;
    let mut forwarder_task: Option<tokio::task::JoinHandle<()>> = None;
    let mut ticker = tokio::time::interval(TICK);

    loop {
      tokio::select! {
        _ = self.close.cancelled() => {
          self.control.send_close_proxy(proxy_name.clone());
          if let Some(task) = forwarder_task.take() {
            task.abort();
          }
          self.control.unsubscribe(&proxy_name).await;
          phase = Phase::Closed;
          break;
        }
        _ = ticker.tick() => {
          phase = self.on_tick(phase, health_flag.load(Ordering::SeqCst)).await;
        }
        _ = health_rx.recv() => {
          phase = self.on_tick(phase, health_flag.load(Ordering::SeqCst)).await;
        }
        Some(event) = events.recv() => {
          phase = self.on_event(phase, event, &mut forwarder_task, &plugin_handle).await;
        }
      }

      if matches!(phase, Phase::Closed) {
        break;
      }
    }

    health_task.abort();
    self.logger.send(LogMessage::info(format!("proxy {proxy_name}: wrapper closed"))).await.ok();
  }

  async fn on_tick(&self, phase: Phase, healthy: bool) -> Phase {
    match phase {
      Phase::New if healthy => self.send_new_proxy().await,
      Phase::WaitStart { last_send } if last_send.elapsed() >= WAIT_START_RESEND => self.send_new_proxy().await,
      Phase::StartErr { last_error, .. } if last_error.elapsed() >= START_ERR_RETRY => self.send_new_proxy().await,
      Phase::Running { .. } if !healthy => {
        self.logger.send(LogMessage::error(format!("proxy {}: health check failed", self.proxy.name))).await.ok();
        self.control.send_close_proxy(self.proxy.name.clone());
        Phase::CheckFailed
      }
      Phase::CheckFailed if healthy => self.send_new_proxy().await,
      other => other,
    }
  }

  async fn on_event(
    &self,
    phase: Phase,
    event: ServerEvent,
    forwarder_task: &mut Option<tokio::task::JoinHandle<()>>,
    plugin_handle: &Option<https_plugin::PluginHandle>,
  ) -> Phase {
    match event {
      ServerEvent::StartOk { remote_addr } if matches!(phase, Phase::WaitStart { .. }) => {
        self.logger.send(LogMessage::info(format!("proxy {} started, remote={remote_addr}", self.proxy.name))).await.ok();
        let proxy = self.proxy.clone();
        let control = self.control.clone();
        let shutdown = self.close.clone();
        let logger = self.logger.clone();
        let pool_count = self.pool_count;
        let plugin_tx = plugin_handle.as_ref().map(|h| h.queue_tx.clone());
        *forwarder_task = Some(tokio::spawn(async move {
          forwarder::run(proxy, control, pool_count, shutdown, logger, plugin_tx).await;
        }));
        Phase::Running { remote_addr }
      }
      ServerEvent::StartErr { error } if matches!(phase, Phase::WaitStart { .. }) => {
        self.logger.send(LogMessage::error(format!("proxy {} failed to start: {error}", self.proxy.name))).await.ok();
        Phase::StartErr { last_error: Instant::now(), message: error }
      }
      ServerEvent::CloseProxy => {
        if let Some(task) = forwarder_task.take() {
          task.abort();
        }
        Phase::CheckFailed
      }
      ServerEvent::UpdateCert { crt_base64, key_base64 } => {
        if let Some(handle) = plugin_handle {
          https_plugin::hot_swap(handle, &crt_base64, &key_base64, &self.logger).await;
        }
        phase
      }
      _ => phase,
    }
  }

  async fn send_new_proxy(&self) -> Phase {
    self.control.send_new_proxy(self.proxy.name.clone(), self.proxy.config.clone());
    Phase::WaitStart { last_send: Instant::now() }
  }
}
