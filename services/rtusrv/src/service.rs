//! Service lifecycle: hubs connected on start, closed on stop

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use voltage_rtu::{HubConfig, HubRegistry, PortOpener, Response, StartupReport};

use crate::calls::{CallReply, ServiceCall};
use crate::config::ServiceConfig;
use crate::error::{Result, RtuSrvError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    Running,
    Stopped,
}

pub struct Service {
    registry: HubRegistry,
    lifecycle: Mutex<Lifecycle>,
}

impl Service {
    /// Hubs on real serial ports
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(HubRegistry::from_config(&config.rtu())?))
    }

    pub fn from_config_with<F>(config: &ServiceConfig, opener_for: F) -> Result<Self>
    where
        F: FnMut(&HubConfig) -> Arc<dyn PortOpener>,
    {
        config.validate()?;
        Ok(Self::new(HubRegistry::from_config_with(
            &config.rtu(),
            opener_for,
        )?))
    }

    pub fn new(registry: HubRegistry) -> Self {
        Self {
            registry,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn registry(&self) -> &HubRegistry {
        &self.registry
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock().await
    }

    /// Connect every hub. A hub that fails to open is reported and skipped;
    /// calls addressed to it fail with a not-connected error. Definitions
    /// rejected while building the registry are reported the same way.
    pub async fn start(&self) -> Result<StartupReport> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Running => {
                debug!("Service already running");
                return Ok(StartupReport::default());
            },
            Lifecycle::Stopped => return Err(RtuSrvError::Stopped),
            Lifecycle::Created => {},
        }

        let report = self.registry.connect_all().await;
        for (name, err) in report.failures() {
            error!("Hub '{}' unavailable: {}", name, err);
        }
        info!(
            "Service started: {}/{} hubs connected",
            report.connected().len(),
            self.registry.len()
        );
        *lifecycle = Lifecycle::Running;
        Ok(report)
    }

    /// Close every hub; later calls fail
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if *lifecycle == Lifecycle::Stopped {
            return;
        }
        self.registry.close_all().await;
        *lifecycle = Lifecycle::Stopped;
        info!("Service stopped");
    }

    pub async fn call(&self, call: ServiceCall) -> Result<Response> {
        if *self.lifecycle.lock().await != Lifecycle::Running {
            return Err(RtuSrvError::NotRunning);
        }

        let request = call.to_request()?;
        let hub = self.registry.lookup(call.hub())?;
        debug!("Call {:?} on hub '{}'", request, hub.name());
        match hub.execute(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                warn!("Call on hub '{}' failed: {}", hub.name(), e);
                Err(e.into())
            },
        }
    }

    /// Answer one JSON call per input line with one JSON reply line
    ///
    /// Blank lines are skipped. Returns the number of calls answered once
    /// `input` reaches end of file.
    pub async fn serve_lines<R, W>(&self, input: R, mut output: W) -> Result<usize>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        let mut answered = 0;
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let result = match ServiceCall::from_json(line) {
                Ok(call) => self.call(call).await,
                Err(e) => Err(e),
            };
            let mut reply = CallReply::from_result(&result).to_json();
            reply.push('\n');
            output.write_all(reply.as_bytes()).await?;
            output.flush().await?;
            answered += 1;
        }
        Ok(answered)
    }
}
