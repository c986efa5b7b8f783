// Connection lifecycle. A connection begins stopped: consumers exist and
// can be configured, but no delivery flows until start. Stop quiesces every
// consumer and blocks until in-flight work drains; close is terminal.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use corvus_broker::BrokerLink;

use crate::config::ClientConfig;
use crate::session::{AckMode, Session};
use crate::{Error, Result};

pub struct Connection {
    link: Arc<dyn BrokerLink>,
    config: ClientConfig,
    sessions: Mutex<Vec<Arc<Session>>>,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl Connection {
    pub fn new(link: Arc<dyn BrokerLink>, config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            link,
            config,
            sessions: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        })
    }

    pub async fn create_session(self: &Arc<Self>, ack_mode: AckMode) -> Result<Arc<Session>> {
        self.check_open()?;
        let channel = self.link.open_channel().await?;
        let session = Session::new(
            Arc::downgrade(self),
            channel,
            ack_mode,
            self.config.clone(),
        );
        self.sessions
            .lock()
            .expect("session registry lock")
            .push(session.clone());
        Ok(session)
    }

    /// Let deliveries flow: resume every consumer, then mark started.
    pub async fn start(&self) -> Result<()> {
        self.check_open()?;
        if !self.stopped.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("connection starting");
        for session in self.snapshot() {
            session.resume_all().await;
        }
        Ok(())
    }

    /// Inhibit delivery: blocks until in-flight receives and listener
    /// callbacks have quiesced (bounded per consumer by the stop timeout).
    pub async fn stop(&self) -> Result<()> {
        self.check_open()?;
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!("connection stopping");
        for session in self.snapshot() {
            session.pause_all().await;
        }
        Ok(())
    }

    /// Close every session, then the link. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.stopped.store(true, Ordering::Release);
        let sessions: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.lock().expect("session registry lock");
            sessions.drain(..).collect()
        };
        for session in sessions {
            if let Err(err) = session.close().await {
                warn!(error = %err, "session close failed");
            }
        }
        if let Err(err) = self.link.close().await {
            warn!(error = %err, "broker link close failed");
        }
        Ok(())
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.lock().expect("session registry lock").clone()
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::IllegalState("connection is closed"));
        }
        Ok(())
    }
}
