//! Synchronous facade for training loops that do not run on tokio

use runtime_core::{Epoch, Result, RuntimeConfig, RuntimeManager, Sequence};

use checkpoint::Snapshot;

use crate::communicator::Communicator;
use crate::recovery::RecoveryOutcome;
use crate::session::{Role, Session};

/// A [`Session`] driven from synchronous code on its own runtime
pub struct BlockingSession {
    // Dropped before the runtime that its tasks live on
    session: Option<Session>,
    runtime: RuntimeManager,
}

impl BlockingSession {
    pub fn init(config: RuntimeConfig, communicator: Communicator) -> Result<Self> {
        let runtime = RuntimeManager::new(&config)?;
        let session = runtime.block_on(Session::init(config, communicator))??;
        Ok(Self {
            session: Some(session),
            runtime,
        })
    }

    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or_else(destroyed)
    }

    pub fn role(&self) -> Result<Role> {
        self.session().map(Session::role)
    }

    pub fn save<S: Snapshot>(&self, epoch: Epoch, state: &S) -> Result<Option<Sequence>> {
        let session = self.session()?;
        self.runtime.block_on(session.save(epoch, state))?
    }

    pub fn save_if_due<S: Snapshot>(&self, epoch: Epoch, state: &S) -> Result<Option<Sequence>> {
        let session = self.session()?;
        self.runtime.block_on(session.save_if_due(epoch, state))?
    }

    pub fn wait_copy_complete(&self) -> Result<()> {
        let session = self.session()?;
        self.runtime.block_on(session.wait_copy_complete())?
    }

    pub fn recover(&mut self) -> Result<RecoveryOutcome> {
        let session = self.session.as_mut().ok_or_else(destroyed)?;
        self.runtime.block_on(session.recover())?
    }

    pub fn restore<S: Snapshot>(&mut self) -> Result<Option<(Epoch, S)>> {
        let session = self.session.as_mut().ok_or_else(destroyed)?;
        self.runtime.block_on(session.restore())?
    }

    pub fn destroy(mut self) -> Result<()> {
        let session = self.session.take().ok_or_else(destroyed)?;
        self.runtime.block_on(session.destroy())??;
        self.runtime.shutdown();
        Ok(())
    }
}

fn destroyed() -> runtime_core::Error {
    runtime_core::Error::Shutdown {
        component: "session".to_string(),
    }
}
