//! Scripted session and resource manager for driver tests

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    error::{Error, Result},
    model::ModelInfo,
    resource::{AccessMode, ResourceManager},
};

use super::{Protocol, ScpiProtocol};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Write(String),
    Read(usize),
    Disconnect,
}

/// Shared record of everything a [`MockScpi`] was asked to do
#[derive(Clone, Default)]
pub struct Transcript(Arc<Mutex<Vec<Event>>>);
impl Transcript {
    fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                Event::Write(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    pub fn reads(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|ev| match ev {
                Event::Read(len) => Some(len),
                _ => None,
            })
            .collect()
    }
}

#[derive(Default)]
pub struct MockScpi {
    transcript: Transcript,
    responses: VecDeque<Vec<u8>>,
    failing: Vec<String>,
}
impl MockScpi {
    pub fn new() -> (Self, Transcript) {
        let mock = Self::default();
        let transcript = mock.transcript.clone();
        (mock, transcript)
    }

    /// Queue a response for the next read
    pub fn respond(mut self, data: impl AsRef<[u8]>) -> Self {
        self.responses.push_back(data.as_ref().to_vec());
        self
    }

    /// Fail every write of exactly `cmd`, the write is still recorded
    pub fn fail_on(mut self, cmd: &str) -> Self {
        self.failing.push(cmd.to_string());
        self
    }
}
#[async_trait]
impl Protocol for MockScpi {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.transcript.push(Event::Disconnect);
        Ok(())
    }

    async fn model(&mut self) -> Result<ModelInfo> {
        (self as &mut dyn ScpiProtocol).idn_model().await
    }
}
#[async_trait]
impl ScpiProtocol for MockScpi {
    async fn int_send(&mut self, data: &[u8]) -> Result<()> {
        let cmd = String::from_utf8_lossy(data).to_string();
        self.transcript.push(Event::Write(cmd.clone()));

        if self.failing.contains(&cmd) {
            return Err(Error::Timeout(format!("write of `{cmd}` not acknowledged")));
        }
        Ok(())
    }

    async fn int_recv(&mut self, max_len: usize) -> Result<Vec<u8>> {
        self.transcript.push(Event::Read(max_len));

        let Some(mut resp) = self.responses.pop_front() else {
            return Err(Error::Timeout("no response queued".into()));
        };
        resp.truncate(max_len);
        Ok(resp)
    }
}

/// Resource manager handing out a single prepared [`MockScpi`]
#[derive(Default)]
pub struct MockRM {
    session: Mutex<Option<MockScpi>>,
    opened: Mutex<Vec<(String, AccessMode, Duration)>>,
}
impl MockRM {
    pub fn new(session: MockScpi) -> Self {
        Self {
            session: Mutex::new(Some(session)),
            opened: Mutex::default(),
        }
    }

    /// Resource strings passed to `open`, in call order
    pub fn opened(&self) -> Vec<(String, AccessMode, Duration)> {
        self.opened.lock().unwrap().clone()
    }
}
#[async_trait]
impl ResourceManager for MockRM {
    async fn open(
        &self,
        resource: &str,
        mode: AccessMode,
        timeout: Duration,
    ) -> Result<Box<dyn ScpiProtocol>> {
        self.opened
            .lock()
            .unwrap()
            .push((resource.to_string(), mode, timeout));

        match self.session.lock().unwrap().take() {
            Some(session) => Ok(Box::new(session)),
            None => Err(Error::Unspecified(format!("{resource} not available"))),
        }
    }
}
