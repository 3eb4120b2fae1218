//! Result sink and its presentation thread.
//!
//! The sink only ever runs on one designated thread. It is built there by a
//! factory closure and never leaves it, so sinks wrapping thread-bound UI handles
//! need not be `Send`. Everything else talks to it through a `Presenter`, which
//! posts labels to the thread without waiting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{JoinHandle, ThreadId};

use anyhow::{anyhow, Result};

use crate::engine::Label;

/// Presentation collaborator. Called only on the presentation thread.
pub trait ResultSink {
    fn publish(&mut self, label: &Label);
}

impl<S: ResultSink + ?Sized> ResultSink for Box<S> {
    fn publish(&mut self, label: &Label) {
        (**self).publish(label)
    }
}

enum Message {
    Publish(Label),
    Shutdown,
}

/// Cloneable handle that marshals labels onto the presentation thread.
#[derive(Clone)]
pub struct Presenter {
    tx: mpsc::Sender<Message>,
    thread_id: ThreadId,
}

impl Presenter {
    /// Post a label. Returns false once the presentation thread has stopped.
    pub fn dispatch(&self, label: Label) -> bool {
        self.tx.send(Message::Publish(label)).is_ok()
    }

    /// Id of the designated presentation thread.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }
}

/// The designated presentation thread, owning one sink.
pub struct PresentationThread {
    presenter: Presenter,
    join: Option<JoinHandle<()>>,
}

impl PresentationThread {
    pub fn spawn<S, F>(name: &str, make_sink: F) -> Result<Self>
    where
        S: ResultSink,
        F: FnOnce() -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut sink = make_sink();
                while let Ok(message) = rx.recv() {
                    match message {
                        Message::Publish(label) => sink.publish(&label),
                        Message::Shutdown => break,
                    }
                }
                log::debug!("presentation thread exiting");
            })?;
        let presenter = Presenter {
            tx,
            thread_id: join.thread().id(),
        };
        log::info!("presentation thread '{}' started", name);
        Ok(Self {
            presenter,
            join: Some(join),
        })
    }

    pub fn presenter(&self) -> Presenter {
        self.presenter.clone()
    }

    /// Deliver everything already posted, then stop the thread.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(join) = self.join.take() else {
            return Ok(());
        };
        // Messages are handled in order, so pending labels are published first.
        let _ = self.presenter.tx.send(Message::Shutdown);
        join.join()
            .map_err(|_| anyhow!("presentation thread panicked"))
    }
}

impl Drop for PresentationThread {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("{}", err);
        }
    }
}

/// Logs labels as they change.
#[derive(Default)]
pub struct LogSink {
    last: Option<String>,
}

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultSink for LogSink {
    fn publish(&mut self, label: &Label) {
        if self.last.as_deref() == Some(label.text()) {
            log::debug!("label: {}", label);
            return;
        }
        log::info!("label: {}", label);
        self.last = Some(label.text().to_string());
    }
}

/// Last-known-good label, readable from any thread.
#[derive(Clone, Default)]
pub struct LatestLabel {
    cell: Arc<Mutex<Option<Label>>>,
    updates: Arc<AtomicU64>,
}

impl LatestLabel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Label> {
        self.cell
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of publishes seen.
    pub fn updates(&self) -> u64 {
        self.updates.load(Ordering::Acquire)
    }
}

impl ResultSink for LatestLabel {
    fn publish(&mut self, label: &Label) {
        *self.cell.lock().unwrap_or_else(PoisonError::into_inner) = Some(label.clone());
        self.updates.fetch_add(1, Ordering::Release);
    }
}

/// Publishes to several sinks in order.
#[derive(Default)]
pub struct FanOut {
    sinks: Vec<Box<dyn ResultSink>>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<S: ResultSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl ResultSink for FanOut {
    fn publish(&mut self, label: &Label) {
        for sink in &mut self.sinks {
            sink.publish(label);
        }
    }
}
