//! Alert sounds played on a dedicated audio thread.

pub mod chime;

use anyhow::{anyhow, Context, Result};
use chime::Chime;
use log::warn;
use rodio::{OutputStream, Sink};
use serde::{Deserialize, Serialize};
use std::sync::{
    mpsc::{self, Sender},
    Arc, Mutex,
};
use std::thread;

use crate::monitor::SoundPlayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Agent went idle and waits for input.
    Waiting,
    /// Agent wants to run a command.
    Warning,
    Success,
    Error,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Waiting => "waiting",
            AlertKind::Warning => "warning",
            AlertKind::Success => "success",
            AlertKind::Error => "error",
        }
    }
}

enum AudioCommand {
    Play(AlertKind),
    Stop,
}

/// Cloneable handle to the audio thread. The thread, output stream and sink
/// are created on first use; rodio's stream is not `Send`, so it never
/// leaves that thread.
#[derive(Clone)]
pub struct AlertPlayer {
    tx: Arc<Mutex<Option<Sender<AudioCommand>>>>,
}

impl AlertPlayer {
    pub fn new() -> Self {
        Self {
            tx: Arc::new(Mutex::new(None)),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
        let mut guard = self
            .tx
            .lock()
            .map_err(|_| anyhow!("audio sender lock poisoned"))?;
        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AudioCommand>();

        thread::Builder::new()
            .name("agentwatch-audio".to_string())
            .spawn(move || {
                let mut _stream: Option<OutputStream> = None;
                let mut sink: Option<Sink> = None;

                fn ensure_sink(
                    stream: &mut Option<OutputStream>,
                    sink: &mut Option<Sink>,
                ) -> Result<()> {
                    if sink.is_none() {
                        let (s, handle) = OutputStream::try_default()
                            .context("Failed to create audio output stream")?;
                        let new_sink =
                            Sink::try_new(&handle).context("Failed to create audio sink")?;
                        *stream = Some(s);
                        *sink = Some(new_sink);
                    }
                    Ok(())
                }

                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        AudioCommand::Play(kind) => {
                            if let Err(err) = ensure_sink(&mut _stream, &mut sink) {
                                warn!("Cannot play {} alert: {err:#}", kind.as_str());
                                continue;
                            }
                            if let Some(ref s) = sink {
                                // a newer alert replaces one still playing
                                s.clear();
                                s.append(Chime::new(kind));
                                s.play();
                            }
                        }
                        AudioCommand::Stop => {
                            if let Some(s_old) = sink.take() {
                                s_old.stop();
                            }
                            _stream = None;
                        }
                    }
                }
            })
            .context("failed to spawn audio thread")?;

        *guard = Some(tx.clone());
        Ok(tx)
    }

    pub fn play(&self, kind: AlertKind) -> Result<()> {
        let tx = self.ensure_thread()?;
        tx.send(AudioCommand::Play(kind))
            .map_err(|_| anyhow!("audio thread has exited"))
    }

    /// Cuts any alert still playing and releases the output device.
    pub fn stop(&self) {
        if let Ok(Some(tx)) = self.tx.lock().map(|g| g.clone()) {
            let _ = tx.send(AudioCommand::Stop);
        }
    }
}

impl Default for AlertPlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl SoundPlayer for AlertPlayer {
    fn play(&self, kind: AlertKind) -> Result<()> {
        AlertPlayer::play(self, kind)
    }
}
