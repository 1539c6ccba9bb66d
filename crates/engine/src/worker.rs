//! Channel-based decode worker.
//!
//! Runs ASR on a dedicated thread so the frame-ingestion path never
//! blocks on a model. Requests are processed strictly in order, so
//! results come back FIFO and finalized segments stay time-ordered.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parley_stt::{pad_for_decode, SttEngine, SttError};

pub enum DecodeRequest {
    Segment {
        seq: u64,
        start_s: f64,
        end_s: f64,
        samples: Vec<f32>,
        /// Speaker label decided at dispatch time, if any.
        label_hint: Option<String>,
    },
    Shutdown,
}

pub struct DecodeOutcome {
    pub seq: u64,
    pub start_s: f64,
    pub end_s: f64,
    pub label_hint: Option<String>,
    pub samples: Vec<f32>,
    pub text: Result<String, SttError>,
}

pub struct DecodeWorker {
    request_tx: Sender<DecodeRequest>,
    result_rx: Receiver<DecodeOutcome>,
    handle: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    pub fn spawn(engine: Box<dyn SttEngine>, sample_rate: u32, min_decode_s: f32) -> Self {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<DecodeRequest>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded::<DecodeOutcome>();

        let handle = thread::spawn(move || {
            decode_loop(engine, sample_rate, min_decode_s, request_rx, result_tx);
        });

        Self {
            request_tx,
            result_rx,
            handle: Some(handle),
        }
    }

    /// Queue a segment for decoding. Returns false if the worker thread
    /// is gone (panicked); the caller should disable ASR.
    pub fn submit(&self, request: DecodeRequest) -> bool {
        self.request_tx.send(request).is_ok()
    }

    pub fn try_recv(&self) -> Option<DecodeOutcome> {
        self.result_rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<DecodeOutcome> {
        self.result_rx.recv_timeout(timeout).ok()
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        let _ = self.request_tx.send(DecodeRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn decode_loop(
    engine: Box<dyn SttEngine>,
    sample_rate: u32,
    min_decode_s: f32,
    request_rx: Receiver<DecodeRequest>,
    result_tx: Sender<DecodeOutcome>,
) {
    tracing::debug!(model = engine.model_name(), "decode worker started");
    while let Ok(request) = request_rx.recv() {
        match request {
            DecodeRequest::Segment {
                seq,
                start_s,
                end_s,
                samples,
                label_hint,
            } => {
                let padded = pad_for_decode(&samples, min_decode_s, sample_rate);
                let text = engine.transcribe(&padded, sample_rate);
                if let Err(e) = &text {
                    tracing::warn!(seq, "decode failed: {e}");
                }
                let outcome = DecodeOutcome {
                    seq,
                    start_s,
                    end_s,
                    label_hint,
                    samples,
                    text,
                };
                if result_tx.send(outcome).is_err() {
                    break; // engine dropped, late result discarded
                }
            }
            DecodeRequest::Shutdown => break,
        }
    }
    tracing::debug!("decode worker stopped");
}
