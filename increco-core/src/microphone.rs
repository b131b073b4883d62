//! Microphone capture (feature `audio-capture`): a `cpal` input stream feeds
//! a lock-free ring buffer; this module's `Producing` worker drains it into
//! fixed-size `Audio` IUs, self-rate-limiting by sleeping when nothing new
//! has arrived. Grounded in the reference engine's `audio`/`buffering`
//! modules — `cpal::Stream` is `!Send` on most platforms, so, exactly as
//! there, the stream is created and lives out its life on one dedicated
//! thread, communicating with the rest of the module only through the ring
//! buffer and an `Arc<AtomicBool>` running flag. The original source's
//! `MicrophoneModule` fills the analogous role for PyAudio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info, warn};

use crate::error::{Result, RuntimeError};
use crate::iu::{AudioPayload, IuKind, IuPayload, IuRef};
use crate::module::{Module, ModuleContext, ModuleKind};

/// Ring buffer capacity: 2^20 f32 samples, ~23.8s at 44.1kHz.
const RING_CAPACITY: usize = 1 << 20;

/// Input frames handed to `rubato` per resample call.
const RESAMPLE_CHUNK: usize = 960;

/// Converts f32 mono audio from the device's native rate to the module's
/// configured rate. A zero-copy passthrough when the two already match.
/// Grounded in the reference engine's `audio::resample::RateConverter`.
struct RateConverter {
    resampler: Option<FastFixedIn<f32>>,
    input_buf: Vec<f32>,
    chunk_size: usize,
    output_buf: Vec<Vec<f32>>,
}

impl RateConverter {
    fn new(capture_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(RateConverter {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
            });
        }
        let ratio = target_rate as f64 / capture_rate as f64;
        let resampler = FastFixedIn::<f32>::new(ratio, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
            .map_err(|e| RuntimeError::BackendUnavailable(format!("resampler init: {e}")))?;
        let max_out = resampler.output_frames_max();
        Ok(RateConverter {
            resampler: Some(resampler),
            input_buf: Vec::new(),
            chunk_size,
            output_buf: vec![vec![0.0; max_out]],
        })
    }

    fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.input_buf.extend_from_slice(samples);
        let mut result = Vec::new();
        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];
            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => result.extend_from_slice(&self.output_buf[0][..produced]),
                Err(e) => error!(error = %e, "resampler process error"),
            }
            self.input_buf.drain(..self.chunk_size);
        }
        result
    }
}

#[derive(Debug, Clone)]
pub struct MicrophoneConfig {
    pub chunk_size: u32,
    pub rate: u32,
    pub sample_width: u16,
}

impl Default for MicrophoneConfig {
    fn default() -> Self {
        MicrophoneConfig {
            chunk_size: 5000,
            rate: 44_100,
            sample_width: 2,
        }
    }
}

pub struct Microphone {
    config: MicrophoneConfig,
    consumer: Option<HeapCons<f32>>,
    scratch: Vec<f32>,
    running: Arc<AtomicBool>,
    capture_thread: Option<std::thread::JoinHandle<()>>,
}

impl Microphone {
    pub fn new(config: MicrophoneConfig) -> Self {
        Microphone {
            config,
            consumer: None,
            scratch: Vec::new(),
            running: Arc::new(AtomicBool::new(false)),
            capture_thread: None,
        }
    }

    /// Owns the `cpal::Device`/`Stream` for the thread's whole life. Reports
    /// its outcome once via `ready` so `setup()` can surface a build error
    /// synchronously instead of only discovering it later via silence.
    fn run_capture_thread(
        mut producer: HeapProd<f32>,
        running: Arc<AtomicBool>,
        target_rate: u32,
        ready: mpsc::Sender<Result<u32>>,
    ) {
        let host = cpal::default_host();
        let device = match host.default_input_device() {
            Some(d) => d,
            None => {
                let _ = ready.send(Err(RuntimeError::BackendUnavailable(
                    "no default input device".to_string(),
                )));
                return;
            }
        };
        let supported = match device.default_input_config() {
            Ok(c) => c,
            Err(e) => {
                let _ = ready.send(Err(RuntimeError::BackendUnavailable(e.to_string())));
                return;
            }
        };
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels() as usize;
        let config = StreamConfig {
            channels: supported.channels(),
            sample_rate: SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let mut rate_converter = match RateConverter::new(sample_rate, target_rate, RESAMPLE_CHUNK) {
            Ok(rc) => rc,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };

        let err_fn = |e| error!(error = %e, "microphone stream error");
        let stream_result = match supported.sample_format() {
            SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _| push_mixed_down(&mut producer, &mut rate_converter, data, channels),
                err_fn,
                None,
            ),
            SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _| {
                    let floats: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                    push_mixed_down(&mut producer, &mut rate_converter, &floats, channels)
                },
                err_fn,
                None,
            ),
            fmt => {
                let _ = ready.send(Err(RuntimeError::BackendUnavailable(format!(
                    "unsupported sample format: {fmt:?}"
                ))));
                return;
            }
        };

        let stream = match stream_result {
            Ok(s) => s,
            Err(e) => {
                let _ = ready.send(Err(RuntimeError::BackendUnavailable(e.to_string())));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(RuntimeError::BackendUnavailable(e.to_string())));
            return;
        }

        info!(device = ?device.name().ok(), sample_rate, channels, "microphone capture started");
        let _ = ready.send(Ok(sample_rate));

        while running.load(Ordering::Relaxed) {
            std::thread::sleep(Duration::from_millis(20));
        }
        // `stream` drops here, on the same thread that created it.
    }
}

fn push_mixed_down(producer: &mut HeapProd<f32>, rate_converter: &mut RateConverter, data: &[f32], channels: usize) {
    let mono: std::borrow::Cow<[f32]> = if channels <= 1 {
        data.into()
    } else {
        let frames = data.len() / channels;
        let mut down = Vec::with_capacity(frames);
        for f in 0..frames {
            let base = f * channels;
            let sum: f32 = data[base..base + channels].iter().sum();
            down.push(sum / channels as f32);
        }
        down.into()
    };
    let resampled = rate_converter.process(&mono);
    let written = producer.push_slice(&resampled);
    if written < resampled.len() {
        warn!(dropped = resampled.len() - written, "microphone ring buffer full");
    }
}

impl Module for Microphone {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Producing
    }
    fn input_kinds(&self) -> &'static [IuKind] {
        &[]
    }
    fn output_kind(&self) -> Option<IuKind> {
        Some(IuKind::Audio)
    }
    fn class_tag(&self) -> &'static str {
        "microphone.Microphone"
    }

    fn setup(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        let (producer, consumer) = HeapRb::<f32>::new(RING_CAPACITY).split();
        self.consumer = Some(consumer);
        self.running.store(true, Ordering::SeqCst);

        let (ready_tx, ready_rx) = mpsc::channel();
        let running = Arc::clone(&self.running);
        let target_rate = self.config.rate;
        let handle = std::thread::spawn(move || Self::run_capture_thread(producer, running, target_rate, ready_tx));
        self.capture_thread = Some(handle);

        match ready_rx.recv() {
            Ok(Ok(_sample_rate)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(RuntimeError::BackendUnavailable(
                "capture thread exited before reporting readiness".to_string(),
            )),
        }
    }

    fn shutdown(&mut self, _ctx: &Arc<ModuleContext>) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.capture_thread.take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn process_iu(&mut self, ctx: &Arc<ModuleContext>, _input: Option<IuRef>) -> Result<Option<IuRef>> {
        let chunk_size = self.config.chunk_size as usize;
        let consumer = match self.consumer.as_mut() {
            Some(c) => c,
            None => {
                std::thread::sleep(Duration::from_millis(10));
                return Ok(None);
            }
        };

        if consumer.occupied_len() < chunk_size {
            std::thread::sleep(Duration::from_millis(10));
            return Ok(None);
        }

        self.scratch.resize(chunk_size, 0.0);
        let popped = consumer.pop_slice(&mut self.scratch);
        let mut bytes = Vec::with_capacity(popped * self.config.sample_width as usize);
        for &sample in &self.scratch[..popped] {
            let clamped = sample.clamp(-1.0, 1.0);
            let pcm = (clamped * i16::MAX as f32) as i16;
            bytes.extend_from_slice(&pcm.to_le_bytes());
        }

        let audio = AudioPayload {
            raw_bytes: bytes,
            frame_rate: self.config.rate,
            n_frames: popped as u32,
            sample_width: self.config.sample_width,
        };
        Ok(Some(ctx.create_iu(IuPayload::Audio(audio), None)))
    }
}
