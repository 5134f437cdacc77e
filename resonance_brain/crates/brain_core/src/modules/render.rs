use crate::modules::config::env_timeout;
use crate::modules::protocol::PresetDocument;
use async_trait::async_trait;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Peak level after normalization, as a fraction of full scale.
pub const PEAK_HEADROOM: f32 = 0.95;

/// Tail rendered past each chord note so releases are not cut off.
const CHORD_NOTE_TAIL_SECS: f32 = 0.5;
const CHORD_TOTAL_TAIL_SECS: f32 = 1.0;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("invalid note: {0}")]
    InvalidNote(String),
    #[error("synth engine failed: {0}")]
    Engine(String),
    #[error("render worker failed: {0}")]
    Worker(String),
    #[error("wav encoding failed: {0}")]
    Wav(#[from] hound::Error),
    #[error("render service request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("render service returned status={status} body={body}")]
    BadStatus { status: u16, body: String },
    #[error("render service timed out")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteSpec {
    /// MIDI note number.
    pub pitch: u8,
    pub velocity: f32,
    pub note_duration: f32,
    pub total_duration: f32,
    pub sample_rate: u32,
    pub bpm: f32,
}

impl Default for NoteSpec {
    fn default() -> Self {
        Self {
            pitch: 60,
            velocity: 0.8,
            note_duration: 1.0,
            total_duration: 3.0,
            sample_rate: 44_100,
            bpm: 120.0,
        }
    }
}

impl NoteSpec {
    pub fn validate(&self) -> Result<(), RenderError> {
        if self.pitch > 127 {
            return Err(RenderError::InvalidNote(format!("pitch {} out of MIDI range", self.pitch)));
        }
        if !(0.0..=1.0).contains(&self.velocity) {
            return Err(RenderError::InvalidNote(format!("velocity {} not in 0..=1", self.velocity)));
        }
        if !(self.note_duration.is_finite() && self.note_duration > 0.0) {
            return Err(RenderError::InvalidNote("note_duration must be > 0".into()));
        }
        if !(self.total_duration.is_finite() && self.total_duration >= self.note_duration) {
            return Err(RenderError::InvalidNote(
                "total_duration must be >= note_duration".into(),
            ));
        }
        if self.sample_rate == 0 {
            return Err(RenderError::InvalidNote("sample_rate must be > 0".into()));
        }
        Ok(())
    }

    pub fn total_frames(&self) -> usize {
        seconds_to_frames(self.total_duration, self.sample_rate)
    }
}

/// One note of a chord preview. `start` and `duration` are in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChordNote {
    pub pitch: u8,
    pub velocity: f32,
    pub start: f32,
    pub duration: f32,
}

pub fn default_chord() -> Vec<ChordNote> {
    [60u8, 64, 67]
        .into_iter()
        .map(|pitch| ChordNote {
            pitch,
            velocity: 0.7,
            start: 0.0,
            duration: 2.0,
        })
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StereoBuffer {
    pub left: Vec<f32>,
    pub right: Vec<f32>,
}

impl StereoBuffer {
    pub fn silent(frames: usize) -> Self {
        Self {
            left: vec![0.0; frames],
            right: vec![0.0; frames],
        }
    }

    pub fn frames(&self) -> usize {
        self.left.len().max(self.right.len())
    }

    pub fn peak(&self) -> f32 {
        self.left
            .iter()
            .chain(self.right.iter())
            .fold(0.0f32, |m, s| m.max(s.abs()))
    }
}

/// The synthesis engine proper. Implementations are CPU-bound and synchronous.
pub trait SynthEngine: Send + Sync {
    fn render(&self, preset: &PresetDocument, note: &NoteSpec) -> Result<StereoBuffer, RenderError>;
}

/// Preset in, WAV bytes out.
#[async_trait]
pub trait PreviewRenderer: Send + Sync {
    fn name(&self) -> &str;

    async fn render_preview(
        &self,
        preset: &PresetDocument,
        note: &NoteSpec,
    ) -> Result<Vec<u8>, RenderError>;
}

/// Scales both channels so the loudest sample sits at `headroom`. Silence is left alone.
pub fn normalize_peak(buf: &mut StereoBuffer, headroom: f32) {
    let peak = buf.peak();
    if peak <= f32::EPSILON || !peak.is_finite() {
        return;
    }
    let gain = headroom / peak;
    for s in buf.left.iter_mut().chain(buf.right.iter_mut()) {
        *s *= gain;
    }
}

/// 16-bit interleaved stereo WAV. A shorter channel is padded with silence.
pub fn encode_wav(buf: &StereoBuffer, sample_rate: u32) -> Result<Vec<u8>, RenderError> {
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for i in 0..buf.frames() {
            let l = buf.left.get(i).copied().unwrap_or(0.0);
            let r = buf.right.get(i).copied().unwrap_or(0.0);
            writer.write_sample(quantize(l))?;
            writer.write_sample(quantize(r))?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

fn quantize(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

fn seconds_to_frames(secs: f32, sample_rate: u32) -> usize {
    (secs.max(0.0) * sample_rate as f32).round() as usize
}

/// Sums `(offset_frames, buffer)` parts into a buffer of exactly `total_frames`.
/// Anything past the end is cut.
pub fn mix_notes(parts: &[(usize, StereoBuffer)], total_frames: usize) -> StereoBuffer {
    let mut out = StereoBuffer::silent(total_frames);
    for (offset, part) in parts {
        for (dst, src) in out.left.iter_mut().skip(*offset).zip(part.left.iter()) {
            *dst += *src;
        }
        for (dst, src) in out.right.iter_mut().skip(*offset).zip(part.right.iter()) {
            *dst += *src;
        }
    }
    out
}

/// Renders each chord note separately and mixes them at their onsets.
pub fn render_chord(
    engine: &dyn SynthEngine,
    preset: &PresetDocument,
    notes: &[ChordNote],
    base: &NoteSpec,
) -> Result<StereoBuffer, RenderError> {
    if notes.is_empty() {
        return Err(RenderError::InvalidNote("chord has no notes".into()));
    }

    let end = notes
        .iter()
        .map(|n| n.start + n.duration)
        .fold(0.0f32, f32::max);
    let total_frames = seconds_to_frames(end + CHORD_TOTAL_TAIL_SECS, base.sample_rate);

    let mut parts = Vec::with_capacity(notes.len());
    for n in notes {
        let spec = NoteSpec {
            pitch: n.pitch,
            velocity: n.velocity,
            note_duration: n.duration,
            total_duration: n.duration + CHORD_NOTE_TAIL_SECS,
            ..*base
        };
        spec.validate()?;
        let rendered = engine.render(preset, &spec)?;
        parts.push((seconds_to_frames(n.start, base.sample_rate), rendered));
    }

    let mut mixed = mix_notes(&parts, total_frames);
    normalize_peak(&mut mixed, PEAK_HEADROOM);
    Ok(mixed)
}

/// Runs an in-process [`SynthEngine`] on the blocking pool and packages the result.
#[derive(Clone)]
pub struct EngineRenderer {
    engine: Arc<dyn SynthEngine>,
    chord: Option<Vec<ChordNote>>,
}

impl EngineRenderer {
    pub fn new(engine: Arc<dyn SynthEngine>) -> Self {
        Self { engine, chord: None }
    }

    /// Render previews as a chord instead of a single note.
    pub fn with_chord(mut self, notes: Vec<ChordNote>) -> Self {
        self.chord = Some(notes);
        self
    }
}

#[async_trait]
impl PreviewRenderer for EngineRenderer {
    fn name(&self) -> &str {
        "engine"
    }

    async fn render_preview(
        &self,
        preset: &PresetDocument,
        note: &NoteSpec,
    ) -> Result<Vec<u8>, RenderError> {
        note.validate()?;
        let engine = Arc::clone(&self.engine);
        let preset = preset.clone();
        let note = *note;
        let chord = self.chord.clone();

        tokio::task::spawn_blocking(move || {
            let mut buf = match chord {
                Some(notes) => render_chord(engine.as_ref(), &preset, &notes, &note)?,
                None => engine.render(&preset, &note)?,
            };
            normalize_peak(&mut buf, PEAK_HEADROOM);
            encode_wav(&buf, note.sample_rate)
        })
        .await
        .map_err(|e| RenderError::Worker(e.to_string()))?
    }
}

/// Client for the preset converter service: `POST {base}/convert` with the preset as
/// multipart field `file`, answered with `audio/wav`. The service picks its own note.
#[derive(Debug, Clone)]
pub struct ConverterRenderer {
    client: reqwest::Client,
    base_url: String,
}

impl ConverterRenderer {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// `RENDER_URL`, with `RENDER_HTTP_TIMEOUT_SECS` (default 60). `None` when unset.
    pub fn from_env() -> Result<Option<Self>, RenderError> {
        let Some(url) = crate::modules::config::env_string("RENDER_URL") else {
            return Ok(None);
        };
        let timeout = env_timeout("RENDER_HTTP_TIMEOUT_SECS", 60, 5, 300);
        Self::new(url, timeout).map(Some)
    }
}

#[async_trait]
impl PreviewRenderer for ConverterRenderer {
    fn name(&self) -> &str {
        "converter"
    }

    async fn render_preview(
        &self,
        preset: &PresetDocument,
        note: &NoteSpec,
    ) -> Result<Vec<u8>, RenderError> {
        tracing::debug!(pitch = note.pitch, "converter service renders its own note");
        let bytes = serde_json::to_vec(preset)
            .map_err(|e| RenderError::Engine(format!("preset serialization: {e}")))?;
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name("preset.vital")
            .mime_str("application/octet-stream")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/convert", self.base_url);
        let resp = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(timeout_or_http)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RenderError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let wav = resp.bytes().await.map_err(timeout_or_http)?;
        if !wav.starts_with(b"RIFF") {
            return Err(RenderError::Engine("converter returned a non-WAV payload".into()));
        }
        Ok(wav.to_vec())
    }
}

fn timeout_or_http(e: reqwest::Error) -> RenderError {
    if e.is_timeout() {
        RenderError::Timeout
    } else {
        RenderError::Http(e)
    }
}
