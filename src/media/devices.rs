//! Lokale Capture-Geräte und der Media Stream Bundle
//!
//! Verwendet cpal für Cross-Platform Audio I/O. Der Bundle besitzt die
//! lokalen Streams exklusiv für die Dauer einer Session; die Track-Flags
//! (Audio/Video aktiviert) sind unabhängig vom Signaling-Zustand
//! schaltbar.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use std::sync::{Arc, Weak};
use thiserror::Error;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für beste Qualität)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

/// Frame Size in Samples (20ms @ 48kHz = 960 samples)
pub const FRAME_SIZE: usize = 960;

/// Buffer Size für Audio-Ring-Buffer
const RING_BUFFER_SIZE: usize = FRAME_SIZE * 10;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("No audio output device found")]
    NoOutputDevice,

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildError(String),

    #[error("Failed to start audio stream: {0}")]
    StreamPlayError(String),
}

// ============================================================================
// MEDIA STREAM BUNDLE
// ============================================================================

/// Lokale Streams plus schwache Referenz auf den Remote-Stream
///
/// Die lokalen Geräte gehören exklusiv diesem Bundle und werden bei
/// `release` vollständig freigegeben; der Remote-Track wird nur
/// referenziert, nie besessen.
///
/// Note: Stream ist nicht Send, daher wrappen wir in Send-fähige Container
pub struct MediaStreamBundle {
    input_device: Option<Device>,
    output_device: Option<Device>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,

    /// Ring-Buffer für aufgenommenes Audio (Raw PCM)
    capture_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Ring-Buffer für zu spielendes Audio (decoded PCM)
    playback_buffer: Arc<Mutex<HeapRb<f32>>>,

    /// Track-Flags, unabhängig vom Signaling schaltbar
    audio_enabled: Arc<Mutex<bool>>,
    video_enabled: Arc<Mutex<bool>>,

    /// Hat diese Session überhaupt einen Video-Track?
    has_video_track: bool,

    /// Schwache Rückreferenz auf den zuletzt empfangenen Remote-Track
    remote_track: Mutex<Weak<TrackRemote>>,

    /// Audio Level (0.0 - 1.0) für Visualisierung
    input_level: Arc<Mutex<f32>>,
    output_level: Arc<Mutex<f32>>,
}

// MediaStreamBundle ist nicht automatisch Send wegen Stream
unsafe impl Send for MediaStreamBundle {}

impl MediaStreamBundle {
    /// Erstellt einen Bundle mit den Default-Geräten des Hosts
    ///
    /// `with_video` entscheidet ob die Session einen Video-Track führt;
    /// Audio-only Sessions melden bei `set_video_enabled` immer `false`.
    pub fn new(with_video: bool) -> Result<Self, DeviceError> {
        let host = cpal::default_host();

        let input_device = host.default_input_device();
        let output_device = host.default_output_device();

        if input_device.is_none() {
            tracing::warn!("No audio input device found");
        }
        if output_device.is_none() {
            tracing::warn!("No audio output device found");
        }

        let capture_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));
        let playback_buffer = Arc::new(Mutex::new(HeapRb::new(RING_BUFFER_SIZE)));

        tracing::info!(
            "MediaStreamBundle initialized: {}Hz, {} channel(s), video: {}",
            SAMPLE_RATE,
            CHANNELS,
            with_video
        );

        Ok(Self {
            input_device,
            output_device,
            input_stream: None,
            output_stream: None,
            capture_buffer,
            playback_buffer,
            audio_enabled: Arc::new(Mutex::new(true)),
            video_enabled: Arc::new(Mutex::new(with_video)),
            has_video_track: with_video,
            remote_track: Mutex::new(Weak::new()),
            input_level: Arc::new(Mutex::new(0.0)),
            output_level: Arc::new(Mutex::new(0.0)),
        })
    }

    /// Startet Audio Capture (Mikrofon)
    pub fn start_capture(&mut self) -> Result<(), DeviceError> {
        let device = self
            .input_device
            .as_ref()
            .ok_or(DeviceError::NoInputDevice)?;

        let config = Self::find_best_input_config(device)?;

        tracing::info!(
            "Starting audio capture: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let capture_buffer = Arc::clone(&self.capture_buffer);
        let audio_enabled = Arc::clone(&self.audio_enabled);
        let input_level = Arc::clone(&self.input_level);
        let target_sample_rate = SAMPLE_RATE;
        let source_sample_rate = config.sample_rate.0;

        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let enabled = *audio_enabled.lock();

                    // Audio Level berechnen (RMS)
                    let rms: f32 =
                        (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                    *input_level.lock() = rms.min(1.0);

                    if !enabled {
                        return;
                    }

                    // Resampling falls nötig (zu 48kHz)
                    let samples: Vec<f32> = if source_sample_rate != target_sample_rate {
                        let ratio = target_sample_rate as f32 / source_sample_rate as f32;
                        let new_len = (data.len() as f32 * ratio) as usize;
                        (0..new_len)
                            .map(|i| {
                                let src_idx = i as f32 / ratio;
                                let idx = src_idx as usize;
                                let frac = src_idx - idx as f32;
                                let s1 = data.get(idx).copied().unwrap_or(0.0);
                                let s2 = data.get(idx + 1).copied().unwrap_or(s1);
                                s1 + (s2 - s1) * frac
                            })
                            .collect()
                    } else {
                        data.to_vec()
                    };

                    let mut buffer = capture_buffer.lock();
                    for sample in samples {
                        let _ = buffer.try_push(sample);
                    }
                },
                |err| {
                    tracing::error!("Audio capture error: {}", err);
                },
                None,
            )
            .map_err(|e| DeviceError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DeviceError::StreamPlayError(e.to_string()))?;

        self.input_stream = Some(stream);
        Ok(())
    }

    /// Startet Audio Playback (Lautsprecher)
    pub fn start_playback(&mut self) -> Result<(), DeviceError> {
        let device = self
            .output_device
            .as_ref()
            .ok_or(DeviceError::NoOutputDevice)?;

        let config = Self::find_best_output_config(device)?;

        tracing::info!(
            "Starting audio playback: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        let playback_buffer = Arc::clone(&self.playback_buffer);
        let output_level = Arc::clone(&self.output_level);
        let source_sample_rate = SAMPLE_RATE;
        let target_sample_rate = config.sample_rate.0;
        let channels = config.channels as usize;

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let mut buffer = playback_buffer.lock();
                    let mut level_sum = 0.0f32;
                    let mut sample_count = 0;

                    // Mono zu Stereo (falls nötig) und Resampling
                    let samples_needed = data.len() / channels;
                    let ratio = source_sample_rate as f32 / target_sample_rate as f32;
                    let source_samples_needed = (samples_needed as f32 * ratio) as usize;

                    for i in 0..samples_needed {
                        let src_idx = (i as f32 * ratio) as usize;

                        let sample = if src_idx < source_samples_needed {
                            buffer.try_pop().unwrap_or(0.0)
                        } else {
                            0.0
                        };

                        level_sum += sample.abs();
                        sample_count += 1;

                        for c in 0..channels {
                            if let Some(s) = data.get_mut(i * channels + c) {
                                *s = sample;
                            }
                        }
                    }

                    if sample_count > 0 {
                        *output_level.lock() = (level_sum / sample_count as f32).min(1.0);
                    }
                },
                |err| {
                    tracing::error!("Audio playback error: {}", err);
                },
                None,
            )
            .map_err(|e| DeviceError::StreamBuildError(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DeviceError::StreamPlayError(e.to_string()))?;

        self.output_stream = Some(stream);
        Ok(())
    }

    /// Gibt alle Geräte-Handles frei
    ///
    /// Nach `release` hält der Bundle keine Streams mehr; erst danach
    /// darf eine neue Session Geräte akquirieren.
    pub fn release(&mut self) {
        self.input_stream = None;
        self.output_stream = None;
        *self.remote_track.lock() = Weak::new();
        tracing::info!("Local media released");
    }

    pub fn has_active_streams(&self) -> bool {
        self.input_stream.is_some() || self.output_stream.is_some()
    }

    /// Schaltet den lokalen Audio-Track; liefert den resultierenden Zustand
    ///
    /// Ohne akquirierten Capture-Stream gibt es keinen Audio-Track,
    /// dann ist das Ergebnis immer `false`.
    pub fn set_audio_enabled(&self, enabled: bool) -> bool {
        if self.input_stream.is_none() {
            return false;
        }
        *self.audio_enabled.lock() = enabled;
        tracing::debug!("Audio track enabled: {}", enabled);
        enabled
    }

    pub fn audio_enabled(&self) -> bool {
        self.input_stream.is_some() && *self.audio_enabled.lock()
    }

    /// Schaltet den lokalen Video-Track; Audio-only Sessions liefern `false`
    pub fn set_video_enabled(&self, enabled: bool) -> bool {
        if !self.has_video_track {
            return false;
        }
        *self.video_enabled.lock() = enabled;
        tracing::debug!("Video track enabled: {}", enabled);
        enabled
    }

    pub fn video_enabled(&self) -> bool {
        self.has_video_track && *self.video_enabled.lock()
    }

    /// Best-effort Umschalten zwischen Lautsprecher und Hörer
    ///
    /// Sucht ein passendes Ausgabegerät; ist die Plattform-Routing-
    /// Fähigkeit nicht verfügbar, wird nur geloggt, nie gescheitert.
    pub fn set_speaker_routing(&mut self, speaker: bool) {
        let host = cpal::default_host();
        let wanted = if speaker { "speaker" } else { "earpiece" };

        let candidate = match host.output_devices() {
            Ok(devices) => devices
                .filter_map(|d| d.name().ok().map(|name| (name, d)))
                .find(|(name, _)| name.to_lowercase().contains(wanted))
                .map(|(_, d)| d),
            Err(e) => {
                tracing::warn!("Speaker routing unavailable: {}", e);
                return;
            }
        };

        match candidate {
            Some(device) => {
                tracing::info!("Routing audio output to {:?} device", wanted);
                self.output_device = Some(device);
                // Laufendes Playback auf das neue Gerät umziehen
                if self.output_stream.is_some() {
                    self.output_stream = None;
                    if let Err(e) = self.start_playback() {
                        tracing::warn!("Failed to restart playback after rerouting: {}", e);
                    }
                }
            }
            None => {
                tracing::warn!("No {} output device found, keeping current routing", wanted);
            }
        }
    }

    /// Hinterlegt den zuletzt empfangenen Remote-Track (schwach)
    pub fn set_remote_track(&self, track: &Arc<TrackRemote>) {
        *self.remote_track.lock() = Arc::downgrade(track);
    }

    pub fn remote_track(&self) -> Option<Arc<TrackRemote>> {
        self.remote_track.lock().upgrade()
    }

    /// Liest einen Frame von aufgenommenem Audio
    pub fn read_frame(&self) -> Option<Vec<f32>> {
        let mut buffer = self.capture_buffer.lock();
        if buffer.occupied_len() >= FRAME_SIZE {
            let mut frame = Vec::with_capacity(FRAME_SIZE);
            for _ in 0..FRAME_SIZE {
                if let Some(sample) = buffer.try_pop() {
                    frame.push(sample);
                }
            }
            Some(frame)
        } else {
            None
        }
    }

    /// Schreibt Audio-Samples in den Playback-Buffer
    pub fn write_samples(&self, samples: &[f32]) {
        let mut buffer = self.playback_buffer.lock();
        for sample in samples {
            let _ = buffer.try_push(*sample);
        }
    }

    /// Gibt die Audio-Levels zurück (input, output)
    pub fn levels(&self) -> (f32, f32) {
        (*self.input_level.lock(), *self.output_level.lock())
    }

    /// Findet die beste Input-Konfiguration
    fn find_best_input_config(device: &Device) -> Result<StreamConfig, DeviceError> {
        let configs = device
            .supported_input_configs()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Findet die beste Output-Konfiguration
    fn find_best_output_config(device: &Device) -> Result<StreamConfig, DeviceError> {
        let configs = device
            .supported_output_configs()
            .map_err(|e| DeviceError::UnsupportedConfig(e.to_string()))?;

        Self::select_best_config(configs.collect())
    }

    /// Wählt die beste Konfiguration aus einer Liste
    fn select_best_config(
        configs: Vec<SupportedStreamConfigRange>,
    ) -> Result<StreamConfig, DeviceError> {
        // Priorität: 48kHz > andere, F32 > andere
        let target_rate = cpal::SampleRate(SAMPLE_RATE);

        for config in &configs {
            if config.min_sample_rate() <= target_rate
                && config.max_sample_rate() >= target_rate
                && config.sample_format() == SampleFormat::F32
            {
                return Ok(config.with_sample_rate(target_rate).into());
            }
        }

        for config in &configs {
            if config.sample_format() == SampleFormat::F32 {
                let rate = if config.min_sample_rate() <= target_rate
                    && config.max_sample_rate() >= target_rate
                {
                    target_rate
                } else {
                    config.max_sample_rate()
                };
                return Ok(config.with_sample_rate(rate).into());
            }
        }

        if let Some(config) = configs.first() {
            return Ok(config.with_max_sample_rate().into());
        }

        Err(DeviceError::UnsupportedConfig(
            "No suitable audio configuration found".to_string(),
        ))
    }
}

impl std::fmt::Debug for MediaStreamBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreamBundle")
            .field("audio_enabled", &self.audio_enabled())
            .field("video_enabled", &self.video_enabled())
            .field("has_active_streams", &self.has_active_streams())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // Bundle ohne gestartete Streams - läuft auch ohne Audio-Hardware

    #[test]
    fn test_audio_toggle_without_stream_is_noop() {
        let bundle = MediaStreamBundle::new(false).unwrap();
        // Kein Capture-Stream akquiriert -> kein Audio-Track -> false
        assert!(!bundle.set_audio_enabled(true));
        assert!(!bundle.audio_enabled());
    }

    #[test]
    fn test_video_toggle_on_audio_only_session() {
        let bundle = MediaStreamBundle::new(false).unwrap();
        assert!(!bundle.set_video_enabled(true));
        assert!(!bundle.video_enabled());
    }

    #[test]
    fn test_video_toggle_on_video_session() {
        let bundle = MediaStreamBundle::new(true).unwrap();
        assert!(bundle.video_enabled());
        assert!(!bundle.set_video_enabled(false));
        assert!(!bundle.video_enabled());
        assert!(bundle.set_video_enabled(true));
    }

    #[test]
    fn test_playback_buffer_roundtrip() {
        let bundle = MediaStreamBundle::new(false).unwrap();
        bundle.write_samples(&[0.1, 0.2, 0.3]);
        // Ohne Playback-Stream bleiben die Samples im Ring-Buffer
        assert_eq!(bundle.levels(), (0.0, 0.0));
    }

    #[test]
    fn test_release_clears_remote_reference() {
        let mut bundle = MediaStreamBundle::new(true).unwrap();
        assert!(bundle.remote_track().is_none());
        bundle.release();
        assert!(!bundle.has_active_streams());
        assert!(bundle.remote_track().is_none());
    }
}
