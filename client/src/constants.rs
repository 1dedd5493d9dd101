use std::time::Duration;

pub const LOCAL_WS_URL: &str = "ws://localhost:3005/ws";

/// Current application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Capture rate of the microphone feed sent to the AI engine.
pub const PCM_SAMPLE_RATE: u32 = 16_000;
/// Rate of the synthesized audio returned by the AI engine.
pub const AUDIO_OUTPUT_SAMPLE_RATE: u32 = 24_000;
/// Samples per captured block (~256 ms at 16 kHz).
pub const CAPTURE_BLOCK_SAMPLES: usize = 4096;
/// FFT size of the visualization analyser.
pub const ANALYSER_FFT_SIZE: usize = 256;
/// Roughly one animation frame.
pub const METER_INTERVAL: Duration = Duration::from_millis(16);

pub const VIDEO_FRAME_INTERVAL: Duration = Duration::from_secs(1);
pub const VIDEO_MAX_WIDTH: u32 = 640;
pub const VIDEO_JPEG_QUALITY: u8 = 50;

pub const ALERT_TTL: Duration = Duration::from_secs(5);

pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const GEMINI_REST_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
pub const LIVE_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";
pub const TEXT_MODEL: &str = "gemini-2.5-flash";
pub const VOICE_NAME: &str = "Kore";

pub const SYSTEM_INSTRUCTION: &str = "You are an experienced Senior Technical Recruiter and Software Engineer at a top tech company.
You are conducting a live video coding interview with a candidate.
Your goal is to assess their problem-solving skills, code quality, and communication.
1. Introduce yourself briefly and ask the candidate to introduce themselves.
2. Ask them to solve the coding problem currently on their screen.
3. The candidate can switch languages (JS, Python, Java). Adapt to their choice.
4. Provide hints if they struggle, but don't solve it for them immediately.
5. Keep the conversation flowing naturally. You can see the candidate via their camera.
6. Be encouraging but professional.
7. If they click 'Run Code', you can ask them about the output.";

pub const VISIBILITY_ALERT_TEXT: &str = "Candidate switched away from the interview window";
