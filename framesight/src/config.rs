use std::{env, fs, net::SocketAddr, path::{Path, PathBuf}, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub log: Log,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub extraction: Extraction,
    #[serde(default)]
    pub ml: Ml,
    #[serde(default)]
    pub recorder: Recorder,
    #[serde(default)]
    pub stream: Stream,
    #[serde(default)]
    pub transcoder: Transcoder,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Http {
    #[serde(default = "default_http_listen")]
    pub listen: SocketAddr,
    #[serde(default)]
    pub cors: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    /// Root for recorded/uploaded videos: `{dir}/videos/{camera}/{date}/`.
    #[serde(default = "default_data_dir")]
    pub dir: PathBuf,
    /// Root for extracted frames: `{frames_dir}/{camera}/{date}/`.
    #[serde(default = "default_frames_dir")]
    pub frames_dir: PathBuf,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_history_path")]
    pub history_path: PathBuf,
    #[serde(default = "default_streams_dir")]
    pub streams_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extraction {
    #[serde(default = "default_interval_sec")]
    pub interval_sec: u32,
    #[serde(default = "default_quality")]
    pub quality: u32,
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,
    #[serde(default = "default_dedup_threshold")]
    pub dedup_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ml {
    #[serde(default = "default_ml_url")]
    pub url: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,
}

/// Connection settings for the network video recorder. An empty `ip`
/// disables recorder-backed processing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Recorder {
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_rtsp_port")]
    pub rtsp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stream {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcoder {
    #[serde(default = "default_ffmpeg")]
    pub ffmpeg: String,
    #[serde(default = "default_ffprobe")]
    pub ffprobe: String,
}

fn default_http_listen() -> SocketAddr {
    SocketAddr::from_str(&format!(
        "0.0.0.0:{}",
        env::var("PORT").unwrap_or(String::from("8000"))
    ))
    .expect("invalid listen address")
}

fn default_log_level() -> String {
    env::var("LOG_LEVEL").unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            "debug".to_string()
        } else {
            "info".to_string()
        }
    })
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_frames_dir() -> PathBuf {
    PathBuf::from("data/frames")
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/framesight.db")
}

fn default_history_path() -> PathBuf {
    PathBuf::from("data/process_history.json")
}

fn default_streams_dir() -> PathBuf {
    PathBuf::from("data/streams")
}

fn default_interval_sec() -> u32 {
    5
}

fn default_quality() -> u32 {
    85
}

fn default_true() -> bool {
    true
}

fn default_dedup_threshold() -> u32 {
    10
}

fn default_ml_url() -> String {
    String::from("http://localhost:8001")
}

fn default_batch_size() -> usize {
    32
}

fn default_ready_timeout_secs() -> u64 {
    120
}

fn default_rtsp_port() -> u16 {
    554
}

fn default_idle_timeout_secs() -> u64 {
    30
}

fn default_ffmpeg() -> String {
    String::from("ffmpeg")
}

fn default_ffprobe() -> String {
    String::from("ffprobe")
}

impl Default for Http {
    fn default() -> Self {
        Self {
            listen: default_http_listen(),
            cors: Default::default(),
        }
    }
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Data {
    fn default() -> Self {
        Self {
            dir: default_data_dir(),
            frames_dir: default_frames_dir(),
            db_path: default_db_path(),
            history_path: default_history_path(),
            streams_dir: default_streams_dir(),
        }
    }
}

impl Default for Extraction {
    fn default() -> Self {
        Self {
            interval_sec: default_interval_sec(),
            quality: default_quality(),
            dedup_enabled: true,
            dedup_threshold: default_dedup_threshold(),
        }
    }
}

impl Default for Ml {
    fn default() -> Self {
        Self {
            url: default_ml_url(),
            batch_size: default_batch_size(),
            ready_timeout_secs: default_ready_timeout_secs(),
        }
    }
}

impl Default for Stream {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl Default for Transcoder {
    fn default() -> Self {
        Self {
            ffmpeg: default_ffmpeg(),
            ffprobe: default_ffprobe(),
        }
    }
}

impl Config {
    /// Loads the config from `path`, or from `config.toml` in the working
    /// directory when present, or the built-in defaults.
    pub fn load(path: Option<&str>) -> anyhow::Result<Config> {
        let path = match path {
            Some(p) => Some(PathBuf::from(p)),
            None => {
                let fallback = PathBuf::from("config.toml");
                fallback.exists().then_some(fallback)
            }
        };
        match path {
            Some(p) => {
                let raw = fs::read_to_string(&p)
                    .map_err(|e| anyhow::anyhow!("reading config {}: {}", p.display(), e))?;
                toml::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing config {}: {}", p.display(), e))
            }
            None => Ok(Config::default()),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.extraction.interval_sec == 0 {
            anyhow::bail!("extraction.interval_sec must be at least 1");
        }
        if self.ml.batch_size == 0 {
            anyhow::bail!("ml.batch_size must be at least 1");
        }
        if !self.recorder.ip.is_empty() && self.recorder.username.is_empty() {
            anyhow::bail!("recorder.username is required when recorder.ip is set");
        }
        Ok(())
    }

    /// Video directory for a camera and date: `{data.dir}/videos/{camera}/{date}`.
    pub fn videos_dir(&self, camera_id: &str, date: &str) -> PathBuf {
        self.data.dir.join("videos").join(camera_id).join(date)
    }

    /// Frames directory for a camera and date: `{data.frames_dir}/{camera}/{date}`.
    pub fn frames_dir(&self, camera_id: &str, date: &str) -> PathBuf {
        self.data.frames_dir.join(camera_id).join(date)
    }
}

/// `true` when no path component tries to escape its directory.
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && Path::new(name).file_name().map(|f| f == name).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_from_empty_toml() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.extraction.interval_sec, 5);
        assert!(cfg.extraction.dedup_enabled);
        assert_eq!(cfg.ml.batch_size, 32);
        assert_eq!(cfg.stream.idle_timeout_secs, 30);
        cfg.validate().unwrap();
    }

    #[test]
    fn recorder_without_username_fails_validation() {
        let cfg: Config = toml::from_str("[recorder]\nip = \"10.0.0.2\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn safe_component_rejects_traversal() {
        assert!(is_safe_component("index.m3u8"));
        assert!(is_safe_component("seg_00012.ts"));
        assert!(!is_safe_component(".."));
        assert!(!is_safe_component("a/b"));
        assert!(!is_safe_component(""));
    }
}
