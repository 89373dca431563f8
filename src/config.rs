use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// UDP port the glove sends to.
pub const DEFAULT_UDP_PORT: u16 = 4210;

/// WebSocket port the browser connects to.
pub const DEFAULT_WS_PORT: u16 = 8081;

/// Recording output, relative to the working directory.
pub const DEFAULT_RECORD_PATH: &str = "glove_data.csv";

/// Push cadence to clients (100 Hz).
pub const DEFAULT_PUSH_INTERVAL_MS: u64 = 10;

/// Largest datagram read from the glove; longer payloads are truncated by the OS.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Load environment variables from .env file with robust parsing.
/// Handles values with spaces without requiring quotes.
pub fn load_dotenv() {
    let env_path = Path::new(".env");
    if !env_path.exists() {
        return;
    }

    let content = match fs::read_to_string(env_path) {
        Ok(c) => c,
        Err(_) => return,
    };

    for (key, value) in parse_dotenv(&content) {
        // Only set if not already set (env vars take precedence)
        if std::env::var(key).is_err() {
            // SAFETY: Called from `main` before the Tokio runtime or any other thread exists
            unsafe { std::env::set_var(key, value) };
        }
    }
}

/// Split .env content into key/value pairs, skipping blanks and comments.
fn parse_dotenv(content: &str) -> Vec<(&str, &str)> {
    let mut pairs = Vec::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Find the first '=' and split there
        if let Some(eq_pos) = line.find('=') {
            let key = line[..eq_pos].trim();
            let mut value = line[eq_pos + 1..].trim();

            // Remove surrounding quotes if present
            if value.len() >= 2
                && ((value.starts_with('"') && value.ends_with('"'))
                    || (value.starts_with('\'') && value.ends_with('\'')))
            {
                value = &value[1..value.len() - 1];
            }

            pairs.push((key, value));
        }
    }

    pairs
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ingest: IngestConfig,
    pub clients: ClientConfig,
    pub recording: RecordingConfig,
}

/// UDP side: where the glove sends readings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub max_datagram_len: usize,
}

/// WebSocket side: where browser clients connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub bind: IpAddr,
    pub port: u16,
    pub push_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    pub path: PathBuf,
}

impl IngestConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl ClientConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    pub fn push_interval(&self) -> Duration {
        // A zero interval would spin the session loop
        Duration::from_millis(self.push_interval_ms.max(1))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest: IngestConfig {
                bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: DEFAULT_UDP_PORT,
                max_datagram_len: MAX_DATAGRAM_LEN,
            },
            clients: ClientConfig {
                bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: DEFAULT_WS_PORT,
                push_interval_ms: DEFAULT_PUSH_INTERVAL_MS,
            },
            recording: RecordingConfig {
                path: PathBuf::from(DEFAULT_RECORD_PATH),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from defaults plus whatever `lookup` returns for each known key.
    /// Unparseable values are ignored.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        // UDP ingest
        if let Some(bind) = lookup("GLOVE_UDP_BIND")
            && let Ok(addr) = bind.parse()
        {
            config.ingest.bind = addr;
        }
        if let Some(port) = lookup("GLOVE_UDP_PORT")
            && let Ok(p) = port.parse()
        {
            config.ingest.port = p;
        }

        // WebSocket clients
        if let Some(bind) = lookup("GLOVE_WS_BIND")
            && let Ok(addr) = bind.parse()
        {
            config.clients.bind = addr;
        }
        if let Some(port) = lookup("GLOVE_WS_PORT")
            && let Ok(p) = port.parse()
        {
            config.clients.port = p;
        }
        if let Some(interval) = lookup("GLOVE_PUSH_INTERVAL_MS")
            && let Ok(ms) = interval.parse()
        {
            config.clients.push_interval_ms = ms;
        }

        if let Some(path) = lookup("GLOVE_RECORD_PATH") {
            config.recording.path = PathBuf::from(path);
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_glove_firmware() {
        let config = Config::default();
        assert_eq!(config.ingest.socket_addr(), "0.0.0.0:4210".parse().unwrap());
        assert_eq!(config.clients.socket_addr(), "127.0.0.1:8081".parse().unwrap());
        assert_eq!(config.recording.path, PathBuf::from("glove_data.csv"));
        assert_eq!(config.clients.push_interval(), Duration::from_millis(10));
    }

    #[test]
    fn test_env_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("GLOVE_UDP_PORT", "5000"),
            ("GLOVE_WS_BIND", "0.0.0.0"),
            ("GLOVE_WS_PORT", "9000"),
            ("GLOVE_PUSH_INTERVAL_MS", "20"),
            ("GLOVE_RECORD_PATH", "/tmp/take1.csv"),
        ]));
        assert_eq!(config.ingest.port, 5000);
        assert_eq!(config.clients.socket_addr(), "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.clients.push_interval(), Duration::from_millis(20));
        assert_eq!(config.recording.path, PathBuf::from("/tmp/take1.csv"));
    }

    #[test]
    fn test_invalid_values_keep_defaults() {
        let config = Config::from_lookup(lookup_from(&[
            ("GLOVE_UDP_PORT", "not-a-port"),
            ("GLOVE_UDP_BIND", "999.1.1.1"),
        ]));
        assert_eq!(config.ingest.port, DEFAULT_UDP_PORT);
        assert_eq!(config.ingest.bind, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    #[test]
    fn test_zero_push_interval_is_clamped() {
        let config = Config::from_lookup(lookup_from(&[("GLOVE_PUSH_INTERVAL_MS", "0")]));
        assert_eq!(config.clients.push_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_parse_dotenv() {
        let content = "# comment\n\nGLOVE_UDP_PORT=4211\nGLOVE_RECORD_PATH = \"my take.csv\"\nbroken line\n";
        let pairs = parse_dotenv(content);
        assert_eq!(
            pairs,
            vec![
                ("GLOVE_UDP_PORT", "4211"),
                ("GLOVE_RECORD_PATH", "my take.csv"),
            ]
        );
    }
}
