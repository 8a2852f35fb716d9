use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub signaling_url: String,
    pub stun_server: String,
    pub stun_port: u16,
    pub turn_server: String,
    pub turn_port: u16,
    pub turn_username: String,
    pub turn_password: String,
    /// Caller-side timeout for signaling round trips.
    pub request_timeout: Duration,
    /// Sampling interval of the network quality monitor.
    pub monitor_interval: Duration,
    /// Delay between peer connection reconnect attempts.
    pub peer_retry_delay: Duration,
    /// Reconnect attempts per participant before the connection is marked failed.
    pub peer_retry_max_attempts: u32,
    /// Signaling channel reconnect attempts before the session gives up.
    pub channel_retry_max_attempts: u32,
    /// Initial backoff of the signaling channel reconnect, doubled per attempt.
    pub channel_retry_base_delay: Duration,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        Self {
            signaling_url: env::var("SIGNALING_URL")
                .unwrap_or_else(|_| "ws://127.0.0.1:8080".to_string()),
            stun_server: env::var("STUN_SERVER")
                .unwrap_or_else(|_| "stun.l.google.com".to_string()),
            stun_port: env::var("STUN_PORT")
                .unwrap_or_else(|_| "19302".to_string())
                .parse()
                .unwrap_or(19302),
            turn_server: env::var("TURN_SERVER")
                .unwrap_or_else(|_| String::new()),
            turn_port: env::var("TURN_PORT")
                .unwrap_or_else(|_| "3478".to_string())
                .parse()
                .unwrap_or(3478),
            turn_username: env::var("TURN_USERNAME")
                .unwrap_or_else(|_| String::new()),
            turn_password: env::var("TURN_PASSWORD")
                .unwrap_or_else(|_| String::new()),
            request_timeout: Duration::from_secs(
                env::var("SIGNALING_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            ),
            monitor_interval: Duration::from_secs(
                env::var("MONITOR_INTERVAL_SECS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            ),
            peer_retry_delay: Duration::from_secs(2),
            peer_retry_max_attempts: 5,
            channel_retry_max_attempts: 5,
            channel_retry_base_delay: Duration::from_secs(1),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
