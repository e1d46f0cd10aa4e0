//! Command-line and environment configuration for the server binary.

use crate::pacing::PacerConfig;
use crate::replication::InterestConfig;
use crate::scheduler::SchedulerConfig;
use crate::session::{DisconnectPolicy, PlayoutDelayPolicy, SessionConfig};
use clap::{Parser, ValueEnum};
use std::time::Duration;

/// Largest pacer gain accepted from the command line.
const MAX_GAIN: f64 = 10.0;

fn parse_gain(value: &str) -> Result<f64, String> {
    let gain: f64 = value.parse().map_err(|e| format!("{}", e))?;
    if gain.is_finite() && (0.0..=MAX_GAIN).contains(&gain) {
        Ok(gain)
    } else {
        Err(format!("gain must be between 0 and {}", MAX_GAIN))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PlayoutMode {
    /// base * multiplier, regardless of the link
    Fixed,
    /// measured round trip * multiplier, never below base
    Measured,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OnDisconnect {
    Destroy,
    Release,
}

impl From<OnDisconnect> for DisconnectPolicy {
    fn from(value: OnDisconnect) -> Self {
        match value {
            OnDisconnect::Destroy => DisconnectPolicy::DestroyOwned,
            OnDisconnect::Release => DisconnectPolicy::ReleaseOwned,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address to bind to
    #[arg(short = 'H', long, env = "TICK_SERVER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// UDP port to listen on
    #[arg(short, long, env = "TICK_SERVER_PORT", default_value = "8080")]
    pub port: u16,

    /// Simulation ticks per second
    #[arg(short, long, env = "TICK_SERVER_TICK_RATE", default_value_t = shared::DEFAULT_TICK_RATE)]
    pub tick_rate: u32,

    /// Proportional gain of the tick pacer
    #[arg(long, env = "TICK_SERVER_KP", default_value = "0.18", value_parser = parse_gain)]
    pub kp: f64,

    /// Integral gain of the tick pacer
    #[arg(long, env = "TICK_SERVER_KI", default_value = "0.06", value_parser = parse_gain)]
    pub ki: f64,

    #[arg(long, value_enum, env = "TICK_SERVER_PLAYOUT_MODE", default_value = "fixed")]
    pub playout_mode: PlayoutMode,

    /// Playout delay base (fixed) or floor (measured), in milliseconds
    #[arg(long, env = "TICK_SERVER_PLAYOUT_BASE_MS", default_value = "10")]
    pub playout_base_ms: u64,

    #[arg(long, env = "TICK_SERVER_PLAYOUT_MULTIPLIER", default_value = "3")]
    pub playout_multiplier: u32,

    /// Half extent of the per-client interest box
    #[arg(long, env = "TICK_SERVER_INTEREST_RADIUS", default_value = "50.0")]
    pub interest_half_extent: f32,

    /// Maximum objects replicated to one client
    #[arg(long, env = "TICK_SERVER_MAX_INTEREST", default_value = "256")]
    pub max_interest: usize,

    /// Ticks between full-state resends of each replicated object (0 disables)
    #[arg(long, env = "TICK_SERVER_REFRESH_INTERVAL", default_value = "60")]
    pub refresh_interval: u64,

    /// Maximum concurrent clients
    #[arg(short, long, env = "TICK_SERVER_MAX_CLIENTS", default_value = "32")]
    pub max_clients: usize,

    /// What happens to a client's vehicles when it leaves
    #[arg(long, value_enum, env = "TICK_SERVER_ON_DISCONNECT", default_value = "destroy")]
    pub on_disconnect: OnDisconnect,

    /// Seconds of silence before a client is dropped
    #[arg(long, env = "TICK_SERVER_PEER_TIMEOUT", default_value = "5")]
    pub peer_timeout_secs: u64,

    /// Static props scattered around the origin at startup
    #[arg(long, env = "TICK_SERVER_PROPS", default_value = "16")]
    pub props: usize,

    /// Ticks between diagnostic log lines (0 disables)
    #[arg(long, env = "TICK_SERVER_LOG_INTERVAL", default_value = "240")]
    pub log_interval: u64,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peer_timeout_secs)
    }

    pub fn playout_policy(&self) -> PlayoutDelayPolicy {
        let base = Duration::from_millis(self.playout_base_ms);
        match self.playout_mode {
            PlayoutMode::Fixed => PlayoutDelayPolicy::Fixed {
                base,
                multiplier: self.playout_multiplier,
            },
            PlayoutMode::Measured => PlayoutDelayPolicy::MeasuredRtt {
                multiplier: self.playout_multiplier as f32,
                floor: base,
            },
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            pacer: PacerConfig {
                target_rate: self.tick_rate,
                proportional_gain: self.kp,
                integral_gain: self.ki,
            },
            interest: InterestConfig {
                half_extent: [self.interest_half_extent; 3],
                max_interest: self.max_interest,
                refresh_interval: self.refresh_interval,
            },
            session: SessionConfig {
                max_sessions: self.max_clients,
                playout_policy: self.playout_policy(),
                disconnect_policy: self.on_disconnect.into(),
                ..SessionConfig::default()
            },
            log_interval: self.log_interval,
        }
    }
}
