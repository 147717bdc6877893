//! Configuration management for podbridge
//!
//! Handles loading, defaulting and validation of the YAML configuration file.
//! Every field has a default matching a POD HD 400 → Katana MKII setup, so the
//! bridge runs without any file at all.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::ports::matches_port;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub controller: ControllerConfig,
    pub amp: AmpConfig,
    pub virtual_port: VirtualPortConfig,
    pub translation: TranslationConfig,
    pub watcher: WatcherConfig,
    pub dispatcher: DispatcherConfig,
    /// Wait before touching any device (boot-time settle delay)
    pub startup_delay_ms: u64,
    /// Log every forwarded event
    pub verbose: bool,
}

/// USB controller identification and transport tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub configuration: u8,
    pub interface: u8,
    /// Alternate setting that speaks MIDI over bulk endpoints
    pub alt_setting: u8,
    pub write_endpoint: u8,
    pub read_endpoint: u8,
    /// Bytes requested per bulk read
    pub chunk_size: usize,
    pub max_reads_per_call: usize,
    pub read_timeout_ms: u64,
    /// Reader sleep while the controller is absent
    pub idle_poll_ms: u64,
    pub send_reset_on_open: bool,
}

/// Amplifier MIDI output selection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AmpConfig {
    /// Case-insensitive substring of the amp's MIDI output port name
    pub port_name: String,
}

/// Virtual port mirroring the raw controller stream
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VirtualPortConfig {
    pub enabled: bool,
    pub name: String,
}

/// Control number remap
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
pub struct CcRemap {
    pub from: u8,
    pub to: u8,
}

/// Value scaling applied to the expression pedal after remapping
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionScaling {
    /// 0 stays 0, v > 0 becomes round(v / 2): the amp expects 0-64
    Halve,
    /// Forward the pedal value as is
    #[serde(rename = "none")]
    Identity,
}

/// Translation rules between controller and amp
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub volume_cc: CcRemap,
    pub expression_cc: CcRemap,
    pub expression_scaling: ExpressionScaling,
    /// Send `volume_cc.to = volume_reset_value` before every program change
    pub volume_reset_on_program_change: bool,
    pub volume_reset_value: u8,
    /// Suppress a CC identical to the last one sent to the amp
    pub deduplicate: bool,
}

/// Which signal decides whether a reconnect also reopens the controller
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ControllerReopen {
    /// Reopen whenever the poll observes the controller (every reconnect)
    Observed,
    /// Reopen only if the controller itself dropped out since it was opened
    PreviouslyConnected,
}

/// Device watcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub poll_interval_ms: u64,
    pub controller_reopen: ControllerReopen,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub recv_timeout_ms: u64,
    /// Queue depth above which a backlog warning is logged
    pub backlog_warn_depth: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x0E41,
            product_id: 0x5058,
            configuration: 1,
            interface: 0,
            alt_setting: 5,
            write_endpoint: 0x03,
            read_endpoint: 0x84,
            chunk_size: 8,
            max_reads_per_call: 4,
            read_timeout_ms: 25,
            idle_poll_ms: 50,
            send_reset_on_open: true,
        }
    }
}

impl Default for AmpConfig {
    fn default() -> Self {
        Self { port_name: "KATANA".to_string() }
    }
}

impl Default for VirtualPortConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            name: "VIRTUAL MIDI DEVICE".to_string(),
        }
    }
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            volume_cc: CcRemap { from: 7, to: 81 },
            expression_cc: CcRemap { from: 4, to: 80 },
            expression_scaling: ExpressionScaling::Halve,
            volume_reset_on_program_change: true,
            volume_reset_value: 127,
            deduplicate: true,
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            controller_reopen: ControllerReopen::Observed,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            recv_timeout_ms: 1000,
            backlog_warn_depth: 256,
        }
    }
}

impl ControllerConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config = Self::from_yaml(&contents)
            .with_context(|| format!("Invalid config file: {}", path))?;

        Ok(config)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(contents: &str) -> Result<Self> {
        // An empty document means "all defaults"
        let config: AppConfig = if contents.trim().is_empty() {
            AppConfig::default()
        } else {
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        let c = &self.controller;

        if c.chunk_size == 0 {
            anyhow::bail!("controller.chunk_size must be greater than 0");
        }
        if c.max_reads_per_call == 0 || c.max_reads_per_call > 64 {
            anyhow::bail!(
                "controller.max_reads_per_call is {} (must be 1-64)",
                c.max_reads_per_call
            );
        }
        if c.read_endpoint & 0x80 == 0 {
            anyhow::bail!(
                "controller.read_endpoint 0x{:02X} is not an IN endpoint",
                c.read_endpoint
            );
        }
        if c.write_endpoint & 0x80 != 0 {
            anyhow::bail!(
                "controller.write_endpoint 0x{:02X} is not an OUT endpoint",
                c.write_endpoint
            );
        }

        if self.amp.port_name.trim().is_empty() {
            anyhow::bail!("amp.port_name cannot be empty");
        }
        if self.virtual_port.enabled && self.virtual_port.name.trim().is_empty() {
            anyhow::bail!("virtual_port.name cannot be empty when the virtual port is enabled");
        }
        if self.virtual_port.enabled && matches_port(&self.virtual_port.name, &self.amp.port_name) {
            anyhow::bail!(
                "virtual_port.name '{}' matches amp.port_name '{}'; the bridge would feed itself",
                self.virtual_port.name, self.amp.port_name
            );
        }

        let t = &self.translation;
        for (name, remap) in [("volume_cc", t.volume_cc), ("expression_cc", t.expression_cc)] {
            if remap.from > 127 || remap.to > 127 {
                anyhow::bail!(
                    "translation.{} has invalid CC number (from {}, to {}; must be 0-127)",
                    name, remap.from, remap.to
                );
            }
        }
        if t.volume_cc.from == t.expression_cc.from {
            anyhow::bail!(
                "translation.volume_cc and translation.expression_cc both remap CC {}",
                t.volume_cc.from
            );
        }
        if t.volume_reset_value > 127 {
            anyhow::bail!(
                "translation.volume_reset_value {} is invalid (must be 0-127)",
                t.volume_reset_value
            );
        }

        if self.watcher.poll_interval_ms == 0 {
            anyhow::bail!("watcher.poll_interval_ms must be greater than 0");
        }
        if self.dispatcher.recv_timeout_ms == 0 {
            anyhow::bail!("dispatcher.recv_timeout_ms must be greater than 0");
        }

        Ok(())
    }
}
