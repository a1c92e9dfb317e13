//! Configuration for the penumbra compositor.
//!
//! Loads configuration from TOML file at `~/.config/penumbra/config.toml`
//! and auto-generates a default config file on first run if missing.
//! The aggregate is immutable after startup: every component reads it,
//! nothing mutates it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Fully-opaque fixed-point opacity. All window opacity arithmetic is
/// carried in 0..=OPAQUE.
pub const OPAQUE: u16 = 255;

/// Convert a 0.0..=1.0 config value to fixed-point opacity.
pub fn opacity_fixed(value: f32) -> u16 {
    (value.clamp(0.0, 1.0) * OPAQUE as f32).round() as u16
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    pub vsync: VsyncConfig,
    pub fade: FadeConfig,
    pub shadow: ShadowConfig,
    pub opacity: OpacityConfig,
    pub blur: BlurConfig,
    pub focus: FocusConfig,
    pub unredirect: UnredirectConfig,
    /// Windows whose colors are drawn inverted.
    pub invert_color: Vec<MatchRule>,
    /// Windows never painted at all.
    pub paint_exclude: Vec<MatchRule>,
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("penumbra");

        Ok(config_dir.join("config.toml"))
    }

    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string = toml::to_string_pretty(&default_config)
            .context("Failed to serialize default config")?;

        fs::write(path, toml_string)
            .context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

/// Which render backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Try GLX, fall back to XRender.
    #[default]
    Auto,
    Xrender,
    Glx,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// GLX swap discipline.
    pub glx_swap_method: SwapMethod,
    /// Avoid rebinding the window pixmap on every damage event under
    /// GLX; rebinding is only needed on geometry change on conforming
    /// servers.
    pub glx_no_rebind_pixmap: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SwapMethod {
    #[default]
    Undefined,
    Copy,
    Exchange,
    BufferAge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum VsyncMode {
    /// Present immediately, no pacing.
    None,
    /// Wait for the retrace signal before presenting.
    #[default]
    Retrace,
    /// Use reported buffer age to compute partial redraw.
    BufferAge,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VsyncConfig {
    pub mode: VsyncMode,
    /// Offset the repaint trigger to land just after retrace. Lower
    /// latency, risks tearing if the estimate is wrong.
    pub aggressive: bool,
    /// Assumed refresh rate in Hz when the server does not report one.
    pub refresh_rate: u32,
}

impl Default for VsyncConfig {
    fn default() -> Self {
        Self {
            mode: VsyncMode::Retrace,
            aggressive: false,
            refresh_rate: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FadeConfig {
    pub enabled: bool,
    /// Opacity increment per fade step while fading in (0..=255).
    pub step_in: u16,
    /// Opacity decrement per fade step while fading out (0..=255).
    pub step_out: u16,
    /// Fade step interval in milliseconds. Floored at 1.
    pub delta_ms: u64,
    /// Skip fade animation on window open/close.
    pub no_fading_openclose: bool,
    /// Windows that never animate; they jump straight to target.
    pub exclude: Vec<MatchRule>,
}

impl Default for FadeConfig {
    fn default() -> Self {
        // Matches a 0.028/0.03-per-step ramp over a 0..=255 range.
        Self {
            enabled: true,
            step_in: 7,
            step_out: 8,
            delta_ms: 10,
            no_fading_openclose: false,
            exclude: Vec::new(),
        }
    }
}

impl FadeConfig {
    pub fn delta(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.delta_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowConfig {
    pub enabled: bool,
    /// Gaussian blur radius of the shadow, in pixels.
    pub radius: i32,
    pub offset_x: i32,
    pub offset_y: i32,
    /// Shadow translucency (0.0-1.0).
    pub opacity: f64,
    /// Shadow color: RGB values 0.0-1.0.
    pub color: [f64; 3],
    /// Whether bounding-shaped windows are denied a shadow.
    pub ignore_shaped: bool,
    /// Treat small bounding shapes as rounded corners and keep the shadow.
    pub detect_rounded_corners: bool,
    pub exclude: Vec<MatchRule>,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            radius: 12,
            offset_x: -15,
            offset_y: -15,
            opacity: 0.75,
            color: [0.0, 0.0, 0.0],
            ignore_shaped: true,
            detect_rounded_corners: true,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpacityConfig {
    /// Opacity for focused windows without an explicit override (0.0-1.0).
    pub active: f32,
    /// Opacity for unfocused windows without an explicit override.
    pub inactive: f32,
    /// Whether `inactive` beats an explicit per-window override.
    pub inactive_override: bool,
    /// How much to dim unfocused windows. 0.0 disables dimming.
    pub inactive_dim: f64,
    /// Opacity rules, first match wins.
    pub rules: Vec<OpacityRule>,
}

impl Default for OpacityConfig {
    fn default() -> Self {
        Self {
            active: 1.0,
            inactive: 1.0,
            inactive_override: false,
            inactive_dim: 0.0,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpacityRule {
    pub rule: MatchRule,
    /// Opacity applied to matching windows (0.0-1.0).
    pub opacity: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlurConfig {
    /// Blur the background beneath translucent windows.
    pub enabled: bool,
    /// Convolution kernel half-width (1 => 3x3 box).
    pub strength: u32,
    pub exclude: Vec<MatchRule>,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            strength: 1,
            exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    /// Track _NET_ACTIVE_WINDOW to determine the focused window.
    pub use_ewmh_active_win: bool,
    /// Propagate focus through WM_TRANSIENT_FOR.
    pub detect_transient: bool,
    /// Propagate focus through WM_CLIENT_LEADER groups.
    pub detect_client_leader: bool,
    /// Windows always considered focused.
    pub focus_exclude: Vec<MatchRule>,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            use_ewmh_active_win: true,
            detect_transient: true,
            detect_client_leader: false,
            focus_exclude: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnredirectConfig {
    /// Unredirect all windows when a full-screen opaque window covers
    /// the screen.
    pub enabled: bool,
    /// Delay before unredirecting, in milliseconds.
    pub delay_ms: u64,
}

impl Default for UnredirectConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            delay_ms: 0,
        }
    }
}

/// Which window attribute a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchTarget {
    Name,
    Class,
    Role,
}

/// How the rule value is compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MatchMode {
    #[default]
    Exact,
    Anywhere,
    FromStart,
}

/// A single window match condition, supplied by the config collaborator.
/// Malformed rule syntax is that collaborator's problem; by the time a
/// rule reaches the core it is already structured.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRule {
    pub target: MatchTarget,
    #[serde(default)]
    pub mode: MatchMode,
    pub value: String,
    #[serde(default)]
    pub ignore_case: bool,
}

impl MatchRule {
    pub fn matches(&self, name: &str, class: &str, role: &str) -> bool {
        let subject = match self.target {
            MatchTarget::Name => name,
            MatchTarget::Class => class,
            MatchTarget::Role => role,
        };
        let (subject, value) = if self.ignore_case {
            (subject.to_lowercase(), self.value.to_lowercase())
        } else {
            (subject.to_string(), self.value.clone())
        };
        match self.mode {
            MatchMode::Exact => subject == value,
            MatchMode::Anywhere => subject.contains(&value),
            MatchMode::FromStart => subject.starts_with(&value),
        }
    }
}

/// True when any rule in the list matches the window attributes.
pub fn any_match(rules: &[MatchRule], name: &str, class: &str, role: &str) -> bool {
    rules.iter().any(|r| r.matches(name, class, role))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opacity_fixed_range() {
        assert_eq!(opacity_fixed(0.0), 0);
        assert_eq!(opacity_fixed(1.0), OPAQUE);
        assert_eq!(opacity_fixed(2.0), OPAQUE);
        assert_eq!(opacity_fixed(-1.0), 0);
        assert_eq!(opacity_fixed(0.5), 128);
    }

    #[test]
    fn test_match_rule_modes() {
        let rule = MatchRule {
            target: MatchTarget::Class,
            mode: MatchMode::Anywhere,
            value: "term".into(),
            ignore_case: true,
        };
        assert!(rule.matches("scratch", "XTerm", ""));
        assert!(!rule.matches("term", "firefox", ""));

        let exact = MatchRule {
            target: MatchTarget::Name,
            mode: MatchMode::Exact,
            value: "Firefox".into(),
            ignore_case: false,
        };
        assert!(exact.matches("Firefox", "", ""));
        assert!(!exact.matches("firefox", "", ""));
    }

    #[test]
    fn test_default_config_roundtrips_toml() {
        let config = Config::default();
        let s = toml::to_string_pretty(&config).unwrap();
        let back: Config = toml::from_str(&s).unwrap();
        assert_eq!(back.shadow.radius, config.shadow.radius);
        assert_eq!(back.fade.delta_ms, config.fade.delta_ms);
    }

    #[test]
    fn test_fade_delta_floor() {
        let fade = FadeConfig {
            delta_ms: 0,
            ..FadeConfig::default()
        };
        assert_eq!(fade.delta(), std::time::Duration::from_millis(1));
    }
}
