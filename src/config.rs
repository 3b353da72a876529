//! Runtime configuration and the persisted capture-configuration artifact
//! (spec §6.4, `sump_capture_cfg.txt`).

use std::collections::BTreeMap;

use crate::error::{SumpError, SumpResult};

/// Process-wide settings, read from the environment the way the teacher's
/// `main.rs`/`build.rs` read `SUMP_AXI_ADDR`/`PORT`.
#[derive(Debug, Clone)]
pub struct SumpConfig {
    pub host: String,
    pub port: u16,
    pub aes_key: Option<[u8; 32]>,
    pub authenticate: bool,
    pub http_port: u16,
    /// Number of `None` analog samples prepended so analog aligns with LS
    /// digital (spec §4.5, `sump_ls_ana_dig_alignment`).
    pub ls_ana_dig_alignment: usize,
}

impl Default for SumpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0xCB14, // arbitrary default distinct from any well-known port
            aes_key: None,
            authenticate: false,
            http_port: 8082,
            ls_ana_dig_alignment: 4,
        }
    }
}

impl SumpConfig {
    /// Load configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(host) = std::env::var("SUMP_HOST") {
            cfg.host = host;
        }
        if let Ok(port) = std::env::var("SUMP_PORT") {
            if let Ok(p) = port.parse() {
                cfg.port = p;
            }
        }
        if let Ok(key_hex) = std::env::var("SUMP_AES_KEY") {
            if let Some(key) = parse_hex_key(&key_hex) {
                cfg.aes_key = Some(key);
            } else {
                tracing::warn!("SUMP_AES_KEY present but not 64 hex chars; ignoring");
            }
        }
        if let Ok(auth) = std::env::var("SUMP_AUTH") {
            cfg.authenticate = auth == "1" || auth.eq_ignore_ascii_case("true");
        }
        if let Ok(http_port) = std::env::var("SUMP_HTTP_PORT") {
            if let Ok(p) = http_port.parse() {
                cfg.http_port = p;
            }
        }

        cfg
    }
}

fn parse_hex_key(s: &str) -> Option<[u8; 32]> {
    if s.len() != 64 {
        return None;
    }
    let mut key = [0u8; 32];
    for i in 0..32 {
        key[i] = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(key)
}

/// Capture configuration as described in spec §3 "Capture Configuration".
/// Serialized to/from `sump_capture_cfg.txt` as `key = value` lines.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CaptureConfiguration {
    pub hw_id: u8,
    pub hw_rev: u8,
    pub analog_ram_width: u32,
    pub analog_ram_depth: u32,
    pub digital_ram_width: u32,
    pub digital_ram_depth: u32,
    /// Packed (record_len, header_len, digital_len, analog_len) bytes.
    pub record_profile: u32,
    pub tick_freq_hz: f64,
    pub tick_divisor: u32,
    pub ls_first_sample_ptr: u32,
    pub ls_post_trig_samples: u32,
    pub hs_first_sample_ptr: u32,
    pub hs_post_trig_samples: u32,
    pub user_ctrl: u32,
    pub trigger_type: u32,
    pub trigger_field: u32,
    pub trigger_nth: u32,
    pub trigger_delay: u32,
}

impl CaptureConfiguration {
    /// Invariant: each engine's post-trigger-samples <= engine depth.
    pub fn validate(&self) -> SumpResult<()> {
        if self.ls_post_trig_samples as u64 > self.digital_ram_depth as u64 {
            return Err(SumpError::ConfigParse {
                context: "capture_cfg.ls_post_trig_samples".to_string(),
                message: format!(
                    "{} exceeds ls depth {}",
                    self.ls_post_trig_samples, self.digital_ram_depth
                ),
            });
        }
        if self.hs_post_trig_samples as u64 > self.digital_ram_depth as u64 {
            return Err(SumpError::ConfigParse {
                context: "capture_cfg.hs_post_trig_samples".to_string(),
                message: format!(
                    "{} exceeds hs depth {}",
                    self.hs_post_trig_samples, self.digital_ram_depth
                ),
            });
        }
        Ok(())
    }

    /// Record profile decomposition: (record_len, header_len, digital_len, analog_len).
    pub fn record_profile_bytes(&self) -> (u8, u8, u8, u8) {
        let p = self.record_profile;
        (
            ((p >> 24) & 0xFF) as u8,
            ((p >> 16) & 0xFF) as u8,
            ((p >> 8) & 0xFF) as u8,
            (p & 0xFF) as u8,
        )
    }

    pub fn to_lines(&self) -> Vec<String> {
        vec![
            format!("hw_id = {}", self.hw_id),
            format!("hw_rev = {}", self.hw_rev),
            format!("analog_ram_width = {}", self.analog_ram_width),
            format!("analog_ram_depth = {}", self.analog_ram_depth),
            format!("digital_ram_width = {}", self.digital_ram_width),
            format!("digital_ram_depth = {}", self.digital_ram_depth),
            format!("record_profile = {:#010x}", self.record_profile),
            format!("tick_freq = {}", self.tick_freq_hz),
            format!("tick_divisor = {}", self.tick_divisor),
            format!("ls_first_sample_ptr = {}", self.ls_first_sample_ptr),
            format!("ls_post_trig_samples = {}", self.ls_post_trig_samples),
            format!("hs_first_sample_ptr = {}", self.hs_first_sample_ptr),
            format!("hs_post_trig_samples = {}", self.hs_post_trig_samples),
            format!("user_ctrl = {}", self.user_ctrl),
            format!("trigger_type = {}", self.trigger_type),
            format!("trigger_field = {}", self.trigger_field),
            format!("trigger_nth = {}", self.trigger_nth),
            format!("trigger_delay = {}", self.trigger_delay),
        ]
    }

    /// Parse from `sump_capture_cfg.txt` "key = value" lines. Unknown keys
    /// are ignored (forward compatible); malformed numeric values produce a
    /// `ConfigParse` error but do not abort parsing of the remaining lines —
    /// the last good value wins for any key not reached.
    pub fn from_lines(lines: &[String]) -> SumpResult<Self> {
        let mut map = BTreeMap::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((k, v)) = line.split_once('=') {
                map.insert(k.trim().to_string(), v.trim().to_string());
            }
        }

        let get_u32 = |key: &str| -> u32 {
            map.get(key)
                .and_then(|v| {
                    if let Some(hex) = v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
                        u32::from_str_radix(hex, 16).ok()
                    } else {
                        v.parse().ok()
                    }
                })
                .unwrap_or(0)
        };
        let get_u8 = |key: &str| -> u8 { get_u32(key) as u8 };
        let get_f64 = |key: &str| -> f64 {
            map.get(key).and_then(|v| v.parse().ok()).unwrap_or(0.0)
        };

        Ok(Self {
            hw_id: get_u8("hw_id"),
            hw_rev: get_u8("hw_rev"),
            analog_ram_width: get_u32("analog_ram_width"),
            analog_ram_depth: get_u32("analog_ram_depth"),
            digital_ram_width: get_u32("digital_ram_width"),
            digital_ram_depth: get_u32("digital_ram_depth"),
            record_profile: get_u32("record_profile"),
            tick_freq_hz: get_f64("tick_freq"),
            tick_divisor: get_u32("tick_divisor"),
            ls_first_sample_ptr: get_u32("ls_first_sample_ptr"),
            ls_post_trig_samples: get_u32("ls_post_trig_samples"),
            hs_first_sample_ptr: get_u32("hs_first_sample_ptr"),
            hs_post_trig_samples: get_u32("hs_post_trig_samples"),
            user_ctrl: get_u32("user_ctrl"),
            trigger_type: get_u32("trigger_type"),
            trigger_field: get_u32("trigger_field"),
            trigger_nth: get_u32("trigger_nth"),
            trigger_delay: get_u32("trigger_delay"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_profile_decomposes() {
        let cfg = CaptureConfiguration {
            record_profile: 0x03010200,
            ..Default::default()
        };
        assert_eq!(cfg.record_profile_bytes(), (3, 1, 2, 0));
    }

    #[test]
    fn roundtrips_through_lines() {
        let cfg = CaptureConfiguration {
            hw_id: 0x53,
            record_profile: 0x03010200,
            tick_freq_hz: 100_000_000.0,
            ls_post_trig_samples: 10,
            digital_ram_depth: 1024,
            ..Default::default()
        };
        let lines = cfg.to_lines();
        let parsed = CaptureConfiguration::from_lines(&lines).unwrap();
        assert_eq!(cfg, parsed);
    }

    #[test]
    fn validate_rejects_oversize_post_trigger() {
        let cfg = CaptureConfiguration {
            ls_post_trig_samples: 2000,
            digital_ram_depth: 1024,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn from_lines_tolerates_missing_and_unknown_keys() {
        let lines = vec!["hw_id = 83".to_string(), "mystery = 7".to_string()];
        let cfg = CaptureConfiguration::from_lines(&lines).unwrap();
        assert_eq!(cfg.hw_id, 83);
    }
}
