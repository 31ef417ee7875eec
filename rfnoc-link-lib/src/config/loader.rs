use std::fs;
use std::path::Path;

use crate::config::CoreConfig;
use crate::error::{Result, RfnocError};

pub fn load_from_path<P: AsRef<Path>>(p: P) -> Result<CoreConfig> {
    let txt = fs::read_to_string(p)
        .map_err(|e| RfnocError::Config(format!("Failed to read config file: {e}")))?;
    let cfg: CoreConfig = toml::from_str(&txt)
        .map_err(|e| RfnocError::Config(format!("Failed to parse config: {e}")))?;

    validate_config(&cfg)?;

    Ok(cfg)
}

pub(crate) fn validate_config(cfg: &CoreConfig) -> Result<()> {
    if cfg.link.num_recv_frames == 0 || cfg.link.num_send_frames == 0 {
        return Err(RfnocError::Config(
            "Frame counts must be nonzero".to_string(),
        ));
    }

    // A frame must at least hold a 512-bit CHDR word plus a timestamp slot.
    const MIN_FRAME_SIZE: usize = 128;
    if cfg.link.recv_frame_size < MIN_FRAME_SIZE || cfg.link.send_frame_size < MIN_FRAME_SIZE {
        return Err(RfnocError::Config(format!(
            "Frame sizes must be at least {MIN_FRAME_SIZE} bytes"
        )));
    }

    let freq = cfg.stream.fc_freq_ratio;
    let headroom = cfg.stream.fc_headroom_ratio;
    if !(freq > 0.0 && freq < 1.0) {
        return Err(RfnocError::Config(format!(
            "fc_freq_ratio must lie in (0, 1), got {freq}"
        )));
    }
    if !(0.0..1.0).contains(&headroom) {
        return Err(RfnocError::Config(format!(
            "fc_headroom_ratio must lie in [0, 1), got {headroom}"
        )));
    }
    if freq + headroom >= 1.0 {
        return Err(RfnocError::Config(format!(
            "fc_freq_ratio + fc_headroom_ratio must stay below 1, got {}",
            freq + headroom
        )));
    }

    if cfg.ctrl.max_outstanding_acks == 0 {
        return Err(RfnocError::Config(
            "max_outstanding_acks must be nonzero".to_string(),
        ));
    }

    if !cfg.offload.service_queue_depth.is_power_of_two() {
        return Err(RfnocError::Config(format!(
            "service_queue_depth must be a power of two, got {}",
            cfg.offload.service_queue_depth
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = CoreConfig::default();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.stream.fc_freq_ratio, 0.125);
        assert_eq!(cfg.stream.fc_headroom_ratio, 0.0625);
    }

    #[test]
    fn test_load_from_toml() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            f,
            r#"
[link]
num_recv_frames = 64
recv_frame_size = 4096

[stream]
fc_freq_ratio = 0.25
"#
        )
        .expect("write");

        let cfg = load_from_path(f.path()).expect("load");
        assert_eq!(cfg.link.num_recv_frames, 64);
        assert_eq!(cfg.link.recv_frame_size, 4096);
        // Untouched fields keep their defaults.
        assert_eq!(cfg.link.num_send_frames, 32);
        assert_eq!(cfg.stream.fc_freq_ratio, 0.25);
    }

    #[test]
    fn test_rejects_bad_fc_ratio() {
        let mut cfg = CoreConfig::default();
        cfg.stream.fc_freq_ratio = 1.5;
        assert!(validate_config(&cfg).is_err());

        cfg.stream.fc_freq_ratio = 0.5;
        cfg.stream.fc_headroom_ratio = 0.6;
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_rejects_tiny_frames() {
        let mut cfg = CoreConfig::default();
        cfg.link.recv_frame_size = 16;
        assert!(validate_config(&cfg).is_err());
    }
}
