use rand::Rng;

use crate::config::ReconnectCfg;

/// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`, capped.
pub fn reconnect_delay_ms(attempt: u32, cfg: &ReconnectCfg) -> u64 {
    let core = cfg
        .base_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX))
        .min(cfg.max_delay_ms);
    let jitter = if cfg.jitter_ms > 0 { rand::rng().random_range(0..=cfg.jitter_ms) } else { 0 };
    core + jitter
}

/// `None` once the attempt budget is spent.
pub fn next_retry(attempts: u32, cfg: &ReconnectCfg) -> Option<u64> {
    (attempts < cfg.max_attempts).then(|| reconnect_delay_ms(attempts, cfg))
}
