use crate::core::session::CallConfig;

/// Validate that when auth is required, a shared secret is configured
pub fn validate_auth_required(
    auth_required: bool,
    state_api_secret: &Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if auth_required && state_api_secret.as_deref().is_none_or(str::is_empty) {
        return Err("When AUTH_REQUIRED=true, STATE_API_SECRET must be configured".into());
    }
    Ok(())
}

/// Validate the remote state-store URL, when one is set
pub fn validate_state_store_url(url: &Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(url) = url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(format!("STATE_STORE_URL must be an http(s) URL, got '{url}'").into());
    }
    Ok(())
}

/// Validate engine settings that would otherwise stall or spin a call
pub fn validate_engine(engine: &CallConfig) -> Result<(), Box<dyn std::error::Error>> {
    if engine.audio.queue_capacity == 0 {
        return Err("engine.audio.queue_capacity must be at least 1".into());
    }
    if engine.audio.max_concurrent_synthesis == 0 {
        return Err("engine.audio.max_concurrent_synthesis must be at least 1".into());
    }
    if engine.dead_air.poll_interval_ms == 0 {
        return Err("engine.dead_air.poll_interval_ms must be greater than zero".into());
    }
    if engine.dead_air.silence_threshold_ms == 0 || engine.dead_air.hold_threshold_ms == 0 {
        return Err("engine.dead_air thresholds must be greater than zero".into());
    }
    if engine.dead_air.check_in_messages.is_empty() && engine.dead_air.max_check_ins > 0 {
        return Err("engine.dead_air.check_in_messages cannot be empty when check-ins are enabled".into());
    }
    let threshold = engine.interruption.echo_overlap_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(format!(
            "engine.interruption.echo_overlap_threshold must be between 0 and 1, got {threshold}"
        )
        .into());
    }
    if engine.response.fallback_message.trim().is_empty() {
        return Err("engine.response.fallback_message cannot be empty".into());
    }
    Ok(())
}
