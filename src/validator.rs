// =============================================================================
// Strategy Validator — any JSON in, a safe strategy out
// =============================================================================
//
// Externally supplied strategy trees (typically a model response) are never
// rejected. The incoming value is deep-merged onto the built-in default, each
// field is read with a type check, and every constraint is enforced by
// clamping. Structural defects land in `errors`, clamped values in
// `warnings`; the returned strategy is always usable.
// =============================================================================

use serde_json::Value;

use crate::strategy::{RegimePreference, TimeframeWeights, TradingStrategy};

/// Validation result: a guaranteed-safe strategy plus the corrections made.
#[derive(Debug, Clone)]
pub struct ValidatedStrategy {
    pub strategy: TradingStrategy,
    /// Structural defects (wrong types, non-object input).
    pub errors: Vec<String>,
    /// Values that had to be clamped or forced.
    pub warnings: Vec<String>,
}

/// Merge `overlay` onto `base` recursively: objects merge key-wise, anything
/// else replaces.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value.clone();
        }
    }
}

/// Validate an arbitrary strategy tree against the session constraints.
pub fn validate_strategy(
    input: &Value,
    session_leverage: f64,
    session_duration_hours: f64,
) -> ValidatedStrategy {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut merged =
        serde_json::to_value(TradingStrategy::default()).expect("default strategy serialises");

    match input {
        Value::Object(_) => deep_merge(&mut merged, input),
        Value::Null => {}
        other => errors.push(format!(
            "strategy is not an object (got {}); using defaults",
            type_name(other)
        )),
    }

    let defaults = TradingStrategy::default();

    let num = |path: &str, default: f64, errors: &mut Vec<String>| -> f64 {
        match merged.pointer(path) {
            None | Some(Value::Null) => default,
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            Some(other) => {
                errors.push(format!(
                    "{path}: expected number, got {}; using {default}",
                    type_name(other)
                ));
                default
            }
        }
    };

    let text = |path: &str, default: &str, errors: &mut Vec<String>| -> String {
        match merged.pointer(path) {
            None | Some(Value::Null) => default.to_string(),
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::String(_)) => default.to_string(),
            Some(other) => {
                errors.push(format!(
                    "{path}: expected string, got {}; using default",
                    type_name(other)
                ));
                default.to_string()
            }
        }
    };

    // ── Meta strings — filled with defaults when missing ────────────────
    let name = text("/name", &defaults.name, &mut errors);
    let style = text("/style", &defaults.style, &mut errors);
    let description = text("/description", &defaults.description, &mut errors);

    // ── Timeframe weights — must sum to 100 ─────────────────────────────
    let mut weights = TimeframeWeights {
        d1: num("/timeframe_weights/d1", defaults.timeframe_weights.d1, &mut errors),
        h4: num("/timeframe_weights/h4", defaults.timeframe_weights.h4, &mut errors),
        h1: num("/timeframe_weights/h1", defaults.timeframe_weights.h1, &mut errors),
        m15: num("/timeframe_weights/m15", defaults.timeframe_weights.m15, &mut errors),
        m5: num("/timeframe_weights/m5", defaults.timeframe_weights.m5, &mut errors),
    };
    if [weights.d1, weights.h4, weights.h1, weights.m15, weights.m5]
        .iter()
        .any(|w| *w < 0.0 || !w.is_finite())
    {
        errors.push("timeframe weights must be non-negative; using defaults".to_string());
        weights = defaults.timeframe_weights;
    }
    let sum = weights.sum();
    if (sum - 100.0).abs() > 0.01 {
        if sum > 0.0 {
            weights.scale(100.0 / sum);
            warnings.push(format!("timeframe weights summed to {sum:.2}; normalised to 100"));
        } else {
            weights = defaults.timeframe_weights;
            errors.push("timeframe weights summed to zero; using defaults".to_string());
        }
    }

    // ── Leverage — session uniform, always ──────────────────────────────
    let requested_leverage = num("/leverage", session_leverage, &mut errors);
    if (requested_leverage - session_leverage).abs() > f64::EPSILON {
        warnings.push(format!(
            "leverage {requested_leverage} forced to session value {session_leverage}"
        ));
    }

    // ── Margin band, confidences, budgets ───────────────────────────────
    let cautious = clampf(
        num("/cautious_margin_percent", defaults.cautious_margin_percent, &mut errors),
        5.0,
        20.0,
        "cautious_margin_percent",
        &mut warnings,
    );
    let full = clampf(
        num("/full_margin_percent", defaults.full_margin_percent, &mut errors),
        5.0,
        20.0,
        "full_margin_percent",
        &mut warnings,
    );
    let (cautious, full) = if cautious > full {
        warnings.push(format!(
            "cautious_margin_percent {cautious} exceeded full_margin_percent {full}; swapped"
        ));
        (full, cautious)
    } else {
        (cautious, full)
    };

    let entry_confidence = clampf(
        num("/entry_confidence", defaults.entry_confidence, &mut errors),
        40.0,
        95.0,
        "entry_confidence",
        &mut warnings,
    );
    let dca_confidence = clampf(
        num("/dca_confidence", defaults.dca_confidence, &mut errors),
        40.0,
        95.0,
        "dca_confidence",
        &mut warnings,
    );

    let max_dca = clampf(
        num("/max_dca_count", defaults.max_dca_count as f64, &mut errors),
        0.0,
        3.0,
        "max_dca_count",
        &mut warnings,
    )
    .round() as u32;

    let max_hours_cap = session_duration_hours.max(0.5);
    let max_hours = clampf(
        num("/max_hours", defaults.max_hours.min(max_hours_cap), &mut errors),
        0.5,
        max_hours_cap,
        "max_hours",
        &mut warnings,
    );

    // ── RSI thresholds — sane, ordered ──────────────────────────────────
    let rsi_oversold = clampf(
        num("/rsi_oversold", defaults.rsi_oversold, &mut errors),
        10.0,
        45.0,
        "rsi_oversold",
        &mut warnings,
    );
    let rsi_overbought = clampf(
        num("/rsi_overbought", defaults.rsi_overbought, &mut errors),
        55.0,
        90.0,
        "rsi_overbought",
        &mut warnings,
    );

    // ── Regime preferences in [0, 1] ────────────────────────────────────
    let regime_preference = RegimePreference {
        trending: clampf(
            num("/regime_preference/trending", defaults.regime_preference.trending, &mut errors),
            0.0,
            1.0,
            "regime_preference.trending",
            &mut warnings,
        ),
        ranging: clampf(
            num("/regime_preference/ranging", defaults.regime_preference.ranging, &mut errors),
            0.0,
            1.0,
            "regime_preference.ranging",
            &mut warnings,
        ),
        volatile: clampf(
            num("/regime_preference/volatile", defaults.regime_preference.volatile, &mut errors),
            0.0,
            1.0,
            "regime_preference.volatile",
            &mut warnings,
        ),
    };

    // ── Safety rails — forced regardless of input ───────────────────────
    if merged.pointer("/use_stop_loss").and_then(Value::as_bool) == Some(true) {
        warnings.push("use_stop_loss forced to false".to_string());
    }
    if merged.pointer("/accept_liquidation").and_then(Value::as_bool) == Some(false) {
        warnings.push("accept_liquidation forced to true".to_string());
    }
    if merged.pointer("/use_fixed_tp").and_then(Value::as_bool) == Some(true) {
        warnings.push("use_fixed_tp forced to false".to_string());
    }

    let strategy = TradingStrategy {
        name,
        style,
        description,
        timeframe_weights: weights,
        leverage: session_leverage,
        cautious_margin_percent: cautious,
        full_margin_percent: full,
        entry_confidence,
        dca_confidence,
        max_dca_count: max_dca,
        max_hours,
        rsi_oversold,
        rsi_overbought,
        regime_preference,
        use_stop_loss: false,
        accept_liquidation: true,
        use_fixed_tp: false,
    };

    ValidatedStrategy {
        strategy,
        errors,
        warnings,
    }
}

fn clampf(value: f64, min: f64, max: f64, field: &str, warnings: &mut Vec<String>) -> f64 {
    if !value.is_finite() {
        warnings.push(format!("{field}: non-finite value clamped to {min}"));
        return min;
    }
    let clamped = value.clamp(min, max);
    if (clamped - value).abs() > f64::EPSILON {
        warnings.push(format!("{field}: {value} clamped to {clamped}"));
    }
    clamped
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// =============================================================================
// Tests
// =============================================================================
