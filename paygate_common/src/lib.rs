mod minor_units;
mod secret;

pub use minor_units::{MinorUnits, MinorUnitsConversionError};
pub use secret::Secret;

/// Parses a boolean flag from an environment-variable value, falling back to `default` when
/// the variable is unset or unrecognisable. Used for the `PAYGATE_USE_*` proxy-header switches.
pub fn parse_boolean_flag(value: Option<String>, default: bool) -> bool {
    let value = match value {
        Some(v) => v,
        None => return default,
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => default,
    }
}
