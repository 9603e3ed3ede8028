//! Validation helpers for DTOs.

use validator::ValidationError;

const MAX_NAME_CHARS: usize = 32;

/// Validates a `#RRGGBB` color (hex digits of either case).
///
/// # Examples
///
/// ```ignore
/// validate_hex_color("#1e90FF") // Ok
/// validate_hex_color("1e90ff")  // Err - missing '#'
/// validate_hex_color("#1e90f")  // Err - too short
/// ```
pub fn validate_hex_color(color: &str) -> Result<(), ValidationError> {
    let Some(digits) = color.strip_prefix('#') else {
        let mut err = ValidationError::new("color_format");
        err.message = Some("Color must start with '#'".into());
        return Err(err);
    };

    if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut err = ValidationError::new("color_format");
        err.message = Some(format!("Color must be #RRGGBB (got `{color}`)").into());
        return Err(err);
    }

    Ok(())
}

/// Validates a display name: not blank, at most 32 characters, no control characters.
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    if name.trim().is_empty() {
        let mut err = ValidationError::new("name_blank");
        err.message = Some("Name must not be blank".into());
        return Err(err);
    }

    let chars = name.chars().count();
    if chars > MAX_NAME_CHARS {
        let mut err = ValidationError::new("name_length");
        err.message =
            Some(format!("Name must be at most {MAX_NAME_CHARS} characters (got {chars})").into());
        return Err(err);
    }

    if name.chars().any(char::is_control) {
        let mut err = ValidationError::new("name_format");
        err.message = Some("Name must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_hex_color_valid() {
        assert!(validate_hex_color("#000000").is_ok());
        assert!(validate_hex_color("#1e90FF").is_ok());
    }

    #[test]
    fn test_validate_hex_color_invalid() {
        assert!(validate_hex_color("1e90ff").is_err()); // no '#'
        assert!(validate_hex_color("#1e90f").is_err()); // too short
        assert!(validate_hex_color("#1e90ffa").is_err()); // too long
        assert!(validate_hex_color("#1e90fg").is_err()); // invalid hex
    }

    #[test]
    fn test_validate_display_name() {
        assert!(validate_display_name("Zoë").is_ok());
        assert!(validate_display_name("").is_err());
        assert!(validate_display_name("   ").is_err());
        assert!(validate_display_name(&"x".repeat(33)).is_err());
        assert!(validate_display_name("tab\there").is_err());
    }
}
