//! Configuration validation functions

use super::ValidationError;

/// Validate a configured TCP/UDP port. Port 0 means "let the OS choose",
/// which is valid for listeners but never for a configured fixed port.
pub fn validate_port(port: u32, field: &str) -> Result<(), ValidationError> {
	if port == 0 || port > u16::MAX as u32 {
		return Err(ValidationError::ConfigError(format!(
			"{} must be a valid port in 1..=65535, got {}",
			field, port
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_validate_port_valid() {
		assert!(validate_port(1, "route_port").is_ok());
		assert!(validate_port(8080, "route_port").is_ok());
		assert!(validate_port(65535, "route_port").is_ok());
	}

	#[test]
	fn test_validate_port_zero() {
		let result = validate_port(0, "route_port");
		assert!(result.is_err());
	}

	#[test]
	fn test_validate_port_too_large() {
		let result = validate_port(70000, "route_port");
		assert!(result.is_err());
	}
}
