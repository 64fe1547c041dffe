use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    pub fn validate_port(port: u16, field_name: &str) -> ConfigResult<()> {
        if port == 0 {
            return Err(ConfigError::Validation(format!("{field_name} cannot be 0")));
        }
        Ok(())
    }

    /// Validate that a value lies within an inclusive range
    pub fn validate_range<T>(value: T, min: T, max: T, field_name: &str) -> ConfigResult<()>
    where
        T: PartialOrd + std::fmt::Display,
    {
        if value < min || value > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be between {min} and {max}, got {value}"
            )));
        }
        Ok(())
    }

    /// Validate that a URL carries one of the accepted schemes
    pub fn validate_url(url: &str, schemes: &[&str], field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        let Some((scheme, rest)) = url.split_once("://") else {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be a valid URL with protocol"
            )));
        };
        if !schemes.contains(&scheme) {
            return Err(ConfigError::Validation(format!(
                "{field_name} must use one of {schemes:?}, got {scheme}"
            )));
        }
        if rest.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} is missing a host or path"
            )));
        }
        Ok(())
    }

    pub fn validate_one_of(value: &str, allowed: &[&str], field_name: &str) -> ConfigResult<()> {
        if !allowed.contains(&value) {
            return Err(ConfigError::Validation(format!(
                "Invalid {field_name}: {value}. Valid options: {allowed:?}"
            )));
        }
        Ok(())
    }
}
