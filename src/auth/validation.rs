use super::AuthError;

pub const MIN_PASSWORD_LENGTH: usize = 8;
pub const MAX_PASSWORD_LENGTH: usize = 128;
const MAX_EMAIL_LENGTH: usize = 254;

/// Normalize and validate an email address for registration or login
pub fn normalize_email(email: &str) -> Result<String, AuthError> {
    let email = email.trim().to_lowercase();

    if email.is_empty() {
        return Err(invalid_email("Email cannot be empty"));
    }
    if email.len() > MAX_EMAIL_LENGTH {
        return Err(invalid_email("Email is too long"));
    }

    let (local, domain) = email.split_once('@').ok_or_else(|| invalid_email("Invalid email format"))?;
    if local.is_empty() || domain.contains('@') || email.chars().any(char::is_whitespace) {
        return Err(invalid_email("Invalid email format"));
    }

    // Domain needs a dot with something on both sides
    match domain.rsplit_once('.') {
        Some((host, tld)) if !host.is_empty() && !tld.is_empty() => Ok(email),
        _ => Err(invalid_email("Invalid email format")),
    }
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation {
            field: "password",
            message: format!("Password must be at least {} characters", MIN_PASSWORD_LENGTH),
        });
    }
    if length > MAX_PASSWORD_LENGTH {
        return Err(AuthError::Validation {
            field: "password",
            message: format!("Password must be at most {} characters", MAX_PASSWORD_LENGTH),
        });
    }
    Ok(())
}

fn invalid_email(message: &str) -> AuthError {
    AuthError::Validation {
        field: "email",
        message: message.to_string(),
    }
}
